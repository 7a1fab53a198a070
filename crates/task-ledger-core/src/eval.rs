use std::cmp::Ordering;

use crate::value::{parse_value, TypeError, Value};
use crate::{Operator, RequirementEntry, RequirementKind, RequirementSnapshot};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EvalError {
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("{operator} requires {expected} operands, got {actual}")]
    Arity { operator: &'static str, expected: &'static str, actual: usize },
    #[error("both operands of {operator} must share one type, got {left} and {right}")]
    TypeMismatch { operator: &'static str, left: &'static str, right: &'static str },
    #[error("unsupported operand type for {operator}: {kind}, must be int or duration")]
    UnsupportedOperandType { operator: &'static str, kind: &'static str },
    #[error("all operands of {operator} must be bool, got {kind} at position {position}")]
    NonBoolean { operator: &'static str, kind: &'static str, position: usize },
    #[error("expected atom requirement, got {0}")]
    NotAtom(&'static str),
    #[error(transparent)]
    Coercion(#[from] TypeError),
}

/// Evaluate `operator` over already-typed operands.
///
/// `==` is variadic and never fails on mixed types, it just answers `false`. The
/// ordering operators take exactly two operands of one ordered type. The boolean
/// operators take one or more `bool` operands.
///
/// # Errors
/// Returns [`EvalError`] on arity, type mismatch or non-boolean operands.
pub fn evaluate(operator: Operator, operands: &[Value]) -> Result<bool, EvalError> {
    match operator {
        Operator::Eq => {
            if operands.len() < 2 {
                return Err(EvalError::Arity {
                    operator: operator.as_str(),
                    expected: "at least 2",
                    actual: operands.len(),
                });
            }
            Ok(operands.windows(2).all(|pair| pair[0] == pair[1]))
        }
        Operator::Ge | Operator::Gt | Operator::Lt | Operator::Le => {
            let [left, right] = operands else {
                return Err(EvalError::Arity {
                    operator: operator.as_str(),
                    expected: "exactly 2",
                    actual: operands.len(),
                });
            };
            let ordering = compare(operator, left, right)?;
            Ok(match operator {
                Operator::Ge => ordering != Ordering::Less,
                Operator::Gt => ordering == Ordering::Greater,
                Operator::Lt => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
        Operator::And | Operator::Or | Operator::Nand | Operator::Nor => {
            if operands.is_empty() {
                return Err(EvalError::Arity {
                    operator: operator.as_str(),
                    expected: "at least 1",
                    actual: 0,
                });
            }
            let mut flags = Vec::with_capacity(operands.len());
            for (position, operand) in operands.iter().enumerate() {
                let Value::Bool(flag) = operand else {
                    return Err(EvalError::NonBoolean {
                        operator: operator.as_str(),
                        kind: operand.kind(),
                        position,
                    });
                };
                flags.push(*flag);
            }
            Ok(match operator {
                Operator::And => flags.iter().all(|flag| *flag),
                Operator::Or => flags.iter().any(|flag| *flag),
                Operator::Nand => !flags.iter().all(|flag| *flag),
                _ => !flags.iter().any(|flag| *flag),
            })
        }
    }
}

/// Evaluate an operator given by name.
///
/// # Errors
/// Returns [`EvalError::UnsupportedOperator`] for names outside the operator set, and
/// otherwise behaves like [`evaluate`].
pub fn evaluate_named(operator: &str, operands: &[Value]) -> Result<bool, EvalError> {
    let Some(parsed) = Operator::parse(operator) else {
        return Err(EvalError::UnsupportedOperator(operator.to_string()));
    };
    evaluate(parsed, operands)
}

/// Judge one recorded leaf value against its atom definition.
///
/// # Errors
/// Returns [`EvalError::NotAtom`] for condition snapshots, [`EvalError::Coercion`] when
/// either the value or the target fails to parse, and any evaluation failure.
pub fn evaluate_atom(
    snapshot: &RequirementSnapshot,
    entry: &RequirementEntry,
) -> Result<bool, EvalError> {
    if snapshot.kind != RequirementKind::Atom {
        return Err(EvalError::NotAtom(snapshot.kind.as_str()));
    }
    let actual = parse_value(&entry.value, snapshot.data_type)?;
    let target = snapshot.target_value.as_deref().unwrap_or_default();
    let target = parse_value(target, snapshot.data_type)?;
    evaluate(snapshot.operator, &[actual, target])
}

fn compare(operator: Operator, left: &Value, right: &Value) -> Result<Ordering, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Duration(a), Value::Duration(b)) => Ok(a.cmp(b)),
        (Value::Int(_) | Value::Duration(_), other) => Err(EvalError::TypeMismatch {
            operator: operator.as_str(),
            left: left.kind(),
            right: other.kind(),
        }),
        (other, _) => Err(EvalError::UnsupportedOperandType {
            operator: operator.as_str(),
            kind: other.kind(),
        }),
    }
}
