use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::value::validate_value;
use crate::{
    DataType, LedgerError, Operator, RequirementId, RequirementKind, RequirementSnapshot,
    RevisionId,
};

/// Deepest requirement tree accepted at construction time.
pub const MAX_TREE_DEPTH: usize = 64;

/// One node of a requirement tree as authored, before skeleton ids are assigned.
///
/// `id` is only meaningful when revising: it names the existing requirement skeleton
/// this node continues. Nodes without an id get a fresh skeleton.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequirementDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequirementId>,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: RequirementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_value: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operands: Vec<RequirementDraft>,
}

impl RequirementDraft {
    /// Validate every node of the tree rooted here.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for blank titles, atoms with operands, conditions
    /// without operands, operators or data types that do not fit the node kind, targets
    /// that do not coerce, repeated ids, and trees deeper than [`MAX_TREE_DEPTH`].
    pub fn validate(&self) -> Result<(), LedgerError> {
        let mut seen_ids = BTreeSet::new();
        let mut stack = vec![(self, 1_usize)];

        while let Some((node, depth)) = stack.pop() {
            if depth > MAX_TREE_DEPTH {
                return Err(LedgerError::Validation(format!(
                    "requirement tree MUST NOT be deeper than {MAX_TREE_DEPTH} levels"
                )));
            }
            if node.title.trim().is_empty() {
                return Err(LedgerError::Validation(
                    "requirement title MUST be non-empty".to_string(),
                ));
            }
            if let Some(id) = node.id {
                if !seen_ids.insert(id) {
                    return Err(LedgerError::Validation(format!(
                        "requirement id {id} appears more than once in the tree"
                    )));
                }
            }

            check_node(
                &node.title,
                node.kind,
                node.data_type.unwrap_or(DataType::None),
                node.operator,
                node.target_value.as_deref(),
            )?;

            match node.kind {
                RequirementKind::Atom if !node.operands.is_empty() => {
                    return Err(LedgerError::Validation(format!(
                        "atom {:?} MUST NOT have operands",
                        node.title
                    )));
                }
                RequirementKind::Condition if node.operands.is_empty() => {
                    return Err(LedgerError::Validation(format!(
                        "condition {:?} MUST have at least one operand",
                        node.title
                    )));
                }
                _ => {}
            }

            stack.extend(node.operands.iter().map(|child| (child, depth + 1)));
        }

        Ok(())
    }
}

/// A requirement snapshot with its children, ordered by `sort_order` then id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequirementNode {
    #[serde(flatten)]
    pub snapshot: RequirementSnapshot,
    #[serde(default)]
    pub children: Vec<RequirementNode>,
}

impl RequirementNode {
    /// Turn this tree back into an authoring draft that keeps every skeleton id.
    #[must_use]
    pub fn to_draft(&self) -> RequirementDraft {
        let snapshot = &self.snapshot;
        RequirementDraft {
            id: Some(snapshot.skeleton_id),
            title: snapshot.title.clone(),
            kind: snapshot.kind,
            data_type: match snapshot.data_type {
                DataType::None => None,
                other => Some(other),
            },
            operator: snapshot.operator,
            target_value: snapshot.target_value.clone(),
            sort_order: snapshot.sort_order,
            operands: self.children.iter().map(Self::to_draft).collect(),
        }
    }

    /// Depth-first iterator over every snapshot in the tree, root first.
    pub fn walk(&self) -> impl Iterator<Item = &RequirementSnapshot> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(&node.snapshot)
        })
    }
}

/// Assign skeleton ids and lay a validated draft out as flat snapshots for one revision.
///
/// Snapshots come back in pre-order, so every parent precedes its children. `assign`
/// is called once per node in that order.
///
/// # Errors
/// Returns the draft's validation failure, or whatever `assign` fails with.
pub fn flatten_draft<E, F>(
    root: &RequirementDraft,
    revision_id: RevisionId,
    mut assign: F,
) -> Result<Vec<RequirementSnapshot>, E>
where
    E: From<LedgerError>,
    F: FnMut(&RequirementDraft) -> Result<RequirementId, E>,
{
    root.validate()?;

    let mut snapshots = Vec::new();
    let mut stack = vec![(root, None)];
    while let Some((node, parent_id)) = stack.pop() {
        let skeleton_id = assign(node)?;
        snapshots.push(RequirementSnapshot {
            revision_id,
            skeleton_id,
            parent_id,
            title: node.title.trim().to_string(),
            kind: node.kind,
            data_type: node.data_type.unwrap_or(DataType::None),
            operator: node.operator,
            target_value: node.target_value.clone(),
            sort_order: node.sort_order,
        });
        stack.extend(node.operands.iter().rev().map(|child| (child, Some(skeleton_id))));
    }

    Ok(snapshots)
}

/// Check the structural rules of one revision's flat snapshot set and return its root.
///
/// # Errors
/// Returns [`LedgerError::Validation`] unless the set belongs to a single revision, has
/// exactly one root, every parent is a condition in the same revision, every node
/// reaches the root, and every node is well-formed for its kind.
pub fn validate_revision(snapshots: &[RequirementSnapshot]) -> Result<RequirementId, LedgerError> {
    let Some(first) = snapshots.first() else {
        return Err(LedgerError::Validation("revision has no requirements".to_string()));
    };

    let mut by_id = BTreeMap::new();
    for snapshot in snapshots {
        if snapshot.revision_id != first.revision_id {
            return Err(LedgerError::Validation(format!(
                "requirement {} belongs to revision {}, expected {}",
                snapshot.skeleton_id, snapshot.revision_id, first.revision_id
            )));
        }
        if by_id.insert(snapshot.skeleton_id, snapshot).is_some() {
            return Err(LedgerError::Validation(format!(
                "requirement {} appears twice in revision {}",
                snapshot.skeleton_id, snapshot.revision_id
            )));
        }
    }

    let roots =
        snapshots.iter().filter(|snapshot| snapshot.parent_id.is_none()).collect::<Vec<_>>();
    let [root] = roots.as_slice() else {
        return Err(LedgerError::Validation(format!(
            "revision {} MUST have exactly one root requirement, found {}",
            first.revision_id,
            roots.len()
        )));
    };

    let mut child_counts: BTreeMap<RequirementId, usize> = BTreeMap::new();
    for snapshot in snapshots {
        check_node(
            &snapshot.title,
            snapshot.kind,
            snapshot.data_type,
            snapshot.operator,
            snapshot.target_value.as_deref(),
        )?;

        let Some(parent_id) = snapshot.parent_id else {
            continue;
        };
        let Some(parent) = by_id.get(&parent_id) else {
            return Err(LedgerError::Validation(format!(
                "requirement {} references parent {parent_id} outside its revision",
                snapshot.skeleton_id
            )));
        };
        if parent.kind != RequirementKind::Condition {
            return Err(LedgerError::Validation(format!(
                "requirement {} has atom {parent_id} as parent",
                snapshot.skeleton_id
            )));
        }
        *child_counts.entry(parent_id).or_default() += 1;
    }

    for snapshot in snapshots {
        if snapshot.kind == RequirementKind::Condition
            && !child_counts.contains_key(&snapshot.skeleton_id)
        {
            return Err(LedgerError::Validation(format!(
                "condition {} MUST have at least one child",
                snapshot.skeleton_id
            )));
        }

        let mut cursor = snapshot.parent_id;
        let mut steps = 0_usize;
        while let Some(parent_id) = cursor {
            steps += 1;
            if steps > MAX_TREE_DEPTH {
                return Err(LedgerError::Validation(format!(
                    "requirement {} does not reach the root within {MAX_TREE_DEPTH} levels",
                    snapshot.skeleton_id
                )));
            }
            cursor = by_id.get(&parent_id).and_then(|parent| parent.parent_id);
        }
    }

    Ok(root.skeleton_id)
}

/// Assemble a validated flat snapshot set into its nested view.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when [`validate_revision`] rejects the set.
pub fn build_tree(snapshots: Vec<RequirementSnapshot>) -> Result<RequirementNode, LedgerError> {
    validate_revision(&snapshots)?;

    let mut root = None;
    let mut children: BTreeMap<RequirementId, Vec<RequirementSnapshot>> = BTreeMap::new();
    for snapshot in snapshots {
        match snapshot.parent_id {
            None => root = Some(snapshot),
            Some(parent_id) => children.entry(parent_id).or_default().push(snapshot),
        }
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|lhs, rhs| {
            lhs.sort_order.cmp(&rhs.sort_order).then_with(|| lhs.skeleton_id.cmp(&rhs.skeleton_id))
        });
    }

    let Some(root) = root else {
        return Err(LedgerError::Validation("revision has no root requirement".to_string()));
    };
    Ok(attach(root, &mut children))
}

fn attach(
    snapshot: RequirementSnapshot,
    children: &mut BTreeMap<RequirementId, Vec<RequirementSnapshot>>,
) -> RequirementNode {
    let own = children.remove(&snapshot.skeleton_id).unwrap_or_default();
    RequirementNode {
        children: own.into_iter().map(|child| attach(child, children)).collect(),
        snapshot,
    }
}

fn check_node(
    title: &str,
    kind: RequirementKind,
    data_type: DataType,
    operator: Operator,
    target_value: Option<&str>,
) -> Result<(), LedgerError> {
    match kind {
        RequirementKind::Atom => {
            if !operator.is_comparison() {
                return Err(LedgerError::Validation(format!(
                    "atom {title:?} needs a comparison operator, got {}",
                    operator.as_str()
                )));
            }
            if data_type == DataType::None {
                return Err(LedgerError::Validation(format!(
                    "atom {title:?} MUST declare a data_type"
                )));
            }
            if operator.is_ordering() && !data_type.is_ordered() {
                return Err(LedgerError::Validation(format!(
                    "atom {title:?} cannot apply {} to {} values",
                    operator.as_str(),
                    data_type.as_str()
                )));
            }
            let Some(target) = target_value else {
                return Err(LedgerError::Validation(format!(
                    "atom {title:?} MUST declare a target_value"
                )));
            };
            validate_value(target, data_type).map_err(|err| {
                LedgerError::Validation(format!("target_value of atom {title:?}: {err}"))
            })
        }
        RequirementKind::Condition => {
            if !operator.is_boolean() {
                return Err(LedgerError::Validation(format!(
                    "condition {title:?} needs AND, OR, NAND or NOR, got {}",
                    operator.as_str()
                )));
            }
            if data_type != DataType::None {
                return Err(LedgerError::Validation(format!(
                    "condition {title:?} MUST NOT declare a data_type"
                )));
            }
            if target_value.is_some() {
                return Err(LedgerError::Validation(format!(
                    "condition {title:?} MUST NOT declare a target_value"
                )));
            }
            Ok(())
        }
    }
}
