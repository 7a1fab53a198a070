use criterion::{criterion_group, criterion_main, Criterion};
use task_ledger_core::{
    build_tree, evaluate, evaluate_atom, flatten_draft, resolve_revision, validate_revision,
    DataType, EntryId, LedgerError, Operator, RequirementDraft, RequirementEntry, RequirementId,
    RequirementKind, RevisionId, TaskId, TaskSnapshot, Value,
};
use time::{Date, Duration, Month, OffsetDateTime};

fn bench_day() -> Date {
    match Date::from_calendar_date(2025, Month::January, 1) {
        Ok(date) => date,
        Err(err) => panic!("invalid bench date: {err}"),
    }
}

fn mk_atom(index: usize) -> RequirementDraft {
    let (data_type, operator, target) = match index % 3 {
        0 => (DataType::Int, Operator::Ge, "10"),
        1 => (DataType::Duration, Operator::Le, "1h30m"),
        _ => (DataType::Bool, Operator::Eq, "true"),
    };
    RequirementDraft {
        id: None,
        title: format!("atom {index}"),
        kind: RequirementKind::Atom,
        data_type: Some(data_type),
        operator,
        target_value: Some(target.to_string()),
        sort_order: i64::try_from(index).unwrap_or_default(),
        operands: Vec::new(),
    }
}

fn mk_tree(groups: usize, per_group: usize) -> RequirementDraft {
    let operands = (0..groups)
        .map(|group| RequirementDraft {
            id: None,
            title: format!("group {group}"),
            kind: RequirementKind::Condition,
            data_type: None,
            operator: if group % 2 == 0 { Operator::And } else { Operator::Or },
            target_value: None,
            sort_order: 0,
            operands: (0..per_group).map(|index| mk_atom(group * per_group + index)).collect(),
        })
        .collect();
    RequirementDraft {
        id: None,
        title: "daily routine".to_string(),
        kind: RequirementKind::Condition,
        data_type: None,
        operator: Operator::Nand,
        target_value: None,
        sort_order: 0,
        operands,
    }
}

fn bench_tree(c: &mut Criterion) {
    let draft = mk_tree(20, 25);

    c.bench_function("flatten_validate_build_520_nodes", |b| {
        b.iter(|| {
            let mut next_id = 0_i64;
            let snapshots = flatten_draft(&draft, RevisionId::new(), |_| {
                next_id += 1;
                Ok::<_, LedgerError>(RequirementId(next_id))
            });
            let outcome = snapshots.and_then(|snapshots| {
                validate_revision(&snapshots)?;
                build_tree(snapshots)
            });
            if let Err(err) = outcome {
                panic!("tree benchmark failed: {err}");
            }
        });
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let mut next_id = 0_i64;
    let snapshots = match flatten_draft(&mk_tree(1, 300), RevisionId::new(), |_| {
        next_id += 1;
        Ok::<_, LedgerError>(RequirementId(next_id))
    }) {
        Ok(snapshots) => snapshots,
        Err(err) => panic!("evaluate benchmark fixture failed: {err}"),
    };
    let atoms = snapshots
        .into_iter()
        .filter(|snapshot| snapshot.kind == RequirementKind::Atom)
        .map(|snapshot| {
            let value = match snapshot.data_type {
                DataType::Int => "12",
                DataType::Duration => "1:15:00",
                _ => "true",
            };
            let entry = RequirementEntry {
                id: EntryId(snapshot.skeleton_id.0),
                requirement_id: snapshot.skeleton_id,
                revision_id: snapshot.revision_id,
                entry_date: bench_day(),
                value: value.to_string(),
            };
            (snapshot, entry)
        })
        .collect::<Vec<_>>();

    c.bench_function("evaluate_and_over_300_atoms", |b| {
        b.iter(|| {
            let mut flags = Vec::with_capacity(atoms.len());
            for (snapshot, entry) in &atoms {
                match evaluate_atom(snapshot, entry) {
                    Ok(flag) => flags.push(Value::Bool(flag)),
                    Err(err) => panic!("atom evaluation failed: {err}"),
                }
            }
            if let Err(err) = evaluate(Operator::And, &flags) {
                panic!("condition evaluation failed: {err}");
            }
        });
    });
}

fn bench_resolve(c: &mut Criterion) {
    let revisions = (0..1_000_i64)
        .map(|index| TaskSnapshot {
            revision_id: RevisionId::new(),
            skeleton_id: TaskId(1),
            title: format!("revision {index}"),
            description: String::new(),
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(index),
            effective_from: bench_day() + Duration::days(index),
            is_current: index == 999,
            activated_at: Some(OffsetDateTime::UNIX_EPOCH + Duration::seconds(index)),
        })
        .collect::<Vec<_>>();
    let lookup = bench_day() + Duration::days(500);

    c.bench_function("resolve_revision_1000_snapshots", |b| {
        b.iter(|| {
            if resolve_revision(&revisions, lookup).is_none() {
                panic!("revision benchmark found no governing revision");
            }
        });
    });
}

criterion_group!(propagation_benches, bench_tree, bench_evaluate, bench_resolve);
criterion_main!(propagation_benches);
