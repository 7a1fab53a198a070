use std::cmp::Ordering;

use time::Date;

use crate::{RevisionId, TaskSnapshot};

/// Pick the task revision that governs `date`.
///
/// Only revisions that have been made current take part. Among those, the governing
/// revision is the one with the latest `effective_from` on or before `date`; ties go to
/// the later activation, then the later `created_at` and then the greater revision id.
/// Dates before every activated revision fall back to the earliest one. Returns `None`
/// when no revision was ever made current.
#[must_use]
pub fn resolve_revision(revisions: &[TaskSnapshot], date: Date) -> Option<&TaskSnapshot> {
    let activated = || revisions.iter().filter(|snapshot| snapshot.activated_at.is_some());
    activated()
        .filter(|snapshot| snapshot.effective_from <= date)
        .max_by(|lhs, rhs| revision_order(lhs, rhs))
        .or_else(|| activated().min_by(|lhs, rhs| revision_order(lhs, rhs)))
}

/// Pick the revision that judges `date`, honouring a day already pinned by its entries.
///
/// A day that already holds entries stays under the revision those entries were
/// recorded with, so later revisions never reinterpret recorded history. Unpinned days
/// go through [`resolve_revision`].
#[must_use]
pub fn governing_revision(
    revisions: &[TaskSnapshot],
    pinned: Option<RevisionId>,
    date: Date,
) -> Option<&TaskSnapshot> {
    pinned
        .and_then(|revision_id| {
            revisions.iter().find(|snapshot| snapshot.revision_id == revision_id)
        })
        .or_else(|| resolve_revision(revisions, date))
}

fn revision_order(lhs: &TaskSnapshot, rhs: &TaskSnapshot) -> Ordering {
    lhs.effective_from
        .cmp(&rhs.effective_from)
        .then_with(|| lhs.activated_at.cmp(&rhs.activated_at))
        .then_with(|| lhs.created_at.cmp(&rhs.created_at))
        .then_with(|| lhs.revision_id.cmp(&rhs.revision_id))
}
