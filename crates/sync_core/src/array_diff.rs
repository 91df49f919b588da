//! Array differ (spec §4.2, component C2): id-keyed or positional diff over
//! ordered sequences.
use std::collections::HashMap;

use errors::ErrorMetadata;
use serde_json::Value;
use sync_types::ArrayDiffOp;

/// Computes an edit script turning `prev` into `next`, or `None` if the
/// change isn't one of the recognized shapes (caller falls back to `value`).
pub fn compute_array_diff(prev: &[Value], next: &[Value]) -> Option<Vec<ArrayDiffOp>> {
    if prev.is_empty() != next.is_empty() {
        return Some(vec![ArrayDiffOp::Replace {
            items: next.to_vec(),
        }]);
    }
    if prev.is_empty() && next.is_empty() {
        return Some(vec![]);
    }

    if let (Some(prev_ids), Some(next_ids)) = (stable_ids(prev), stable_ids(next)) {
        return diff_by_id(prev, &prev_ids, next, &next_ids);
    }

    diff_positional(prev, next)
}

/// If every element is an object carrying a scalar `id` field, returns those
/// ids in order; otherwise `None` (caller falls back to positional diffing).
fn stable_ids(items: &[Value]) -> Option<Vec<Value>> {
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let id = item.as_object()?.get("id")?.clone();
        ids.push(id);
    }
    Some(ids)
}

/// Returns `None` when the remove/update/push/insert vocabulary can't
/// faithfully reproduce `next` (a true reorder of retained ids, which would
/// need `move`) — the caller falls back to a `value` update rather than
/// shipping a diff that doesn't reconstruct (spec §8 invariant 5).
fn diff_by_id(
    prev: &[Value],
    prev_ids: &[Value],
    next: &[Value],
    next_ids: &[Value],
) -> Option<Vec<ArrayDiffOp>> {
    let prev_index: HashMap<&Value, usize> = prev_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();
    let next_index: HashMap<&Value, usize> = next_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();

    let mut ops = Vec::new();
    // Working copy of the id sequence, mutated as ops are conceptually
    // applied, so each op's `idx` matches the array state it will actually
    // run against on the receiving end.
    let mut working: Vec<Value> = prev_ids.to_vec();

    // Removals in decreasing original-index order so earlier removals
    // don't shift the indices later ones refer to.
    let mut removed: Vec<usize> = prev_ids
        .iter()
        .enumerate()
        .filter(|(_, id)| !next_index.contains_key(id))
        .map(|(i, _)| i)
        .collect();
    removed.sort_unstable_by(|a, b| b.cmp(a));
    for idx in removed {
        ops.push(ArrayDiffOp::Remove { idx });
        working.remove(idx);
    }

    // The retained ids must keep the same relative order on both sides, or
    // this vocabulary has no way to express the change faithfully.
    let retained_in_next_order: Vec<&Value> =
        next_ids.iter().filter(|id| prev_index.contains_key(id)).collect();
    if working.iter().collect::<Vec<&Value>>() != retained_in_next_order {
        return None;
    }

    // Updates for ids retained in both whose value changed, indexed against
    // the post-removal working array.
    for (idx, id) in working.iter().enumerate() {
        if let (Some(&prev_idx), Some(&next_idx)) =
            (prev_index.get(id), next_index.get(id))
        {
            if prev[prev_idx] != next[next_idx] {
                ops.push(ArrayDiffOp::Update {
                    idx,
                    item: next[next_idx].clone(),
                });
            }
        }
    }

    // New ids, inserted at their absolute target index in `next`. Walking
    // `next_ids` left to right and using each new id's final position as its
    // insert index is valid: every id before it — retained (same relative
    // order, checked above) or already inserted earlier in this loop — is
    // already in place by the time we get here, so later insertions never
    // invalidate an earlier one's index.
    let post_removal_len = working.len();
    let mut inserted = 0usize;
    for (next_idx, id) in next_ids.iter().enumerate() {
        if prev_index.contains_key(id) {
            continue;
        }
        let item = next[next_idx].clone();
        if next_idx == post_removal_len + inserted {
            ops.push(ArrayDiffOp::Push { item });
        } else {
            ops.push(ArrayDiffOp::Insert { idx: next_idx, item });
        }
        inserted += 1;
    }

    Some(ops)
}

fn diff_positional(prev: &[Value], next: &[Value]) -> Option<Vec<ArrayDiffOp>> {
    if next.len() > prev.len() && next[..prev.len()] == *prev {
        return Some(
            next[prev.len()..]
                .iter()
                .map(|item| ArrayDiffOp::Push { item: item.clone() })
                .collect(),
        );
    }

    if next.len() > prev.len() && next[next.len() - prev.len()..] == *prev {
        let prepended = &next[..next.len() - prev.len()];
        return Some(
            prepended
                .iter()
                .rev()
                .map(|item| ArrayDiffOp::Unshift { item: item.clone() })
                .collect(),
        );
    }

    if next.len() < prev.len() && prev[..next.len()] == *next {
        let removed_count = prev.len() - next.len();
        return Some(
            (next.len()..prev.len())
                .rev()
                .map(|idx| ArrayDiffOp::Remove { idx })
                .take(removed_count)
                .collect(),
        );
    }

    None
}

/// Replays `ops` against `curr`, returning a new array. Never mutates
/// `curr`. Ops are order-sensitive: `Remove`/`Update` indices are resolved
/// against the array as it stands *after* earlier ops in the script.
pub fn apply_array_diff(curr: &[Value], ops: &[ArrayDiffOp]) -> anyhow::Result<Vec<Value>> {
    let mut out = curr.to_vec();
    for op in ops {
        match op {
            ArrayDiffOp::Push { item } => out.push(item.clone()),
            ArrayDiffOp::Unshift { item } => out.insert(0, item.clone()),
            ArrayDiffOp::Insert { idx, item } => {
                bounds_check(*idx, out.len() + 1)?;
                out.insert(*idx, item.clone());
            },
            ArrayDiffOp::Remove { idx } => {
                bounds_check(*idx, out.len())?;
                out.remove(*idx);
            },
            ArrayDiffOp::Update { idx, item } => {
                bounds_check(*idx, out.len())?;
                out[*idx] = item.clone();
            },
            ArrayDiffOp::Move { from, to } => {
                bounds_check(*from, out.len())?;
                bounds_check(*to, out.len())?;
                let item = out.remove(*from);
                out.insert(*to, item);
            },
            ArrayDiffOp::Replace { items } => out = items.clone(),
        }
    }
    Ok(out)
}

fn bounds_check(idx: usize, len: usize) -> anyhow::Result<()> {
    anyhow::ensure!(
        idx < len,
        ErrorMetadata::patch_application_error(format!(
            "array diff op index {idx} out of bounds (len {len})"
        ))
    );
    Ok(())
}
