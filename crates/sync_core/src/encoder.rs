//! Update encoder/decoder (spec §4.1, component C1): chooses the smallest of
//! value / delta / patch / array representations for one field's transition.
use anyhow::Context;
use errors::ErrorMetadata;
use serde_json::Value;
use sync_types::{
    ArrayDiffOp,
    DeltaOp,
    Update,
};

use crate::array_diff::{
    apply_array_diff,
    compute_array_diff,
};

/// Strings shorter than this are always sent whole; a delta's per-op
/// overhead isn't worth it below this length (spec §4.1 rule 2, §8).
pub const DELTA_THRESHOLD: usize = 100;

fn json_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Computes the minimal-or-fallback [`Update`] describing `prev -> next`.
/// Returns `None` when `prev == next` (spec invariant 1): callers should
/// elide transmission entirely rather than send an empty update.
pub fn encode(prev: &Value, next: &Value) -> Option<Update> {
    if prev == next {
        return None;
    }

    let next_size = json_size(next);

    if let (Value::String(prev_s), Value::String(next_s)) = (prev, next) {
        if prev_s.len() > DELTA_THRESHOLD || next_s.len() > DELTA_THRESHOLD {
            if let Some(ops) = encode_string_delta(prev_s, next_s) {
                let update = Update::Delta(ops);
                if json_size(&serde_json::to_value(&update).unwrap_or(Value::Null)) < next_size {
                    crate::metrics::record_strategy("delta");
                    return Some(update);
                }
            }
        }
    }

    if let (Value::Object(_), Value::Object(_)) = (prev, next) {
        let patch = json_patch::diff(prev, next).0;
        let update = Update::Patch(patch);
        if json_size(&serde_json::to_value(&update).unwrap_or(Value::Null)) < next_size {
            crate::metrics::record_strategy("patch");
            return Some(update);
        }
    }

    if let (Value::Array(prev_a), Value::Array(next_a)) = (prev, next) {
        if let Some(ops) = compute_array_diff(prev_a, next_a) {
            let is_lone_replace = matches!(ops.as_slice(), [ArrayDiffOp::Replace { .. }]);
            if !is_lone_replace {
                let update = Update::Array(ops);
                if json_size(&serde_json::to_value(&update).unwrap_or(Value::Null)) < next_size {
                    crate::metrics::record_strategy("array");
                    return Some(update);
                }
            }
        }
    }

    crate::metrics::record_strategy("value");
    Some(Update::Value(next.clone()))
}

/// Replays an [`Update`] against `prev` to reconstruct `next`.
pub fn decode(prev: &Value, update: &Update) -> anyhow::Result<Value> {
    match update {
        Update::Value(data) => Ok(data.clone()),
        Update::Delta(ops) => {
            let prev_s = prev
                .as_str()
                .context(ErrorMetadata::patch_application_error(
                    "delta update applied to a non-string previous value",
                ))?;
            Ok(Value::String(decode_string_delta(prev_s, ops)?))
        },
        Update::Patch(ops) => crate::patch::apply_patch(prev, ops),
        Update::Array(ops) => {
            let prev_a = prev
                .as_array()
                .context(ErrorMetadata::patch_application_error(
                    "array update applied to a non-array previous value",
                ))?;
            let next = apply_array_diff(prev_a, ops)?;
            Ok(Value::Array(next))
        },
    }
}

/// Longest-common-affix diff between two strings: finds the shared prefix
/// and (non-overlapping) shared suffix, and emits a single delta op
/// replacing whatever sits between them. Char-indexed so positions always
/// land on a valid split point regardless of multi-byte UTF-8 content.
fn encode_string_delta(prev: &str, next: &str) -> Option<Vec<DeltaOp>> {
    let prev_chars: Vec<char> = prev.chars().collect();
    let next_chars: Vec<char> = next.chars().collect();

    let max_prefix = prev_chars.len().min(next_chars.len());
    let mut prefix = 0;
    while prefix < max_prefix && prev_chars[prefix] == next_chars[prefix] {
        prefix += 1;
    }

    let max_suffix = max_prefix - prefix;
    let mut suffix = 0;
    while suffix < max_suffix
        && prev_chars[prev_chars.len() - 1 - suffix] == next_chars[next_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let deleted_len = prev_chars.len() - prefix - suffix;
    let inserted: String = next_chars[prefix..next_chars.len() - suffix].iter().collect();

    if deleted_len == 0 && inserted.is_empty() {
        return None;
    }

    Some(vec![DeltaOp {
        position: prefix,
        delete: if deleted_len > 0 { Some(deleted_len) } else { None },
        insert: if inserted.is_empty() { None } else { Some(inserted) },
    }])
}

fn decode_string_delta(prev: &str, ops: &[DeltaOp]) -> anyhow::Result<String> {
    let mut chars: Vec<char> = prev.chars().collect();
    for op in ops {
        anyhow::ensure!(
            op.position <= chars.len(),
            ErrorMetadata::patch_application_error(format!(
                "delta op position {} out of bounds (len {})",
                op.position,
                chars.len()
            ))
        );
        let delete = op.delete.unwrap_or(0);
        let end = op.position + delete;
        anyhow::ensure!(
            end <= chars.len(),
            ErrorMetadata::patch_application_error(format!(
                "delta op deletes past end of string (position {}, delete {}, len {})",
                op.position,
                delete,
                chars.len()
            ))
        );
        let insert: Vec<char> = op.insert.as_deref().unwrap_or("").chars().collect();
        chars.splice(op.position..end, insert);
    }
    Ok(chars.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn equal_values_elide() {
        assert_eq!(encode(&json!({"a": 1}), &json!({"a": 1})), None);
    }

    #[test]
    fn short_string_falls_back_to_value() {
        let prev = json!("hi");
        let next = json!("hi there");
        assert_eq!(encode(&prev, &next), Some(Update::Value(next)));
    }

    #[test]
    fn long_string_append_uses_single_delta_op() {
        let base = "x".repeat(200);
        let prev = Value::String(base.clone());
        let next = Value::String(format!("{base} more"));
        let update = encode(&prev, &next).unwrap();
        match &update {
            Update::Delta(ops) => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].position, 200);
                assert_eq!(ops[0].delete, None);
                assert_eq!(ops[0].insert.as_deref(), Some(" more"));
            },
            other => panic!("expected Delta, got {other:?}"),
        }
        assert_eq!(decode(&prev, &update).unwrap(), next);
    }

    #[test]
    fn nested_object_uses_patch() {
        let prev = json!({"theme": "dark", "notifications": true, "language": "en"});
        let next = json!({"theme": "light", "notifications": true, "language": "en"});
        let update = encode(&prev, &next).unwrap();
        assert!(matches!(update, Update::Patch(_)));
        assert_eq!(decode(&prev, &update).unwrap(), next);
    }

    #[test]
    fn decode_is_inverse_of_encode_for_small_object() {
        let prev = json!({"a": 1});
        let next = json!({"a": 2});
        let update = encode(&prev, &next).unwrap();
        assert_eq!(decode(&prev, &update).unwrap(), next);
    }

    #[test]
    fn array_lone_replace_falls_back_to_value() {
        let prev = json!([1, 2, 3]);
        let next = json!(["a", "b"]);
        let update = encode(&prev, &next).unwrap();
        assert_eq!(update, Update::Value(next));
    }

    #[test]
    fn array_append_falls_back_to_value_when_op_isnt_smaller() {
        let prev = json!([1, 2]);
        let next = json!([1, 2, 3]);
        let update = encode(&prev, &next).unwrap();
        assert_eq!(update, Update::Value(next));
    }

    proptest::proptest! {
        /// Spec §8 invariant 1: `decode(prev, encode(prev, next)) == next`.
        #[test]
        fn decode_inverts_encode(prev in sync_types::testing::arb_json(), next in sync_types::testing::arb_json()) {
            if let Some(update) = encode(&prev, &next) {
                proptest::prop_assert_eq!(decode(&prev, &update).unwrap(), next);
            } else {
                proptest::prop_assert_eq!(prev, next);
            }
        }

        /// Spec §8 invariant 2: the encoded form never serializes larger than
        /// plain replacement of `next`.
        #[test]
        fn encoded_size_never_exceeds_value_form(prev in sync_types::testing::arb_json(), next in sync_types::testing::arb_json()) {
            if let Some(update) = encode(&prev, &next) {
                let encoded_size = json_size(&serde_json::to_value(&update).unwrap());
                proptest::prop_assert!(encoded_size <= json_size(&next));
            }
        }
    }
}
