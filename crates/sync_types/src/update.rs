//! The wire-level update record (spec §3, §4.1): a tagged union describing
//! how one field's value transitioned from `prev` to `next`.
use json_patch::PatchOperation;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;

/// One field's minimal transition, as sent in an `update` frame's `updates`
/// map (spec §6).
///
/// `Value` carries a `serde_json::Value` and `Patch` a `json_patch`
/// `PatchOperation`, neither of which implement `proptest::Arbitrary`; see
/// `testing::arb_update` for a hand-written generator instead of a derive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "data", rename_all = "lowercase")]
pub enum Update {
    /// Full replacement: `data` is the next value verbatim.
    Value(Value),
    /// Ordered text-edit script over a string field.
    Delta(Vec<DeltaOp>),
    /// RFC 6902 patch over a nested-object field.
    Patch(Vec<PatchOperation>),
    /// Ordered-sequence edit script over an array field.
    Array(Vec<ArrayDiffOp>),
}

/// One operation in a text delta edit script (spec §3, §4.1 rule 2).
///
/// `position` is a char offset into the string as it stands after the
/// previous op in this script has been applied (so a multi-op script is a
/// left-to-right replay, not a set of offsets all relative to the original):
/// each op deletes `delete` chars starting at `position`, then splices
/// `insert` (if present) in at that same position.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaOp {
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub delete: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub insert: Option<String>,
}

/// One operation in an ordered-sequence edit script (spec §3, §4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ArrayDiffOp {
    Push { item: Value },
    Unshift { item: Value },
    Insert { idx: usize, item: Value },
    Remove { idx: usize },
    Update { idx: usize, item: Value },
    Move { from: usize, to: usize },
    Replace { items: Vec<Value> },
}
