//! Hand-written proptest generators for types that can't `#[derive(Arbitrary)]`
//! because they embed `serde_json::Value` or `json_patch::PatchOperation`.
use json_patch::{
    AddOperation,
    PatchOperation,
    RemoveOperation,
    ReplaceOperation,
};
use proptest::{
    collection::vec,
    prelude::*,
};
use serde_json::Value;

use crate::update::{
    ArrayDiffOp,
    DeltaOp,
    Update,
};

/// Recursive JSON value generator, depth-bounded so shrinking terminates.
pub fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..6).prop_map(Value::Array),
            vec(("[a-z]{1,8}", inner), 0..6).prop_map(|entries| {
                Value::Object(entries.into_iter().collect())
            }),
        ]
    })
}

fn arb_pointer() -> impl Strategy<Value = String> {
    vec("[a-z]{1,6}", 1..4).prop_map(|tokens| {
        let mut out = String::new();
        for t in tokens {
            out.push('/');
            out.push_str(&t);
        }
        out
    })
}

/// Generator for `json_patch::PatchOperation`, which does not implement
/// `Arbitrary` upstream.
pub fn arb_patch_operation() -> impl Strategy<Value = PatchOperation> {
    prop_oneof![
        (arb_pointer(), arb_json()).prop_map(|(path, value)| {
            PatchOperation::Add(AddOperation { path, value })
        }),
        (arb_pointer(), arb_json()).prop_map(|(path, value)| {
            PatchOperation::Replace(ReplaceOperation { path, value })
        }),
        arb_pointer().prop_map(|path| PatchOperation::Remove(RemoveOperation { path })),
    ]
}

fn arb_delta_op() -> impl Strategy<Value = DeltaOp> {
    (
        any::<usize>(),
        proptest::option::of(any::<usize>()),
        proptest::option::of("[a-zA-Z0-9]{0,8}"),
    )
        .prop_map(|(position, delete, insert)| DeltaOp {
            position,
            delete,
            insert,
        })
}

pub fn arb_array_diff_op() -> impl Strategy<Value = ArrayDiffOp> {
    prop_oneof![
        arb_json().prop_map(|item| ArrayDiffOp::Push { item }),
        arb_json().prop_map(|item| ArrayDiffOp::Unshift { item }),
        (any::<usize>(), arb_json()).prop_map(|(idx, item)| ArrayDiffOp::Insert { idx, item }),
        any::<usize>().prop_map(|idx| ArrayDiffOp::Remove { idx }),
        (any::<usize>(), arb_json()).prop_map(|(idx, item)| ArrayDiffOp::Update { idx, item }),
        (any::<usize>(), any::<usize>()).prop_map(|(from, to)| ArrayDiffOp::Move { from, to }),
        vec(arb_json(), 0..6).prop_map(|items| ArrayDiffOp::Replace { items }),
    ]
}

/// Generator for the whole [`Update`] tagged union.
pub fn arb_update() -> impl Strategy<Value = Update> {
    prop_oneof![
        arb_json().prop_map(Update::Value),
        vec(arb_delta_op(), 0..6).prop_map(Update::Delta),
        vec(arb_patch_operation(), 0..6).prop_map(Update::Patch),
        vec(arb_array_diff_op(), 0..6).prop_map(Update::Array),
    ]
}

/// Asserts that `value` survives a JSON serialize/deserialize round trip.
pub fn assert_roundtrips<T>(value: &T)
where
    T: serde::Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug,
{
    let json = serde_json::to_string(value).expect("serialize");
    let back: T = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(value, &back, "round trip mismatch via {json}");
}
