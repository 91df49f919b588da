//! JSON-patch applier (spec §4.3, component C3). Implements RFC 6902
//! `add`/`remove`/`replace`/`move`/`copy`/`test`, with one intentional
//! deviation from the strict RFC: `add`/`replace` auto-vivify missing parent
//! objects along the path, which `json_patch::patch` (used only for
//! `diff()`, not application, elsewhere in this crate) does not do.
use errors::ErrorMetadata;
use json_patch::PatchOperation;
use serde_json::{
    Map,
    Value,
};
use sync_types::path::{
    parse_array_index,
    split_pointer,
};

/// Applies `ops` to a deep clone of `target`, leaving the caller's value
/// untouched. `test` operations never mutate.
pub fn apply_patch(target: &Value, ops: &[PatchOperation]) -> anyhow::Result<Value> {
    let mut doc = target.clone();
    for op in ops {
        apply_one(&mut doc, op)?;
    }
    Ok(doc)
}

fn apply_one(doc: &mut Value, op: &PatchOperation) -> anyhow::Result<()> {
    match op {
        PatchOperation::Add(add) => {
            let tokens = split_pointer(&add.path)?;
            set_path(doc, &tokens, add.value.clone(), true)
        },
        PatchOperation::Replace(replace) => {
            let tokens = split_pointer(&replace.path)?;
            set_path(doc, &tokens, replace.value.clone(), false)
        },
        PatchOperation::Remove(remove) => {
            let tokens = split_pointer(&remove.path)?;
            remove_path(doc, &tokens)
        },
        PatchOperation::Move(mv) => {
            let from_tokens = split_pointer(&mv.from)?;
            let to_tokens = split_pointer(&mv.path)?;
            let value = take_path(doc, &from_tokens)?;
            set_path(doc, &to_tokens, value, true)
        },
        PatchOperation::Copy(cp) => {
            let from_tokens = split_pointer(&cp.from)?;
            let to_tokens = split_pointer(&cp.path)?;
            let value = get_path(doc, &from_tokens)?.clone();
            set_path(doc, &to_tokens, value, true)
        },
        PatchOperation::Test(test) => {
            let tokens = split_pointer(&test.path)?;
            let actual = get_path(doc, &tokens)?;
            anyhow::ensure!(
                actual == &test.value,
                ErrorMetadata::patch_application_error(format!(
                    "test op failed at {:?}: expected {}, found {}",
                    test.path, test.value, actual
                ))
            );
            Ok(())
        },
    }
}

fn not_found(path: &str) -> anyhow::Error {
    anyhow::Error::new(ErrorMetadata::patch_application_error(format!(
        "no value at path {path:?}"
    )))
}

fn get_path<'a>(doc: &'a Value, tokens: &[String]) -> anyhow::Result<&'a Value> {
    let mut cur = doc;
    for token in tokens {
        cur = match cur {
            Value::Object(map) => map
                .get(token)
                .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?,
            Value::Array(arr) => {
                let idx = parse_array_index(token, arr.len())?
                    .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?;
                arr.get(idx)
                    .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?
            },
            _ => return Err(not_found(&sync_types::path::join_pointer(tokens))),
        };
    }
    Ok(cur)
}

/// Sets the value at `tokens`, auto-vivifying missing intermediate objects
/// when `vivify` is true (the `add`/`move`/`copy` destination case). With
/// `vivify = false` (`replace`), a missing parent is an error.
fn set_path(doc: &mut Value, tokens: &[String], value: Value, vivify: bool) -> anyhow::Result<()> {
    if tokens.is_empty() {
        *doc = value;
        return Ok(());
    }

    let (last, parents) = tokens.split_last().expect("checked non-empty above");
    let mut cur = doc;
    for token in parents {
        cur = match cur {
            Value::Object(map) => {
                if vivify && !map.contains_key(token) {
                    map.insert(token.clone(), Value::Object(Map::new()));
                }
                map.get_mut(token)
                    .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?
            },
            Value::Array(arr) => {
                let idx = parse_array_index(token, arr.len())?
                    .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?;
                arr.get_mut(idx)
                    .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?
            },
            _ => return Err(not_found(&sync_types::path::join_pointer(tokens))),
        };
    }

    match cur {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        },
        Value::Array(arr) => {
            match parse_array_index(last, arr.len())? {
                Some(idx) if idx == arr.len() => arr.push(value),
                Some(idx) => arr[idx] = value,
                None => arr.push(value),
            }
            Ok(())
        },
        other if vivify => {
            let mut map = Map::new();
            map.insert(last.clone(), value);
            *other = Value::Object(map);
            Ok(())
        },
        _ => Err(not_found(&sync_types::path::join_pointer(tokens))),
    }
}

fn remove_path(doc: &mut Value, tokens: &[String]) -> anyhow::Result<()> {
    take_path(doc, tokens).map(|_| ())
}

fn take_path(doc: &mut Value, tokens: &[String]) -> anyhow::Result<Value> {
    if tokens.is_empty() {
        return Ok(std::mem::replace(doc, Value::Null));
    }

    let (last, parents) = tokens.split_last().expect("checked non-empty above");
    let mut cur = doc;
    for token in parents {
        cur = match cur {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?,
            Value::Array(arr) => {
                let idx = parse_array_index(token, arr.len())?
                    .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?;
                arr.get_mut(idx)
                    .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?
            },
            _ => return Err(not_found(&sync_types::path::join_pointer(tokens))),
        };
    }

    match cur {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens))),
        Value::Array(arr) => {
            let idx = parse_array_index(last, arr.len())?
                .ok_or_else(|| not_found(&sync_types::path::join_pointer(tokens)))?;
            anyhow::ensure!(
                idx < arr.len(),
                not_found(&sync_types::path::join_pointer(tokens))
            );
            Ok(arr.remove(idx))
        },
        _ => Err(not_found(&sync_types::path::join_pointer(tokens))),
    }
}
