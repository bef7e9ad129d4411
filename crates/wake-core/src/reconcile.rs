// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Structural diffing: turn a target state into a minimal op sequence.
//!
//! [`reconcile_ops`] walks `current` and `target` together and emits the
//! smallest op list whose application to `current` yields a value
//! structurally equal to `target`. Output order is deterministic: object
//! diffs emit deletions first, then target keys in their insertion order;
//! array diffs recurse over the common prefix and close with at most one
//! trailing splice.

use crate::error::FatalError;
use crate::op::Op;
use crate::value::{Path, Value};

/// How the node under diff sits inside its parent container.
enum Slot<'a> {
    Root,
    Field(&'a str),
    Index(usize),
}

fn as_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Computes the minimal op sequence transforming `current` into `target`.
///
/// # Errors
///
/// [`FatalError::RootReplacement`] when the two roots have different kinds
/// (object vs array vs primitive): the algebra has no op that replaces the
/// root itself.
pub fn reconcile_ops(current: &Value, target: &Value) -> Result<Vec<Op>, FatalError> {
    let mut ops = Vec::new();
    diff(current, target, &Path::root(), &Slot::Root, &mut ops)?;
    Ok(ops)
}

fn diff(
    current: &Value,
    target: &Value,
    parent_path: &Path,
    slot: &Slot<'_>,
    ops: &mut Vec<Op>,
) -> Result<(), FatalError> {
    if Value::ptr_eq(current, target) {
        return Ok(());
    }
    match (current, target) {
        (Value::Object(c), Value::Object(t)) => {
            let path = node_path(parent_path, slot);
            for key in c.keys() {
                if !t.contains_key(key) {
                    ops.push(Op::delete(path.clone(), key.as_str()));
                }
            }
            for (key, target_value) in t.iter() {
                match c.get(key) {
                    None => ops.push(Op::set(path.clone(), key.as_str(), target_value.clone())),
                    Some(current_value) => {
                        diff(current_value, target_value, &path, &Slot::Field(key), ops)?;
                    }
                }
            }
            Ok(())
        }
        (Value::Array(c), Value::Array(t)) => {
            let path = node_path(parent_path, slot);
            let common = c.len().min(t.len());
            for i in 0..common {
                diff(&c[i], &t[i], &path, &Slot::Index(i), ops)?;
            }
            if t.len() > c.len() {
                ops.push(Op::splice(path, as_i64(c.len()), 0, t[c.len()..].to_vec()));
            } else if c.len() > t.len() {
                ops.push(Op::splice(
                    path,
                    as_i64(t.len()),
                    as_i64(c.len() - t.len()),
                    Vec::new(),
                ));
            }
            Ok(())
        }
        _ => {
            if current.structural_eq(target) {
                return Ok(());
            }
            replace(target, parent_path, slot, ops)
        }
    }
}

fn node_path(parent_path: &Path, slot: &Slot<'_>) -> Path {
    match slot {
        Slot::Root => parent_path.clone(),
        Slot::Field(key) => parent_path.join(*key),
        Slot::Index(index) => parent_path.join(*index),
    }
}

/// Emits a whole-value replacement addressed through the parent container.
fn replace(
    target: &Value,
    parent_path: &Path,
    slot: &Slot<'_>,
    ops: &mut Vec<Op>,
) -> Result<(), FatalError> {
    match slot {
        Slot::Root => Err(FatalError::RootReplacement),
        Slot::Field(key) => {
            ops.push(Op::set(parent_path.clone(), *key, target.clone()));
            Ok(())
        }
        Slot::Index(index) => {
            ops.push(Op::splice(
                parent_path.clone(),
                as_i64(*index),
                1,
                vec![target.clone()],
            ));
            Ok(())
        }
    }
}
