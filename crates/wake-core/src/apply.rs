// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Operation execution and the mutable applier.
//!
//! Both applier modes share one reference semantics, implemented here by
//! [`exec_op`]:
//!
//! - every op is checked against the current tree before anything is
//!   touched, so a rejected op leaves the tree bit-identical (no
//!   copy-on-write cloning happens on the failure path);
//! - mutation then walks the path with refcount-based copy-on-write, so
//!   shared subtrees are shallow-cloned at most once and untouched siblings
//!   keep their identity.
//!
//! The mutable applier ([`apply_ops_mut`]) additionally journals the exact
//! inverse of each executed op. When a later op fails or validation rejects
//! the candidate, the journal is replayed in reverse, restoring the prior
//! state including key order, key-absence vs explicit-undefined
//! distinctions, and the identity of restored splice victims.

use std::rc::Rc;

use thiserror::Error;

use crate::op::{Op, OpKey};
use crate::value::{ObjectMap, Path, PathSegment, Value, ValueKind};

/// Why a transaction was rejected.
///
/// Rejections are silent at the engine level: the transaction contributes
/// nothing to derived state and no subscriber hears about it. The variants
/// exist for the applier's own control flow and for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// A path segment failed to resolve (missing field, out-of-range index,
    /// or traversal through a primitive).
    #[error("path did not resolve: {path}")]
    PathUnresolved {
        /// The container path that failed to resolve.
        path: Path,
    },

    /// The container at `path` has the wrong kind for the operation.
    #[error("kind mismatch at {path}: expected {expected}, found {found}")]
    KindMismatch {
        /// The container path.
        path: Path,
        /// Kind the operation requires.
        expected: ValueKind,
        /// Kind actually present.
        found: ValueKind,
    },

    /// An array index target was out of bounds.
    #[error("index {index} out of bounds at {path} (len {len})")]
    IndexOutOfBounds {
        /// The array path.
        path: Path,
        /// The offending index.
        index: usize,
        /// Array length at execution time.
        len: usize,
    },

    /// A delete targeted an object field that is not present.
    #[error("missing field {field:?} at {path}")]
    MissingField {
        /// The object path.
        path: Path,
        /// The absent field name.
        field: String,
    },

    /// The `length` pseudo-property was deleted, or assigned something other
    /// than a non-negative integer number.
    #[error("invalid length target at {path}")]
    InvalidLength {
        /// The array path.
        path: Path,
    },

    /// The transaction's validator returned `false` for the candidate state.
    #[error("validation rejected the candidate state")]
    ValidationRejected,
}

/// Inverse of one executed op, sufficient to restore the pre-op state.
#[derive(Debug)]
pub(crate) enum Undo {
    /// Restore a replaced object field to its previous value.
    ObjectSet { path: Path, key: String, prev: Value },
    /// Remove a freshly inserted object field (it was appended last).
    ObjectPop { path: Path, key: String },
    /// Re-insert a deleted object field at its original position.
    ObjectInsert {
        path: Path,
        key: String,
        value: Value,
        index: usize,
    },
    /// Restore a replaced array slot.
    ArraySet { path: Path, index: usize, prev: Value },
    /// Truncate an array back after an extension or append.
    ArrayTruncate { path: Path, len: usize },
    /// Re-append a truncated tail.
    ArrayExtend { path: Path, tail: Vec<Value> },
    /// Reverse a splice: remove what was inserted, restore what was removed.
    Splice {
        path: Path,
        index: usize,
        inserted: usize,
        removed: Vec<Value>,
    },
    /// Re-insert elements removed by `DeleteFromSet`, ascending positions.
    ArrayInsertMany {
        path: Path,
        items: Vec<(usize, Value)>,
    },
}

/// Resolves `path` against `root` without cloning, with rejection reasons.
fn resolve<'a>(root: &'a Value, path: &Path) -> Result<&'a Value, ApplyError> {
    root.resolve(path).ok_or_else(|| ApplyError::PathUnresolved {
        path: path.clone(),
    })
}

/// Walks to the node at `path` with copy-on-write, returning mutable access.
///
/// Callers must have resolved the path immutably first; a miss here means
/// the tree changed underneath us, which the single-threaded model rules
/// out.
fn node_mut<'a>(root: &'a mut Value, path: &Path) -> Option<&'a mut Value> {
    let mut node = root;
    for segment in path.segments() {
        node = match (segment, node) {
            (PathSegment::Key(k), Value::Object(map)) => Rc::make_mut(map).get_mut(k.as_str())?,
            (PathSegment::Index(i), Value::Array(items)) => Rc::make_mut(items).get_mut(*i)?,
            _ => return None,
        };
    }
    Some(node)
}

fn object_mut<'a>(root: &'a mut Value, path: &Path) -> Result<&'a mut ObjectMap, ApplyError> {
    match node_mut(root, path) {
        Some(Value::Object(map)) => Ok(Rc::make_mut(map)),
        _ => {
            debug_assert!(false, "object container vanished between check and mutate");
            Err(ApplyError::PathUnresolved { path: path.clone() })
        }
    }
}

fn array_mut<'a>(root: &'a mut Value, path: &Path) -> Result<&'a mut Vec<Value>, ApplyError> {
    match node_mut(root, path) {
        Some(Value::Array(items)) => Ok(Rc::make_mut(items)),
        _ => {
            debug_assert!(false, "array container vanished between check and mutate");
            Err(ApplyError::PathUnresolved { path: path.clone() })
        }
    }
}

fn expect_object<'a>(container: &'a Value, path: &Path) -> Result<&'a ObjectMap, ApplyError> {
    container.as_object().ok_or_else(|| ApplyError::KindMismatch {
        path: path.clone(),
        expected: ValueKind::Object,
        found: container.kind(),
    })
}

fn expect_array<'a>(container: &'a Value, path: &Path) -> Result<&'a [Value], ApplyError> {
    container.as_array().ok_or_else(|| ApplyError::KindMismatch {
        path: path.clone(),
        expected: ValueKind::Array,
        found: container.kind(),
    })
}

/// Clamps an authored splice start into `[0, len]`, node-style.
fn clamp_splice_start(index: i64, len: usize) -> usize {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let start = if index < 0 {
        (len_i + index).max(0)
    } else {
        index.min(len_i)
    };
    usize::try_from(start).unwrap_or(0)
}

/// Reads a `length` assignment value as a non-negative integer.
fn length_value(value: &Value, path: &Path) -> Result<usize, ApplyError> {
    let invalid = || ApplyError::InvalidLength { path: path.clone() };
    let n = value.as_number().ok_or_else(invalid)?;
    if !n.is_finite() || n < 0.0 || n.fract() != 0.0 {
        return Err(invalid());
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let len = n as usize;
    Ok(len)
}

/// Executes one op against `root`, journaling its inverse when requested.
///
/// On `Err`, `root` is untouched: all checks run against the immutable tree
/// before the copy-on-write walk begins.
pub(crate) fn exec_op(
    root: &mut Value,
    op: &Op,
    journal: Option<&mut Vec<Undo>>,
) -> Result<(), ApplyError> {
    let undo = exec_op_inner(root, op)?;
    if let (Some(journal), Some(undo)) = (journal, undo) {
        journal.push(undo);
    }
    Ok(())
}

fn exec_op_inner(root: &mut Value, op: &Op) -> Result<Option<Undo>, ApplyError> {
    match op {
        Op::Set { path, key, value } => exec_set(root, path, key, value),
        Op::Delete { path, key } => exec_delete(root, path, key),
        Op::Splice {
            path,
            index,
            delete_count,
            inserts,
        } => exec_splice(root, path, *index, *delete_count, inserts),
        Op::AddToSet { path, value } => exec_add_to_set(root, path, value),
        Op::DeleteFromSet { path, value } => exec_delete_from_set(root, path, value),
    }
}

fn exec_set(
    root: &mut Value,
    path: &Path,
    key: &OpKey,
    value: &Value,
) -> Result<Option<Undo>, ApplyError> {
    let container = resolve(root, path)?;
    match key {
        OpKey::Field(field) => {
            let map = expect_object(container, path)?;
            let undo = map.get(field).map_or_else(
                || Undo::ObjectPop {
                    path: path.clone(),
                    key: field.clone(),
                },
                |prev| Undo::ObjectSet {
                    path: path.clone(),
                    key: field.clone(),
                    prev: prev.clone(),
                },
            );
            object_mut(root, path)?.insert(field.clone(), value.clone());
            Ok(Some(undo))
        }
        OpKey::Index(index) => {
            let items = expect_array(container, path)?;
            let len = items.len();
            if *index > len {
                return Err(ApplyError::IndexOutOfBounds {
                    path: path.clone(),
                    index: *index,
                    len,
                });
            }
            if *index == len {
                array_mut(root, path)?.push(value.clone());
                return Ok(Some(Undo::ArrayTruncate {
                    path: path.clone(),
                    len,
                }));
            }
            let prev = items[*index].clone();
            array_mut(root, path)?[*index] = value.clone();
            Ok(Some(Undo::ArraySet {
                path: path.clone(),
                index: *index,
                prev,
            }))
        }
        OpKey::Length => {
            let items = expect_array(container, path)?;
            let len = items.len();
            let new_len = length_value(value, path)?;
            if new_len == len {
                return Ok(None);
            }
            if new_len < len {
                let tail = items[new_len..].to_vec();
                array_mut(root, path)?.truncate(new_len);
                return Ok(Some(Undo::ArrayExtend {
                    path: path.clone(),
                    tail,
                }));
            }
            array_mut(root, path)?.resize(new_len, Value::Undefined);
            Ok(Some(Undo::ArrayTruncate {
                path: path.clone(),
                len,
            }))
        }
    }
}

fn exec_delete(root: &mut Value, path: &Path, key: &OpKey) -> Result<Option<Undo>, ApplyError> {
    let container = resolve(root, path)?;
    match key {
        OpKey::Field(field) => {
            let map = expect_object(container, path)?;
            let Some(index) = map.get_index_of(field.as_str()) else {
                return Err(ApplyError::MissingField {
                    path: path.clone(),
                    field: field.clone(),
                });
            };
            let value = map[index].clone();
            object_mut(root, path)?.shift_remove(field.as_str());
            Ok(Some(Undo::ObjectInsert {
                path: path.clone(),
                key: field.clone(),
                value,
                index,
            }))
        }
        OpKey::Index(index) => {
            let items = expect_array(container, path)?;
            let len = items.len();
            let Some(prev) = items.get(*index).cloned() else {
                return Err(ApplyError::IndexOutOfBounds {
                    path: path.clone(),
                    index: *index,
                    len,
                });
            };
            // A deleted slot becomes a hole; length is unchanged.
            array_mut(root, path)?[*index] = Value::Undefined;
            Ok(Some(Undo::ArraySet {
                path: path.clone(),
                index: *index,
                prev,
            }))
        }
        OpKey::Length => Err(ApplyError::InvalidLength { path: path.clone() }),
    }
}

fn exec_splice(
    root: &mut Value,
    path: &Path,
    index: i64,
    delete_count: i64,
    inserts: &[Value],
) -> Result<Option<Undo>, ApplyError> {
    let container = resolve(root, path)?;
    let items = expect_array(container, path)?;
    let len = items.len();
    let start = clamp_splice_start(index, len);
    let remaining = len - start;
    let removing = usize::try_from(delete_count.max(0))
        .unwrap_or(usize::MAX)
        .min(remaining);
    if removing == 0 && inserts.is_empty() {
        return Ok(None);
    }
    let removed: Vec<Value> = array_mut(root, path)?
        .splice(start..start + removing, inserts.iter().cloned())
        .collect();
    Ok(Some(Undo::Splice {
        path: path.clone(),
        index: start,
        inserted: inserts.len(),
        removed,
    }))
}

fn exec_add_to_set(root: &mut Value, path: &Path, value: &Value) -> Result<Option<Undo>, ApplyError> {
    let container = resolve(root, path)?;
    let items = expect_array(container, path)?;
    if items.iter().any(|item| item.structural_eq(value)) {
        // Already present; leave the tree identity untouched.
        return Ok(None);
    }
    let len = items.len();
    array_mut(root, path)?.push(value.clone());
    Ok(Some(Undo::ArrayTruncate {
        path: path.clone(),
        len,
    }))
}

fn exec_delete_from_set(
    root: &mut Value,
    path: &Path,
    value: &Value,
) -> Result<Option<Undo>, ApplyError> {
    let container = resolve(root, path)?;
    let items = expect_array(container, path)?;
    let victims: Vec<(usize, Value)> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.structural_eq(value))
        .map(|(i, item)| (i, item.clone()))
        .collect();
    if victims.is_empty() {
        return Ok(None);
    }
    let array = array_mut(root, path)?;
    // Remove from the back so earlier indexes stay valid.
    for (i, _) in victims.iter().rev() {
        array.remove(*i);
    }
    Ok(Some(Undo::ArrayInsertMany {
        path: path.clone(),
        items: victims,
    }))
}

/// Replays one inverse entry. Failures here would mean the journal and the
/// tree disagree, which the applier's atomicity makes impossible.
fn revert(root: &mut Value, undo: Undo) {
    let ok = match undo {
        Undo::ObjectSet { path, key, prev } => object_mut(root, &path)
            .map(|map| {
                map.insert(key, prev);
            })
            .is_ok(),
        Undo::ObjectPop { path, key } => object_mut(root, &path)
            .map(|map| {
                map.shift_remove(key.as_str());
            })
            .is_ok(),
        Undo::ObjectInsert {
            path,
            key,
            value,
            index,
        } => object_mut(root, &path)
            .map(|map| {
                map.shift_insert(index, key, value);
            })
            .is_ok(),
        Undo::ArraySet { path, index, prev } => array_mut(root, &path)
            .map(|items| {
                items[index] = prev;
            })
            .is_ok(),
        Undo::ArrayTruncate { path, len } => array_mut(root, &path)
            .map(|items| {
                items.truncate(len);
            })
            .is_ok(),
        Undo::ArrayExtend { path, tail } => array_mut(root, &path)
            .map(|items| {
                items.extend(tail);
            })
            .is_ok(),
        Undo::Splice {
            path,
            index,
            inserted,
            removed,
        } => array_mut(root, &path)
            .map(|items| {
                items.splice(index..index + inserted, removed);
            })
            .is_ok(),
        Undo::ArrayInsertMany { path, items } => array_mut(root, &path)
            .map(|array| {
                for (i, value) in items {
                    array.insert(i, value);
                }
            })
            .is_ok(),
    };
    debug_assert!(ok, "undo journal replay failed");
}

/// Applies a transaction's ops in place, rolling back on any failure.
///
/// On success the tree holds the post-transaction state. On `Err` the undo
/// journal has been replayed in reverse and the tree is structurally
/// identical to its pre-call state.
///
/// # Errors
///
/// Returns the first op's rejection reason, or
/// [`ApplyError::ValidationRejected`] when `validate` refuses the candidate.
pub fn apply_ops_mut(
    target: &mut Value,
    ops: &[Op],
    validate: Option<&dyn Fn(&Value) -> bool>,
) -> Result<(), ApplyError> {
    let mut journal: Vec<Undo> = Vec::with_capacity(ops.len());
    let mut failure: Option<ApplyError> = None;
    for op in ops {
        if let Err(err) = exec_op(target, op, Some(&mut journal)) {
            failure = Some(err);
            break;
        }
    }
    if failure.is_none() {
        if let Some(validate) = validate {
            if !validate(target) {
                failure = Some(ApplyError::ValidationRejected);
            }
        }
    }
    match failure {
        None => Ok(()),
        Some(err) => {
            for undo in journal.into_iter().rev() {
                revert(target, undo);
            }
            Err(err)
        }
    }
}
