// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The replicated operation algebra.
//!
//! Every document mutation is expressed as one of five [`Op`] variants. Ops
//! are recorded exactly as authored: a splice keeps its original (possibly
//! negative or out-of-range) index and delete count so the same record
//! replays faithfully on every peer, with clamping applied only at
//! execution time.

use serde::{Deserialize, Serialize};

use crate::value::{Path, Value};

/// Addressing of a [`Op::Set`] / [`Op::Delete`] target within its container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKey {
    /// An object field.
    Field(String),
    /// An array element index.
    Index(usize),
    /// The array `length` pseudo-property. Setting it truncates or extends.
    Length,
}

impl From<&str> for OpKey {
    fn from(v: &str) -> Self {
        Self::Field(v.to_owned())
    }
}

impl From<String> for OpKey {
    fn from(v: String) -> Self {
        Self::Field(v)
    }
}

impl From<usize> for OpKey {
    fn from(v: usize) -> Self {
        Self::Index(v)
    }
}

/// A single replicated document operation.
///
/// `path` always addresses the container the operation acts on; the
/// variant's own fields address within it. Path resolution failures, kind
/// mismatches, and out-of-bounds targets reject the enclosing transaction
/// (see [`crate::apply::ApplyError`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Assigns `value` to `container[key]`.
    ///
    /// On objects this inserts or replaces; assigning [`Value::Undefined`]
    /// or [`Value::Null`] keeps the key present. On arrays, `key` must be an
    /// existing index or the append position; `OpKey::Length` truncates or
    /// extends (extension fills with `Undefined`).
    Set {
        /// Path of the container.
        path: Path,
        /// Target within the container.
        key: OpKey,
        /// Value to assign.
        value: Value,
    },

    /// Removes `key` from an object, or punches an `Undefined` hole into an
    /// array slot (length unchanged).
    Delete {
        /// Path of the container.
        path: Path,
        /// Target within the container.
        key: OpKey,
    },

    /// Array splice with node-style semantics.
    ///
    /// `index` and `delete_count` are preserved as authored; execution
    /// clamps the start into `[0, len]` after resolving negative indexes and
    /// clamps the delete count to the remaining length.
    Splice {
        /// Path of the array.
        path: Path,
        /// Authored start index. Negative counts back from the end.
        index: i64,
        /// Authored number of elements to remove.
        delete_count: i64,
        /// Elements inserted at the (clamped) start position.
        inserts: Vec<Value>,
    },

    /// Appends `value` to the array unless a structurally equal element is
    /// already present.
    AddToSet {
        /// Path of the array.
        path: Path,
        /// Candidate element.
        value: Value,
    },

    /// Removes every element structurally equal to `value`.
    DeleteFromSet {
        /// Path of the array.
        path: Path,
        /// Element to remove.
        value: Value,
    },
}

impl Op {
    /// Path of the container this operation targets.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Set { path, .. }
            | Self::Delete { path, .. }
            | Self::Splice { path, .. }
            | Self::AddToSet { path, .. }
            | Self::DeleteFromSet { path, .. } => path,
        }
    }

    /// Convenience constructor for [`Op::Set`].
    pub fn set(path: Path, key: impl Into<OpKey>, value: impl Into<Value>) -> Self {
        Self::Set {
            path,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Convenience constructor for [`Op::Delete`].
    pub fn delete(path: Path, key: impl Into<OpKey>) -> Self {
        Self::Delete {
            path,
            key: key.into(),
        }
    }

    /// Convenience constructor for [`Op::Splice`].
    #[must_use]
    pub fn splice(path: Path, index: i64, delete_count: i64, inserts: Vec<Value>) -> Self {
        Self::Splice {
            path,
            index,
            delete_count,
            inserts,
        }
    }

    /// Convenience constructor for [`Op::AddToSet`].
    pub fn add_to_set(path: Path, value: impl Into<Value>) -> Self {
        Self::AddToSet {
            path,
            value: value.into(),
        }
    }

    /// Convenience constructor for [`Op::DeleteFromSet`].
    pub fn delete_from_set(path: Path, value: impl Into<Value>) -> Self {
        Self::DeleteFromSet {
            path,
            value: value.into(),
        }
    }
}
