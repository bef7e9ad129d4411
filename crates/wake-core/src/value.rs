// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! JSON value model and paths.
//!
//! [`Value`] is the document data model: a JSON-shaped sum type whose
//! container variants are reference-counted so that derived states can share
//! untouched subtrees. Cloning a `Value` is O(1); deep copies are explicit
//! via [`Value::deep_clone`].
//!
//! Determinism contract
//! - Objects preserve insertion order ([`indexmap::IndexMap`]); two peers
//!   that apply the same operations produce objects with identical key
//!   order, so iteration-dependent code (diffing, serialization) is
//!   bit-identical across peers.
//! - Structural equality treats `NaN` as equal to `NaN` and distinguishes
//!   `0.0` from `-0.0` (SameValue semantics). Reference equality on
//!   containers is pointer identity.
//! - Arrays have no absent slots. A deleted array index holds
//!   [`Value::Undefined`], which is a real element; object fields may be
//!   explicitly `Undefined`, which is distinct from the field being absent.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Insertion-ordered object representation.
pub type ObjectMap = IndexMap<String, Value>;

/// A JSON document value.
///
/// Containers (`Array`, `Object`) and strings are `Rc`-shared: `clone` bumps
/// a refcount, and mutation goes through copy-on-write (see
/// [`crate::draft`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// An explicitly-undefined slot. Distinct from an absent object field.
    Undefined,
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number (IEEE-754 double, matching the replicated data model).
    Number(f64),
    /// JSON string.
    String(Rc<str>),
    /// JSON array. No holes; deleted slots hold [`Value::Undefined`].
    Array(Rc<Vec<Value>>),
    /// JSON object with insertion-ordered fields.
    Object(Rc<ObjectMap>),
}

/// Discriminant of a [`Value`], used in diagnostics and kind checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// [`Value::Undefined`].
    Undefined,
    /// [`Value::Null`].
    Null,
    /// [`Value::Bool`].
    Bool,
    /// [`Value::Number`].
    Number,
    /// [`Value::String`].
    String,
    /// [`Value::Array`].
    Array,
    /// [`Value::Object`].
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// SameValue comparison for numbers: `NaN == NaN`, `0.0 != -0.0`.
fn number_eq(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    a.to_bits() == b.to_bits()
}

impl Value {
    /// Returns an empty object value.
    #[must_use]
    pub fn empty_object() -> Self {
        Self::Object(Rc::new(ObjectMap::new()))
    }

    /// Returns an empty array value.
    #[must_use]
    pub fn empty_array() -> Self {
        Self::Array(Rc::new(Vec::new()))
    }

    /// Builds an object from `(key, value)` pairs, preserving pair order.
    pub fn object_from<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map: ObjectMap = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::Object(Rc::new(map))
    }

    /// Builds an array from values, preserving order.
    pub fn array_from<V, I>(items: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Self::Array(Rc::new(items.into_iter().map(Into::into).collect()))
    }

    /// Returns the value's kind discriminant.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Undefined => ValueKind::Undefined,
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::String(_) => ValueKind::String,
            Self::Array(_) => ValueKind::Array,
            Self::Object(_) => ValueKind::Object,
        }
    }

    /// Returns `true` for [`Value::Undefined`].
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Returns the object map when this value is an object.
    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectMap> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the element slice when this value is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the string slice when this value is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number when this value is a number.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Resolves a child by path segment without cloning.
    #[must_use]
    pub fn child(&self, segment: &PathSegment) -> Option<&Value> {
        match (segment, self) {
            (PathSegment::Key(k), Self::Object(map)) => map.get(k.as_str()),
            (PathSegment::Index(i), Self::Array(items)) => items.get(*i),
            _ => None,
        }
    }

    /// Resolves a descendant by path without cloning.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> Option<&Value> {
        let mut node = self;
        for segment in path.segments() {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Reference equality.
    ///
    /// Containers and strings compare by pointer identity; `Undefined`,
    /// `Null`, booleans, and numbers compare by value (numbers by bits, so
    /// `-0.0` and `0.0` are distinct and any `NaN` equals only its own bit
    /// pattern).
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        match (a, b) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(x), Self::Bool(y)) => x == y,
            (Self::Number(x), Self::Number(y)) => x.to_bits() == y.to_bits(),
            (Self::String(x), Self::String(y)) => Rc::ptr_eq(x, y),
            (Self::Array(x), Self::Array(y)) => Rc::ptr_eq(x, y),
            (Self::Object(x), Self::Object(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }

    /// Structural (deep) equality.
    ///
    /// Objects compare as unordered key sets with equal values; arrays
    /// compare element-wise. Numbers use SameValue semantics.
    #[must_use]
    pub fn structural_eq(&self, other: &Self) -> bool {
        if Self::ptr_eq(self, other) {
            return true;
        }
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => number_eq(*a, *b),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.structural_eq(y))
            }
            (Self::Object(a), Self::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.structural_eq(w)))
            }
            _ => false,
        }
    }

    /// Recursively detaches this value from any shared structure.
    ///
    /// The result shares nothing with `self`; every container is freshly
    /// allocated.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        match self {
            Self::Undefined => Self::Undefined,
            Self::Null => Self::Null,
            Self::Bool(b) => Self::Bool(*b),
            Self::Number(n) => Self::Number(*n),
            Self::String(s) => Self::String(Rc::from(&**s)),
            Self::Array(items) => {
                Self::Array(Rc::new(items.iter().map(Value::deep_clone).collect()))
            }
            Self::Object(map) => Self::Object(Rc::new(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.deep_clone()))
                    .collect(),
            )),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(other)
    }
}

// Structural equality is reflexive here because NaN equals NaN.
impl Eq for Value {}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for Value {
    #[allow(clippy::cast_precision_loss)]
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(Rc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(Rc::from(v.as_str()))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(Rc::new(v))
    }
}

impl From<ObjectMap> for Value {
    fn from(v: ObjectMap) -> Self {
        Self::Object(Rc::new(v))
    }
}

/// One step of a document path: an object field or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// Object field name.
    Key(String),
    /// Array element index.
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(v: &str) -> Self {
        Self::Key(v.to_owned())
    }
}

impl From<String> for PathSegment {
    fn from(v: String) -> Self {
        Self::Key(v)
    }
}

impl From<usize> for PathSegment {
    fn from(v: usize) -> Self {
        Self::Index(v)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, ".{k}"),
            Self::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// An ordered sequence of segments addressing a node in the document tree.
///
/// The empty path addresses the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path(Vec<PathSegment>);

impl Path {
    /// The empty path (document root).
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Builds a path from anything convertible to segments.
    pub fn of<S, I>(segments: I) -> Self
    where
        S: Into<PathSegment>,
        I: IntoIterator<Item = S>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Returns `true` when this path addresses the root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the path has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The path's segments, root-first.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Returns a new path with `segment` appended.
    #[must_use]
    pub fn join(&self, segment: impl Into<PathSegment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(v: Vec<PathSegment>) -> Self {
        Self(v)
    }
}

impl FromIterator<PathSegment> for Path {
    fn from_iter<I: IntoIterator<Item = PathSegment>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.0 {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}
