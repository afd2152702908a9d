//! Dynamic property values
//!
//! Every component property, whether it arrives as a markup string or as a
//! structured value from code, is carried as a [`PropValue`]. Parsed
//! component data, cached attribute values and mixin caches all use the
//! same representation so they can be merged without re-parsing.
//!
//! Equality is structural (see [`PropValue`]'s `PartialEq`). It is the one
//! rule used everywhere a "did the data change?" decision is made.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered property map used for multi-property component data
pub type PropMap = IndexMap<String, PropValue>;

/// Opaque reference to a node in the host document
///
/// The scene crate converts its slotmap keys to and from this handle so the
/// schema engine can resolve selectors without depending on the document type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(pub u64);

impl NodeHandle {
    /// Convert to raw u64
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from raw u64
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// 2D vector property
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

/// 3D vector property
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// 4D vector property
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Vec4 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Vec2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl Vec4 {
    pub const fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }
}

impl PartialEq for Vec2 {
    fn eq(&self, other: &Self) -> bool {
        float_eq(self.x, other.x) && float_eq(self.y, other.y)
    }
}

impl PartialEq for Vec3 {
    fn eq(&self, other: &Self) -> bool {
        float_eq(self.x, other.x) && float_eq(self.y, other.y) && float_eq(self.z, other.z)
    }
}

impl PartialEq for Vec4 {
    fn eq(&self, other: &Self) -> bool {
        float_eq(self.x, other.x)
            && float_eq(self.y, other.y)
            && float_eq(self.z, other.z)
            && float_eq(self.w, other.w)
    }
}

/// NaN compares equal to NaN so a NaN-valued property does not update every frame.
fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// A property value
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum PropValue {
    /// Absent / undefined
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Int(i64),
    Str(String),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Array(Vec<PropValue>),
    /// A resolved document node (selector, media asset)
    Node(NodeHandle),
    /// A list of resolved document nodes
    Nodes(Vec<NodeHandle>),
    /// Multi-property data or a partial structured value
    Map(Box<PropMap>),
}

impl PartialEq for PropValue {
    fn eq(&self, other: &Self) -> bool {
        use PropValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => float_eq(*a, *b),
            (Int(a), Int(b)) => a == b,
            (Number(a), Int(b)) | (Int(b), Number(a)) => float_eq(*a, *b as f64),
            (Str(a), Str(b)) => a == b,
            (Vec2(a), Vec2(b)) => a == b,
            (Vec3(a), Vec3(b)) => a == b,
            (Vec4(a), Vec4(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Node(a), Node(b)) => a == b,
            (Nodes(a), Nodes(b)) => a == b,
            // IndexMap equality ignores insertion order
            (Map(a), Map(b)) => a == b,
            _ => false,
        }
    }
}

impl PropValue {
    /// Create an empty map value
    pub fn empty_map() -> Self {
        PropValue::Map(Box::default())
    }

    /// Create a map value from key/value pairs
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, PropValue)>,
    {
        PropValue::Map(Box::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Whether this value counts as "not provided" (null or empty string)
    pub fn is_empty_input(&self) -> bool {
        match self {
            PropValue::Null => true,
            PropValue::Str(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Number(n) => Some(*n),
            PropValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropValue::Int(i) => Some(*i),
            PropValue::Number(n) => Some(n.trunc() as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            PropValue::Vec3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<NodeHandle> {
        match self {
            PropValue::Node(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&PropMap> {
        match self {
            PropValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut PropMap> {
        match self {
            PropValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a key of a map value
    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Short name of the variant, used in warnings
    pub fn kind(&self) -> &'static str {
        match self {
            PropValue::Null => "null",
            PropValue::Bool(_) => "boolean",
            PropValue::Number(_) => "number",
            PropValue::Int(_) => "int",
            PropValue::Str(_) => "string",
            PropValue::Vec2(_) => "vec2",
            PropValue::Vec3(_) => "vec3",
            PropValue::Vec4(_) => "vec4",
            PropValue::Array(_) => "array",
            PropValue::Node(_) => "node",
            PropValue::Nodes(_) => "nodes",
            PropValue::Map(_) => "map",
        }
    }

    /// Plain attribute-string form, without any type-specific formatting
    pub fn to_attr_string(&self) -> String {
        self.to_string()
    }
}

fn format_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Null => Ok(()),
            PropValue::Bool(b) => write!(f, "{}", b),
            PropValue::Number(n) => format_number(f, *n),
            PropValue::Int(i) => write!(f, "{}", i),
            PropValue::Str(s) => f.write_str(s),
            PropValue::Vec2(v) => {
                format_number(f, v.x)?;
                f.write_str(" ")?;
                format_number(f, v.y)
            }
            PropValue::Vec3(v) => {
                format_number(f, v.x)?;
                f.write_str(" ")?;
                format_number(f, v.y)?;
                f.write_str(" ")?;
                format_number(f, v.z)
            }
            PropValue::Vec4(v) => {
                format_number(f, v.x)?;
                f.write_str(" ")?;
                format_number(f, v.y)?;
                f.write_str(" ")?;
                format_number(f, v.z)?;
                f.write_str(" ")?;
                format_number(f, v.w)
            }
            PropValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            PropValue::Node(n) => write!(f, "node:{}", n.0),
            PropValue::Nodes(nodes) => {
                for (i, n) in nodes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "node:{}", n.0)?;
                }
                Ok(())
            }
            PropValue::Map(map) => {
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                Ok(())
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions
// ─────────────────────────────────────────────────────────────────────────────

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::Str(s.to_string())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        PropValue::Str(s)
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        PropValue::Bool(b)
    }
}

impl From<f64> for PropValue {
    fn from(n: f64) -> Self {
        PropValue::Number(n)
    }
}

impl From<i64> for PropValue {
    fn from(i: i64) -> Self {
        PropValue::Int(i)
    }
}

impl From<Vec2> for PropValue {
    fn from(v: Vec2) -> Self {
        PropValue::Vec2(v)
    }
}

impl From<Vec3> for PropValue {
    fn from(v: Vec3) -> Self {
        PropValue::Vec3(v)
    }
}

impl From<Vec4> for PropValue {
    fn from(v: Vec4) -> Self {
        PropValue::Vec4(v)
    }
}

impl From<NodeHandle> for PropValue {
    fn from(n: NodeHandle) -> Self {
        PropValue::Node(n)
    }
}

impl From<PropMap> for PropValue {
    fn from(m: PropMap) -> Self {
        PropValue::Map(Box::new(m))
    }
}

impl<T: Into<PropValue>> From<Vec<T>> for PropValue {
    fn from(items: Vec<T>) -> Self {
        PropValue::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for PropValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Json::Null => PropValue::Null,
            Json::Bool(b) => PropValue::Bool(b),
            Json::Number(n) => PropValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => PropValue::Str(s),
            Json::Array(items) => PropValue::Array(items.into_iter().map(Into::into).collect()),
            Json::Object(obj) => PropValue::Map(Box::new(
                obj.into_iter().map(|(k, v)| (k, v.into())).collect(),
            )),
        }
    }
}
