//! Property types
//!
//! A property type knows how to turn a raw attribute value (usually a markup
//! string, sometimes an already-structured value from code) into a typed
//! [`PropValue`], and back into a string. Parsers must be idempotent: feeding
//! a parser its own output returns that output unchanged, so re-merging data
//! that was parsed earlier never double-coerces.
//!
//! Built-in types:
//!
//! | name | default | notes |
//! |---|---|---|
//! | `string` | `""` | |
//! | `number` | `0` | leading-float parse |
//! | `int` | `0` | truncates |
//! | `boolean` | `false` | only `"false"` / `false` are false |
//! | `color` | `"#FFF"` | stored untransformed |
//! | `vec2`, `vec3`, `vec4` | zero vector | whitespace-separated or partial map |
//! | `array` | `[]` | comma-separated |
//! | `selector` | `null` | `#id` fast path |
//! | `selectorAll` | `null` | list of nodes |
//! | `asset` | `""` | `#id`, `url(...)` or raw |

use crate::error::{CoreError, Result};
use crate::value::{NodeHandle, PropMap, PropValue, Vec2, Vec3, Vec4};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Name of the permissive fallback type used for unknown type names
pub const PASSTHROUGH: &str = "passthrough";

/// Read access to the host document, used by selector and asset parsing
pub trait NodeLookup {
    /// Find a node by its `id` attribute
    fn element_by_id(&self, id: &str) -> Option<NodeHandle>;

    /// First node matching a selector
    fn query_selector(&self, selector: &str) -> Option<NodeHandle>;

    /// Every node matching a selector, in document order
    fn query_selector_all(&self, selector: &str) -> Vec<NodeHandle>;

    /// Markup attribute of a node
    fn attribute(&self, node: NodeHandle, name: &str) -> Option<String>;

    /// Whether the node is an image/video/audio/canvas style media element
    fn is_media_element(&self, node: NodeHandle) -> bool;

    /// The node's `id` attribute
    fn element_id(&self, node: NodeHandle) -> Option<String> {
        self.attribute(node, "id")
    }
}

/// Lookup that resolves nothing (schema registration, tests)
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLookup;

impl NodeLookup for NoLookup {
    fn element_by_id(&self, _id: &str) -> Option<NodeHandle> {
        None
    }

    fn query_selector(&self, _selector: &str) -> Option<NodeHandle> {
        None
    }

    fn query_selector_all(&self, _selector: &str) -> Vec<NodeHandle> {
        Vec::new()
    }

    fn attribute(&self, _node: NodeHandle, _name: &str) -> Option<String> {
        None
    }

    fn is_media_element(&self, _node: NodeHandle) -> bool {
        false
    }
}

/// A named property type with parse/stringify behaviour
pub trait PropertyType: Send + Sync {
    /// Registered type name
    fn name(&self) -> &str;

    /// Default used when a declaration omits one
    fn default_value(&self) -> PropValue;

    /// Coerce a raw value. `default` is the property's declared default.
    fn parse(&self, raw: &PropValue, default: &PropValue, lookup: &dyn NodeLookup) -> PropValue;

    /// Attribute-string form of a parsed value
    fn stringify(&self, value: &PropValue, _lookup: &dyn NodeLookup) -> String {
        value.to_attr_string()
    }

    /// Whether a declared default has the runtime shape this type produces
    fn accepts_default(&self, _default: &PropValue) -> bool {
        true
    }
}

/// Registry of property types
#[derive(Clone)]
pub struct PropertyTypes {
    types: FxHashMap<String, Arc<dyn PropertyType>>,
}

impl Default for PropertyTypes {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for PropertyTypes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort();
        f.debug_struct("PropertyTypes").field("types", &names).finish()
    }
}

impl PropertyTypes {
    /// Registry with no types at all
    pub fn empty() -> Self {
        Self {
            types: FxHashMap::default(),
        }
    }

    /// Registry with every built-in type
    pub fn with_builtins() -> Self {
        let mut types = Self::empty();
        let builtins: Vec<Arc<dyn PropertyType>> = vec![
            Arc::new(StringType::new("string", "")),
            Arc::new(StringType::new("color", "#FFF")),
            Arc::new(NumberType),
            Arc::new(IntType),
            Arc::new(BooleanType),
            Arc::new(VecType::<2>),
            Arc::new(VecType::<3>),
            Arc::new(VecType::<4>),
            Arc::new(ArrayType),
            Arc::new(SelectorType),
            Arc::new(SelectorAllType),
            Arc::new(AssetType),
            Arc::new(PassthroughType),
        ];
        for ty in builtins {
            types.types.insert(ty.name().to_string(), ty);
        }
        types
    }

    /// Register a custom property type
    pub fn register(&mut self, ty: Arc<dyn PropertyType>) -> Result<()> {
        let name = ty.name().to_string();
        if self.types.contains_key(&name) {
            return Err(CoreError::DuplicatePropertyType(name));
        }
        self.types.insert(name, ty);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PropertyType>> {
        self.types.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// The permissive fallback type
    pub fn passthrough(&self) -> Arc<dyn PropertyType> {
        self.types
            .get(PASSTHROUGH)
            .cloned()
            .unwrap_or_else(|| Arc::new(PassthroughType))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scalar types
// ─────────────────────────────────────────────────────────────────────────────

/// `string` and `color`
struct StringType {
    name: &'static str,
    default: &'static str,
}

impl StringType {
    fn new(name: &'static str, default: &'static str) -> Self {
        Self { name, default }
    }
}

impl PropertyType for StringType {
    fn name(&self) -> &str {
        self.name
    }

    fn default_value(&self) -> PropValue {
        PropValue::from(self.default)
    }

    fn parse(&self, raw: &PropValue, _default: &PropValue, _lookup: &dyn NodeLookup) -> PropValue {
        match raw {
            PropValue::Str(_) => raw.clone(),
            PropValue::Null => PropValue::from(""),
            other => PropValue::Str(other.to_attr_string()),
        }
    }

    fn accepts_default(&self, default: &PropValue) -> bool {
        matches!(default, PropValue::Str(_))
    }
}

/// Parse the longest leading float, like a lenient number reader
pub fn parse_leading_float(s: &str) -> f64 {
    let s = s.trim();
    if let Ok(n) = s.parse::<f64>() {
        return n;
    }
    let bytes = s.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        let c = bytes[end];
        match c {
            b'0'..=b'9' => seen_digit = true,
            b'+' | b'-' if end == 0 => {}
            b'+' | b'-' if seen_exp && matches!(bytes[end - 1], b'e' | b'E') => {}
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        end += 1;
    }
    // Back off a dangling exponent or sign
    while end > 0 {
        if let Ok(n) = s[..end].parse::<f64>() {
            return n;
        }
        end -= 1;
    }
    f64::NAN
}

struct NumberType;

impl PropertyType for NumberType {
    fn name(&self) -> &str {
        "number"
    }

    fn default_value(&self) -> PropValue {
        PropValue::Number(0.0)
    }

    fn parse(&self, raw: &PropValue, _default: &PropValue, _lookup: &dyn NodeLookup) -> PropValue {
        match raw {
            PropValue::Number(_) => raw.clone(),
            PropValue::Int(i) => PropValue::Number(*i as f64),
            PropValue::Str(s) => PropValue::Number(parse_leading_float(s)),
            PropValue::Bool(b) => PropValue::Number(if *b { 1.0 } else { 0.0 }),
            _ => PropValue::Number(f64::NAN),
        }
    }

    fn accepts_default(&self, default: &PropValue) -> bool {
        matches!(default, PropValue::Number(_) | PropValue::Int(_))
    }
}

struct IntType;

impl PropertyType for IntType {
    fn name(&self) -> &str {
        "int"
    }

    fn default_value(&self) -> PropValue {
        PropValue::Int(0)
    }

    fn parse(&self, raw: &PropValue, default: &PropValue, _lookup: &dyn NodeLookup) -> PropValue {
        let n = match raw {
            PropValue::Int(_) => return raw.clone(),
            PropValue::Number(n) => *n,
            PropValue::Str(s) => parse_leading_float(s),
            PropValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            _ => f64::NAN,
        };
        if n.is_finite() {
            PropValue::Int(n.trunc() as i64)
        } else {
            default.as_i64().map(PropValue::Int).unwrap_or(PropValue::Int(0))
        }
    }

    fn accepts_default(&self, default: &PropValue) -> bool {
        matches!(default, PropValue::Number(_) | PropValue::Int(_))
    }
}

struct BooleanType;

impl PropertyType for BooleanType {
    fn name(&self) -> &str {
        "boolean"
    }

    fn default_value(&self) -> PropValue {
        PropValue::Bool(false)
    }

    fn parse(&self, raw: &PropValue, _default: &PropValue, _lookup: &dyn NodeLookup) -> PropValue {
        match raw {
            PropValue::Bool(_) => raw.clone(),
            PropValue::Str(s) => PropValue::Bool(s != "false"),
            PropValue::Null => PropValue::Bool(false),
            _ => PropValue::Bool(true),
        }
    }

    fn accepts_default(&self, default: &PropValue) -> bool {
        matches!(default, PropValue::Bool(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vectors
// ─────────────────────────────────────────────────────────────────────────────

const AXES: [&str; 4] = ["x", "y", "z", "w"];

fn vec_components(value: &PropValue) -> Option<[f64; 4]> {
    match value {
        PropValue::Vec2(v) => Some([v.x, v.y, 0.0, 0.0]),
        PropValue::Vec3(v) => Some([v.x, v.y, v.z, 0.0]),
        PropValue::Vec4(v) => Some([v.x, v.y, v.z, v.w]),
        _ => None,
    }
}

fn vec_from_components<const N: usize>(c: [f64; 4]) -> PropValue {
    match N {
        2 => PropValue::Vec2(Vec2::new(c[0], c[1])),
        3 => PropValue::Vec3(Vec3::new(c[0], c[1], c[2])),
        _ => PropValue::Vec4(Vec4::new(c[0], c[1], c[2], c[3])),
    }
}

fn component_of(value: &PropValue) -> Option<f64> {
    match value {
        PropValue::Number(n) => Some(*n),
        PropValue::Int(i) => Some(*i as f64),
        PropValue::Str(s) => {
            let n = parse_leading_float(s);
            (!n.is_nan()).then_some(n)
        }
        _ => None,
    }
}

/// `vec2`, `vec3`, `vec4`
struct VecType<const N: usize>;

impl<const N: usize> VecType<N> {
    fn merge_map(map: &PropMap, base: [f64; 4]) -> [f64; 4] {
        let mut out = base;
        for (i, axis) in AXES.iter().enumerate().take(N) {
            if let Some(n) = map.get(*axis).and_then(component_of) {
                out[i] = n;
            }
        }
        out
    }
}

impl<const N: usize> PropertyType for VecType<N> {
    fn name(&self) -> &str {
        match N {
            2 => "vec2",
            3 => "vec3",
            _ => "vec4",
        }
    }

    fn default_value(&self) -> PropValue {
        vec_from_components::<N>([0.0; 4])
    }

    fn parse(&self, raw: &PropValue, default: &PropValue, _lookup: &dyn NodeLookup) -> PropValue {
        let base = vec_components(default)
            .or_else(|| default.as_map().map(|m| Self::merge_map(m, [0.0; 4])))
            .unwrap_or([0.0; 4]);
        match raw {
            PropValue::Vec2(_) | PropValue::Vec3(_) | PropValue::Vec4(_) => {
                let c = vec_components(raw).unwrap_or(base);
                // Same arity returns the value as-is
                let same = matches!(
                    (N, raw),
                    (2, PropValue::Vec2(_)) | (3, PropValue::Vec3(_)) | (4, PropValue::Vec4(_))
                );
                if same {
                    raw.clone()
                } else {
                    vec_from_components::<N>(c)
                }
            }
            PropValue::Map(map) => vec_from_components::<N>(Self::merge_map(map, base)),
            PropValue::Str(s) => {
                let mut out = base;
                for (i, part) in s.split_whitespace().take(N).enumerate() {
                    let n = parse_leading_float(part);
                    if !n.is_nan() {
                        out[i] = n;
                    }
                }
                vec_from_components::<N>(out)
            }
            PropValue::Number(_) | PropValue::Int(_) => {
                let mut out = base;
                if let Some(n) = component_of(raw) {
                    out[0] = n;
                }
                vec_from_components::<N>(out)
            }
            _ => vec_from_components::<N>(base),
        }
    }

    fn accepts_default(&self, default: &PropValue) -> bool {
        matches!(
            default,
            PropValue::Vec2(_) | PropValue::Vec3(_) | PropValue::Vec4(_) | PropValue::Map(_)
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arrays
// ─────────────────────────────────────────────────────────────────────────────

struct ArrayType;

impl PropertyType for ArrayType {
    fn name(&self) -> &str {
        "array"
    }

    fn default_value(&self) -> PropValue {
        PropValue::Array(Vec::new())
    }

    fn parse(&self, raw: &PropValue, _default: &PropValue, _lookup: &dyn NodeLookup) -> PropValue {
        match raw {
            PropValue::Array(_) => raw.clone(),
            PropValue::Str(s) if s.trim().is_empty() => PropValue::Array(Vec::new()),
            PropValue::Str(s) => PropValue::Array(
                s.split(',')
                    .map(|item| PropValue::from(item.trim()))
                    .collect(),
            ),
            PropValue::Null => PropValue::Array(Vec::new()),
            other => PropValue::Array(vec![other.clone()]),
        }
    }

    fn accepts_default(&self, default: &PropValue) -> bool {
        matches!(default, PropValue::Array(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Selectors
// ─────────────────────────────────────────────────────────────────────────────

/// `#some-id` with nothing else in it
pub fn simple_id_selector(selector: &str) -> Option<&str> {
    let id = selector.strip_prefix('#')?;
    let simple = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_');
    simple.then_some(id)
}

fn query_one(selector: &str, lookup: &dyn NodeLookup) -> Option<NodeHandle> {
    match simple_id_selector(selector) {
        Some(id) => lookup.element_by_id(id),
        None => lookup.query_selector(selector),
    }
}

fn node_selector_string(node: NodeHandle, lookup: &dyn NodeLookup) -> String {
    lookup
        .element_id(node)
        .map(|id| format!("#{}", id))
        .unwrap_or_default()
}

struct SelectorType;

impl PropertyType for SelectorType {
    fn name(&self) -> &str {
        "selector"
    }

    fn default_value(&self) -> PropValue {
        PropValue::Null
    }

    fn parse(&self, raw: &PropValue, _default: &PropValue, lookup: &dyn NodeLookup) -> PropValue {
        match raw {
            PropValue::Node(_) => raw.clone(),
            PropValue::Str(s) if !s.trim().is_empty() => query_one(s.trim(), lookup)
                .map(PropValue::Node)
                .unwrap_or(PropValue::Null),
            _ => PropValue::Null,
        }
    }

    fn stringify(&self, value: &PropValue, lookup: &dyn NodeLookup) -> String {
        match value {
            PropValue::Node(node) => node_selector_string(*node, lookup),
            PropValue::Str(s) => s.clone(),
            _ => String::new(),
        }
    }

    fn accepts_default(&self, default: &PropValue) -> bool {
        matches!(default, PropValue::Null | PropValue::Str(_) | PropValue::Node(_))
    }
}

struct SelectorAllType;

impl PropertyType for SelectorAllType {
    fn name(&self) -> &str {
        "selectorAll"
    }

    fn default_value(&self) -> PropValue {
        PropValue::Null
    }

    fn parse(&self, raw: &PropValue, _default: &PropValue, lookup: &dyn NodeLookup) -> PropValue {
        match raw {
            PropValue::Nodes(_) => raw.clone(),
            PropValue::Node(node) => PropValue::Nodes(vec![*node]),
            PropValue::Str(s) if !s.trim().is_empty() => {
                PropValue::Nodes(lookup.query_selector_all(s.trim()))
            }
            PropValue::Str(_) => PropValue::Nodes(Vec::new()),
            _ => PropValue::Null,
        }
    }

    fn stringify(&self, value: &PropValue, lookup: &dyn NodeLookup) -> String {
        match value {
            PropValue::Nodes(nodes) => nodes
                .iter()
                .map(|n| node_selector_string(*n, lookup))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
            PropValue::Str(s) => s.clone(),
            _ => String::new(),
        }
    }

    fn accepts_default(&self, default: &PropValue) -> bool {
        matches!(default, PropValue::Null | PropValue::Str(_) | PropValue::Nodes(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Assets
// ─────────────────────────────────────────────────────────────────────────────

/// Strip a `url(...)` wrapper and optional quotes
pub fn unwrap_url(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    let lower = trimmed.get(..4)?.to_ascii_lowercase();
    if lower != "url(" || !trimmed.ends_with(')') {
        return None;
    }
    let inner = trimmed[4..trimmed.len() - 1].trim();
    let inner = inner
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(inner);
    Some(inner)
}

struct AssetType;

impl PropertyType for AssetType {
    fn name(&self) -> &str {
        "asset"
    }

    fn default_value(&self) -> PropValue {
        PropValue::from("")
    }

    fn parse(&self, raw: &PropValue, _default: &PropValue, lookup: &dyn NodeLookup) -> PropValue {
        let s = match raw {
            PropValue::Node(_) => return raw.clone(),
            PropValue::Str(s) => s,
            PropValue::Null => return PropValue::from(""),
            other => return PropValue::Str(other.to_attr_string()),
        };

        if let Some(id) = s.trim().strip_prefix('#') {
            return match lookup.element_by_id(id) {
                Some(node) if lookup.is_media_element(node) => PropValue::Node(node),
                Some(node) => PropValue::Str(lookup.attribute(node, "src").unwrap_or_default()),
                None => {
                    tracing::warn!("Asset `#{}` not found", id);
                    PropValue::from("")
                }
            };
        }

        match unwrap_url(s) {
            Some(url) => PropValue::from(url),
            None => raw.clone(),
        }
    }

    fn stringify(&self, value: &PropValue, lookup: &dyn NodeLookup) -> String {
        match value {
            PropValue::Node(node) => node_selector_string(*node, lookup),
            other => other.to_attr_string(),
        }
    }

    fn accepts_default(&self, default: &PropValue) -> bool {
        matches!(default, PropValue::Str(_) | PropValue::Null)
    }
}

/// Fallback for unknown type names: values pass through untouched
struct PassthroughType;

impl PropertyType for PassthroughType {
    fn name(&self) -> &str {
        PASSTHROUGH
    }

    fn default_value(&self) -> PropValue {
        PropValue::Null
    }

    fn parse(&self, raw: &PropValue, _default: &PropValue, _lookup: &dyn NodeLookup) -> PropValue {
        raw.clone()
    }
}
