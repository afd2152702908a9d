//! Schema engine
//!
//! Components declare their data shape with a [`SchemaDecl`]: either one
//! property (the whole attribute value is parsed with a single type) or an
//! ordered map of named properties (the attribute is a style string and each
//! key is parsed independently). [`process_schema`] resolves a declaration
//! once, at registration time, into a [`Schema`] whose every property has a
//! concrete type, default, parser and stringifier.
//!
//! ```rust
//! use trellis_core::schema::{process_schema, PropertyDecl, SchemaDecl};
//! use trellis_core::{NoLookup, PropValue, PropertyTypes};
//!
//! let decl = SchemaDecl::multi([
//!     ("width", PropertyDecl::new().with_default(1.0)),
//!     ("color", PropertyDecl::typed("color")),
//! ]);
//! let schema = process_schema(&decl, &PropertyTypes::with_builtins());
//! let data = schema.parse_value(&"width: 3".into(), &NoLookup).unwrap();
//! assert_eq!(data.get("width"), Some(&PropValue::Number(3.0)));
//! assert_eq!(data.get("color"), Some(&PropValue::from("#FFF")));
//! ```

use crate::error::{CoreError, Result};
use crate::style::{self, StyleParse};
use crate::types::{NodeLookup, PropertyType, PropertyTypes};
use crate::value::{PropMap, PropValue};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Custom parser: `(raw, lookup) -> value`
pub type ParseFn = Arc<dyn Fn(&PropValue, &dyn NodeLookup) -> PropValue + Send + Sync>;

/// Custom stringifier: `(value, lookup) -> attribute string`
pub type StringifyFn = Arc<dyn Fn(&PropValue, &dyn NodeLookup) -> String + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Declarations
// ─────────────────────────────────────────────────────────────────────────────

/// A partial property definition, as written by a component author
#[derive(Clone, Default)]
pub struct PropertyDecl {
    pub type_name: Option<String>,
    pub default: Option<PropValue>,
    pub one_of: Option<Vec<String>>,
    pub parse: Option<ParseFn>,
    pub stringify: Option<StringifyFn>,
}

impl fmt::Debug for PropertyDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDecl")
            .field("type_name", &self.type_name)
            .field("default", &self.default)
            .field("one_of", &self.one_of)
            .field("custom_parse", &self.parse.is_some())
            .field("custom_stringify", &self.stringify.is_some())
            .finish()
    }
}

impl PropertyDecl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declaration with an explicit type name
    pub fn typed(type_name: impl Into<String>) -> Self {
        Self::new().with_type(type_name)
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<PropValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Restrict string values to a fixed set
    pub fn one_of<I, S>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.one_of = Some(allowed.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_parse<F>(mut self, parse: F) -> Self
    where
        F: Fn(&PropValue, &dyn NodeLookup) -> PropValue + Send + Sync + 'static,
    {
        self.parse = Some(Arc::new(parse));
        self
    }

    pub fn with_stringify<F>(mut self, stringify: F) -> Self
    where
        F: Fn(&PropValue, &dyn NodeLookup) -> String + Send + Sync + 'static,
    {
        self.stringify = Some(Arc::new(stringify));
        self
    }

    /// Read a property declaration from JSON
    ///
    /// An object with `type`, `default` or `oneOf` keys is a full
    /// declaration; any other value is shorthand for `{ default: value }`.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let Some(obj) = value.as_object().filter(|o| {
            o.contains_key("type") || o.contains_key("default") || o.contains_key("oneOf")
        }) else {
            return Self::new().with_default(PropValue::from(value.clone()));
        };

        let mut decl = Self::new();
        if let Some(ty) = obj.get("type").and_then(|t| t.as_str()) {
            decl.type_name = Some(ty.to_string());
        }
        if let Some(default) = obj.get("default") {
            decl.default = Some(PropValue::from(default.clone()));
        }
        if let Some(allowed) = obj.get("oneOf").and_then(|v| v.as_array()) {
            decl.one_of = Some(
                allowed
                    .iter()
                    .map(|v| match v.as_str() {
                        Some(s) => s.to_string(),
                        None => v.to_string(),
                    })
                    .collect(),
            );
        }
        decl
    }
}

/// A schema declaration
#[derive(Clone, Debug)]
pub enum SchemaDecl {
    Single(PropertyDecl),
    Multi(IndexMap<String, PropertyDecl>),
}

impl Default for SchemaDecl {
    fn default() -> Self {
        SchemaDecl::Single(PropertyDecl::new())
    }
}

impl SchemaDecl {
    /// Multi-property declaration from `(name, decl)` pairs
    pub fn multi<K, I>(props: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, PropertyDecl)>,
    {
        SchemaDecl::Multi(props.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Read a schema declaration from a JSON object
    ///
    /// A top-level `type` string, a top-level `default` key, or an empty
    /// object marks a single-property schema.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            CoreError::InvalidSchema(format!("expected an object, got `{}`", value))
        })?;

        let single = obj.is_empty()
            || obj.get("type").map(|t| t.is_string()).unwrap_or(false)
            || obj.contains_key("default");
        if single {
            return Ok(SchemaDecl::Single(PropertyDecl::from_json(value)));
        }

        Ok(SchemaDecl::Multi(
            obj.iter()
                .map(|(name, prop)| (name.clone(), PropertyDecl::from_json(prop)))
                .collect(),
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolved schema
// ─────────────────────────────────────────────────────────────────────────────

/// A fully resolved property definition
#[derive(Clone)]
pub struct PropertyDef {
    /// Property name (empty for single-property schemas)
    pub name: String,
    pub type_name: String,
    pub default: PropValue,
    pub one_of: Option<Vec<String>>,
    ty: Arc<dyn PropertyType>,
    parse: Option<ParseFn>,
    stringify: Option<StringifyFn>,
}

impl fmt::Debug for PropertyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDef")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("default", &self.default)
            .field("one_of", &self.one_of)
            .finish()
    }
}

impl PropertyDef {
    /// Whether this property uses a custom parser
    pub fn has_custom_parse(&self) -> bool {
        self.parse.is_some()
    }

    /// Run the type (or custom) parser without default substitution
    pub fn parse_raw(&self, raw: &PropValue, lookup: &dyn NodeLookup) -> PropValue {
        match &self.parse {
            Some(parse) => parse(raw, lookup),
            None => self.ty.parse(raw, &self.default, lookup),
        }
    }

    /// Attribute-string form of a value
    pub fn stringify(&self, value: &PropValue, lookup: &dyn NodeLookup) -> String {
        match &self.stringify {
            Some(stringify) => stringify(value, lookup),
            None => self.ty.stringify(value, lookup),
        }
    }
}

/// A processed schema
#[derive(Clone, Debug)]
pub enum Schema {
    Single(PropertyDef),
    Multi(IndexMap<String, PropertyDef>),
}

impl Schema {
    pub fn is_single_property(&self) -> bool {
        matches!(self, Schema::Single(_))
    }

    /// The definition of a single-property schema
    pub fn single(&self) -> Option<&PropertyDef> {
        match self {
            Schema::Single(def) => Some(def),
            Schema::Multi(_) => None,
        }
    }

    /// Named properties of a multi-property schema
    pub fn properties(&self) -> Option<&IndexMap<String, PropertyDef>> {
        match self {
            Schema::Multi(props) => Some(props),
            Schema::Single(_) => None,
        }
    }

    /// Look up a property of a multi-property schema
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties().and_then(|props| props.get(name))
    }

    /// Declared defaults, as component data
    pub fn default_data(&self) -> PropValue {
        match self {
            Schema::Single(def) => def.default.clone(),
            Schema::Multi(props) => PropValue::Map(Box::new(
                props
                    .iter()
                    .map(|(name, def)| (name.clone(), def.default.clone()))
                    .collect(),
            )),
        }
    }

    /// Parse a whole attribute value against this schema
    pub fn parse_value(&self, raw: &PropValue, lookup: &dyn NodeLookup) -> Result<PropValue> {
        match self {
            Schema::Single(def) => parse_property(raw, def, lookup),
            Schema::Multi(props) => {
                let raw_map = style_input_to_map(raw);
                warn_unknown_properties(&raw_map, props);
                let mut out = PropMap::with_capacity(props.len());
                parse_properties_into(&raw_map, props, lookup, &mut out)?;
                Ok(PropValue::Map(Box::new(out)))
            }
        }
    }

    /// Attribute-string form of whole component data
    pub fn stringify_value(&self, value: &PropValue, lookup: &dyn NodeLookup) -> String {
        match (self, value) {
            (Schema::Single(def), _) => stringify_property(value, def, lookup),
            (Schema::Multi(props), PropValue::Map(data)) => {
                stringify_properties(data, props, lookup)
            }
            (Schema::Multi(_), other) => other.to_attr_string(),
        }
    }
}

/// Turn a raw multi-property attribute value into a map of raw values
///
/// Strings go through the style-string parser; maps pass through; a plain
/// (colon-less) string or any other value yields an empty map.
pub fn style_input_to_map(raw: &PropValue) -> PropMap {
    match raw {
        PropValue::Map(map) => map.as_ref().clone(),
        PropValue::Str(s) => match style::parse(s) {
            StyleParse::Map(decls) => decls
                .into_iter()
                .map(|(k, v)| (k, PropValue::Str(v)))
                .collect(),
            StyleParse::Plain(plain) => {
                if !plain.trim().is_empty() {
                    tracing::warn!("Expected `key: value` declarations, got `{}`", plain);
                }
                PropMap::new()
            }
        },
        _ => PropMap::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Processing
// ─────────────────────────────────────────────────────────────────────────────

fn infer_type_name(default: Option<&PropValue>) -> &'static str {
    match default {
        Some(PropValue::Bool(_)) => "boolean",
        Some(PropValue::Number(_)) | Some(PropValue::Int(_)) => "number",
        Some(PropValue::Array(_)) => "array",
        Some(PropValue::Vec2(_)) => "vec2",
        Some(PropValue::Vec3(_)) => "vec3",
        Some(PropValue::Vec4(_)) => "vec4",
        _ => "string",
    }
}

/// Resolve one property declaration
pub fn process_property(name: &str, decl: &PropertyDecl, types: &PropertyTypes) -> PropertyDef {
    let type_name = decl
        .type_name
        .clone()
        .unwrap_or_else(|| infer_type_name(decl.default.as_ref()).to_string());

    let ty = match types.get(&type_name) {
        Some(ty) => ty,
        None => {
            if decl.parse.is_none() {
                tracing::warn!(
                    "Unknown property type `{}` for property `{}`; values pass through unparsed",
                    type_name,
                    name
                );
            }
            types.passthrough()
        }
    };

    let default = decl.default.clone().unwrap_or_else(|| ty.default_value());

    if decl.parse.is_none() && !default.is_null() && !ty.accepts_default(&default) {
        tracing::warn!(
            "Default `{}` ({}) of property `{}` does not match type `{}`",
            default,
            default.kind(),
            name,
            type_name
        );
    }

    PropertyDef {
        name: name.to_string(),
        type_name,
        default,
        one_of: decl.one_of.clone(),
        ty,
        parse: decl.parse.clone(),
        stringify: decl.stringify.clone(),
    }
}

/// Resolve a schema declaration
pub fn process_schema(decl: &SchemaDecl, types: &PropertyTypes) -> Schema {
    match decl {
        SchemaDecl::Single(prop) => Schema::Single(process_property("", prop, types)),
        SchemaDecl::Multi(props) => Schema::Multi(
            props
                .iter()
                .map(|(name, prop)| (name.clone(), process_property(name, prop, types)))
                .collect(),
        ),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing / stringifying
// ─────────────────────────────────────────────────────────────────────────────

/// Parse one raw value against a property definition
///
/// Empty input (null or `""`) is replaced by the declared default before
/// parsing, so clearing an attribute always restores the default.
pub fn parse_property(
    raw: &PropValue,
    def: &PropertyDef,
    lookup: &dyn NodeLookup,
) -> Result<PropValue> {
    let value = if raw.is_empty_input() {
        def.parse_raw(&def.default.clone(), lookup)
    } else {
        def.parse_raw(raw, lookup)
    };

    if let Some(allowed) = &def.one_of {
        let text = value.to_attr_string();
        if !allowed.iter().any(|a| *a == text) {
            return Err(CoreError::InvalidEnumValue {
                property: def.name.clone(),
                value: text,
                allowed: allowed.clone(),
            });
        }
    }
    Ok(value)
}

/// Keys of `raw` that name no property
pub fn unknown_properties<'a>(
    raw: &'a PropMap,
    props: &'a IndexMap<String, PropertyDef>,
) -> impl Iterator<Item = &'a str> {
    raw.keys()
        .filter(move |key| !props.contains_key(*key))
        .map(String::as_str)
}

/// Warn once per key of `raw` that names no property
pub fn warn_unknown_properties(raw: &PropMap, props: &IndexMap<String, PropertyDef>) {
    for key in unknown_properties(raw, props) {
        tracing::warn!("Unknown property `{}`", key);
    }
}

/// Parse a raw map against the named properties into `out`
///
/// Every schema key is written (missing keys get their default); unknown
/// keys in `raw` are dropped silently, so callers that re-parse cached
/// values do not repeat warnings. `out` keeps its existing key set.
pub fn parse_properties_into(
    raw: &PropMap,
    props: &IndexMap<String, PropertyDef>,
    lookup: &dyn NodeLookup,
    out: &mut PropMap,
) -> Result<()> {
    let null = PropValue::Null;
    for (name, def) in props {
        let value = parse_property(raw.get(name).unwrap_or(&null), def, lookup)?;
        out.insert(name.clone(), value);
    }
    Ok(())
}

/// Parse a raw map against a schema's named properties
pub fn parse_properties(
    raw: &PropMap,
    schema: &Schema,
    lookup: &dyn NodeLookup,
) -> Result<PropMap> {
    let mut out = PropMap::new();
    if let Some(props) = schema.properties() {
        warn_unknown_properties(raw, props);
        parse_properties_into(raw, props, lookup, &mut out)?;
    }
    Ok(out)
}

/// Attribute-string form of a single value
pub fn stringify_property(value: &PropValue, def: &PropertyDef, lookup: &dyn NodeLookup) -> String {
    def.stringify(value, lookup)
}

/// Style-string form of multi-property data
pub fn stringify_properties(
    data: &PropMap,
    props: &IndexMap<String, PropertyDef>,
    lookup: &dyn NodeLookup,
) -> String {
    style::stringify(data.iter().map(|(key, value)| {
        let text = match props.get(key) {
            Some(def) => def.stringify(value, lookup),
            None => value.to_attr_string(),
        };
        (key.as_str(), text)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NoLookup;
    use crate::value::Vec3;
    use serde_json::json;

    fn types() -> PropertyTypes {
        PropertyTypes::with_builtins()
    }

    #[test]
    fn test_single_detection() {
        assert!(matches!(
            SchemaDecl::from_json(&json!({ "type": "number" })).unwrap(),
            SchemaDecl::Single(_)
        ));
        assert!(matches!(
            SchemaDecl::from_json(&json!({ "default": 2 })).unwrap(),
            SchemaDecl::Single(_)
        ));
        assert!(matches!(
            SchemaDecl::from_json(&json!({})).unwrap(),
            SchemaDecl::Single(_)
        ));
        // a property literally named `type` is not a type declaration
        assert!(matches!(
            SchemaDecl::from_json(&json!({ "type": { "default": "box" }, "size": 1 })).unwrap(),
            SchemaDecl::Multi(_)
        ));
        assert!(SchemaDecl::from_json(&json!(5)).is_err());
    }

    #[test]
    fn test_type_inference() {
        let decl = SchemaDecl::from_json(&json!({
            "on": { "default": true },
            "speed": 2,
            "tags": { "default": ["a"] },
            "label": "hello",
        }))
        .unwrap();
        let schema = process_schema(&decl, &types());
        assert_eq!(schema.property("on").unwrap().type_name, "boolean");
        assert_eq!(schema.property("speed").unwrap().type_name, "number");
        assert_eq!(schema.property("tags").unwrap().type_name, "array");
        assert_eq!(schema.property("label").unwrap().type_name, "string");
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let schema = process_schema(&SchemaDecl::Single(PropertyDecl::typed("quaternion")), &types());
        let def = schema.single().unwrap();
        assert_eq!(def.type_name, "quaternion");
        let raw = PropValue::from("0 0 0 1");
        assert_eq!(parse_property(&raw, def, &NoLookup).unwrap(), raw);
    }

    #[test]
    fn test_mismatched_default_still_usable() {
        let schema = process_schema(
            &SchemaDecl::Single(PropertyDecl::typed("number").with_default("abc")),
            &types(),
        );
        let def = schema.single().unwrap();
        assert_eq!(parse_property(&"4".into(), def, &NoLookup).unwrap(), PropValue::Number(4.0));
    }

    #[test]
    fn test_empty_input_uses_default() {
        let schema = process_schema(
            &SchemaDecl::Single(
                PropertyDecl::typed("vec3").with_default(Vec3::new(1.0, 1.0, 1.0)),
            ),
            &types(),
        );
        let def = schema.single().unwrap();
        let expected = PropValue::Vec3(Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(parse_property(&PropValue::Null, def, &NoLookup).unwrap(), expected);
        assert_eq!(parse_property(&"".into(), def, &NoLookup).unwrap(), expected);
    }

    #[test]
    fn test_array_default_is_cloned() {
        let schema = process_schema(
            &SchemaDecl::Single(PropertyDecl::new().with_default(vec!["a", "b"])),
            &types(),
        );
        let def = schema.single().unwrap();
        let mut first = parse_property(&PropValue::Null, def, &NoLookup).unwrap();
        if let PropValue::Array(items) = &mut first {
            items.push("c".into());
        }
        let second = parse_property(&PropValue::Null, def, &NoLookup).unwrap();
        assert_eq!(second, PropValue::from(vec!["a", "b"]));
    }

    #[test]
    fn test_one_of() {
        let schema = process_schema(
            &SchemaDecl::multi([(
                "side",
                PropertyDecl::new().with_default("front").one_of(["front", "back", "double"]),
            )]),
            &types(),
        );
        assert!(schema.parse_value(&"side: back".into(), &NoLookup).is_ok());
        let err = schema.parse_value(&"side: left".into(), &NoLookup).unwrap_err();
        assert!(matches!(err, CoreError::InvalidEnumValue { ref value, .. } if value == "left"));
    }

    #[test]
    fn test_multi_parse_and_unknown_keys() {
        let schema = process_schema(
            &SchemaDecl::multi([
                ("width", PropertyDecl::new().with_default(1.0)),
                ("src", PropertyDecl::typed("asset")),
            ]),
            &types(),
        );
        let data = schema
            .parse_value(&"width: 2; src: url(a.png); bogus: 1".into(), &NoLookup)
            .unwrap();
        let map = data.as_map().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("width"), Some(&PropValue::Number(2.0)));
        assert_eq!(map.get("src"), Some(&PropValue::from("a.png")));
    }

    #[test]
    fn test_custom_parse_and_stringify() {
        let decl = PropertyDecl::new()
            .with_parse(|raw, _| PropValue::from(raw.to_attr_string().to_uppercase()))
            .with_stringify(|value, _| value.to_attr_string().to_lowercase());
        let schema = process_schema(&SchemaDecl::Single(decl), &types());
        let def = schema.single().unwrap();
        let value = parse_property(&"abc".into(), def, &NoLookup).unwrap();
        assert_eq!(value, PropValue::from("ABC"));
        assert_eq!(stringify_property(&value, def, &NoLookup), "abc");
    }

    #[test]
    fn test_stringify_properties() {
        let schema = process_schema(
            &SchemaDecl::multi([
                ("offset", PropertyDecl::typed("vec3")),
                ("visible", PropertyDecl::new().with_default(true)),
            ]),
            &types(),
        );
        let data = schema.parse_value(&"offset: 1 2 3".into(), &NoLookup).unwrap();
        assert_eq!(
            schema.stringify_value(&data, &NoLookup),
            "offset: 1 2 3; visible: true"
        );
    }

    #[test]
    fn test_unknown_properties_are_listed_not_parsed() {
        let schema = process_schema(
            &SchemaDecl::multi([("width", PropertyDecl::new().with_default(1.0))]),
            &types(),
        );
        let props = schema.properties().unwrap();
        let raw = style_input_to_map(&"width: 2; bogus: 1".into());
        assert_eq!(unknown_properties(&raw, props).collect::<Vec<_>>(), vec!["bogus"]);

        let mut out = PropMap::new();
        parse_properties_into(&raw, props, &NoLookup, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("width"), Some(&PropValue::Number(2.0)));
    }
}
