//! Trellis Core
//!
//! Leaf building blocks for the Trellis scene runtime:
//!
//! - **Property values**: [`PropValue`], the dynamic value every component property is carried as
//! - **Property types**: named parse/stringify pairs (`number`, `vec3`, `selector`, ...)
//! - **Schema engine**: resolves component schema declarations once, parses attribute values against them
//! - **Style strings**: `key: value; key: value` attribute encoding for multi-property components
//! - **Object pool**: stack-like reuse of per-component data maps
//!
//! # Example
//!
//! ```rust
//! use trellis_core::schema::{process_schema, PropertyDecl, SchemaDecl};
//! use trellis_core::{NoLookup, PropValue, PropertyTypes, Vec3};
//!
//! let schema = process_schema(
//!     &SchemaDecl::Single(PropertyDecl::typed("vec3")),
//!     &PropertyTypes::with_builtins(),
//! );
//! let value = schema.parse_value(&"1 2 3".into(), &NoLookup).unwrap();
//! assert_eq!(value, PropValue::Vec3(Vec3::new(1.0, 2.0, 3.0)));
//! ```

pub mod error;
pub mod pool;
pub mod schema;
pub mod style;
pub mod types;
pub mod value;

pub use error::{CoreError, Result};
pub use pool::{ObjectPool, Poolable};
pub use schema::{
    parse_properties, parse_property, process_schema, stringify_properties, stringify_property,
    PropertyDecl, PropertyDef, Schema, SchemaDecl,
};
pub use style::StyleParse;
pub use types::{NoLookup, NodeLookup, PropertyType, PropertyTypes};
pub use value::{NodeHandle, PropMap, PropValue, Vec2, Vec3, Vec4};
