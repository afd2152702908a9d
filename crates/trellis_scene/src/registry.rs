//! Component, system, geometry and shader registries
//!
//! A [`Registry`] is populated once, before any scene is built, and then
//! shared read-only as `Arc<Registry>`. Every schema is processed at
//! registration time and cached on its definition, so per-instance parsing
//! never re-derives type metadata.

use crate::component::{Behavior, HookContext};
use crate::error::{HookResult, Result, SceneError};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use trellis_core::schema::{process_schema, PropertyDecl, Schema, SchemaDecl};
use trellis_core::{NodeLookup, PropValue, PropertyType, PropertyTypes, Vec3};

/// Separator between a multi-instance component's name and its id
pub const MULTIPLE_DELIMITER: &str = "__";

/// Creates a fresh behavior for every component or system instance
pub type BehaviorFactory = Arc<dyn Fn() -> Box<dyn Behavior> + Send + Sync>;

/// Creates a fresh geometry/shader primitive
pub type PrimitiveFactory = Arc<dyn Fn() -> Box<dyn Primitive> + Send + Sync>;

/// Split `sound__ambient` into `("sound", Some("ambient"))`
pub fn split_attr_name(attr_name: &str) -> (&str, Option<&str>) {
    match attr_name.split_once(MULTIPLE_DELIMITER) {
        Some((name, id)) => (name, Some(id)),
        None => (attr_name, None),
    }
}

/// Behavior used by components registered without one
#[derive(Debug, Default)]
pub struct NoopBehavior;

impl Behavior for NoopBehavior {}

// ─────────────────────────────────────────────────────────────────────────────
// Components
// ─────────────────────────────────────────────────────────────────────────────

/// A component as written by its author
#[derive(Clone)]
pub struct ComponentSpec {
    pub schema: SchemaDecl,
    pub multiple: bool,
    pub dependencies: Vec<String>,
    pub factory: Option<BehaviorFactory>,
}

impl ComponentSpec {
    pub fn new(schema: SchemaDecl) -> Self {
        Self {
            schema,
            multiple: false,
            dependencies: Vec::new(),
            factory: None,
        }
    }

    /// Allow several instances per entity, keyed `name__id`
    pub fn multiple(mut self, multiple: bool) -> Self {
        self.multiple = multiple;
        self
    }

    /// Components that must be initialized on the same entity first
    pub fn dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn behavior<F, B>(mut self, factory: F) -> Self
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: Behavior,
    {
        self.factory = Some(Arc::new(move || Box::new(factory()) as Box<dyn Behavior>));
        self
    }

    pub fn behavior_default<B: Behavior + Default>(self) -> Self {
        self.behavior(B::default)
    }
}

impl fmt::Debug for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentSpec")
            .field("schema", &self.schema)
            .field("multiple", &self.multiple)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// A registered component: immutable once created
pub struct ComponentDefinition {
    pub name: String,
    pub schema: Schema,
    pub multiple: bool,
    pub dependencies: Vec<String>,
    factory: Option<BehaviorFactory>,
}

impl ComponentDefinition {
    pub fn is_single_property(&self) -> bool {
        self.schema.is_single_property()
    }

    pub fn create_behavior(&self) -> Box<dyn Behavior> {
        match &self.factory {
            Some(factory) => factory(),
            None => Box::new(NoopBehavior),
        }
    }
}

impl fmt::Debug for ComponentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDefinition")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("multiple", &self.multiple)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Systems
// ─────────────────────────────────────────────────────────────────────────────

/// A scene-scoped singleton service
#[derive(Clone)]
pub struct SystemSpec {
    pub schema: SchemaDecl,
    pub factory: Option<BehaviorFactory>,
}

impl SystemSpec {
    pub fn new(schema: SchemaDecl) -> Self {
        Self {
            schema,
            factory: None,
        }
    }

    pub fn behavior<F, B>(mut self, factory: F) -> Self
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: Behavior,
    {
        self.factory = Some(Arc::new(move || Box::new(factory()) as Box<dyn Behavior>));
        self
    }
}

impl Default for SystemSpec {
    fn default() -> Self {
        Self::new(SchemaDecl::Multi(IndexMap::new()))
    }
}

pub struct SystemDefinition {
    pub name: String,
    pub schema: Schema,
    factory: Option<BehaviorFactory>,
}

impl SystemDefinition {
    pub fn create_behavior(&self) -> Box<dyn Behavior> {
        match &self.factory {
            Some(factory) => factory(),
            None => Box::new(NoopBehavior),
        }
    }
}

impl fmt::Debug for SystemDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemDefinition")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Geometries and shaders
// ─────────────────────────────────────────────────────────────────────────────

/// A geometry or shader implementation
///
/// `init` builds the renderer-side object from parsed data; the material and
/// geometry components that consume primitives own what it returns.
pub trait Primitive {
    fn init(&mut self, data: &PropValue) -> Box<dyn Any>;

    fn update(&mut self, _data: &PropValue) {}
}

#[derive(Clone)]
pub struct PrimitiveSpec {
    pub schema: SchemaDecl,
    pub factory: PrimitiveFactory,
}

impl PrimitiveSpec {
    pub fn new<F, P>(schema: SchemaDecl, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Primitive + 'static,
    {
        Self {
            schema,
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Primitive>),
        }
    }
}

pub struct PrimitiveDefinition {
    pub name: String,
    pub schema: Schema,
    factory: PrimitiveFactory,
}

impl PrimitiveDefinition {
    pub fn create(&self) -> Box<dyn Primitive> {
        (self.factory)()
    }

    /// Parse primitive data against the primitive's schema
    pub fn parse_data(&self, raw: &PropValue, lookup: &dyn NodeLookup) -> Result<PropValue> {
        Ok(self.schema.parse_value(raw, lookup)?)
    }
}

impl fmt::Debug for PrimitiveDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimitiveDefinition")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Every registered name a scene can resolve
#[derive(Default)]
pub struct Registry {
    types: PropertyTypes,
    components: IndexMap<String, Arc<ComponentDefinition>>,
    systems: BTreeMap<String, Arc<SystemDefinition>>,
    geometries: FxHashMap<String, Arc<PrimitiveDefinition>>,
    shaders: FxHashMap<String, Arc<PrimitiveDefinition>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("systems", &self.systems.keys().collect::<Vec<_>>())
            .field("geometries", &self.geometries.len())
            .field("shaders", &self.shaders.len())
            .finish()
    }
}

impl Registry {
    /// Registry with the built-in property types and no components
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the transform components `position`, `rotation`,
    /// `scale` and `visible`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, spec) in builtin_components() {
            // Fresh registry: names cannot collide
            if let Err(e) = registry.register_component(name, spec) {
                tracing::warn!("Failed to register built-in component `{}`: {}", name, e);
            }
        }
        registry
    }

    pub fn register_property_type(&mut self, ty: Arc<dyn PropertyType>) -> Result<()> {
        Ok(self.types.register(ty)?)
    }

    pub fn property_types(&self) -> &PropertyTypes {
        &self.types
    }

    pub fn register_component(
        &mut self,
        name: &str,
        spec: ComponentSpec,
    ) -> Result<Arc<ComponentDefinition>> {
        if name.contains(MULTIPLE_DELIMITER) {
            return Err(SceneError::InvalidComponentName(name.to_string()));
        }
        if self.components.contains_key(name) {
            return Err(SceneError::DuplicateComponent(name.to_string()));
        }
        let def = Arc::new(ComponentDefinition {
            name: name.to_string(),
            schema: process_schema(&spec.schema, &self.types),
            multiple: spec.multiple,
            dependencies: spec.dependencies,
            factory: spec.factory,
        });
        tracing::debug!("Registered component `{}`", name);
        self.components.insert(name.to_string(), def.clone());
        Ok(def)
    }

    pub fn register_system(
        &mut self,
        name: &str,
        spec: SystemSpec,
    ) -> Result<Arc<SystemDefinition>> {
        if self.systems.contains_key(name) {
            return Err(SceneError::DuplicateSystem(name.to_string()));
        }
        let def = Arc::new(SystemDefinition {
            name: name.to_string(),
            schema: process_schema(&spec.schema, &self.types),
            factory: spec.factory,
        });
        tracing::debug!("Registered system `{}`", name);
        self.systems.insert(name.to_string(), def.clone());
        Ok(def)
    }

    pub fn register_geometry(
        &mut self,
        name: &str,
        spec: PrimitiveSpec,
    ) -> Result<Arc<PrimitiveDefinition>> {
        if self.geometries.contains_key(name) {
            return Err(SceneError::DuplicateGeometry(name.to_string()));
        }
        let def = self.primitive(name, spec);
        self.geometries.insert(name.to_string(), def.clone());
        Ok(def)
    }

    pub fn register_shader(
        &mut self,
        name: &str,
        spec: PrimitiveSpec,
    ) -> Result<Arc<PrimitiveDefinition>> {
        if self.shaders.contains_key(name) {
            return Err(SceneError::DuplicateShader(name.to_string()));
        }
        let def = self.primitive(name, spec);
        self.shaders.insert(name.to_string(), def.clone());
        Ok(def)
    }

    fn primitive(&self, name: &str, spec: PrimitiveSpec) -> Arc<PrimitiveDefinition> {
        Arc::new(PrimitiveDefinition {
            name: name.to_string(),
            schema: process_schema(&spec.schema, &self.types),
            factory: spec.factory,
        })
    }

    pub fn component(&self, name: &str) -> Option<&Arc<ComponentDefinition>> {
        self.components.get(name)
    }

    /// Definition for an attribute name, with or without an instance id
    pub fn component_for_attr(&self, attr_name: &str) -> Option<&Arc<ComponentDefinition>> {
        self.components.get(split_attr_name(attr_name).0)
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    pub fn system(&self, name: &str) -> Option<&Arc<SystemDefinition>> {
        self.systems.get(name)
    }

    pub fn has_system(&self, name: &str) -> bool {
        self.systems.contains_key(name)
    }

    /// Systems in name order
    pub fn systems(&self) -> impl Iterator<Item = &Arc<SystemDefinition>> {
        self.systems.values()
    }

    pub fn geometry(&self, name: &str) -> Option<&Arc<PrimitiveDefinition>> {
        self.geometries.get(name)
    }

    pub fn shader(&self, name: &str) -> Option<&Arc<PrimitiveDefinition>> {
        self.shaders.get(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in transform components
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Channel {
    Position,
    Rotation,
    Scale,
}

/// Writes one transform channel of the entity's object
#[derive(Debug)]
struct TransformBehavior {
    channel: Channel,
}

impl TransformBehavior {
    fn apply(&self, ctx: &mut HookContext<'_>, value: Vec3) {
        let channel = self.channel;
        if let Some(object) = ctx.object3d_mut() {
            match channel {
                Channel::Position => object.position = value,
                Channel::Rotation => {
                    object.rotation = Vec3::new(
                        value.x.to_radians(),
                        value.y.to_radians(),
                        value.z.to_radians(),
                    )
                }
                Channel::Scale => object.scale = value,
            }
        }
        ctx.sync_transform();
    }

    fn reset_value(&self) -> Vec3 {
        match self.channel {
            Channel::Scale => Vec3::new(1.0, 1.0, 1.0),
            Channel::Position | Channel::Rotation => Vec3::default(),
        }
    }
}

impl Behavior for TransformBehavior {
    fn update(&mut self, ctx: &mut HookContext<'_>, _old: &PropValue) -> HookResult {
        let value = ctx.data().as_vec3().unwrap_or_else(|| self.reset_value());
        self.apply(ctx, value);
        Ok(())
    }

    fn remove(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let value = self.reset_value();
        self.apply(ctx, value);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct VisibleBehavior;

impl VisibleBehavior {
    fn apply(ctx: &mut HookContext<'_>, visible: bool) {
        if let Some(object) = ctx.object3d_mut() {
            object.visible = visible;
        }
        ctx.sync_transform();
    }
}

impl Behavior for VisibleBehavior {
    fn update(&mut self, ctx: &mut HookContext<'_>, _old: &PropValue) -> HookResult {
        let visible = ctx.data().as_bool().unwrap_or(true);
        Self::apply(ctx, visible);
        Ok(())
    }

    fn remove(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        Self::apply(ctx, true);
        Ok(())
    }
}

fn transform_spec(channel: Channel, default: Vec3) -> ComponentSpec {
    ComponentSpec::new(SchemaDecl::Single(
        PropertyDecl::typed("vec3").with_default(default),
    ))
    .behavior(move || TransformBehavior { channel })
}

fn builtin_components() -> Vec<(&'static str, ComponentSpec)> {
    vec![
        (
            "position",
            transform_spec(Channel::Position, Vec3::new(0.0, 0.0, 0.0)),
        ),
        (
            "rotation",
            transform_spec(Channel::Rotation, Vec3::new(0.0, 0.0, 0.0)),
        ),
        (
            "scale",
            transform_spec(Channel::Scale, Vec3::new(1.0, 1.0, 1.0)),
        ),
        (
            "visible",
            ComponentSpec::new(SchemaDecl::Single(
                PropertyDecl::typed("boolean").with_default(true),
            ))
            .behavior_default::<VisibleBehavior>(),
        ),
    ]
}
