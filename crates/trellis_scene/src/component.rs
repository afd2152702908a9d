//! Component instances and their lifecycle
//!
//! A component instance keeps three layers of state:
//!
//! - the markup attribute string, owned by the [`Document`](crate::Document),
//! - `attr_value`, the value set directly on the entity, only partially
//!   parsed (multi-property values are split into per-key raw values),
//! - `data`, the fully resolved value: defaults < mixins < `attr_value`.
//!
//! Mixins can change independently of the entity, so `data` is always
//! recomputed from `attr_value` plus the current mixin caches rather than
//! from the markup string.
//!
//! Behaviors never hold a reference into the scene. Each hook receives a
//! [`HookContext`] with mutable access to the whole scene; while a hook runs
//! its behavior is taken out of the instance, and writes aimed at that same
//! instance are queued and applied once the hook returns.

use crate::assets::{AssetOutcome, AssetRequest, AssetStatus, AssetWaiter};
use crate::document::{Document, NodeId};
use crate::error::{HookResult, Result, SceneError};
use crate::events::{names, EventDetail};
use crate::registry::{split_attr_name, ComponentDefinition};
use crate::renderer::{AsAny, Object3D, ObjectHandle, Renderer};
use crate::scene::Scene;
use smallvec::SmallVec;
use std::sync::Arc;
use trellis_core::schema::{
    parse_properties_into, parse_property, style_input_to_map, warn_unknown_properties,
};
use trellis_core::{NodeLookup, ObjectPool, PropMap, PropValue, Schema};

static NULL_VALUE: PropValue = PropValue::Null;

/// Lifecycle hooks of a component or system
///
/// Every hook defaults to a no-op. `tick` and `tock` only run when
/// [`has_tick`](Behavior::has_tick) / [`has_tock`](Behavior::has_tock)
/// return true.
pub trait Behavior: AsAny {
    /// Runs exactly once, before the first `update`
    fn init(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    /// Data changed; `old` is the previous data (empty at creation)
    fn update(&mut self, _ctx: &mut HookContext<'_>, _old: &PropValue) -> HookResult {
        Ok(())
    }

    fn remove(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn play(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn pause(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn tick(&mut self, _ctx: &mut HookContext<'_>, _time: f64, _delta: f64) -> HookResult {
        Ok(())
    }

    /// Runs after the frame has been submitted to the renderer
    fn tock(
        &mut self,
        _ctx: &mut HookContext<'_>,
        _time: f64,
        _delta: f64,
        _camera: Option<ObjectHandle>,
    ) -> HookResult {
        Ok(())
    }

    /// An asset requested through [`HookContext::request_asset`] settled
    fn on_asset(
        &mut self,
        _ctx: &mut HookContext<'_>,
        _url: &str,
        _outcome: &AssetOutcome,
    ) -> HookResult {
        Ok(())
    }

    fn has_tick(&self) -> bool {
        false
    }

    fn has_tock(&self) -> bool {
        false
    }
}

/// Whose hook is running
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookOwner {
    Component { entity: NodeId, key: String },
    System(String),
}

#[derive(Clone, Debug)]
pub(crate) enum DeferredAction {
    Update { value: PropValue, clobber: bool },
    Remove,
}

/// A write aimed at an instance whose hook was running
#[derive(Clone, Debug)]
pub(crate) struct DeferredOp {
    pub target: HookOwner,
    pub action: DeferredAction,
}

// ─────────────────────────────────────────────────────────────────────────────
// Hook context
// ─────────────────────────────────────────────────────────────────────────────

/// Scene access for a running hook
pub struct HookContext<'a> {
    pub(crate) scene: &'a mut Scene,
    pub(crate) owner: HookOwner,
}

impl<'a> HookContext<'a> {
    fn instance(&self) -> Option<&ComponentInstance> {
        match &self.owner {
            HookOwner::Component { entity, key } => self
                .scene
                .entities
                .get(*entity)
                .and_then(|e| e.components.get(key)),
            HookOwner::System(_) => None,
        }
    }

    pub fn owner(&self) -> &HookOwner {
        &self.owner
    }

    /// Resolved data of the running component or system
    pub fn data(&self) -> &PropValue {
        let data = match &self.owner {
            HookOwner::Component { .. } => self.instance().map(|c| &c.data),
            HookOwner::System(name) => self.scene.systems.get(name).map(|s| &s.data),
        };
        data.unwrap_or(&NULL_VALUE)
    }

    /// One property of multi-property data
    pub fn property(&self, name: &str) -> Option<&PropValue> {
        self.data().get(name)
    }

    pub fn attr_name(&self) -> &str {
        match &self.owner {
            HookOwner::Component { key, .. } => key,
            HookOwner::System(name) => name,
        }
    }

    /// Instance id of a multi-instance component
    pub fn id(&self) -> Option<&str> {
        split_attr_name(self.attr_name()).1
    }

    /// The owning entity; the scene root for systems
    pub fn entity(&self) -> NodeId {
        match &self.owner {
            HookOwner::Component { entity, .. } => *entity,
            HookOwner::System(_) => self.scene.root,
        }
    }

    pub fn scene_node(&self) -> NodeId {
        self.scene.root
    }

    pub fn is_playing(&self) -> bool {
        self.scene.is_playing(self.entity())
    }

    pub fn object3d(&self) -> Option<&Object3D> {
        self.scene.entities.get(self.entity()).map(|e| &e.object3d)
    }

    pub fn object3d_mut(&mut self) -> Option<&mut Object3D> {
        let entity = self.entity();
        self.scene.entities.get_mut(entity).map(|e| &mut e.object3d)
    }

    /// Push the entity's transform to the renderer
    pub fn sync_transform(&mut self) {
        let entity = self.entity();
        if let Some(state) = self.scene.entities.get(entity) {
            let (handle, transform) = (state.root_object, state.object3d);
            self.scene.renderer.sync_transform(handle, &transform);
        }
    }

    /// The entity's root renderer object
    pub fn object_handle(&self) -> Option<ObjectHandle> {
        self.scene.entities.get(self.entity()).map(|e| e.root_object)
    }

    /// A named renderer object previously set with `set_object3d`
    pub fn object3d_of(&self, kind: &str) -> Option<ObjectHandle> {
        self.scene
            .entities
            .get(self.entity())
            .and_then(|e| e.objects.get(kind).copied())
    }

    /// Attach a renderer object under the entity's root object
    ///
    /// An object previously set under the same kind is detached first.
    pub fn set_object3d(&mut self, kind: &str, handle: ObjectHandle) {
        let entity = self.entity();
        let Some(state) = self.scene.entities.get_mut(entity) else {
            return;
        };
        let root_object = state.root_object;
        let previous = state.objects.insert(kind.to_string(), handle);
        if let Some(old) = previous.filter(|old| *old != handle) {
            self.scene.renderer.remove(root_object, old);
        }
        self.scene.renderer.add(root_object, handle);
        self.scene.emit(
            entity,
            names::OBJECT3D_SET,
            EventDetail::Object3D(kind.to_string()),
            true,
        );
    }

    pub fn remove_object3d(&mut self, kind: &str) -> Option<ObjectHandle> {
        let entity = self.entity();
        let state = self.scene.entities.get_mut(entity)?;
        let root_object = state.root_object;
        let handle = state.objects.shift_remove(kind)?;
        self.scene.renderer.remove(root_object, handle);
        self.scene.emit(
            entity,
            names::OBJECT3D_REMOVE,
            EventDetail::Object3D(kind.to_string()),
            true,
        );
        Some(handle)
    }

    pub fn renderer(&mut self) -> &mut dyn Renderer {
        self.scene.renderer.as_mut()
    }

    pub fn component_data(&self, entity: NodeId, attr_name: &str) -> Option<&PropValue> {
        self.scene.component_data(entity, attr_name)
    }

    pub fn set_attribute(
        &mut self,
        node: NodeId,
        name: &str,
        value: impl Into<PropValue>,
    ) -> Result<()> {
        self.scene.set_attribute(node, name, value)
    }

    pub fn remove_attribute(&mut self, node: NodeId, name: &str) -> Result<()> {
        self.scene.remove_attribute(node, name)
    }

    /// Emit an event on the owning entity
    pub fn emit(&mut self, name: &str, detail: EventDetail, bubbles: bool) {
        let entity = self.entity();
        self.scene.emit(entity, name, detail, bubbles);
    }

    pub fn add_state(&mut self, state: &str) {
        let entity = self.entity();
        self.scene.add_state(entity, state);
    }

    pub fn remove_state(&mut self, state: &str) {
        let entity = self.entity();
        self.scene.remove_state(entity, state);
    }

    pub fn is_state(&self, state: &str) -> bool {
        self.scene.is_state(self.entity(), state)
    }

    /// Downcast a system's behavior
    pub fn system<T: 'static>(&self, name: &str) -> Option<&T> {
        self.scene.system::<T>(name)
    }

    pub fn system_data(&self, name: &str) -> Option<&PropValue> {
        self.scene.system_data(name)
    }

    /// Request an asset; the component's `on_asset` runs on completion
    ///
    /// A second request for a URL that is still in flight joins the first.
    pub fn request_asset(&mut self, url: &str) -> AssetStatus {
        let waiter = match &self.owner {
            HookOwner::Component { entity, key } => AssetWaiter::Component {
                entity: *entity,
                key: key.clone(),
            },
            HookOwner::System(name) => AssetWaiter::System(name.clone()),
        };
        match self.scene.assets.request(url, waiter) {
            AssetRequest::New => {
                self.scene.fetcher.start(url);
                AssetStatus::Pending
            }
            AssetRequest::Joined => AssetStatus::Pending,
            AssetRequest::Ready(outcome) => AssetStatus::Ready(outcome),
        }
    }

    pub fn document(&self) -> &Document {
        &self.scene.doc
    }

    pub fn lookup(&self) -> &dyn NodeLookup {
        &self.scene.doc
    }

    /// Current frame time in milliseconds
    pub fn time(&self) -> f64 {
        self.scene.clock.time()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instances
// ─────────────────────────────────────────────────────────────────────────────

/// One component attached to one entity
pub struct ComponentInstance {
    pub(crate) name: String,
    pub(crate) id: Option<String>,
    pub(crate) attr_name: String,
    pub(crate) data: PropValue,
    pub(crate) attr_value: PropValue,
    /// Whether the entity itself defines a value (markup or `set_attribute`)
    pub(crate) own: bool,
    pub(crate) initialized: bool,
    pub(crate) just_initialized: bool,
    pub(crate) playing: bool,
    pub(crate) behavior: Option<Box<dyn Behavior>>,
    pub(crate) def: Arc<ComponentDefinition>,
}

impl ComponentInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn attr_name(&self) -> &str {
        &self.attr_name
    }

    pub fn data(&self) -> &PropValue {
        &self.data
    }

    pub fn attr_value(&self) -> &PropValue {
        &self.attr_value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn definition(&self) -> &Arc<ComponentDefinition> {
        &self.def
    }

    pub fn behavior<T: 'static>(&self) -> Option<&T> {
        self.behavior.as_deref()?.as_any().downcast_ref::<T>()
    }

    pub fn behavior_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.behavior.as_deref_mut()?.as_any_mut().downcast_mut::<T>()
    }
}

impl std::fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentInstance")
            .field("attr_name", &self.attr_name)
            .field("data", &self.data)
            .field("attr_value", &self.attr_value)
            .field("initialized", &self.initialized)
            .field("playing", &self.playing)
            .finish()
    }
}

/// Fold a new raw value into a cached `attr_value`
///
/// Single-property values replace the cache. Multi-property values are
/// split into per-key raw values and merged key by key, unless `clobber`.
/// Unknown keys warn here, once per write; composing data later is silent.
pub(crate) fn merge_attr_value(
    schema: &Schema,
    cache: &PropValue,
    value: &PropValue,
    clobber: bool,
) -> PropValue {
    if schema.is_single_property() {
        return value.clone();
    }
    let incoming = style_input_to_map(value);
    if let Some(props) = schema.properties() {
        warn_unknown_properties(&incoming, props);
    }
    if clobber {
        return PropValue::Map(Box::new(incoming));
    }
    let mut merged = cache.as_map().cloned().unwrap_or_default();
    merged.extend(incoming);
    PropValue::Map(Box::new(merged))
}

/// Partially parse a raw value for the cache
pub(crate) fn parse_attr_value_for_cache(schema: &Schema, raw: &PropValue) -> PropValue {
    merge_attr_value(schema, &NULL_VALUE, raw, true)
}

/// Resolve component data: defaults < mixins (in order) < own value
pub(crate) fn compose_data(
    schema: &Schema,
    attr_value: &PropValue,
    mixin_values: &[&PropValue],
    lookup: &dyn NodeLookup,
    pool: &mut ObjectPool<PropMap>,
) -> Result<PropValue> {
    match schema {
        Schema::Single(prop) => {
            let raw = if !attr_value.is_empty_input() {
                attr_value
            } else {
                mixin_values
                    .iter()
                    .rev()
                    .find(|v| !v.is_empty_input())
                    .copied()
                    .unwrap_or(&NULL_VALUE)
            };
            Ok(parse_property(raw, prop, lookup)?)
        }
        Schema::Multi(props) => {
            let mut merged = PropMap::new();
            for layer in mixin_values.iter().copied().chain(std::iter::once(attr_value)) {
                if let Some(map) = layer.as_map() {
                    for (key, value) in map {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            let mut out = pool.use_object();
            match parse_properties_into(&merged, props, lookup, &mut out) {
                Ok(()) => Ok(PropValue::Map(out)),
                Err(e) => {
                    pool.recycle(out);
                    Err(e.into())
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

impl Scene {
    /// Run a hook of a component with its behavior taken out of the instance
    ///
    /// Returns `None` when the component is gone or its hook is already
    /// running further up the stack.
    pub(crate) fn with_component_behavior<F>(
        &mut self,
        entity: NodeId,
        key: &str,
        hook: F,
    ) -> Option<HookResult>
    where
        F: FnOnce(&mut dyn Behavior, &mut HookContext<'_>) -> HookResult,
    {
        let mut behavior = self
            .entities
            .get_mut(entity)?
            .components
            .get_mut(key)?
            .behavior
            .take()?;
        let owner = HookOwner::Component {
            entity,
            key: key.to_string(),
        };
        self.running.push(owner.clone());
        let result = {
            let mut ctx = HookContext { scene: self, owner };
            hook(behavior.as_mut(), &mut ctx)
        };
        self.running.pop();
        if let Some(instance) = self
            .entities
            .get_mut(entity)
            .and_then(|e| e.components.get_mut(key))
        {
            instance.behavior = Some(behavior);
        }
        self.apply_deferred();
        Some(result)
    }

    pub(crate) fn run_component_hook<F>(&mut self, entity: NodeId, key: &str, hook_name: &str, hook: F)
    where
        F: FnOnce(&mut dyn Behavior, &mut HookContext<'_>) -> HookResult,
    {
        if let Some(Err(e)) = self.with_component_behavior(entity, key, hook) {
            tracing::warn!("Component `{}` {} failed: {}", key, hook_name, e);
        }
    }

    fn is_deferring(&self, target: &HookOwner) -> bool {
        if self.running.contains(target) {
            return true;
        }
        match target {
            HookOwner::Component { entity, key } => self
                .entities
                .get(*entity)
                .map(|e| e.initializing.contains(key))
                .unwrap_or(false),
            HookOwner::System(_) => false,
        }
    }

    pub(crate) fn defer(&mut self, target: HookOwner, action: DeferredAction) {
        tracing::trace!("Deferring write to {:?}", target);
        self.deferred.push(DeferredOp { target, action });
    }

    /// Apply queued writes whose target is no longer busy
    pub(crate) fn apply_deferred(&mut self) {
        while let Some(index) = self
            .deferred
            .iter()
            .position(|op| !self.is_deferring(&op.target))
        {
            let op = self.deferred.remove(index);
            let result = match (op.target, op.action) {
                (HookOwner::Component { entity, key }, DeferredAction::Update { value, clobber }) => {
                    self.write_component(entity, &key, value, clobber)
                }
                (HookOwner::Component { entity, key }, DeferredAction::Remove) => {
                    self.remove_component(entity, &key);
                    Ok(())
                }
                (HookOwner::System(name), DeferredAction::Update { value, clobber }) => {
                    self.update_system(&name, value, clobber)
                }
                (HookOwner::System(_), DeferredAction::Remove) => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!("Deferred write failed: {}", e);
            }
        }
    }

    /// Raw value an entity provides for a component: a pre-load write, else markup
    pub(crate) fn raw_for(&self, entity: NodeId, attr_name: &str) -> Option<PropValue> {
        if let Some(value) = self.entities.get(entity).and_then(|e| e.preload.get(attr_name)) {
            return Some(value.clone());
        }
        self.doc.attribute(entity, attr_name).map(PropValue::from)
    }

    fn build_data(
        &mut self,
        entity: NodeId,
        attr_name: &str,
        def: &ComponentDefinition,
        attr_value: &PropValue,
    ) -> Result<PropValue> {
        let applied = self
            .entities
            .get(entity)
            .map(|e| e.applied.as_slice())
            .unwrap_or(&[]);
        let mixin_values: SmallVec<[&PropValue; 4]> = applied
            .iter()
            .filter_map(|(_, node)| self.mixins.get(*node))
            .filter_map(|m| m.cache.get(attr_name))
            .collect();
        let pool = self.pools.entry(def.name.clone()).or_default();
        compose_data(&def.schema, attr_value, &mixin_values, &self.doc, pool)
    }

    pub(crate) fn recycle_data(&mut self, name: &str, data: PropValue) {
        if let PropValue::Map(map) = data {
            if let Some(pool) = self.pools.get_mut(name) {
                pool.recycle(map);
            }
        }
    }

    /// Set a component value on an entity, creating the component if needed
    pub(crate) fn write_component(
        &mut self,
        entity: NodeId,
        attr_name: &str,
        value: PropValue,
        clobber: bool,
    ) -> Result<()> {
        let (name, id) = split_attr_name(attr_name);
        let Some(def) = self.registry.component(name).cloned() else {
            return Ok(());
        };
        if let Some(id) = id.filter(|_| !def.multiple) {
            return Err(SceneError::NotMultiple {
                name: name.to_string(),
                id: id.to_string(),
            });
        }
        let target = HookOwner::Component {
            entity,
            key: attr_name.to_string(),
        };
        if self.is_deferring(&target) {
            self.defer(target, DeferredAction::Update { value, clobber });
            return Ok(());
        }

        let state = self
            .entities
            .get_mut(entity)
            .ok_or(SceneError::NotAnEntity(entity))?;
        if !state.has_loaded {
            let cached = state.preload.get(attr_name).unwrap_or(&NULL_VALUE);
            let merged = merge_attr_value(&def.schema, cached, &value, clobber);
            state.preload.insert(attr_name.to_string(), merged);
            return Ok(());
        }
        if state.components.contains_key(attr_name) {
            self.update_properties(entity, attr_name, &value, clobber)
        } else {
            self.init_component(entity, attr_name, Some(value))
        }
    }

    /// Construct a component on a loaded entity
    ///
    /// Dependencies are initialized first, recursively. A component that is
    /// already initializing on this entity is skipped, which breaks cycles.
    pub(crate) fn init_component(
        &mut self,
        entity: NodeId,
        attr_name: &str,
        raw: Option<PropValue>,
    ) -> Result<()> {
        let (name, id) = split_attr_name(attr_name);
        let Some(def) = self.registry.component(name).cloned() else {
            return Ok(());
        };
        if let Some(id) = id.filter(|_| !def.multiple) {
            return Err(SceneError::NotMultiple {
                name: name.to_string(),
                id: id.to_string(),
            });
        }
        if entity == self.root && self.systems.contains_key(name) {
            tracing::debug!("System `{}` shadows the component of the same name", name);
            return Ok(());
        }

        let state = self
            .entities
            .get_mut(entity)
            .ok_or(SceneError::NotAnEntity(entity))?;
        if state.components.contains_key(attr_name) || state.initializing.contains(attr_name) {
            return Ok(());
        }
        if !state.has_loaded {
            if let Some(raw) = raw {
                state.preload.insert(attr_name.to_string(), raw);
            }
            return Ok(());
        }
        state.initializing.insert(attr_name.to_string());

        for dep in &def.dependencies {
            if !self.registry.has_component(dep) {
                tracing::warn!("Component `{}` depends on unknown component `{}`", name, dep);
                continue;
            }
            if let Err(e) = self.init_component(entity, dep, None) {
                tracing::warn!("Dependency `{}` of `{}` failed: {}", dep, name, e);
            }
        }

        let raw = raw.or_else(|| self.raw_for(entity, attr_name));
        let own = raw.is_some();
        let attr_value = parse_attr_value_for_cache(&def.schema, raw.as_ref().unwrap_or(&NULL_VALUE));
        let data = match self.build_data(entity, attr_name, &def, &attr_value) {
            Ok(data) => data,
            Err(e) => {
                self.finish_initializing(entity, attr_name);
                return Err(e);
            }
        };

        let just_initialized = !self.doc.has_attribute(entity, attr_name);
        if just_initialized {
            // Observed as an echo and skipped once by flush_mutations
            self.doc.set_attribute(entity, attr_name, "");
        }

        let instance = ComponentInstance {
            name: name.to_string(),
            id: id.map(str::to_string),
            attr_name: attr_name.to_string(),
            data,
            attr_value,
            own,
            initialized: false,
            just_initialized,
            playing: false,
            behavior: Some(def.create_behavior()),
            def: def.clone(),
        };
        if let Some(state) = self.entities.get_mut(entity) {
            state.components.insert(attr_name.to_string(), instance);
        }

        if let Some(Err(e)) = self.with_component_behavior(entity, attr_name, |b, ctx| b.init(ctx))
        {
            tracing::warn!("Component `{}` init failed, dropping it: {}", attr_name, e);
            if let Some(state) = self.entities.get_mut(entity) {
                if let Some(instance) = state.components.shift_remove(attr_name) {
                    state.pending_removal.remove(attr_name);
                    self.recycle_data(name, instance.data);
                }
            }
            if just_initialized {
                self.doc.remove_attribute_silent(entity, attr_name);
                self.doc.discard_mutations(entity, attr_name);
            }
            self.finish_initializing(entity, attr_name);
            self.apply_deferred();
            return Ok(());
        }

        if let Some(instance) = self.component_mut(entity, attr_name) {
            instance.initialized = true;
        }
        let old = if def.is_single_property() {
            PropValue::Null
        } else {
            PropValue::empty_map()
        };
        self.run_component_hook(entity, attr_name, "update", |b, ctx| b.update(ctx, &old));
        self.finish_initializing(entity, attr_name);

        if self.is_playing(entity) {
            self.play_component(entity, attr_name);
        }
        tracing::trace!("Initialized component `{}`", attr_name);
        self.emit(
            entity,
            names::COMPONENT_INITIALIZED,
            EventDetail::Component {
                name: name.to_string(),
                id: id.map(str::to_string),
            },
            false,
        );

        self.apply_deferred();
        let removal_pending = self
            .entities
            .get_mut(entity)
            .map(|e| e.pending_removal.remove(attr_name))
            .unwrap_or(false);
        if removal_pending {
            self.remove_component(entity, attr_name);
        }
        Ok(())
    }

    fn finish_initializing(&mut self, entity: NodeId, attr_name: &str) {
        if let Some(state) = self.entities.get_mut(entity) {
            state.initializing.remove(attr_name);
        }
    }

    pub(crate) fn component_mut(
        &mut self,
        entity: NodeId,
        attr_name: &str,
    ) -> Option<&mut ComponentInstance> {
        self.entities
            .get_mut(entity)
            .and_then(|e| e.components.get_mut(attr_name))
    }

    /// Fold a value into the component's cache and recompute its data
    ///
    /// On a parse error the cache is restored and the error returned.
    pub(crate) fn update_properties(
        &mut self,
        entity: NodeId,
        attr_name: &str,
        value: &PropValue,
        clobber: bool,
    ) -> Result<()> {
        let Some(instance) = self.component_mut(entity, attr_name) else {
            return Ok(());
        };
        let merged = merge_attr_value(&instance.def.schema, &instance.attr_value, value, clobber);
        let previous = std::mem::replace(&mut instance.attr_value, merged);
        let previous_own = std::mem::replace(&mut instance.own, true);
        if let Err(e) = self.recompute(entity, attr_name) {
            if let Some(instance) = self.component_mut(entity, attr_name) {
                instance.attr_value = previous;
                instance.own = previous_own;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Rebuild data from the cache and current mixins; `update` runs only
    /// when the resolved data actually changed
    pub(crate) fn recompute(&mut self, entity: NodeId, attr_name: &str) -> Result<bool> {
        let Some(instance) = self.component_mut(entity, attr_name) else {
            return Ok(false);
        };
        let def = instance.def.clone();
        let attr_value = instance.attr_value.clone();
        let data = self.build_data(entity, attr_name, &def, &attr_value)?;

        let Some(instance) = self.component_mut(entity, attr_name) else {
            self.recycle_data(&def.name, data);
            return Ok(false);
        };
        if instance.data == data {
            self.recycle_data(&def.name, data);
            return Ok(false);
        }
        let old = std::mem::replace(&mut instance.data, data);
        let id = instance.id.clone();
        self.run_component_hook(entity, attr_name, "update", |b, ctx| b.update(ctx, &old));
        self.recycle_data(&def.name, old);
        self.emit(
            entity,
            names::COMPONENT_CHANGED,
            EventDetail::Component {
                name: def.name.clone(),
                id,
            },
            false,
        );
        Ok(true)
    }

    /// Drop one key (or the whole own value) from the cache
    pub(crate) fn reset_component_property(
        &mut self,
        entity: NodeId,
        attr_name: &str,
        property: Option<&str>,
    ) -> Result<()> {
        let Some(instance) = self.component_mut(entity, attr_name) else {
            return Ok(());
        };
        match property {
            Some(key) if instance.attr_value.as_map().is_some() => {
                if let Some(map) = instance.attr_value.as_map_mut() {
                    map.shift_remove(key);
                }
            }
            _ => {
                instance.attr_value = parse_attr_value_for_cache(&instance.def.schema, &NULL_VALUE);
                instance.own = false;
            }
        }
        self.recompute(entity, attr_name).map(|_| ())
    }

    /// Remove a component, honoring default/mixin refusal and deferral
    ///
    /// A component still backed by a default or a mixin is not removed: its
    /// own value is cleared and the component stays on the backing data.
    pub(crate) fn remove_component(&mut self, entity: NodeId, attr_name: &str) {
        let Some(state) = self.entities.get_mut(entity) else {
            return;
        };
        state.preload.shift_remove(attr_name);
        let initialized = state
            .components
            .get(attr_name)
            .map(|c| c.initialized && !state.initializing.contains(attr_name));
        match initialized {
            None if state.initializing.contains(attr_name) => {
                state.pending_removal.insert(attr_name.to_string());
                return;
            }
            None => return,
            Some(false) => {
                state.pending_removal.insert(attr_name.to_string());
                return;
            }
            Some(true) => {}
        }

        if self.config.is_default_component(attr_name) || self.mixin_defines(entity, attr_name) {
            tracing::debug!(
                "Not removing `{}`: still defined by a default or a mixin",
                attr_name
            );
            let own = self
                .component_mut(entity, attr_name)
                .map(|c| c.own)
                .unwrap_or(false);
            if own {
                if let Err(e) = self.reset_component_property(entity, attr_name, None) {
                    tracing::warn!("Failed to reset `{}`: {}", attr_name, e);
                }
            }
            return;
        }

        let target = HookOwner::Component {
            entity,
            key: attr_name.to_string(),
        };
        if self.running.contains(&target) {
            self.defer(target, DeferredAction::Remove);
            return;
        }
        self.teardown_component(entity, attr_name, true);
    }

    /// Unconditionally tear a component down
    pub(crate) fn teardown_component(&mut self, entity: NodeId, attr_name: &str, strip_markup: bool) {
        self.pause_component(entity, attr_name);
        self.run_component_hook(entity, attr_name, "remove", |b, ctx| b.remove(ctx));

        let Some(instance) = self
            .entities
            .get_mut(entity)
            .and_then(|e| e.components.shift_remove(attr_name))
        else {
            return;
        };
        self.tick_behaviors
            .retain(|(e, k)| !(*e == entity && k == attr_name));
        self.tock_behaviors
            .retain(|(e, k)| !(*e == entity && k == attr_name));
        let ComponentInstance { name, id, data, .. } = instance;
        self.recycle_data(&name, data);
        tracing::trace!("Removed component `{}`", attr_name);
        self.emit(
            entity,
            names::COMPONENT_REMOVED,
            EventDetail::Component { name, id },
            false,
        );
        if strip_markup {
            self.doc.remove_attribute_silent(entity, attr_name);
            self.doc.discard_mutations(entity, attr_name);
        }
    }

    pub(crate) fn play_component(&mut self, entity: NodeId, attr_name: &str) {
        let Some(instance) = self.component_mut(entity, attr_name) else {
            return;
        };
        if instance.playing || !instance.initialized {
            return;
        }
        instance.playing = true;
        let (has_tick, has_tock) = instance
            .behavior
            .as_deref()
            .map(|b| (b.has_tick(), b.has_tock()))
            .unwrap_or((false, false));
        let entry = (entity, attr_name.to_string());
        if has_tick && !self.tick_behaviors.contains(&entry) {
            self.tick_behaviors.push(entry.clone());
        }
        if has_tock && !self.tock_behaviors.contains(&entry) {
            self.tock_behaviors.push(entry);
        }
        self.run_component_hook(entity, attr_name, "play", |b, ctx| b.play(ctx));
    }

    pub(crate) fn pause_component(&mut self, entity: NodeId, attr_name: &str) {
        let Some(instance) = self.component_mut(entity, attr_name) else {
            return;
        };
        if !instance.playing {
            return;
        }
        instance.playing = false;
        self.tick_behaviors
            .retain(|(e, k)| !(*e == entity && k == attr_name));
        self.tock_behaviors
            .retain(|(e, k)| !(*e == entity && k == attr_name));
        self.run_component_hook(entity, attr_name, "pause", |b, ctx| b.pause(ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::schema::{process_schema, PropertyDecl, SchemaDecl};
    use trellis_core::{NoLookup, PropertyTypes, Vec3};

    fn multi() -> Schema {
        process_schema(
            &SchemaDecl::multi([
                ("width", PropertyDecl::new().with_default(1.0)),
                ("color", PropertyDecl::typed("color")),
            ]),
            &PropertyTypes::with_builtins(),
        )
    }

    fn single() -> Schema {
        process_schema(
            &SchemaDecl::Single(PropertyDecl::typed("vec3")),
            &PropertyTypes::with_builtins(),
        )
    }

    #[test]
    fn test_cache_keeps_raw_strings() {
        let cache = parse_attr_value_for_cache(&multi(), &"width: 2".into());
        assert_eq!(cache.get("width"), Some(&PropValue::from("2")));
    }

    #[test]
    fn test_merge_and_clobber() {
        let schema = multi();
        let cache = parse_attr_value_for_cache(&schema, &"width: 2".into());
        let merged = merge_attr_value(&schema, &cache, &"color: red".into(), false);
        assert_eq!(merged.as_map().map(|m| m.len()), Some(2));
        let clobbered = merge_attr_value(&schema, &merged, &"color: blue".into(), true);
        assert_eq!(clobbered.as_map().map(|m| m.len()), Some(1));
        assert_eq!(clobbered.get("color"), Some(&PropValue::from("blue")));
    }

    #[test]
    fn test_merge_priority_multi() {
        let schema = multi();
        let mut pool = ObjectPool::new();
        let early = PropValue::map([("width", PropValue::from("3")), ("color", "red".into())]);
        let late = PropValue::map([("color", PropValue::from("blue"))]);
        let own = PropValue::empty_map();
        let data = compose_data(&schema, &own, &[&early, &late], &NoLookup, &mut pool).unwrap();
        assert_eq!(data.get("width"), Some(&PropValue::Number(3.0)));
        assert_eq!(data.get("color"), Some(&PropValue::from("blue")));

        let own = PropValue::map([("width", PropValue::from("9"))]);
        let data = compose_data(&schema, &own, &[&early, &late], &NoLookup, &mut pool).unwrap();
        assert_eq!(data.get("width"), Some(&PropValue::Number(9.0)));

        let data = compose_data(&schema, &PropValue::empty_map(), &[], &NoLookup, &mut pool).unwrap();
        assert_eq!(data.get("width"), Some(&PropValue::Number(1.0)));
        assert_eq!(data.get("color"), Some(&PropValue::from("#FFF")));
    }

    #[test]
    fn test_merge_priority_single() {
        let schema = single();
        let mut pool = ObjectPool::new();
        let mixin = PropValue::from("1 1 1");
        let data = compose_data(&schema, &PropValue::Null, &[&mixin], &NoLookup, &mut pool).unwrap();
        assert_eq!(data, PropValue::Vec3(Vec3::new(1.0, 1.0, 1.0)));

        let own = PropValue::from("2 2 2");
        let data = compose_data(&schema, &own, &[&mixin], &NoLookup, &mut pool).unwrap();
        assert_eq!(data, PropValue::Vec3(Vec3::new(2.0, 2.0, 2.0)));

        let data = compose_data(&schema, &"".into(), &[], &NoLookup, &mut pool).unwrap();
        assert_eq!(data, PropValue::Vec3(Vec3::default()));
    }

    #[test]
    fn test_multi_data_comes_from_pool() {
        let schema = multi();
        let mut pool = ObjectPool::new();
        let first = compose_data(&schema, &PropValue::empty_map(), &[], &NoLookup, &mut pool).unwrap();
        let PropValue::Map(map) = first else {
            panic!("expected map data");
        };
        let addr = &*map as *const PropMap;
        pool.recycle(map);
        let second = compose_data(&schema, &PropValue::empty_map(), &[], &NoLookup, &mut pool).unwrap();
        assert_eq!(second.as_map().map(|m| m as *const PropMap), Some(addr));
    }
}
