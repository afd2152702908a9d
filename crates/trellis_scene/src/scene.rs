//! The scene
//!
//! [`Scene`] owns the markup [`Document`] and every piece of runtime state
//! hanging off it: entity and mixin state, the scene's systems, the active
//! tick/tock behaviors, the asset cache, listeners and the renderer.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trellis_scene::{Registry, SceneBuilder};
//!
//! let registry = Arc::new(Registry::with_builtins());
//! let mut scene = SceneBuilder::new(registry).build();
//!
//! let box_entity = scene.create_element("t-entity");
//! scene.set_attribute(box_entity, "position", "0 1.5 -3").unwrap();
//! scene.append_child(scene.root(), box_entity).unwrap();
//!
//! scene.render_frame(16.0);
//! assert!(scene.is_playing(box_entity));
//! ```

use crate::assets::{AssetCache, Fetcher, LoadStatus, NullFetcher};
use crate::clock::{AnimationDriver, FrameClock};
use crate::component::{ComponentInstance, DeferredOp, HookOwner};
use crate::config::SceneConfig;
use crate::document::{Document, MutationRecord, NodeId, NodeKind, SCENE_TAG};
use crate::entity::EntityState;
use crate::error::{Result, SceneError};
use crate::events::{Event, EventDetail, ListenerId, Listeners};
use crate::mixin::MixinState;
use crate::registry::{split_attr_name, Registry};
use crate::renderer::{HeadlessRenderer, Object3D, ObjectHandle, Renderer};
use crate::system::SystemInstance;
use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use slotmap::SecondaryMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use trellis_core::{ObjectPool, PropMap, PropValue};

/// Upper bound on mutation delivery rounds per flush
const MAX_FLUSH_ROUNDS: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a [`Scene`]
pub struct SceneBuilder {
    registry: Arc<Registry>,
    renderer: Box<dyn Renderer>,
    fetcher: Box<dyn Fetcher>,
    config: SceneConfig,
    attributes: Vec<(String, String)>,
    animation: Option<Box<dyn AnimationDriver>>,
}

impl SceneBuilder {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            renderer: Box::new(HeadlessRenderer::new()),
            fetcher: Box::new(NullFetcher),
            config: SceneConfig::default(),
            attributes: Vec::new(),
            animation: None,
        }
    }

    pub fn renderer(mut self, renderer: impl Renderer) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    pub fn config(mut self, config: SceneConfig) -> Self {
        self.config = config;
        self
    }

    /// Markup attribute on the scene node, read by systems at creation
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn animation_driver(mut self, driver: impl AnimationDriver + 'static) -> Self {
        self.animation = Some(Box::new(driver));
        self
    }

    /// Create the scene node, then every system in name order, then load
    pub fn build(self) -> Scene {
        let SceneBuilder {
            registry,
            mut renderer,
            fetcher,
            config,
            attributes,
            animation,
        } = self;

        let mut doc = Document::new();
        let root = doc.create_root(SCENE_TAG);
        for (name, value) in &attributes {
            doc.set_attribute_silent(root, name, value);
        }

        let mut root_state = EntityState::new(renderer.create_object("scene"));
        root_state.attached = true;
        let mut entities = SecondaryMap::new();
        entities.insert(root, root_state);
        let mut load_status = SecondaryMap::new();
        load_status.insert(root, LoadStatus::Pending);

        let mut scene = Scene {
            doc,
            registry,
            config,
            renderer,
            fetcher,
            root,
            entities,
            mixins: SecondaryMap::new(),
            mixin_users: FxHashMap::default(),
            systems: BTreeMap::new(),
            tick_behaviors: Vec::new(),
            tock_behaviors: Vec::new(),
            pools: FxHashMap::default(),
            assets: AssetCache::new(),
            load_status,
            asset_containers: SecondaryMap::new(),
            listeners: Listeners::new(),
            clock: FrameClock::new(),
            animation,
            camera: None,
            running: Vec::new(),
            deferred: Vec::new(),
            settling: false,
            settle_again: false,
        };
        scene.init_systems();
        scene.settle_loads();
        tracing::info!("Scene built with {} system(s)", scene.systems.len());
        scene
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scene
// ─────────────────────────────────────────────────────────────────────────────

/// A running scene
pub struct Scene {
    pub(crate) doc: Document,
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: SceneConfig,
    pub(crate) renderer: Box<dyn Renderer>,
    pub(crate) fetcher: Box<dyn Fetcher>,
    pub(crate) root: NodeId,

    pub(crate) entities: SecondaryMap<NodeId, EntityState>,
    pub(crate) mixins: SecondaryMap<NodeId, MixinState>,
    /// Mixin id → entities whose last resolution looked that id up
    pub(crate) mixin_users: FxHashMap<String, IndexSet<NodeId>>,
    pub(crate) systems: BTreeMap<String, SystemInstance>,

    /// Playing components with a `tick`, in the order they started
    pub(crate) tick_behaviors: Vec<(NodeId, String)>,
    pub(crate) tock_behaviors: Vec<(NodeId, String)>,
    /// Data maps per component name
    pub(crate) pools: FxHashMap<String, ObjectPool<PropMap>>,

    pub(crate) assets: AssetCache,
    pub(crate) load_status: SecondaryMap<NodeId, LoadStatus>,
    /// Asset container → time its timeout started
    pub(crate) asset_containers: SecondaryMap<NodeId, Option<f64>>,

    pub(crate) listeners: Listeners,
    pub(crate) clock: FrameClock,
    pub(crate) animation: Option<Box<dyn AnimationDriver>>,
    pub(crate) camera: Option<ObjectHandle>,

    /// Owners of the hooks currently on the stack
    pub(crate) running: Vec<HookOwner>,
    pub(crate) deferred: Vec<DeferredOp>,
    pub(crate) settling: bool,
    pub(crate) settle_again: bool,
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("root", &self.root)
            .field("nodes", &self.doc.len())
            .field("entities", &self.entities.len())
            .field("systems", &self.systems.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl Scene {
    // === Tree ===

    /// Create a detached node; entity tags get runtime state and a renderer object
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        let node = self.doc.create_element(tag);
        if self.doc.kind(node) == Some(NodeKind::Entity) {
            self.init_entity_state(node);
        }
        node
    }

    /// Create a detached entity with a custom tag
    pub fn create_entity_node(&mut self, tag: &str) -> NodeId {
        let node = self.doc.create_node(tag, NodeKind::Entity);
        self.init_entity_state(node);
        node
    }

    fn init_entity_state(&mut self, node: NodeId) {
        let object = self.renderer.create_object("group");
        self.entities.insert(node, EntityState::new(object));
    }

    /// Append a detached node (and its subtree) under `parent`
    ///
    /// Connecting attaches entities parents first, registers mixins and
    /// starts asset requests; whatever can load then loads.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.doc.append_child(parent, child)?;
        if self.doc.is_connected(child) {
            for node in self.doc.pre_order(child) {
                self.connect_node(node);
            }
        }
        self.settle_loads();
        Ok(())
    }

    // === Attributes ===

    /// Set a component, mixin list, system value or plain attribute
    ///
    /// Multi-property values merge into the current value; writes made
    /// before the entity loads are kept until it does.
    pub fn set_attribute(
        &mut self,
        node: NodeId,
        name: &str,
        value: impl Into<PropValue>,
    ) -> Result<()> {
        self.set_attribute_with(node, name, value.into(), false)
    }

    /// Like [`set_attribute`](Self::set_attribute), replacing instead of merging
    pub fn set_attribute_clobber(
        &mut self,
        node: NodeId,
        name: &str,
        value: impl Into<PropValue>,
    ) -> Result<()> {
        self.set_attribute_with(node, name, value.into(), true)
    }

    fn set_attribute_with(
        &mut self,
        node: NodeId,
        name: &str,
        value: PropValue,
        clobber: bool,
    ) -> Result<()> {
        let kind = self.doc.kind(node).ok_or(SceneError::UnknownNode(node))?;
        if !kind.is_entity() {
            let text = value.to_attr_string();
            self.doc.set_attribute_silent(node, name, &text);
            if kind == NodeKind::Mixin {
                self.mixin_attribute_changed(node, name, Some(&text));
            }
            return Ok(());
        }

        if name == "mixin" {
            let text = value.to_attr_string();
            self.doc.set_attribute_silent(node, name, &text);
            if self.entities.get(node).map(|e| e.attached).unwrap_or(false) {
                self.update_mixins(node, &text);
            }
            return Ok(());
        }
        let base = split_attr_name(name).0;
        if node == self.root && self.systems.contains_key(base) {
            return self.update_system(base, value, clobber);
        }
        if self.registry.component_for_attr(name).is_some() {
            return self.write_component(node, name, value, clobber);
        }
        self.doc
            .set_attribute_silent(node, name, &value.to_attr_string());
        Ok(())
    }

    /// Set one property of a multi-property component
    pub fn set_property(
        &mut self,
        node: NodeId,
        attr_name: &str,
        property: &str,
        value: impl Into<PropValue>,
    ) -> Result<()> {
        let single = self
            .registry
            .component_for_attr(attr_name)
            .map(|def| def.is_single_property())
            .unwrap_or(false);
        let value = if single {
            value.into()
        } else {
            PropValue::map([(property, value.into())])
        };
        self.set_attribute_with(node, attr_name, value, false)
    }

    /// Remove an attribute
    ///
    /// A component backed by a default or an active mixin stays, falling
    /// back to that value.
    pub fn remove_attribute(&mut self, node: NodeId, name: &str) -> Result<()> {
        let kind = self.doc.kind(node).ok_or(SceneError::UnknownNode(node))?;
        if !kind.is_entity() {
            self.doc.remove_attribute_silent(node, name);
            if kind == NodeKind::Mixin {
                self.mixin_attribute_changed(node, name, None);
            }
            return Ok(());
        }

        if name == "mixin" {
            self.doc.remove_attribute_silent(node, name);
            if self.entities.get(node).map(|e| e.attached).unwrap_or(false) {
                self.update_mixins(node, "");
            }
            return Ok(());
        }
        let base = split_attr_name(name).0;
        if node == self.root && self.systems.contains_key(base) {
            self.doc.remove_attribute_silent(node, name);
            return self.update_system(base, PropValue::Null, true);
        }
        if self.registry.component_for_attr(name).is_some() {
            self.remove_component(node, name);
        }
        self.doc.remove_attribute_silent(node, name);
        Ok(())
    }

    /// Drop one property (or the whole own value) back to mixin/default data
    pub fn reset_property(
        &mut self,
        entity: NodeId,
        attr_name: &str,
        property: Option<&str>,
    ) -> Result<()> {
        if !self.entities.contains_key(entity) {
            return Err(SceneError::NotAnEntity(entity));
        }
        self.reset_component_property(entity, attr_name, property)
    }

    /// The raw markup string of an attribute
    pub fn markup_attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.doc.attribute(node, name)
    }

    /// Resolved component data
    pub fn component_data(&self, entity: NodeId, attr_name: &str) -> Option<&PropValue> {
        self.component_instance(entity, attr_name).map(|c| &c.data)
    }

    /// The component's own cached value, before mixins and defaults
    pub fn component_attr_value(&self, entity: NodeId, attr_name: &str) -> Option<&PropValue> {
        self.component_instance(entity, attr_name)
            .map(|c| &c.attr_value)
    }

    pub fn has_component(&self, entity: NodeId, attr_name: &str) -> bool {
        self.component_instance(entity, attr_name).is_some()
    }

    pub fn component_instance(&self, entity: NodeId, attr_name: &str) -> Option<&ComponentInstance> {
        self.entities
            .get(entity)
            .and_then(|e| e.components.get(attr_name))
    }

    /// Downcast a component's behavior
    pub fn behavior<T: 'static>(&self, entity: NodeId, attr_name: &str) -> Option<&T> {
        self.component_instance(entity, attr_name)?.behavior::<T>()
    }

    pub fn behavior_mut<T: 'static>(&mut self, entity: NodeId, attr_name: &str) -> Option<&mut T> {
        self.component_mut(entity, attr_name)?.behavior_mut::<T>()
    }

    pub fn entity(&self, node: NodeId) -> Option<&EntityState> {
        self.entities.get(node)
    }

    // === Markup mutations ===

    /// Write markup as a host would; observed on the next flush
    pub fn write_markup_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<()> {
        if !self.doc.set_attribute(node, name, value) {
            return Err(SceneError::UnknownNode(node));
        }
        Ok(())
    }

    /// Remove markup as a host would; observed on the next flush
    pub fn remove_markup_attribute(&mut self, node: NodeId, name: &str) -> Result<()> {
        if !self.doc.contains(node) {
            return Err(SceneError::UnknownNode(node));
        }
        self.doc.remove_attribute(node, name);
        Ok(())
    }

    /// Deliver queued markup changes, one per node and attribute
    ///
    /// Every record is applied; the first error is returned.
    pub fn flush_mutations(&mut self) -> Result<()> {
        let mut first_error = None;
        for _ in 0..MAX_FLUSH_ROUNDS {
            if !self.doc.has_pending_mutations() {
                break;
            }
            for record in self.doc.take_mutations() {
                if let Err(e) = self.apply_mutation(record) {
                    tracing::warn!("Attribute change failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn apply_mutation(&mut self, record: MutationRecord) -> Result<()> {
        let MutationRecord {
            node, name, value, ..
        } = record;
        match self.doc.kind(node) {
            Some(NodeKind::Mixin) => {
                self.mixin_attribute_changed(node, &name, value.as_deref());
                return Ok(());
            }
            Some(NodeKind::Scene) | Some(NodeKind::Entity) => {}
            _ => return Ok(()),
        }
        if value.is_some() && !self.doc.has_attribute(node, &name) {
            // Written, then removed again before delivery
            return Ok(());
        }
        let Some(state) = self.entities.get_mut(node) else {
            return Ok(());
        };
        if !state.attached {
            return Ok(());
        }
        if name == "mixin" {
            self.update_mixins(node, value.as_deref().unwrap_or_default());
            return Ok(());
        }
        if !state.has_loaded {
            // Markup is read at load time
            state.preload.shift_remove(&name);
            return Ok(());
        }
        if let Some(instance) = state.components.get_mut(&name) {
            if std::mem::replace(&mut instance.just_initialized, false)
                && value.as_deref() == Some("")
            {
                return Ok(());
            }
        }

        let base = split_attr_name(&name).0;
        if node == self.root && self.systems.contains_key(base) {
            let value = value.map(PropValue::from).unwrap_or_default();
            return self.update_system(base, value, true);
        }
        if self.registry.component_for_attr(&name).is_none() {
            return Ok(());
        }
        match value {
            Some(text) => self.write_component(node, &name, PropValue::from(text), true),
            None => {
                self.remove_component(node, &name);
                Ok(())
            }
        }
    }

    // === Play state ===

    pub fn is_playing(&self, entity: NodeId) -> bool {
        self.entities.get(entity).map(|e| e.playing).unwrap_or(false)
    }

    pub fn has_loaded(&self, entity: NodeId) -> bool {
        self.entities
            .get(entity)
            .map(|e| e.has_loaded)
            .unwrap_or(false)
    }

    pub fn load_status(&self, node: NodeId) -> Option<LoadStatus> {
        self.load_status.get(node).copied()
    }

    pub fn states(&self, entity: NodeId) -> Vec<&str> {
        self.entities
            .get(entity)
            .map(|e| e.states().collect())
            .unwrap_or_default()
    }

    // === Events ===

    pub fn add_listener<F>(&mut self, node: NodeId, event: &str, callback: F) -> ListenerId
    where
        F: FnMut(&Event) + 'static,
    {
        self.listeners.add(node, event, callback)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Dispatch an event on `target`, then its ancestors if `bubbles`
    pub fn emit(&mut self, target: NodeId, name: &str, detail: EventDetail, bubbles: bool) {
        let path = self.doc.path_to_root(target);
        if path.is_empty() {
            return;
        }
        tracing::trace!("Event `{}` on {:?}", name, target);
        let event = Event {
            name: name.to_string(),
            target,
            current_target: target,
            detail,
            bubbles,
        };
        self.listeners.dispatch(&path, event);
    }

    // === Systems ===

    /// Downcast a system's behavior
    pub fn system<T: 'static>(&self, name: &str) -> Option<&T> {
        self.systems.get(name)?.behavior::<T>()
    }

    pub fn system_data(&self, name: &str) -> Option<&PropValue> {
        self.systems.get(name).map(|s| &s.data)
    }

    pub fn system_instance(&self, name: &str) -> Option<&SystemInstance> {
        self.systems.get(name)
    }

    // === Rendering ===

    pub fn set_active_camera(&mut self, camera: Option<ObjectHandle>) {
        self.camera = camera;
    }

    pub fn camera(&self) -> Option<ObjectHandle> {
        self.camera
    }

    pub fn set_animation_driver(&mut self, driver: Box<dyn AnimationDriver>) {
        self.animation = Some(driver);
    }

    pub fn object3d(&self, entity: NodeId) -> Option<&Object3D> {
        self.entities.get(entity).map(|e| &e.object3d)
    }

    /// Root renderer object of an entity
    pub fn object_handle(&self, entity: NodeId) -> Option<ObjectHandle> {
        self.entities.get(entity).map(|e| e.root_object)
    }

    pub fn renderer(&self) -> &dyn Renderer {
        self.renderer.as_ref()
    }

    pub fn renderer_mut(&mut self) -> &mut dyn Renderer {
        self.renderer.as_mut()
    }

    /// Downcast the renderer, e.g. to inspect a [`HeadlessRenderer`]
    pub fn renderer_as<T: 'static>(&self) -> Option<&T> {
        let renderer: &dyn Renderer = self.renderer.as_ref();
        renderer.as_any().downcast_ref::<T>()
    }

    /// Run one frame at host time `now_ms`
    ///
    /// Order: flush markup changes, advance asset timeouts, animations,
    /// component `tick`s, system `tick`s, `render`, then the `tock` pass in
    /// the same order. Nothing ticks while the scene is paused.
    pub fn render_frame(&mut self, now_ms: f64) {
        if let Err(e) = self.flush_mutations() {
            tracing::warn!("Markup flush failed: {}", e);
        }
        self.check_asset_timeouts(now_ms);
        let (time, delta) = self.clock.advance(now_ms);
        let playing = self.is_playing(self.root);

        if playing {
            if let Some(driver) = self.animation.as_mut() {
                driver.update(time, delta);
            }
            let ticking = self.tick_behaviors.clone();
            for (entity, key) in ticking {
                if self.behavior_active(entity, &key) {
                    self.run_component_hook(entity, &key, "tick", |b, ctx| {
                        b.tick(ctx, time, delta)
                    });
                }
            }
            self.tick_systems(time, delta);
        }

        let root_object = self
            .entities
            .get(self.root)
            .map(|e| e.root_object);
        if let Some(root_object) = root_object {
            self.renderer.render(root_object, self.camera);
        }

        if playing {
            let camera = self.camera;
            let tocking = self.tock_behaviors.clone();
            for (entity, key) in tocking {
                if self.behavior_active(entity, &key) {
                    self.run_component_hook(entity, &key, "tock", |b, ctx| {
                        b.tock(ctx, time, delta, camera)
                    });
                }
            }
            self.tock_systems(time, delta, camera);
        }
    }

    /// Component still attached and playing on a playing entity
    fn behavior_active(&self, entity: NodeId, key: &str) -> bool {
        self.entities
            .get(entity)
            .filter(|e| e.playing)
            .and_then(|e| e.components.get(key))
            .map(|c| c.playing)
            .unwrap_or(false)
    }

    // === Accessors ===

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// The scene node
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn asset_cache(&self) -> &AssetCache {
        &self.assets
    }
}
