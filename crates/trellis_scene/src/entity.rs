//! Entity lifecycle
//!
//! ```text
//! created ──append──▶ attached ──children settle──▶ loaded ─┬─▶ playing
//!                                                           └─▶ paused
//! any ──remove──▶ detached
//! ```
//!
//! An entity loads once every node-type child has loaded or failed, and
//! once the scene's asset container has settled. Child failures never block
//! a parent. Loading is a post-order pass over the tree that repeats until
//! nothing changes, so a child always loads before its parent and every
//! node settles exactly once.

use crate::assets::LoadStatus;
use crate::component::ComponentInstance;
use crate::document::{NodeId, NodeKind};
use crate::error::{Result, SceneError};
use crate::events::{names, EventDetail};
use crate::registry::split_attr_name;
use crate::renderer::{Object3D, ObjectHandle};
use crate::scene::Scene;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashSet;
use trellis_core::PropValue;

/// Runtime state of an entity node
pub struct EntityState {
    pub(crate) components: IndexMap<String, ComponentInstance>,
    /// Resolved mixins, lowest priority first
    pub(crate) applied: Vec<(String, NodeId)>,
    /// Ids from the entity's `mixin` attribute
    pub(crate) base_ids: Vec<String>,
    /// Ids looked up by the last resolution (reverse index keys)
    pub(crate) probed: Vec<String>,
    pub(crate) states: IndexSet<String>,
    pub(crate) playing: bool,
    pub(crate) has_loaded: bool,
    pub(crate) attached: bool,
    pub(crate) object3d: Object3D,
    pub(crate) root_object: ObjectHandle,
    pub(crate) objects: IndexMap<String, ObjectHandle>,
    pub(crate) initializing: FxHashSet<String>,
    pub(crate) pending_removal: FxHashSet<String>,
    /// Component values written before the entity loaded
    pub(crate) preload: IndexMap<String, PropValue>,
}

impl EntityState {
    pub(crate) fn new(root_object: ObjectHandle) -> Self {
        Self {
            components: IndexMap::new(),
            applied: Vec::new(),
            base_ids: Vec::new(),
            probed: Vec::new(),
            states: IndexSet::new(),
            playing: false,
            has_loaded: false,
            attached: false,
            object3d: Object3D::default(),
            root_object,
            objects: IndexMap::new(),
            initializing: FxHashSet::default(),
            pending_removal: FxHashSet::default(),
            preload: IndexMap::new(),
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentInstance> {
        self.components.values()
    }

    pub fn component(&self, attr_name: &str) -> Option<&ComponentInstance> {
        self.components.get(attr_name)
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(String::as_str)
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn has_loaded(&self) -> bool {
        self.has_loaded
    }

    pub fn object3d(&self) -> &Object3D {
        &self.object3d
    }

    pub fn root_object(&self) -> ObjectHandle {
        self.root_object
    }
}

impl std::fmt::Debug for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityState")
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .field("mixins", &self.applied)
            .field("states", &self.states)
            .field("playing", &self.playing)
            .field("has_loaded", &self.has_loaded)
            .finish()
    }
}

impl Scene {
    // === Attach / detach ===

    /// Nearest ancestor entity of a node
    pub(crate) fn parent_entity(&self, node: NodeId) -> Option<NodeId> {
        let mut current = self.doc.parent(node);
        while let Some(n) = current {
            if self.entities.contains_key(n) {
                return Some(n);
            }
            current = self.doc.parent(n);
        }
        None
    }

    /// Entities directly below a node, looking through plain elements
    pub(crate) fn child_entities(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.doc.children(node).iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            if self.entities.contains_key(n) {
                out.push(n);
            } else {
                stack.extend(self.doc.children(n).iter().rev().copied());
            }
        }
        out
    }

    /// A node became connected
    pub(crate) fn connect_node(&mut self, node: NodeId) {
        match self.doc.kind(node) {
            Some(NodeKind::Entity) => self.attach_entity(node),
            Some(NodeKind::Mixin) => {
                self.load_status.insert(node, LoadStatus::Loaded);
                self.attach_mixin(node);
            }
            Some(NodeKind::Assets) => {
                if !self.asset_containers.contains_key(node) {
                    self.asset_containers.insert(node, None);
                    self.load_status.insert(node, LoadStatus::Pending);
                }
            }
            Some(NodeKind::AssetItem) | Some(NodeKind::Element) => {
                if self.is_tracked_asset(node) && !self.load_status.contains_key(node) {
                    self.request_item(node);
                }
            }
            Some(NodeKind::Scene) | None => {}
        }
    }

    fn attach_entity(&mut self, node: NodeId) {
        let Some(state) = self.entities.get_mut(node) else {
            return;
        };
        if state.attached {
            return;
        }
        state.attached = true;
        let object = state.root_object;
        if let Some(parent) = self.parent_entity(node) {
            if let Some(parent_object) = self.entities.get(parent).map(|p| p.root_object) {
                self.renderer.add(parent_object, object);
            }
        }
        self.load_status.insert(node, LoadStatus::Pending);
        tracing::debug!("Entity {:?} attached", node);

        if let Some(parent) = self.doc.parent(node) {
            self.emit(parent, names::CHILD_ATTACHED, EventDetail::Child(node), true);
        }
        if let Some(mixins) = self.doc.attribute(node, "mixin").map(str::to_string) {
            self.update_mixins(node, &mixins);
        }
    }

    /// A node is about to leave the tree
    pub(crate) fn disconnect_node(&mut self, node: NodeId) {
        match self.doc.kind(node) {
            Some(NodeKind::Entity) => self.detach_entity(node),
            Some(NodeKind::Mixin) => self.detach_mixin(node),
            _ => {}
        }
    }

    fn detach_entity(&mut self, node: NodeId) {
        if !self.entities.contains_key(node) {
            return;
        }
        let keys: Vec<String> = self
            .entities
            .get(node)
            .map(|e| e.components.keys().cloned().collect())
            .unwrap_or_default();
        for key in keys.iter().rev() {
            self.teardown_component(node, key, false);
        }
        self.tick_behaviors.retain(|(e, _)| *e != node);
        self.tock_behaviors.retain(|(e, _)| *e != node);

        let parent_object = self
            .parent_entity(node)
            .and_then(|p| self.entities.get(p))
            .map(|p| p.root_object);
        let Some(state) = self.entities.remove(node) else {
            return;
        };
        for (_, handle) in state.objects {
            self.renderer.remove(state.root_object, handle);
            self.renderer.dispose(handle);
        }
        if let Some(parent_object) = parent_object {
            self.renderer.remove(parent_object, state.root_object);
        }
        self.renderer.dispose(state.root_object);

        for id in state.probed {
            if let Some(users) = self.mixin_users.get_mut(&id) {
                users.shift_remove(&node);
                if users.is_empty() {
                    self.mixin_users.remove(&id);
                }
            }
        }
        tracing::debug!("Entity {:?} detached", node);
    }

    // === Loading ===

    /// Settle every node whose load dependencies are met
    pub(crate) fn settle_loads(&mut self) {
        if self.settling {
            self.settle_again = true;
            return;
        }
        self.settling = true;
        loop {
            self.settle_again = false;
            for node in self.doc.post_order(self.root) {
                self.try_load(node);
            }
            if !self.settle_again {
                break;
            }
        }
        self.settling = false;
    }

    fn status(&self, node: NodeId) -> Option<LoadStatus> {
        self.load_status.get(node).copied()
    }

    fn children_settled(&self, node: NodeId) -> bool {
        self.doc.children(node).iter().all(|child| {
            let takes_part = self
                .doc
                .kind(*child)
                .map(|k| k.is_node_type() && k != NodeKind::Scene)
                .unwrap_or(false);
            !takes_part || self.status(*child).map(LoadStatus::is_settled).unwrap_or(true)
        })
    }

    fn assets_settled(&self) -> bool {
        self.asset_containers.keys().all(|container| {
            !self.doc.is_connected(container)
                || self.status(container).map(LoadStatus::is_settled).unwrap_or(true)
        })
    }

    fn try_load(&mut self, node: NodeId) {
        if self.status(node) != Some(LoadStatus::Pending) {
            return;
        }
        match self.doc.kind(node) {
            Some(NodeKind::Scene) | Some(NodeKind::Entity) => {
                let attached = self.entities.get(node).map(|e| e.attached).unwrap_or(false);
                if !attached || !self.children_settled(node) {
                    return;
                }
                if node != self.root && !self.assets_settled() {
                    return;
                }
                self.finish_load(node);
            }
            Some(NodeKind::Assets) => {
                let tracked_settled = self.doc.children(node).iter().all(|child| {
                    self.status(*child).map(LoadStatus::is_settled).unwrap_or(true)
                });
                if tracked_settled {
                    self.load_status.insert(node, LoadStatus::Loaded);
                    tracing::debug!("Assets {:?} loaded", node);
                    self.emit(node, names::LOADED, EventDetail::None, false);
                }
            }
            _ => {}
        }
    }

    fn finish_load(&mut self, node: NodeId) {
        self.load_status.insert(node, LoadStatus::Loaded);
        if let Some(state) = self.entities.get_mut(node) {
            state.has_loaded = true;
        }
        self.update_components(node);

        let parent_playing = self
            .parent_entity(node)
            .map(|p| self.is_playing(p))
            .unwrap_or(false);
        if node == self.root || parent_playing {
            self.play_entity(node);
        }
        tracing::debug!("Entity {:?} loaded", node);
        self.emit(node, names::LOADED, EventDetail::None, false);
    }

    /// Order attribute names with default components first
    pub(crate) fn defaults_first(&self, keys: IndexSet<String>) -> Vec<String> {
        let (mut defaults, rest): (Vec<String>, Vec<String>) = keys
            .into_iter()
            .partition(|k| self.config.is_default_component(k));
        defaults.sort_by_key(|k| {
            self.config
                .default_components
                .iter()
                .position(|d| d == k)
                .unwrap_or(usize::MAX)
        });
        defaults.extend(rest);
        defaults
    }

    /// Initialize every component the entity defines
    ///
    /// Default components come first, then mixin-provided ones, then markup
    /// attributes and values written before load.
    pub(crate) fn update_components(&mut self, entity: NodeId) {
        let mut keys: IndexSet<String> = IndexSet::new();
        for name in &self.config.default_components {
            if self.registry.has_component(name) {
                keys.insert(name.clone());
            }
        }
        if let Some(state) = self.entities.get(entity) {
            for (_, node) in &state.applied {
                if let Some(mixin) = self.mixins.get(*node) {
                    keys.extend(mixin.cache.keys().cloned());
                }
            }
            keys.extend(state.preload.keys().cloned());
        }
        if let Some(attributes) = self.doc.attributes(entity) {
            for name in attributes.keys() {
                if name == "mixin" {
                    continue;
                }
                let base = split_attr_name(name).0;
                if self.registry.has_component(base)
                    || (entity == self.root && self.systems.contains_key(base))
                {
                    keys.insert(name.clone());
                }
            }
        }

        for key in self.defaults_first(keys) {
            let base = split_attr_name(&key).0.to_string();
            if entity == self.root && self.systems.contains_key(&base) {
                if let Some(value) = self.raw_for(entity, &key) {
                    if let Err(e) = self.update_system(&base, value, true) {
                        tracing::warn!("System `{}` update failed: {}", base, e);
                    }
                }
                continue;
            }
            let preload = self
                .entities
                .get_mut(entity)
                .and_then(|e| e.preload.shift_remove(&key));
            let exists = self
                .entities
                .get(entity)
                .map(|e| e.components.contains_key(&key))
                .unwrap_or(false);
            let result = match (exists, preload) {
                (true, Some(value)) => self.update_properties(entity, &key, &value, true),
                (true, None) => Ok(()),
                (false, preload) => {
                    let raw = preload.or_else(|| self.raw_for(entity, &key));
                    self.init_component(entity, &key, raw)
                }
            };
            if let Err(e) = result {
                tracing::warn!("Component `{}` failed to initialize: {}", key, e);
            }
        }
    }

    // === Play / pause ===

    /// Start a loaded entity, its components and its child entities
    pub fn play(&mut self, entity: NodeId) {
        self.play_entity(entity);
    }

    /// Pause an entity, its components and its child entities
    pub fn pause(&mut self, entity: NodeId) {
        self.pause_entity(entity);
    }

    fn play_entity(&mut self, entity: NodeId) {
        let Some(state) = self.entities.get_mut(entity) else {
            return;
        };
        if state.playing || !state.has_loaded {
            return;
        }
        state.playing = true;
        let keys: Vec<String> = state.components.keys().cloned().collect();
        for key in keys {
            self.play_component(entity, &key);
        }
        if entity == self.root {
            self.play_systems();
        }
        for child in self.child_entities(entity) {
            self.play_entity(child);
        }
        tracing::debug!("Entity {:?} playing", entity);
        self.emit(entity, names::PLAY, EventDetail::None, true);
    }

    fn pause_entity(&mut self, entity: NodeId) {
        let Some(state) = self.entities.get_mut(entity) else {
            return;
        };
        if !state.playing {
            return;
        }
        state.playing = false;
        let keys: Vec<String> = state.components.keys().cloned().collect();
        for key in keys {
            self.pause_component(entity, &key);
        }
        if entity == self.root {
            self.pause_systems();
        }
        for child in self.child_entities(entity) {
            self.pause_entity(child);
        }
        tracing::debug!("Entity {:?} paused", entity);
        self.emit(entity, names::PAUSE, EventDetail::None, true);
    }

    // === States ===

    pub fn add_state(&mut self, entity: NodeId, state: &str) {
        let added = self
            .entities
            .get_mut(entity)
            .map(|e| e.states.insert(state.to_string()))
            .unwrap_or(false);
        if !added {
            return;
        }
        self.reresolve_mixins(entity);
        self.emit(
            entity,
            names::STATE_ADDED,
            EventDetail::State(state.to_string()),
            true,
        );
    }

    pub fn remove_state(&mut self, entity: NodeId, state: &str) {
        let removed = self
            .entities
            .get_mut(entity)
            .map(|e| e.states.shift_remove(state))
            .unwrap_or(false);
        if !removed {
            return;
        }
        self.reresolve_mixins(entity);
        self.emit(
            entity,
            names::STATE_REMOVED,
            EventDetail::State(state.to_string()),
            true,
        );
    }

    pub fn is_state(&self, entity: NodeId, state: &str) -> bool {
        self.entities
            .get(entity)
            .map(|e| e.states.contains(state))
            .unwrap_or(false)
    }

    // === Markup sync ===

    /// Write every component's own value back into markup
    pub fn flush_to_dom(&mut self, entity: NodeId) -> Result<()> {
        let state = self
            .entities
            .get(entity)
            .ok_or(SceneError::NotAnEntity(entity))?;
        let mut writes = Vec::with_capacity(state.components.len());
        for (key, instance) in &state.components {
            let text = match instance.def.schema.properties() {
                None => {
                    if instance.attr_value.is_empty_input() {
                        String::new()
                    } else {
                        let value = instance.def.schema.parse_value(&instance.attr_value, &self.doc)?;
                        instance.def.schema.stringify_value(&value, &self.doc)
                    }
                }
                Some(props) => {
                    let own = instance.attr_value.as_map().cloned().unwrap_or_default();
                    let mut parsed = trellis_core::PropMap::new();
                    for (name, raw) in own {
                        if let Some(def) = props.get(&name) {
                            parsed.insert(name, trellis_core::parse_property(&raw, def, &self.doc)?);
                        }
                    }
                    trellis_core::stringify_properties(&parsed, props, &self.doc)
                }
            };
            writes.push((key.clone(), text));
        }
        for (key, text) in writes {
            self.doc.set_attribute_silent(entity, &key, &text);
        }
        Ok(())
    }

    /// Remove a node and its subtree
    ///
    /// Every entity in the subtree is torn down children first: components
    /// are paused and removed, renderer objects detached and disposed.
    pub fn remove_node(&mut self, node: NodeId) -> Result<()> {
        if node == self.root {
            return Err(SceneError::InvalidHierarchy(
                "the scene root cannot be removed".to_string(),
            ));
        }
        if !self.doc.contains(node) {
            return Err(SceneError::UnknownNode(node));
        }
        let parent = self.doc.parent(node);
        let was_connected = self.doc.is_connected(node);
        if was_connected {
            for n in self.doc.post_order(node) {
                self.disconnect_node(n);
            }
        }
        for n in self.doc.remove_subtree(node) {
            // Never-attached entities still own their root object
            if let Some(state) = self.entities.remove(n) {
                self.renderer.dispose(state.root_object);
            }
            self.listeners.remove_node(n);
            self.load_status.remove(n);
            self.asset_containers.remove(n);
        }
        if let (Some(parent), true) = (parent, was_connected) {
            self.emit(parent, names::CHILD_DETACHED, EventDetail::Child(node), true);
        }
        self.settle_loads();
        Ok(())
    }
}
