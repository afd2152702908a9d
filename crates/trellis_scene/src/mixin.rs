//! Mixins
//!
//! A `t-mixin` node is a named bundle of component attributes. Its values
//! are parsed for the component cache as soon as it connects and whenever
//! one of its attributes changes; entities read that cache rather than
//! re-parsing markup.
//!
//! An entity's `mixin` attribute lists mixin ids. Resolution expands nested
//! mixins (a mixin's own `mixin` attribute) ahead of the mixin that names
//! them, then appends state variants `<id>-<state>` for each active state.
//! Later entries override earlier ones when component data is composed.

use crate::component::parse_attr_value_for_cache;
use crate::document::{NodeId, NodeKind};
use crate::registry::split_attr_name;
use crate::scene::Scene;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashSet;
use trellis_core::PropValue;

/// Cached state of a connected mixin node
#[derive(Clone, Debug, Default)]
pub struct MixinState {
    pub(crate) id: String,
    /// Component attribute name → value parsed for the cache
    pub(crate) cache: IndexMap<String, PropValue>,
}

impl MixinState {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cached(&self, attr_name: &str) -> Option<&PropValue> {
        self.cache.get(attr_name)
    }
}

/// Output of one resolution pass
#[derive(Default)]
struct Composition {
    /// Resolved mixins, lowest priority first
    applied: Vec<(String, NodeId)>,
    /// Every base id visited, resolved or not, for reflection
    names: Vec<String>,
    /// Every id looked up, including state variants
    probed: Vec<String>,
    visited: FxHashSet<String>,
}

fn split_ids(value: &str) -> Vec<String> {
    let mut ids: IndexSet<&str> = IndexSet::new();
    for id in value.split_whitespace() {
        ids.insert(id);
    }
    ids.into_iter().map(str::to_string).collect()
}

impl Scene {
    /// Parse one mixin attribute for the cache; `None` for non-component names
    fn cache_attribute(&self, name: &str, value: &str) -> Option<PropValue> {
        if name == "id" || name == "mixin" {
            return None;
        }
        let def = self.registry.component(split_attr_name(name).0)?;
        Some(parse_attr_value_for_cache(&def.schema, &PropValue::from(value)))
    }

    /// Connected mixin node with the given id
    pub(crate) fn find_mixin(&self, id: &str) -> Option<NodeId> {
        self.doc
            .element_by_id(id)
            .filter(|node| self.mixins.contains_key(*node))
    }

    pub(crate) fn attach_mixin(&mut self, node: NodeId) {
        let id = self.doc.attribute(node, "id").unwrap_or_default().to_string();
        let mut cache = IndexMap::new();
        if let Some(attributes) = self.doc.attributes(node) {
            for (name, value) in attributes {
                if let Some(parsed) = self.cache_attribute(name, value) {
                    cache.insert(name.clone(), parsed);
                }
            }
        }
        tracing::debug!("Mixin `{}` attached", id);
        self.mixins.insert(node, MixinState { id: id.clone(), cache });
        self.reresolve_users(&id);
    }

    pub(crate) fn detach_mixin(&mut self, node: NodeId) {
        let Some(state) = self.mixins.remove(node) else {
            return;
        };
        tracing::debug!("Mixin `{}` detached", state.id);
        self.reresolve_users(&state.id);
    }

    /// Re-run resolution on every entity that looked up `id`
    fn reresolve_users(&mut self, id: &str) {
        let users: Vec<NodeId> = self
            .mixin_users
            .get(id)
            .map(|u| u.iter().copied().collect())
            .unwrap_or_default();
        for entity in users {
            self.reresolve_mixins(entity);
        }
    }

    /// Resolve again from the entity's current base ids and states
    pub(crate) fn reresolve_mixins(&mut self, entity: NodeId) {
        let Some(base) = self.entities.get(entity).map(|e| e.base_ids.join(" ")) else {
            return;
        };
        self.update_mixins(entity, &base);
    }

    fn compose_mixin(&self, id: &str, depth: usize, out: &mut Composition) {
        out.probed.push(id.to_string());
        if !out.visited.insert(id.to_string()) {
            return;
        }
        if depth > self.config.max_mixin_depth {
            tracing::warn!(
                "Mixin `{}` nested deeper than {}; ignoring it",
                id,
                self.config.max_mixin_depth
            );
            return;
        }
        let Some(node) = self.find_mixin(id) else {
            if depth == 0 {
                out.names.push(id.to_string());
            }
            return;
        };
        let nested = self
            .doc
            .attribute(node, "mixin")
            .map(split_ids)
            .unwrap_or_default();
        for nested_id in &nested {
            self.compose_mixin(nested_id, depth + 1, out);
        }
        out.names.push(id.to_string());
        out.applied.push((id.to_string(), node));
    }

    fn compose_variants(&self, states: &IndexSet<String>, out: &mut Composition) {
        let bases = out.names.clone();
        for state in states {
            for base in &bases {
                let variant = format!("{}-{}", base, state);
                let names_before = out.names.len();
                self.compose_mixin(&variant, 0, out);
                // Variants are not reflected onto the `mixin` attribute
                out.names.truncate(names_before);
            }
        }
    }

    /// Resolve an entity's mixin list and refresh affected components
    pub(crate) fn update_mixins(&mut self, entity: NodeId, value: &str) {
        let Some(states) = self.entities.get(entity).map(|e| e.states.clone()) else {
            return;
        };
        let base = split_ids(value);
        let mut composition = Composition::default();
        for id in &base {
            self.compose_mixin(id, 0, &mut composition);
        }
        self.compose_variants(&states, &mut composition);
        let Composition {
            applied,
            names,
            probed,
            ..
        } = composition;

        let Some(state) = self.entities.get_mut(entity) else {
            return;
        };
        let old_applied = std::mem::replace(&mut state.applied, applied);
        let old_probed = std::mem::replace(&mut state.probed, probed.clone());
        state.base_ids = base;
        let has_loaded = state.has_loaded;
        let unchanged = old_applied
            .iter()
            .map(|(_, n)| *n)
            .eq(state.applied.iter().map(|(_, n)| *n));

        for id in old_probed {
            if let Some(users) = self.mixin_users.get_mut(&id) {
                users.shift_remove(&entity);
                if users.is_empty() {
                    self.mixin_users.remove(&id);
                }
            }
        }
        for id in probed {
            self.mixin_users.entry(id).or_default().insert(entity);
        }

        let reflected = names.join(" ");
        if reflected.is_empty() {
            self.doc.remove_attribute_silent(entity, "mixin");
        } else {
            self.doc.set_attribute_silent(entity, "mixin", &reflected);
        }

        if !has_loaded || unchanged {
            return;
        }
        let new_applied = self
            .entities
            .get(entity)
            .map(|e| e.applied.clone())
            .unwrap_or_default();
        let mut keys: IndexSet<String> = IndexSet::new();
        for (_, node) in old_applied.iter().chain(new_applied.iter()) {
            if let Some(mixin) = self.mixins.get(*node) {
                keys.extend(mixin.cache.keys().cloned());
            }
        }
        for key in self.defaults_first(keys) {
            self.refresh_component(entity, &key);
        }
    }

    /// Whether any applied mixin defines `attr_name`
    pub(crate) fn mixin_defines(&self, entity: NodeId, attr_name: &str) -> bool {
        self.entities
            .get(entity)
            .map(|e| {
                e.applied.iter().any(|(_, node)| {
                    self.mixins
                        .get(*node)
                        .map(|m| m.cache.contains_key(attr_name))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// Recompute one component after its mixin inputs changed
    ///
    /// A component that only existed because of a mixin is torn down when
    /// no mixin defines it any more; a newly mixed-in one is created.
    pub(crate) fn refresh_component(&mut self, entity: NodeId, attr_name: &str) {
        if self.registry.component_for_attr(attr_name).is_none() {
            return;
        }
        let Some(state) = self.entities.get(entity) else {
            return;
        };
        match state.components.get(attr_name) {
            Some(instance) => {
                let orphaned = !instance.own
                    && !self.mixin_defines(entity, attr_name)
                    && !self.config.is_default_component(attr_name);
                if orphaned {
                    self.teardown_component(entity, attr_name, true);
                } else if let Err(e) = self.recompute(entity, attr_name) {
                    tracing::warn!("Failed to refresh `{}`: {}", attr_name, e);
                }
            }
            None => {
                if self.mixin_defines(entity, attr_name) {
                    if let Err(e) = self.init_component(entity, attr_name, None) {
                        tracing::warn!("Failed to initialize mixed-in `{}`: {}", attr_name, e);
                    }
                }
            }
        }
    }

    /// A mixin node's attribute changed
    ///
    /// Only the changed component is recomputed on referencing entities.
    pub(crate) fn mixin_attribute_changed(&mut self, node: NodeId, name: &str, value: Option<&str>) {
        if self.doc.kind(node) != Some(NodeKind::Mixin) {
            return;
        }
        let Some(old_id) = self.mixins.get(node).map(|m| m.id.clone()) else {
            return;
        };
        match name {
            "id" => {
                let new_id = value.unwrap_or_default().to_string();
                if let Some(state) = self.mixins.get_mut(node) {
                    state.id = new_id.clone();
                }
                self.reresolve_users(&old_id);
                self.reresolve_users(&new_id);
            }
            "mixin" => self.reresolve_users(&old_id),
            _ => {
                let parsed = value.and_then(|v| self.cache_attribute(name, v));
                if parsed.is_none() && self.registry.component_for_attr(name).is_none() {
                    return;
                }
                if let Some(state) = self.mixins.get_mut(node) {
                    match parsed {
                        Some(parsed) => {
                            state.cache.insert(name.to_string(), parsed);
                        }
                        None => {
                            state.cache.shift_remove(name);
                        }
                    }
                }
                let users: Vec<NodeId> = self
                    .mixin_users
                    .get(&old_id)
                    .map(|u| u.iter().copied().collect())
                    .unwrap_or_default();
                for entity in users {
                    let uses_node = self
                        .entities
                        .get(entity)
                        .map(|e| e.has_loaded && e.applied.iter().any(|(_, n)| *n == node))
                        .unwrap_or(false);
                    if uses_node {
                        self.refresh_component(entity, name);
                    }
                }
            }
        }
    }

    /// Ids of the mixins applied to an entity, lowest priority first
    pub fn mixin_ids(&self, entity: NodeId) -> Vec<&str> {
        self.entities
            .get(entity)
            .map(|e| e.applied.iter().map(|(id, _)| id.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn mixin(&self, node: NodeId) -> Option<&MixinState> {
        self.mixins.get(node)
    }
}
