//! Scene-scoped systems
//!
//! One instance per registered system, created in name order when the scene
//! is built and before any entity attaches. A scene attribute with a
//! system's name updates that system's data and never constructs a
//! component.

use crate::component::{
    merge_attr_value, parse_attr_value_for_cache, Behavior, DeferredAction, HookContext,
    HookOwner,
};
use crate::error::{HookResult, Result};
use crate::registry::SystemDefinition;
use crate::renderer::ObjectHandle;
use crate::scene::Scene;
use std::sync::Arc;
use trellis_core::PropValue;

pub struct SystemInstance {
    pub(crate) name: String,
    pub(crate) data: PropValue,
    pub(crate) attr_value: PropValue,
    pub(crate) behavior: Option<Box<dyn Behavior>>,
    pub(crate) def: Arc<SystemDefinition>,
    pub(crate) playing: bool,
}

impl SystemInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &PropValue {
        &self.data
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn behavior<T: 'static>(&self) -> Option<&T> {
        self.behavior.as_deref()?.as_any().downcast_ref::<T>()
    }
}

impl std::fmt::Debug for SystemInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemInstance")
            .field("name", &self.name)
            .field("data", &self.data)
            .field("playing", &self.playing)
            .finish()
    }
}

impl Scene {
    pub(crate) fn with_system_behavior<F>(&mut self, name: &str, hook: F) -> Option<HookResult>
    where
        F: FnOnce(&mut dyn Behavior, &mut HookContext<'_>) -> HookResult,
    {
        let mut behavior = self.systems.get_mut(name)?.behavior.take()?;
        let owner = HookOwner::System(name.to_string());
        self.running.push(owner.clone());
        let result = {
            let mut ctx = HookContext { scene: self, owner };
            hook(behavior.as_mut(), &mut ctx)
        };
        self.running.pop();
        if let Some(system) = self.systems.get_mut(name) {
            system.behavior = Some(behavior);
        }
        self.apply_deferred();
        Some(result)
    }

    fn run_system_hook<F>(&mut self, name: &str, hook_name: &str, hook: F)
    where
        F: FnOnce(&mut dyn Behavior, &mut HookContext<'_>) -> HookResult,
    {
        if let Some(Err(e)) = self.with_system_behavior(name, hook) {
            tracing::warn!("System `{}` {} failed: {}", name, hook_name, e);
        }
    }

    /// Create and init every registered system, in name order
    pub(crate) fn init_systems(&mut self) {
        let defs: Vec<Arc<SystemDefinition>> = self.registry.systems().cloned().collect();
        for def in defs {
            let raw = self
                .doc
                .attribute(self.root, &def.name)
                .map(PropValue::from)
                .unwrap_or_default();
            let attr_value = parse_attr_value_for_cache(&def.schema, &raw);
            let data = match def.schema.parse_value(&attr_value, &self.doc) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("System `{}` data invalid, using defaults: {}", def.name, e);
                    def.schema.default_data()
                }
            };
            let name = def.name.clone();
            self.systems.insert(
                name.clone(),
                SystemInstance {
                    name: name.clone(),
                    data,
                    attr_value,
                    behavior: Some(def.create_behavior()),
                    def,
                    playing: false,
                },
            );
            self.run_system_hook(&name, "init", |b, ctx| b.init(ctx));
            tracing::debug!("Initialized system `{}`", name);
        }
    }

    /// Route a scene attribute to its system
    pub(crate) fn update_system(&mut self, name: &str, value: PropValue, clobber: bool) -> Result<()> {
        let target = HookOwner::System(name.to_string());
        if self.running.contains(&target) {
            self.defer(target, DeferredAction::Update { value, clobber });
            return Ok(());
        }
        let Some(system) = self.systems.get_mut(name) else {
            return Ok(());
        };
        let def = system.def.clone();
        let attr_value = merge_attr_value(&def.schema, &system.attr_value, &value, clobber);
        let data = def.schema.parse_value(&attr_value, &self.doc)?;

        let Some(system) = self.systems.get_mut(name) else {
            return Ok(());
        };
        system.attr_value = attr_value;
        if system.data == data {
            return Ok(());
        }
        let old = std::mem::replace(&mut system.data, data);
        self.run_system_hook(name, "update", |b, ctx| b.update(ctx, &old));
        Ok(())
    }

    pub(crate) fn play_systems(&mut self) {
        let names: Vec<String> = self.systems.keys().cloned().collect();
        for name in names {
            let Some(system) = self.systems.get_mut(&name) else {
                continue;
            };
            if system.playing {
                continue;
            }
            system.playing = true;
            self.run_system_hook(&name, "play", |b, ctx| b.play(ctx));
        }
    }

    pub(crate) fn pause_systems(&mut self) {
        let names: Vec<String> = self.systems.keys().cloned().collect();
        for name in names {
            let Some(system) = self.systems.get_mut(&name) else {
                continue;
            };
            if !system.playing {
                continue;
            }
            system.playing = false;
            self.run_system_hook(&name, "pause", |b, ctx| b.pause(ctx));
        }
    }

    fn systems_with(&self, wants: fn(&dyn Behavior) -> bool) -> Vec<String> {
        self.systems
            .values()
            .filter(|s| s.behavior.as_deref().map(|b| wants(b)).unwrap_or(false))
            .map(|s| s.name.clone())
            .collect()
    }

    pub(crate) fn tick_systems(&mut self, time: f64, delta: f64) {
        for name in self.systems_with(|b| b.has_tick()) {
            self.run_system_hook(&name, "tick", |b, ctx| b.tick(ctx, time, delta));
        }
    }

    pub(crate) fn tock_systems(&mut self, time: f64, delta: f64, camera: Option<ObjectHandle>) {
        for name in self.systems_with(|b| b.has_tock()) {
            self.run_system_hook(&name, "tock", |b, ctx| b.tock(ctx, time, delta, camera));
        }
    }
}
