//! # Trellis Scene
//!
//! A declarative entity-component scene runtime. A markup [`Document`] of
//! tagged nodes is bound to a retained renderer object graph:
//!
//! - **Entities**: `t-entity` nodes whose attributes name components
//! - **Components**: registered schemas plus [`Behavior`] hooks, one
//!   instance per entity (or several, keyed `name__id`)
//! - **Mixins**: `t-mixin` nodes bundling component values, composed in
//!   order and switched by entity states
//! - **Systems**: scene-scoped singletons configured from scene attributes
//! - **Render loop**: [`Scene::render_frame`] ticks every playing behavior
//!   and asks the [`Renderer`] to draw
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use trellis_scene::prelude::*;
//!
//! let mut registry = Registry::with_builtins();
//! registry
//!     .register_component(
//!         "light",
//!         ComponentSpec::new(SchemaDecl::multi([
//!             ("intensity", PropertyDecl::new().with_default(1.0)),
//!             ("color", PropertyDecl::typed("color")),
//!         ])),
//!     )
//!     .unwrap();
//!
//! let mut scene = SceneBuilder::new(Arc::new(registry)).build();
//! let lamp = scene.create_element("t-entity");
//! scene.set_attribute(lamp, "light", "intensity: 2").unwrap();
//! scene.append_child(scene.root(), lamp).unwrap();
//!
//! let data = scene.component_data(lamp, "light").unwrap();
//! assert_eq!(data.get("intensity"), Some(&PropValue::Number(2.0)));
//! ```

pub mod assets;
pub mod clock;
pub mod component;
pub mod config;
pub mod document;
pub mod entity;
pub mod error;
pub mod events;
pub mod logging;
pub mod mixin;
pub mod prelude;
pub mod registry;
pub mod renderer;
pub mod scene;
pub mod system;

pub use assets::{AssetCache, AssetOutcome, AssetStatus, Fetcher, LoadStatus, NullFetcher};
pub use clock::{AnimationDriver, FrameClock};
pub use component::{Behavior, ComponentInstance, HookContext, HookOwner};
pub use config::{AssetFailurePolicy, SceneConfig};
pub use document::{Document, MutationRecord, Node, NodeId, NodeKind, Selector};
pub use entity::EntityState;
pub use error::{HookError, HookResult, Result, SceneError};
pub use events::{names, Event, EventDetail, ListenerId, Listeners};
pub use logging::init_tracing;
pub use mixin::MixinState;
pub use registry::{
    split_attr_name, ComponentDefinition, ComponentSpec, NoopBehavior, Primitive,
    PrimitiveDefinition, PrimitiveSpec, Registry, SystemDefinition, SystemSpec,
};
pub use renderer::{AsAny, HeadlessRenderer, Object3D, ObjectHandle, RenderCommand, Renderer};
pub use scene::{Scene, SceneBuilder};
pub use system::SystemInstance;

pub use trellis_core;

#[cfg(test)]
mod tests;
