//! Prelude module for common imports
//!
//! ```rust
//! use trellis_scene::prelude::*;
//! ```

// Scene
pub use crate::scene::{Scene, SceneBuilder};
pub use crate::config::{AssetFailurePolicy, SceneConfig};
pub use crate::document::{NodeId, NodeKind};

// Registration
pub use crate::registry::{ComponentSpec, PrimitiveSpec, Registry, SystemSpec};
pub use crate::component::{Behavior, HookContext};
pub use crate::error::{HookResult, SceneError};

// Events and assets
pub use crate::assets::{AssetOutcome, AssetStatus, Fetcher};
pub use crate::events::{names, Event, EventDetail};

// Rendering
pub use crate::clock::AnimationDriver;
pub use crate::renderer::{HeadlessRenderer, Object3D, ObjectHandle, Renderer};

// Values and schemas
pub use trellis_core::schema::{PropertyDecl, SchemaDecl};
pub use trellis_core::{PropMap, PropValue, Vec2, Vec3, Vec4};
