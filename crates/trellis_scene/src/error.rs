//! Error types for trellis_scene

use crate::document::NodeId;
use thiserror::Error;
use trellis_core::CoreError;

/// Errors raised by registration and the scene attribute surface
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("Component `{0}` is already registered")]
    DuplicateComponent(String),

    #[error("System `{0}` is already registered")]
    DuplicateSystem(String),

    #[error("Geometry `{0}` is already registered")]
    DuplicateGeometry(String),

    #[error("Shader `{0}` is already registered")]
    DuplicateShader(String),

    /// Component names may not contain the multi-instance delimiter
    #[error("Invalid component name `{0}`: names may not contain `__`")]
    InvalidComponentName(String),

    /// An instance id was given for a component without `multiple`
    #[error("Component `{name}` does not allow multiple instances (got id `{id}`)")]
    NotMultiple { name: String, id: String },

    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("Node {0:?} is not an entity")]
    NotAnEntity(NodeId),

    /// A tree edit that would leave the document malformed
    #[error("Invalid tree edit: {0}")]
    InvalidHierarchy(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A lifecycle hook failed where the failure has to reach the caller
    #[error("Component `{component}` failed: {message}")]
    Hook { component: String, message: String },
}

/// Result type for trellis_scene operations
pub type Result<T> = std::result::Result<T, SceneError>;

/// Error type returned by component and system hooks
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by component and system hooks
pub type HookResult = std::result::Result<(), HookError>;
