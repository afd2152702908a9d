//! Scene configuration
//!
//! Hosts usually keep these settings in a `trellis.toml`:
//!
//! ```toml
//! asset_timeout_ms = 5000
//! asset_failure = "fail_fast"
//! default_components = ["position", "rotation", "scale", "visible"]
//! max_mixin_depth = 8
//! log_filter = "trellis_scene=debug"
//! ```

use crate::error::{Result, SceneError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// =============================================================================
// Asset loading policy
// =============================================================================

/// What a failed asset item does to its container
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetFailurePolicy {
    /// A failed item settles like a loaded one; the container keeps waiting on the rest
    #[default]
    BestEffort,
    /// The first failed item settles the whole container with an `error` event
    FailFast,
}

// =============================================================================
// SceneConfig
// =============================================================================

/// Runtime settings for a scene
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SceneConfig {
    /// How long an asset container may block loading; `None` waits forever
    #[serde(default = "default_asset_timeout")]
    pub asset_timeout_ms: Option<f64>,
    #[serde(default)]
    pub asset_failure: AssetFailurePolicy,
    /// Components every entity applies even without a markup attribute
    #[serde(default = "default_components")]
    pub default_components: Vec<String>,
    /// Nesting limit for mixins that reference other mixins
    #[serde(default = "default_max_mixin_depth")]
    pub max_mixin_depth: usize,
    /// Filter directive for [`crate::logging::init_tracing`]
    #[serde(default)]
    pub log_filter: Option<String>,
}

fn default_asset_timeout() -> Option<f64> {
    Some(3000.0)
}

fn default_components() -> Vec<String> {
    ["position", "rotation", "scale", "visible"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_mixin_depth() -> usize {
    16
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            asset_timeout_ms: default_asset_timeout(),
            asset_failure: AssetFailurePolicy::default(),
            default_components: default_components(),
            max_mixin_depth: default_max_mixin_depth(),
            log_filter: None,
        }
    }
}

impl SceneConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SceneError::Config(e.to_string()))
    }

    /// Parse a JSON document
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| SceneError::Config(e.to_string()))
    }

    /// Load a config file; `.json` files are read as JSON, anything else as TOML
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SceneError::Config(e.to_string()))
    }

    pub fn is_default_component(&self, attr_name: &str) -> bool {
        self.default_components.iter().any(|c| c == attr_name)
    }
}
