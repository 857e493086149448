//! Plugin manifest (`plugin.toml`).
//!
//! The bundled `ribosome` binary hosts plugins whose state is plain JSON.
//! Such a plugin is described entirely by its manifest:
//!
//! ```toml
//! name = "notes"
//! prefix = "nt"
//! api_version = "0.1.0"
//! components = []
//!
//! [data]
//! entries = []
//! ```

use std::path::Path;

use ribosome_core::{BasicConfig, PluginConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{HostError, HostResult};

/// Manifest API version for compatibility checking.
pub const API_VERSION: &str = "0.1.0";

/// A plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin name, used for editor variables and the autocmd group
    pub name: String,

    /// Short prefix for trigger names
    pub prefix: String,

    /// Required API version
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Plugin description
    #[serde(default)]
    pub description: Option<String>,

    /// Components that are always active
    #[serde(default)]
    pub core_components: Vec<String>,

    /// Components active unless `g:<name>_components` says otherwise
    #[serde(default)]
    pub components: Vec<String>,

    /// Initial plugin data
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl PluginManifest {
    /// Loads and validates a manifest file.
    pub fn load(path: impl AsRef<Path>) -> HostResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parses and validates manifest text.
    pub fn parse(content: &str) -> HostResult<Self> {
        let manifest: PluginManifest =
            toml::from_str(content).map_err(|e| HostError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> HostResult<()> {
        if self.name.trim().is_empty() {
            return Err(HostError::InvalidManifest("`name` must not be empty".to_string()));
        }
        if self.prefix.trim().is_empty() {
            return Err(HostError::InvalidManifest("`prefix` must not be empty".to_string()));
        }
        if !Self::is_compatible(&self.api_version) {
            return Err(HostError::IncompatibleVersion {
                expected: API_VERSION.to_string(),
                got: self.api_version.clone(),
            });
        }
        Ok(())
    }

    /// Checks if an API version is compatible.
    fn is_compatible(version: &str) -> bool {
        let current_major = API_VERSION.split('.').next().unwrap_or("0");
        let plugin_major = version.split('.').next().unwrap_or("0");
        current_major == plugin_major
    }

    /// The plugin identity described by this manifest.
    pub fn basic(&self) -> BasicConfig {
        let mut basic = BasicConfig::new(self.name.clone(), self.prefix.clone());
        basic.core_components = self.core_components.clone();
        basic.default_components = self.components.clone();
        basic
    }

    /// A plugin config carrying this manifest's identity.
    ///
    /// Component names are resolved when the config is built, so a
    /// manifest naming a component the host does not provide fails then.
    pub fn plugin_config(&self) -> PluginConfig<Value> {
        let config = PluginConfig::new(self.name.clone(), self.prefix.clone());
        let config = self
            .core_components
            .iter()
            .fold(config, |config, name| config.core(name.clone()));
        self.components
            .iter()
            .fold(config, |config, name| config.default_component(name.clone()))
    }
}
