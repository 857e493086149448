//! Plugin settings read from editor variables.
//!
//! Settings live in the editor as `g:<plugin>_<name>`. A missing variable
//! falls back to the setting's default; a variable of the wrong type is an
//! error.

use ribosome_nvim::{NvimErrorKind, NvimIO};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A typed editor variable with a default.
#[derive(Debug, Clone)]
pub struct Setting<T> {
    name: &'static str,
    default: T,
}

impl<T> Setting<T>
where
    T: DeserializeOwned + Clone + Send + 'static,
{
    pub const fn new(name: &'static str, default: T) -> Self {
        Self { name, default }
    }

    /// The variable name for `plugin`.
    pub fn var_name(&self, plugin: &str) -> String {
        format!("{}_{}", plugin, self.name)
    }

    /// Reads the setting, using the default if the variable is unset.
    pub fn value(&self, plugin: &str) -> NvimIO<T> {
        let default = self.default.clone();
        NvimIO::get_var(&self.var_name(plugin)).recover_failure(move |result| match result {
            Ok(value) => NvimIO::pure(value),
            Err(e) if matches!(e.kind(), NvimErrorKind::Request { .. }) => NvimIO::pure(default),
            Err(e) => NvimIO::failed(e),
        })
    }
}

/// Overrides the default component list.
pub const COMPONENTS: Setting<Option<Vec<String>>> = Setting::new("components", None);

/// Enables the config's init program.
pub const INTERNAL_INIT: Setting<bool> = Setting::new("internal_init", false);

/// Settings loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSettings {
    pub components: Option<Vec<String>>,
    pub internal_init: bool,
}

impl PluginSettings {
    /// Reads every setting for `plugin`.
    pub fn load(plugin: &str) -> NvimIO<Self> {
        let plugin = plugin.to_string();
        COMPONENTS.value(&plugin).flat_map(move |components| {
            INTERNAL_INIT
                .value(&plugin)
                .map(move |internal_init| PluginSettings {
                    components,
                    internal_init,
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ribosome_nvim::Nvim;
    use ribosome_nvim::testing::RecordingApi;
    use serde_json::json;

    #[test]
    fn test_defaults_when_unset() {
        let settings = PluginSettings::load("myo").run(&Nvim::new(RecordingApi::new())).unwrap();
        assert_eq!(settings, PluginSettings::default());
    }

    #[test]
    fn test_reads_variables() {
        let api = RecordingApi::new()
            .with_var("myo_components", json!(["core", "extra"]))
            .with_var("myo_internal_init", json!(true));
        let settings = PluginSettings::load("myo").run(&Nvim::new(api)).unwrap();
        assert_eq!(settings.components, Some(vec!["core".to_string(), "extra".to_string()]));
        assert!(settings.internal_init);
    }

    #[test]
    fn test_wrong_type_is_an_error() {
        let api = RecordingApi::new().with_var("myo_internal_init", json!("yes"));
        assert!(PluginSettings::load("myo").run(&Nvim::new(api)).is_err());
    }
}
