//! Persisted registry state.
//!
//! Per-module enabled flag, load order, namespace display names and the
//! module's own key-value settings survive restarts. The core only requires
//! that a namespace display name, once persisted, is stable across reloads.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{HostError, HostResult};
use perch_plugin_api::SettingsStore;

/// Everything the registry persists between runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-module state, in load order.
    pub modules: Vec<ModuleState>,
}

/// Persisted state of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleState {
    /// Module name, the registry key.
    pub name: String,
    /// Disabled modules are skipped at startup without being forgotten.
    pub enabled: bool,
    /// Position in the load order.
    pub order: u32,
    /// Namespace display names as first registered; kept stable on reload.
    pub namespaces: Vec<String>,
    /// Module-scoped settings key-value pairs.
    pub settings: HashMap<String, String>,
}

impl Default for ModuleState {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            order: 0,
            namespaces: Vec::new(),
            settings: HashMap::new(),
        }
    }
}

impl RegistryConfig {
    /// Load persisted state from `path`, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml_edit::de::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("could not parse registry state {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("could not read registry state {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save persisted state to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> HostResult<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml_edit::ser::to_string_pretty(self)
            .map_err(|e| HostError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<&ModuleState> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Get or create the state record for `name`. New records go to the end
    /// of the load order.
    pub fn module_mut(&mut self, name: &str) -> &mut ModuleState {
        if let Some(idx) = self.modules.iter().position(|m| m.name == name) {
            return &mut self.modules[idx];
        }
        let order = self.modules.iter().map(|m| m.order + 1).max().unwrap_or(0);
        self.modules.push(ModuleState {
            name: name.to_string(),
            order,
            ..ModuleState::default()
        });
        self.modules.last_mut().expect("just pushed")
    }

    /// Drop a module's persisted state (user removal).
    pub fn remove_module(&mut self, name: &str) {
        self.modules.retain(|m| m.name != name);
    }
}

/// Module-facing view of one module's persisted settings map. The map itself
/// stays host-owned; modules only see the trait.
pub struct SettingsRef<'a>(&'a mut HashMap<String, String>);

impl<'a> SettingsRef<'a> {
    pub fn new(map: &'a mut HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl SettingsStore for SettingsRef<'_> {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.toml");

        let mut config = RegistryConfig::default();
        {
            let state = config.module_mut("remote");
            state.namespaces = vec!["remote".into(), "rsync".into()];
            state.settings.insert("anonymous".into(), "true".into());
        }
        config.module_mut("archive").enabled = false;
        config.save(&path).unwrap();

        let loaded = RegistryConfig::load(&path);
        let remote = loaded.module("remote").unwrap();
        assert_eq!(remote.namespaces, vec!["remote", "rsync"]);
        assert_eq!(remote.settings.get("anonymous").map(String::as_str), Some("true"));
        assert!(!loaded.module("archive").unwrap().enabled);
    }

    #[test]
    fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::load(&dir.path().join("nope.toml"));
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_load_order_assignment() {
        let mut config = RegistryConfig::default();
        config.module_mut("a");
        config.module_mut("b");
        config.module_mut("a");
        assert_eq!(config.modules.len(), 2);
        assert_eq!(config.module("b").unwrap().order, 1);
    }

    #[test]
    fn test_settings_ref_reads_and_writes_the_map() {
        let mut map: HashMap<String, String> = HashMap::new();
        {
            let mut store = SettingsRef::new(&mut map);
            store.set("host", "example.org");
            assert_eq!(store.get("host"), Some("example.org".into()));
            assert_eq!(store.get("missing"), None);
        }
        assert_eq!(map.get("host").map(String::as_str), Some("example.org"));
    }
}
