//! In-memory registry of parsed fencing configurations, keyed by source name.

use super::config::FencingConfig;
use super::error::EngineResult;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Synchronized map from configuration name to parsed configuration.
///
/// Owned by the controller context and shared through `Arc`. Values are
/// immutable `Arc<FencingConfig>` so a reader holding a snapshot never sees a
/// partially replaced entry.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    entries: RwLock<IndexMap<String, Arc<FencingConfig>>>,
}

/// Point-in-time, insertion-ordered view of the registry
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    configs: Vec<Arc<FencingConfig>>,
}

impl ConfigSnapshot {
    pub fn get(&self, name: &str) -> Option<&Arc<FencingConfig>> {
        self.configs.iter().find(|config| config.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FencingConfig>> {
        self.configs.iter()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

impl FromIterator<FencingConfig> for ConfigSnapshot {
    fn from_iter<I: IntoIterator<Item = FencingConfig>>(iter: I) -> Self {
        Self {
            configs: iter.into_iter().map(Arc::new).collect(),
        }
    }
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `raw` and store it under `name`.
    ///
    /// On error the previous entry (if any) is left untouched.
    pub fn upsert(&self, name: &str, raw: &str) -> EngineResult<()> {
        match FencingConfig::from_yaml(name, raw) {
            Ok(config) => {
                debug!(
                    config = %name,
                    methods = config.methods.len(),
                    "Registered fencing configuration"
                );
                self.insert(config);
                Ok(())
            }
            Err(e) => {
                warn!(config = %name, error = %e, "Rejected fencing configuration, keeping previous entry");
                Err(e)
            }
        }
    }

    /// Store an already parsed configuration, replacing in place.
    pub fn insert(&self, config: FencingConfig) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(config.name.clone(), Arc::new(config));
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.shift_remove(name).is_some();
        if removed {
            debug!(config = %name, "Removed fencing configuration");
        }
        removed
    }

    /// Drop every entry whose source is not in `names`.
    pub fn resync<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let keep: HashSet<&str> = names.into_iter().collect();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|name, _| {
            let retained = keep.contains(name.as_str());
            if !retained {
                debug!(config = %name, "Dropping fencing configuration whose source vanished");
            }
            retained
        });
    }

    pub fn get(&self, name: &str) -> Option<Arc<FencingConfig>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).cloned()
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        ConfigSnapshot {
            configs: entries.values().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
