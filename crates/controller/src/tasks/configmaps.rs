//! Keeps the configuration registry in step with labelled ConfigMaps

use crate::fencing::{ConfigRegistry, FencingError};
use crate::tasks::types::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ListParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::pin::pin;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Watches fencing configuration ConfigMaps in one namespace
pub struct ConfigWatcher {
    api: Api<ConfigMap>,
    registry: Arc<ConfigRegistry>,
    selector: String,
    key: String,
}

impl ConfigWatcher {
    pub fn new(
        client: Client,
        namespace: &str,
        registry: Arc<ConfigRegistry>,
        selector: &str,
        key: &str,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            registry,
            selector: selector.to_string(),
            key: key.to_string(),
        }
    }

    /// Populate the registry once, so requests are not judged against an
    /// empty registry at startup.
    pub async fn load(&self) -> Result<usize> {
        let list = self
            .api
            .list(&ListParams::default().labels(&self.selector))
            .await?;
        for cm in &list.items {
            apply_configmap(&self.registry, cm, &self.key);
        }
        self.registry
            .resync(list.items.iter().map(|cm| cm.metadata.name.as_deref().unwrap_or_default()));
        info!(
            configmaps = list.items.len(),
            configs = self.registry.len(),
            "Loaded fencing configurations"
        );
        Ok(self.registry.len())
    }

    /// Follow changes until the task is dropped
    #[instrument(skip(self), fields(selector = %self.selector))]
    pub async fn run(self) {
        let config = watcher::Config::default().labels(&self.selector);
        let mut events = pin!(watcher(self.api.clone(), config).default_backoff());
        let mut seen: Vec<String> = Vec::new();

        while let Some(event) = events.next().await {
            match event {
                Ok(watcher::Event::Init) => seen.clear(),
                Ok(watcher::Event::InitApply(cm)) => {
                    apply_configmap(&self.registry, &cm, &self.key);
                    seen.push(cm.name_any());
                }
                Ok(watcher::Event::InitDone) => {
                    self.registry.resync(seen.iter().map(String::as_str));
                    debug!(configs = self.registry.len(), "Fencing configurations resynced");
                }
                Ok(watcher::Event::Apply(cm)) => {
                    apply_configmap(&self.registry, &cm, &self.key);
                }
                Ok(watcher::Event::Delete(cm)) => {
                    let name = cm.name_any();
                    if self.registry.remove(&name) {
                        info!(config = %name, "Removed fencing configuration");
                    }
                }
                Err(e) => warn!(error = %e, "ConfigMap watch error"),
            }
        }
    }
}

/// Parse the configuration held by one ConfigMap into the registry.
///
/// Problems are logged; the registry keeps its previous entry for the name.
pub fn apply_configmap(registry: &ConfigRegistry, cm: &ConfigMap, key: &str) -> bool {
    let name = cm.name_any();
    let Some(raw) = cm.data.as_ref().and_then(|data| data.get(key)) else {
        let e = FencingError::MissingData {
            name: name.clone(),
            key: key.to_string(),
        };
        warn!(config = %name, error = %e, "Ignoring ConfigMap");
        return false;
    };
    registry.upsert(&name, raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    const RAW: &str = r"
nodeSelector:
  rack: a
methods:
  - name: ipmi
    mechanisms:
      - driver: echo
";

    fn configmap(name: &str, key: &str, raw: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), raw.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn configmap_is_registered_under_its_name() {
        let registry = ConfigRegistry::new();
        assert!(apply_configmap(&registry, &configmap("rack-a", "fencing-config", RAW), "fencing-config"));
        let config = registry.get("rack-a").unwrap();
        assert_eq!(config.methods[0].name, "ipmi");
    }

    #[test]
    fn missing_key_is_ignored() {
        let registry = ConfigRegistry::new();
        assert!(!apply_configmap(&registry, &configmap("rack-a", "other", RAW), "fencing-config"));
        assert!(registry.is_empty());
    }

    #[test]
    fn broken_update_keeps_previous_entry() {
        let registry = ConfigRegistry::new();
        apply_configmap(&registry, &configmap("rack-a", "fencing-config", RAW), "fencing-config");
        assert!(!apply_configmap(
            &registry,
            &configmap("rack-a", "fencing-config", "methods: ["),
            "fencing-config"
        ));
        assert_eq!(registry.get("rack-a").unwrap().methods.len(), 1);
    }
}
