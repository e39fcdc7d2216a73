use super::health::{assess_node, NodeHealth};
use super::store::RequestStore;
use crate::crds::{FencingOperation, FencingRequest, FencingRequestSpec, TARGET_LABEL};
use crate::fencing::{retry_with_backoff, Backoff, ResourceNaming};
use crate::tasks::config::{HealthConfig, RecoveryPolicy};
use crate::tasks::types::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const ORIGIN: &str = "node-health-monitor";

/// What the monitor did in response to one signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorAction {
    /// A new request with this name was created
    Created(String),
    /// An incomplete request already exists for the node
    AlreadyPending,
    /// This many outstanding requests were deleted
    Cancelled(usize),
    /// The node is suspect; re-check after this long
    Suspect(Duration),
    None,
}

/// Turns node health signals into request creation and cancellation.
///
/// Recovery is handled once per transition to healthy: a node stays
/// "settled" until it is next seen unhealthy, so steady healthy nodes cost
/// no API calls on sweeps or status-only updates.
pub struct NodeMonitor<S: RequestStore> {
    store: S,
    health: HealthConfig,
    backoff: Backoff,
    namespace: String,
    settled: Mutex<HashSet<String>>,
}

impl<S: RequestStore> NodeMonitor<S> {
    pub fn new(store: S, health: HealthConfig, backoff: Backoff, namespace: &str) -> Self {
        Self {
            store,
            health,
            backoff,
            namespace: namespace.to_string(),
            settled: Mutex::new(HashSet::new()),
        }
    }

    /// React to the current state of a node
    pub async fn observe_node(&self, node: &Node, now: DateTime<Utc>) -> Result<MonitorAction> {
        let name = node.name_any();
        let health = assess_node(node, now, self.health.unhealthy_window());
        if !matches!(health, NodeHealth::Healthy { .. }) {
            self.unsettle(&name);
        }
        match health {
            NodeHealth::Failed { since } => {
                let origin = format!("{ORIGIN}: Ready=Unknown since {}", since.to_rfc3339());
                self.raise(&name, origin, now).await
            }
            NodeHealth::Suspect { remaining } => {
                debug!(node = %name, remaining_secs = remaining.as_secs(), "Node heartbeat missing");
                Ok(MonitorAction::Suspect(remaining))
            }
            NodeHealth::Healthy { since } => self.recovered(&name, since, now).await,
            NodeHealth::NotReady | NodeHealth::Unknown => Ok(MonitorAction::None),
        }
    }

    /// The node object is gone; its requests are moot
    pub async fn node_deleted(&self, name: &str) -> Result<MonitorAction> {
        self.unsettle(name);
        if self.health.recovery == RecoveryPolicy::Disabled {
            return Ok(MonitorAction::None);
        }
        self.cancel_outstanding(name, "node deleted").await
    }

    /// React to a warning event about a node. `node` is the current object
    /// from the cache, if known.
    pub async fn problem_event(
        &self,
        event: &Event,
        node: Option<&Node>,
        now: DateTime<Utc>,
    ) -> Result<MonitorAction> {
        if event.type_.as_deref() != Some("Warning") {
            return Ok(MonitorAction::None);
        }
        let source = event
            .source
            .as_ref()
            .and_then(|s| s.component.clone())
            .or_else(|| event.reporting_component.clone())
            .unwrap_or_default();
        if !self.health.problem_sources.iter().any(|s| *s == source) {
            return Ok(MonitorAction::None);
        }

        let Some(name) = event
            .source
            .as_ref()
            .and_then(|s| s.host.clone())
            .or_else(|| event.involved_object.name.clone())
        else {
            return Ok(MonitorAction::None);
        };

        info!(
            node = %name,
            source = %source,
            reason = ?event.reason,
            "Node problem reported"
        );

        if self.health.fence_on_problem_events {
            let origin = format!(
                "{source}: {}",
                event.message.as_deref().unwrap_or("problem reported")
            );
            return self.raise(&name, origin, now).await;
        }

        match node {
            Some(node) => self.observe_node(node, now).await,
            None => Ok(MonitorAction::None),
        }
    }

    async fn outstanding(&self, node: &str) -> Result<Vec<FencingRequest>> {
        Ok(self
            .store
            .requests_for_target(node)
            .await?
            .into_iter()
            .filter(|r| r.spec.target == node && !r.is_complete())
            .collect())
    }

    /// Create exactly one request for a failed node
    async fn raise(&self, node: &str, origin: String, now: DateTime<Utc>) -> Result<MonitorAction> {
        if !self.outstanding(node).await?.is_empty() {
            debug!(node = %node, "Fencing request already pending");
            return Ok(MonitorAction::AlreadyPending);
        }

        let workloads = match self.store.durable_workloads(node).await {
            Ok(workloads) => workloads,
            Err(e) => {
                warn!(node = %node, error = %e, "Could not list workloads on node");
                Vec::new()
            }
        };
        if workloads.is_empty() {
            warn!(node = %node, "Node is lost");
        } else {
            warn!(
                node = %node,
                workloads = workloads.len(),
                "Node is lost with attached persistent volumes"
            );
        }

        let request = self.new_request(node, origin, workloads, now);
        let name = request.name_any();
        let created = retry_with_backoff(&self.backoff, "create_request", || async {
            match self.store.create_request(&request).await {
                Ok(()) => Ok(true),
                Err(e) if e.is_already_exists() => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await?;

        if created {
            info!(node = %node, request = %name, "Created fencing request");
            Ok(MonitorAction::Created(name))
        } else {
            Ok(MonitorAction::AlreadyPending)
        }
    }

    async fn recovered(
        &self,
        node: &str,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<MonitorAction> {
        if self.is_settled(node) {
            return Ok(MonitorAction::None);
        }
        let action = match self.health.recovery {
            RecoveryPolicy::Disabled => MonitorAction::None,
            RecoveryPolicy::Immediate => self.cancel_outstanding(node, "node recovered").await?,
            RecoveryPolicy::AfterStable { stable_seconds } => {
                let stable_for = since
                    .map(|s| (now - s).to_std().unwrap_or_default())
                    .unwrap_or_default();
                if stable_for < Duration::from_secs(stable_seconds) {
                    return Ok(MonitorAction::None);
                }
                self.cancel_outstanding(node, "node recovered and stable").await?
            }
        };
        // a failed listing leaves the node unsettled so the next sweep retries
        self.settle(node);
        Ok(action)
    }

    fn is_settled(&self, node: &str) -> bool {
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node)
    }

    fn settle(&self, node: &str) {
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.to_string());
    }

    fn unsettle(&self, node: &str) {
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node);
    }

    /// Best-effort deletion of every incomplete request for `node`
    async fn cancel_outstanding(&self, node: &str, reason: &str) -> Result<MonitorAction> {
        let outstanding = self.outstanding(node).await?;
        if outstanding.is_empty() {
            return Ok(MonitorAction::None);
        }

        let mut cancelled = 0;
        for request in &outstanding {
            let name = request.name_any();
            let deleted = retry_with_backoff(&self.backoff, "delete_request", || {
                self.store.delete_request(&name)
            })
            .await;
            match deleted {
                Ok(()) => {
                    info!(node = %node, request = %name, reason = %reason, "Cancelled fencing request");
                    cancelled += 1;
                }
                Err(e) => {
                    warn!(node = %node, request = %name, error = %e, "Failed to cancel fencing request");
                }
            }
        }
        Ok(MonitorAction::Cancelled(cancelled))
    }

    fn new_request(
        &self,
        node: &str,
        origin: String,
        workloads: Vec<String>,
        now: DateTime<Utc>,
    ) -> FencingRequest {
        let mut labels = BTreeMap::new();
        labels.insert(TARGET_LABEL.to_string(), ResourceNaming::label_value(node));

        FencingRequest {
            metadata: ObjectMeta {
                name: Some(ResourceNaming::request_name(node, now.timestamp())),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: FencingRequestSpec {
                target: node.to_string(),
                origin: Some(origin),
                operation: FencingOperation::Off,
                not_before: None,
                affected_workloads: workloads,
            },
            status: None,
        }
    }
}
