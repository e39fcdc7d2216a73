//! Node health monitoring: turns lost nodes into `FencingRequest`s

pub mod health;
pub mod monitor;
pub mod store;

pub use health::{assess_node, NodeHealth};
pub use monitor::{MonitorAction, NodeMonitor};
pub use store::{KubeRequestStore, RequestStore};

use crate::tasks::types::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Node};
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use std::pin::pin;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

const PROBLEM_EVENT_FIELDS: &str = "type=Warning,involvedObject.kind=Node";

/// Watch nodes and node problem events. Runs until the task is dropped.
///
/// A periodic sweep over the node cache catches nodes whose heartbeat went
/// stale without any further update to the object.
#[instrument(skip(ctx), fields(namespace = %ctx.namespace))]
pub async fn run_node_monitor(ctx: Arc<Context>) -> Result<()> {
    info!("Starting node health monitor");

    let health = ctx.config.health.clone();
    let monitor = NodeMonitor::new(
        KubeRequestStore::new(ctx.client.clone(), &ctx.namespace),
        health.clone(),
        ctx.config.retry.backoff(),
        &ctx.namespace,
    );

    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let (reader, writer) = reflector::store();
    let mut node_events = pin!(reflector::reflector(
        writer,
        watcher(nodes, watcher::Config::default().any_semantic())
    )
    .default_backoff());

    let events: Api<Event> = Api::all(ctx.client.clone());
    let mut problem_events = pin!(watcher(
        events,
        watcher::Config::default().fields(PROBLEM_EVENT_FIELDS)
    )
    .default_backoff());

    let mut sweep = tokio::time::interval(health.sweep_interval());

    loop {
        tokio::select! {
            Some(event) = node_events.next() => match event {
                Ok(watcher::Event::Apply(node) | watcher::Event::InitApply(node)) => {
                    report(&node.name_any(), monitor.observe_node(&node, Utc::now()).await);
                }
                Ok(watcher::Event::Delete(node)) => {
                    let name = node.name_any();
                    info!(node = %name, "Node deleted");
                    report(&name, monitor.node_deleted(&name).await);
                }
                Ok(watcher::Event::Init) => debug!("Node watch (re)starting"),
                Ok(watcher::Event::InitDone) => {
                    info!(nodes = reader.state().len(), "Node cache synced");
                }
                Err(e) => warn!(error = %e, "Node watch error"),
            },
            Some(event) = problem_events.next() => match event {
                // past events replayed by the initial list are not acted on
                Ok(watcher::Event::Apply(event)) => {
                    let name = event
                        .source
                        .as_ref()
                        .and_then(|s| s.host.clone())
                        .or_else(|| event.involved_object.name.clone())
                        .unwrap_or_default();
                    let node = reader.get(&ObjectRef::new(&name));
                    report(
                        &name,
                        monitor.problem_event(&event, node.as_deref(), Utc::now()).await,
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Node event watch error"),
            },
            _ = sweep.tick() => {
                let now = Utc::now();
                for node in reader.state() {
                    report(&node.name_any(), monitor.observe_node(&node, now).await);
                }
            }
        }
    }
}

fn report(node: &str, outcome: Result<MonitorAction>) {
    match outcome {
        Ok(MonitorAction::None | MonitorAction::Suspect(_) | MonitorAction::AlreadyPending) => {}
        Ok(action) => debug!(node = %node, action = ?action, "Node monitor acted"),
        Err(e) => error!(node = %node, error = %e, "Node monitor failed"),
    }
}
