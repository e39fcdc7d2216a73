use crate::crds::FencingRequest;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config;
use kube::Api;
use std::sync::Arc;
use tracing::{error, info, instrument, Instrument};

pub mod config;
pub mod configmaps;
pub mod leader;
pub mod node;
pub mod request;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use request::{error_policy, reconcile_fencing_request};
pub use types::{Context, Error, Result};

use configmaps::ConfigWatcher;

/// Main entry point once leadership is held: configuration watcher, request
/// controller and node monitor, all in the context's namespace.
#[instrument(skip(ctx), fields(namespace = %ctx.namespace))]
pub async fn run_fencing_controller(ctx: Arc<Context>) -> Result<()> {
    info!("Starting fencing controllers");

    let watcher = ConfigWatcher::new(
        ctx.client.clone(),
        &ctx.namespace,
        ctx.registry.clone(),
        &ctx.config.fencing.config_label_selector,
        &ctx.config.fencing.config_key,
    );
    // requests must not be judged against an empty registry
    watcher.load().await?;

    let config_handle = tokio::spawn(watcher.run());
    let request_handle = tokio::spawn(run_request_controller(ctx.clone()));
    let node_handle = tokio::spawn(node::run_node_monitor(ctx.clone()));

    // none of these is expected to finish
    let outcome = tokio::select! {
        res = config_handle => res.map(|()| Ok(())),
        res = request_handle => res,
        res = node_handle => res,
    };
    match outcome {
        Ok(Ok(())) => info!("Fencing controller task finished"),
        Ok(Err(e)) => {
            error!(error = %e, "Fencing controller task failed");
            return Err(e);
        }
        Err(e) => error!(error = ?e, "Controller task join error"),
    }

    info!("Fencing controllers shutting down");
    Ok(())
}

/// Run the FencingRequest controller
#[instrument(skip(ctx), fields(namespace = %ctx.namespace))]
async fn run_request_controller(ctx: Arc<Context>) -> Result<()> {
    info!("Starting FencingRequest controller");

    let requests: Api<FencingRequest> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let watcher_config = Config::default().any_semantic();

    Controller::new(requests, watcher_config.clone())
        .owns(jobs, watcher_config)
        .run(reconcile_fencing_request, error_policy, ctx)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("fencing_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(request) => {
                        info!(resource = ?request, "FencingRequest reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(
                            error = ?reconciliation_err,
                            "FencingRequest reconciliation error"
                        );
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("FencingRequest controller shutting down");
    Ok(())
}
