/*
 * 5D Labs Fencing Controller - Kubernetes node fencing (STONITH)
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Fencing Controller Service
//!
//! - Elects a single active replica through a Lease
//! - Watches fencing configuration ConfigMaps, FencingRequests and Nodes
//! - Dispatches fencing Jobs and escalates between methods
//! - Serves health and readiness endpoints

use anyhow::Context as _;
use axum::{extract::State, response::Json, routing::get, Router};
use fencing_controller::fencing::ConfigRegistry;
use fencing_controller::tasks::{
    config::ControllerConfig, leader::LeaderElector, run_fencing_controller,
    types::Context as TaskContext,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Clone)]
struct AppState {
    registry: Arc<ConfigRegistry>,
    leader: Arc<AtomicBool>,
    holder: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting Fencing Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_controller_config();
    config.validate().context("invalid controller configuration")?;
    let config = Arc::new(config);

    let namespace = std::env::var("POD_NAMESPACE").context("POD_NAMESPACE must be set")?;
    let holder = std::env::var("POD_NAME").context("POD_NAME must be set")?;

    let client = kube::Client::try_default().await?;
    info!(namespace = %namespace, holder = %holder, "Connected to Kubernetes cluster");

    let registry = Arc::new(ConfigRegistry::new());
    let leader = Arc::new(AtomicBool::new(false));
    let state = AppState {
        registry: registry.clone(),
        leader: leader.clone(),
        holder: holder.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    // standbys serve health checks too
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("HTTP server listening on 0.0.0.0:8080");
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                if stop_rx.changed().await.is_err() {
                    warn!("Shutdown sender dropped, stopping HTTP server");
                }
            })
            .await
    });

    let elector = LeaderElector::new(client.clone(), &namespace, &config.leader, &holder);
    let mut lease = tokio::select! {
        lease = elector.acquire() => lease?,
        () = shutdown_signal() => {
            stop_server(&stop_tx, server).await;
            info!("Fencing controller stopped before acquiring leadership");
            return Ok(());
        }
    };
    leader.store(true, Ordering::SeqCst);

    let ctx = Arc::new(TaskContext {
        client,
        namespace,
        config,
        registry,
    });
    let mut controller = tokio::spawn(run_fencing_controller(ctx));

    let outcome = tokio::select! {
        res = &mut controller => match res {
            Ok(Ok(())) => Err(anyhow::anyhow!("fencing controllers exited unexpectedly")),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        },
        lost = lease.lost() => {
            // another replica may already be acting: stop without cleanup
            error!(error = %lost, "Leadership lost, exiting");
            Err(lost.into())
        }
        () = shutdown_signal() => Ok(()),
    };

    controller.abort();
    leader.store(false, Ordering::SeqCst);
    if outcome.is_ok() {
        if let Err(e) = lease.release().await {
            warn!(error = %e, "Failed to release leadership");
        }
    }
    stop_server(&stop_tx, server).await;

    info!("Fencing controller stopped");
    outcome
}

async fn stop_server(stop_tx: &watch::Sender<bool>, server: JoinHandle<std::io::Result<()>>) {
    if stop_tx.send(true).is_err() {
        warn!("HTTP server already stopped before shutdown was requested");
    }
    match server.await {
        Ok(Ok(())) => info!("HTTP server stopped"),
        Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
        Err(e) => error!(error = %e, "HTTP server task panicked or was cancelled"),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,fencing_controller=debug".into());

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "fencing-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "fencing-controller",
        "holder": state.holder,
        "leader": state.leader.load(Ordering::SeqCst),
        "configs": state.registry.len(),
    }))
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            let mut cfg = ControllerConfig::default();
            cfg.apply_env_overrides();
            cfg
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
