//! FencingRequest reconciliation
//!
//! ```text
//! New -> ConfigSelected -> MethodSelected -> Dispatched -> Succeeded -> Complete(Success)
//!                               ^                  |
//!                               +-- MethodFailed <-+-> exhausted -> Complete(GivingUp)
//! ```
//!
//! Every pass re-derives its position from the persisted status plus the
//! observed Jobs, so a pass can be repeated or interrupted at any point.
//! Status writes are pinned to the revision the pass read; a pass that
//! started from a stale cached copy loses the write and is redone once
//! against a fresh read.

use super::store::{method_state, FencingStore, KubeFencingStore};
use crate::crds::{FencingRequest, FencingRequestStatus, FencingResult};
use crate::fencing::{
    build_job, next_step, retry_with_backoff, select_config, ConfigRegistry, Decision, JobState,
};
use crate::tasks::config::ControllerConfig;
use crate::tasks::types::{Context, Error, Result};
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Delay before the pass that escalates past a method that failed to build
const ESCALATE_AFTER_BUILD_FAILURE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing more to do until the request or its Jobs change
    Done,
    Requeue(Duration),
}

pub struct FencingReconciler<'a, S: FencingStore> {
    store: &'a S,
    registry: &'a ConfigRegistry,
    config: &'a ControllerConfig,
}

impl<'a, S: FencingStore> FencingReconciler<'a, S> {
    pub fn new(store: &'a S, registry: &'a ConfigRegistry, config: &'a ControllerConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub async fn reconcile(
        &self,
        request: &FencingRequest,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        match self.reconcile_once(request, now).await {
            Err(e) if e.is_conflict() => {
                let name = request.name_any();
                info!(request = %name, "Request changed since it was cached, reconciling the latest revision");
                match self.store.get_request(&name).await? {
                    Some(latest) => self.reconcile_once(&latest, now).await,
                    None => Ok(ReconcileOutcome::Done),
                }
            }
            outcome => outcome,
        }
    }

    async fn reconcile_once(
        &self,
        request: &FencingRequest,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let name = request.name_any();
        let target = request.spec.target.as_str();

        if request.is_complete() {
            debug!(request = %name, "Request already complete");
            return Ok(ReconcileOutcome::Done);
        }

        match request.not_before() {
            Ok(Some(not_before)) if not_before > now => {
                let wait = (not_before - now).to_std().unwrap_or_default();
                debug!(request = %name, wait_secs = wait.as_secs(), "Request not yet valid");
                return Ok(ReconcileOutcome::Requeue(wait));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    request = %name,
                    not_before = ?request.spec.not_before,
                    error = %e,
                    "Ignoring malformed notBefore, request is valid from its creation"
                );
            }
        }

        let original = request.status.clone().unwrap_or_default();
        let mut status = original.clone();

        let labels = self.store.node_labels(target).await?;
        let snapshot = self.registry.snapshot();
        let config = match select_config(status.config.as_deref(), target, &labels, &snapshot) {
            Ok(config) => config,
            Err(e) => {
                warn!(request = %name, target = %target, "No fencing configuration applies");
                status.finalize(FencingResult::NoConfig, "", Some(e.to_string()));
                self.persist(request, &original, &status).await?;
                return Ok(ReconcileOutcome::Done);
            }
        };

        if status.config.as_deref() != Some(config.name.as_str()) {
            if status.config.is_some() {
                // reselected after the sticky config vanished
                status.active_method = None;
                status.active_job = None;
            }
            info!(request = %name, config = %config.name, "Selected fencing configuration");
            status.config = Some(config.name.clone());
            status.record(None, FencingResult::ConfigSelected, config.name.as_str(), None);
        }

        let state = self.observe(&name, &mut status).await?;

        let valid_from = request.valid_from().unwrap_or(now);
        let elapsed = (now - valid_from).to_std().unwrap_or_default();

        match next_step(&config, status.active_method.as_deref(), state, elapsed) {
            Decision::Wait { method } => {
                debug!(request = %name, method = %method, "Fencing job still running");
                self.persist(request, &original, &status).await?;
                Ok(ReconcileOutcome::Requeue(self.config.fencing.job_poll_interval()))
            }
            Decision::Delay { index, remaining } => {
                info!(
                    request = %name,
                    method = %config.methods[index].name,
                    remaining_secs = remaining.as_secs(),
                    "Method not yet allowed to run"
                );
                self.persist(request, &original, &status).await?;
                Ok(ReconcileOutcome::Requeue(remaining))
            }
            Decision::Complete { method } => {
                info!(request = %name, method = %method, "Target fenced");
                status.finalize(FencingResult::Success, format!("fenced by {method}"), None);
                self.persist(request, &original, &status).await?;
                Ok(ReconcileOutcome::Done)
            }
            Decision::Exhausted { last } => {
                error!(request = %name, target = %target, last_method = ?last, "All fencing methods failed");
                status.finalize(FencingResult::GivingUp, "all methods failed", None);
                self.persist(request, &original, &status).await?;
                Ok(ReconcileOutcome::Done)
            }
            Decision::Dispatch { index } => {
                let method = &config.methods[index];
                status.active_method = Some(method.name.clone());
                status.active_job = None;
                status.record(Some(&method.name), FencingResult::MethodSelected, "", None);

                let job = match build_job(request, &config, method, &self.config.fencing.build_settings()) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(request = %name, method = %method.name, error = %e, "Method could not be built");
                        status.record(
                            Some(&method.name),
                            FencingResult::MethodFailed,
                            "",
                            Some(e.to_string()),
                        );
                        self.persist(request, &original, &status).await?;
                        return Ok(ReconcileOutcome::Requeue(ESCALATE_AFTER_BUILD_FAILURE));
                    }
                };

                let job_name = job.metadata.name.clone().unwrap_or_default();
                let backoff = self.config.retry.backoff();
                let existed = retry_with_backoff(&backoff, "create_job", || async {
                    match self.store.create_job(&job).await {
                        Ok(_) => Ok(false),
                        Err(e) if e.is_already_exists() => Ok(true),
                        Err(e) => Err(e),
                    }
                })
                .await?;

                info!(
                    request = %name,
                    method = %method.name,
                    job = %job_name,
                    adopted = existed,
                    "Dispatched fencing job"
                );
                status.active_job = Some(job_name.clone());
                status.record(Some(&method.name), FencingResult::JobDispatched, job_name, None);
                self.persist(request, &original, &status).await?;
                Ok(ReconcileOutcome::Requeue(self.config.fencing.job_poll_interval()))
            }
        }
    }

    /// Observe the active method's Jobs and record the outcome of a
    /// dispatched Job exactly once.
    async fn observe(&self, name: &str, status: &mut FencingRequestStatus) -> Result<JobState> {
        let Some(method) = status.active_method.clone() else {
            return Ok(JobState::Missing);
        };

        let jobs = self.store.method_jobs(name, &method).await?;
        let state = method_state(&jobs);

        match (status.active_job.is_some(), state) {
            (false, JobState::Running) => {
                // dispatched but the status write was lost
                let adopted = jobs.iter().find_map(|j| j.metadata.name.clone());
                debug!(request = %name, method = %method, job = ?adopted, "Adopting running job");
                status.active_job = adopted;
            }
            (true, JobState::Succeeded) => {
                status.record(Some(&method), FencingResult::MethodSucceeded, "", None);
                status.active_job = None;
            }
            (true, JobState::Failed | JobState::Missing) => {
                let reason = if state == JobState::Missing {
                    "job not found"
                } else {
                    "job failed"
                };
                status.record(
                    Some(&method),
                    FencingResult::MethodFailed,
                    "",
                    Some(reason.to_string()),
                );
                status.active_job = None;
            }
            _ => {}
        }
        Ok(state)
    }

    async fn persist(
        &self,
        request: &FencingRequest,
        original: &FencingRequestStatus,
        status: &FencingRequestStatus,
    ) -> Result<()> {
        if original == status {
            return Ok(());
        }
        let name = request.name_any();
        let resource_version = request.resource_version();
        let backoff = self.config.retry.backoff();
        // repeating a conflicting write with the same stale copy cannot succeed
        retry_with_backoff(&backoff, "patch_status", || async {
            match self
                .store
                .patch_status(&name, resource_version.as_deref(), status)
                .await
            {
                Err(e) if e.is_conflict() => Ok(Err(e)),
                other => other.map(Ok),
            }
        })
        .await?
    }
}

#[instrument(skip(ctx), fields(request = %request.name_any(), namespace = %ctx.namespace))]
pub async fn reconcile_fencing_request(
    request: Arc<FencingRequest>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let store = KubeFencingStore::new(ctx.client.clone(), &ctx.namespace);
    let reconciler = FencingReconciler::new(&store, &ctx.registry, &ctx.config);

    match reconciler.reconcile(&request, Utc::now()).await? {
        ReconcileOutcome::Done => Ok(Action::await_change()),
        ReconcileOutcome::Requeue(after) => Ok(Action::requeue(after)),
    }
}

/// Failed passes are re-delivered; every step is safe to repeat
pub fn error_policy(request: Arc<FencingRequest>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(
        error = ?err,
        request = %request.name_any(),
        namespace = %ctx.namespace,
        "FencingRequest reconciliation failed, requeueing"
    );
    Action::requeue(ctx.config.fencing.job_poll_interval())
}
