//! API access used by the fencing request reconciler

use crate::crds::{FencingRequest, FencingRequestStatus};
use crate::fencing::{job_selector, JobState};
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

#[async_trait]
pub trait FencingStore: Send + Sync {
    /// Labels of the target node; a missing node has no labels
    async fn node_labels(&self, node: &str) -> Result<BTreeMap<String, String>>;

    /// Jobs dispatched for `method` of `request`
    async fn method_jobs(&self, request: &str, method: &str) -> Result<Vec<Job>>;

    /// Create a Job; `409` maps to `Error::AlreadyExists`
    async fn create_job(&self, job: &Job) -> Result<Job>;

    /// Current copy of the request straight from the API server
    async fn get_request(&self, name: &str) -> Result<Option<FencingRequest>>;

    /// Replace the request's status through the status subresource. With a
    /// `resource_version` the write only lands on that exact revision; a
    /// newer revision maps to `Error::Conflict`.
    async fn patch_status(
        &self,
        request: &str,
        resource_version: Option<&str>,
        status: &FencingRequestStatus,
    ) -> Result<()>;
}

pub struct KubeFencingStore {
    nodes: Api<Node>,
    jobs: Api<Job>,
    requests: Api<FencingRequest>,
}

impl KubeFencingStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            jobs: Api::namespaced(client.clone(), namespace),
            requests: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl FencingStore for KubeFencingStore {
    async fn node_labels(&self, node: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .nodes
            .get_opt(node)
            .await?
            .and_then(|n| n.metadata.labels)
            .unwrap_or_default())
    }

    async fn method_jobs(&self, request: &str, method: &str) -> Result<Vec<Job>> {
        let params = ListParams::default().labels(&job_selector(request, method));
        Ok(self.jobs.list(&params).await?.items)
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let name = job.metadata.name.clone().unwrap_or_default();
        match self.jobs.create(&PostParams::default(), job).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(job = %name, "Job already exists");
                Err(Error::AlreadyExists(name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_request(&self, name: &str) -> Result<Option<FencingRequest>> {
        Ok(self.requests.get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        request: &str,
        resource_version: Option<&str>,
        status: &FencingRequestStatus,
    ) -> Result<()> {
        let patch = status_patch(resource_version, status);
        match self
            .requests
            .patch_status(request, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(request = %request, resource_version = ?resource_version, "Status write lost to a newer revision");
                Err(Error::Conflict(request.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Merge patch body for a status write, pinned to `resource_version` when given
pub fn status_patch(resource_version: Option<&str>, status: &FencingRequestStatus) -> Value {
    match resource_version {
        Some(rv) => json!({ "metadata": { "resourceVersion": rv }, "status": status }),
        None => json!({ "status": status }),
    }
}

/// State of a single Job from its conditions, falling back to pod counters
pub fn job_state(status: Option<&JobStatus>) -> JobState {
    // exists but the job controller has not reported yet
    let Some(status) = status else {
        return JobState::Running;
    };

    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.type_ == "Complete" && condition.status == "True" {
                return JobState::Succeeded;
            }
            if condition.type_ == "Failed" && condition.status == "True" {
                return JobState::Failed;
            }
        }
    }

    if status.succeeded.is_some_and(|s| s > 0) {
        return JobState::Succeeded;
    }
    // with restartPolicy OnFailure a failed pod count alone is not terminal
    if status.failed.is_some_and(|f| f > 0) && status.active.unwrap_or(0) == 0 {
        return JobState::Failed;
    }

    JobState::Running
}

/// Aggregate state of all Jobs of one method: any success wins, then any
/// running Job, otherwise failed. No Jobs at all is `Missing`.
pub fn method_state(jobs: &[Job]) -> JobState {
    if jobs.is_empty() {
        return JobState::Missing;
    }
    let states: Vec<JobState> = jobs.iter().map(|j| job_state(j.status.as_ref())).collect();
    if states.contains(&JobState::Succeeded) {
        JobState::Succeeded
    } else if states.contains(&JobState::Running) {
        JobState::Running
    } else {
        JobState::Failed
    }
}
