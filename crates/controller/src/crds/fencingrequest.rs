//! `FencingRequest` Custom Resource Definition
//!
//! A request to fence one target node. Created by the node health monitor (or
//! an administrator) and mutated only by the fencing request controller.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label carried by every `FencingRequest` naming the node it targets
pub const TARGET_LABEL: &str = "fencing.clusterlabs.org/target";

/// Operation to perform against the target
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum FencingOperation {
    On,
    #[default]
    Off,
    Cycle,
}

impl fmt::Display for FencingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FencingOperation::On => write!(f, "On"),
            FencingOperation::Off => write!(f, "Off"),
            FencingOperation::Cycle => write!(f, "Cycle"),
        }
    }
}

/// `FencingRequest` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "fencing.clusterlabs.org",
    version = "v1alpha1",
    kind = "FencingRequest"
)]
#[kube(namespaced)]
#[kube(status = "FencingRequestStatus")]
#[kube(shortname = "fr")]
#[kube(printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target"}"#)]
#[kube(printcolumn = r#"{"name":"Operation","type":"string","jsonPath":".spec.operation"}"#)]
#[kube(printcolumn = r#"{"name":"Method","type":"string","jsonPath":".status.activeMethod"}"#)]
#[kube(printcolumn = r#"{"name":"Complete","type":"boolean","jsonPath":".status.complete"}"#)]
#[kube(printcolumn = r#"{"name":"Result","type":"string","jsonPath":".status.result"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct FencingRequestSpec {
    /// Name of the node to fence
    pub target: String,

    /// Who or what raised the request (e.g. "node-health-monitor: heartbeat lost")
    #[serde(default)]
    pub origin: Option<String>,

    /// Requested operation (On, Off, Cycle)
    #[serde(default)]
    pub operation: FencingOperation,

    /// Do not act before this time (RFC3339)
    #[serde(default, rename = "notBefore", skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,

    /// Workloads that were observed on the target when the request was raised
    #[serde(default, rename = "affectedWorkloads", skip_serializing_if = "Vec::is_empty")]
    pub affected_workloads: Vec<String>,
}

/// Final and intermediate result codes recorded on a request
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum FencingResult {
    /// Fencing finished successfully
    Success,
    /// No configuration matched the target
    NoConfig,
    /// Every configured method was tried and none succeeded
    GivingUp,
    /// A configuration was chosen for the target
    ConfigSelected,
    /// A method was chosen and its job is about to be dispatched
    MethodSelected,
    /// The method's job was created
    JobDispatched,
    /// The method's job (or its construction) failed
    MethodFailed,
    /// The method's job finished successfully
    MethodSucceeded,
}

impl fmt::Display for FencingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FencingResult::Success => "Success",
            FencingResult::NoConfig => "NoConfig",
            FencingResult::GivingUp => "GivingUp",
            FencingResult::ConfigSelected => "ConfigSelected",
            FencingResult::MethodSelected => "MethodSelected",
            FencingResult::JobDispatched => "JobDispatched",
            FencingResult::MethodFailed => "MethodFailed",
            FencingResult::MethodSucceeded => "MethodSucceeded",
        };
        f.write_str(text)
    }
}

/// Status of the `FencingRequest`
///
/// `config`, `active_method` and `active_job` are serialized even when empty so
/// that a merge patch clears them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FencingRequestStatus {
    /// Terminal flag, once set the request is never reprocessed
    #[serde(default)]
    pub complete: bool,

    /// Final result code
    #[serde(default)]
    pub result: Option<FencingResult>,

    /// Name of the selected fencing configuration (sticky)
    #[serde(default)]
    pub config: Option<String>,

    /// Name of the method currently being executed (sticky)
    #[serde(default)]
    pub active_method: Option<String>,

    /// Name of the Job dispatched for the active method
    #[serde(default)]
    pub active_job: Option<String>,

    /// Ordered audit trail, append-only
    #[serde(default)]
    pub updates: Vec<FencingRequestStatusUpdate>,
}

/// One entry of the audit trail
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FencingRequestStatusUpdate {
    /// RFC3339 timestamp
    pub timestamp: String,

    /// Method the update refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Human-readable message
    pub message: String,

    /// Error text, if the transition was caused by a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FencingRequestStatus {
    /// Append an audit record
    pub fn record(
        &mut self,
        method: Option<&str>,
        result: FencingResult,
        detail: impl Into<String>,
        error: Option<String>,
    ) {
        let detail = detail.into();
        let message = if detail.is_empty() {
            result.to_string()
        } else {
            format!("{result}: {detail}")
        };
        self.updates.push(FencingRequestStatusUpdate {
            timestamp: Utc::now().to_rfc3339(),
            method: method.map(str::to_string),
            message,
            error,
        });
    }

    /// Mark the request terminal with `result`
    pub fn finalize(&mut self, result: FencingResult, detail: impl Into<String>, error: Option<String>) {
        self.complete = true;
        self.result = Some(result);
        self.active_job = None;
        self.record(None, result, detail, error);
    }
}

impl FencingRequest {
    /// Whether the request has reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.complete)
    }

    /// Point in time from which the request is valid: `notBefore` if set,
    /// otherwise the creation timestamp.
    pub fn valid_from(&self) -> Option<DateTime<Utc>> {
        if let Some(not_before) = &self.spec.not_before {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(not_before) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }

    /// `notBefore` parsed, if present. A value that is not RFC3339 is an
    /// error so callers can surface it instead of fencing at once unnoticed.
    pub fn not_before(&self) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
        self.spec
            .not_before
            .as_deref()
            .map(|t| DateTime::parse_from_rfc3339(t).map(|t| t.with_timezone(&Utc)))
            .transpose()
    }
}
