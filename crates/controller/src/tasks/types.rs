use crate::fencing::{ConfigRegistry, FencingError};
use crate::tasks::config::ControllerConfig;
use kube::Client;
use std::sync::Arc;
use thiserror::Error;

/// Shared state handed to every reconciliation
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub namespace: String,
    pub config: Arc<ControllerConfig>,
    pub registry: Arc<ConfigRegistry>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Fencing error: {0}")]
    Fencing(#[from] FencingError),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} was modified concurrently")]
    Conflict(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// `409 Conflict` on create, which dispatch treats as success
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists(_) => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Write rejected because our copy of the object was stale
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    }))
}
