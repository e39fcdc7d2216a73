//! # Fencing Engine
//!
//! Configuration model and the pure building blocks of the fencing workflow:
//!
//! - **`config`**: parsed `FencingConfig` / `FencingMethod` / `FencingMechanism`
//! - **`registry`**: synchronized name -> configuration map fed from ConfigMaps
//! - **`selector`**: best-match configuration for a target node
//! - **`escalation`**: which method runs next given prior state
//! - **`mechanism`**: one mechanism -> one container
//! - **`job`**: one method -> one Job
//! - **`naming`**: deterministic, length-safe resource names and label values
//! - **`retry`**: bounded exponential backoff around API writes
//!
//! Nothing in here talks to the API server; the controllers in `crate::tasks`
//! drive these pieces.

pub mod config;
pub mod error;
pub mod escalation;
pub mod job;
pub mod mechanism;
pub mod naming;
pub mod registry;
pub mod retry;
pub mod selector;

pub use config::{DynamicConfig, FencingConfig, FencingMechanism, FencingMethod, MechanismDriver};
pub use error::{EngineResult, FencingError};
pub use escalation::{next_step, Decision, JobState};
pub use job::{build_job, job_selector};
pub use mechanism::{build_mechanism, ArgumentFormat, BuildSettings, MechanismUnit};
pub use naming::ResourceNaming;
pub use registry::{ConfigRegistry, ConfigSnapshot};
pub use retry::{retry_with_backoff, Backoff};
pub use selector::select_config;
