//! FencingRequest controller: drives each request through configuration
//! selection, method dispatch and escalation.

pub mod controller;
pub mod store;

pub use controller::{error_policy, reconcile_fencing_request, FencingReconciler, ReconcileOutcome};
pub use store::{FencingStore, KubeFencingStore};
