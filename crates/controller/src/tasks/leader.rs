//! # Leader Election
//!
//! Single active replica, using a coordination/v1 Lease. A replica that
//! cannot renew within the renew deadline (or finds another holder in the
//! lease) has lost leadership and must stop acting. The deadline is shorter
//! than the lease duration, so the old leader stops before any standby can
//! see the lease as expired.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::LeaderConfig;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] KubeError),

    #[error("Lease is held by another holder: {holder}")]
    LockHeld { holder: String },

    #[error("Lease taken over by {holder}")]
    TakenOver { holder: String },

    #[error("Lease not renewed within {0:?}")]
    RenewDeadlineExceeded(Duration),

    #[error("Lease renewal task ended: {0}")]
    RenewalAborted(String),
}

/// Contender for the leader Lease
#[derive(Clone)]
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    holder: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    renew_interval: Duration,
}

impl LeaderElector {
    #[must_use]
    pub fn new(client: Client, namespace: &str, config: &LeaderConfig, holder: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: config.lease_name.clone(),
            holder: holder.to_string(),
            lease_duration: Duration::from_secs(config.lease_duration_seconds),
            renew_deadline: Duration::from_secs(config.renew_deadline_seconds),
            renew_interval: Duration::from_secs(config.renew_interval_seconds),
        }
    }

    /// Block until this replica holds the lease
    pub async fn acquire(&self) -> Result<LeaderLease, LeaseError> {
        info!(lease = %self.lease_name, holder = %self.holder, "Waiting for leadership");
        loop {
            match self.try_acquire().await {
                Ok(()) => {
                    info!(lease = %self.lease_name, holder = %self.holder, "Acquired leadership");
                    return Ok(LeaderLease::start(self.clone()));
                }
                Err(LeaseError::LockHeld { holder }) => {
                    debug!(lease = %self.lease_name, current = %holder, "Lease held elsewhere");
                }
                Err(LeaseError::KubeError(KubeError::Api(ae))) if ae.code == 409 => {
                    debug!(lease = %self.lease_name, "Lost acquisition race, retrying");
                }
                Err(e) => {
                    warn!(lease = %self.lease_name, error = %e, "Lease acquisition failed, retrying");
                }
            }
            tokio::time::sleep(self.renew_interval).await;
        }
    }

    /// One attempt: create the lease, or take it over if expired or ours
    pub async fn try_acquire(&self) -> Result<(), LeaseError> {
        let now = Utc::now();
        let Some(mut existing) = self.api.get_opt(&self.lease_name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    ..Default::default()
                },
                spec: Some(claim_spec(None, &self.holder, self.lease_duration, now)),
            };
            self.api.create(&PostParams::default(), &lease).await?;
            return Ok(());
        };

        let current = holder_of(&existing).unwrap_or_default().to_string();
        if current != self.holder && !current.is_empty() && !is_lease_expired(&existing, now) {
            return Err(LeaseError::LockHeld { holder: current });
        }

        existing.spec = Some(claim_spec(existing.spec.as_ref(), &self.holder, self.lease_duration, now));
        // resourceVersion is kept, so a concurrent takeover yields 409
        self.api
            .replace(&self.lease_name, &PostParams::default(), &existing)
            .await?;
        Ok(())
    }

    /// Refresh renewTime if we are still the holder
    async fn renew(&self) -> Result<(), LeaseError> {
        let mut lease = self.api.get(&self.lease_name).await?;
        match holder_of(&lease) {
            Some(holder) if holder == self.holder => {}
            other => {
                return Err(LeaseError::TakenOver {
                    holder: other.unwrap_or("nobody").to_string(),
                })
            }
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
            spec.lease_duration_seconds = Some(duration_seconds(self.lease_duration));
        }
        self.api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release(&self) -> Result<(), LeaseError> {
        let mut lease = self.api.get(&self.lease_name).await?;
        if holder_of(&lease) != Some(self.holder.as_str()) {
            return Ok(());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
        }
        self.api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }
}

/// Held leadership, renewed in the background
pub struct LeaderLease {
    elector: LeaderElector,
    renewal_handle: Option<JoinHandle<LeaseError>>,
}

impl LeaderLease {
    fn start(elector: LeaderElector) -> Self {
        let renewer = elector.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(renewer.renew_interval);
            // acquisition just wrote renewTime
            let mut last_renewed = Instant::now();
            loop {
                let deadline = last_renewed + renewer.renew_deadline;
                tokio::select! {
                    _ = interval.tick() => {}
                    () = tokio::time::sleep_until(deadline) => {
                        error!(lease = %renewer.lease_name, "Renew deadline passed, leadership lost");
                        return LeaseError::RenewDeadlineExceeded(renewer.renew_deadline);
                    }
                }

                let attempted = Instant::now();
                match tokio::time::timeout_at(deadline, renewer.renew()).await {
                    Ok(Ok(())) => {
                        // a standby measures expiry from the renewTime we sent
                        last_renewed = attempted;
                        debug!(lease = %renewer.lease_name, "Lease renewed");
                    }
                    Ok(Err(e @ LeaseError::TakenOver { .. })) => {
                        error!(lease = %renewer.lease_name, error = %e, "Leadership lost");
                        return e;
                    }
                    Ok(Err(e)) => {
                        warn!(lease = %renewer.lease_name, error = %e, "Failed to renew lease");
                        if renew_deadline_passed(last_renewed, Instant::now(), renewer.renew_deadline) {
                            error!(lease = %renewer.lease_name, "Renew deadline passed, leadership lost");
                            return LeaseError::RenewDeadlineExceeded(renewer.renew_deadline);
                        }
                    }
                    Err(_) => {
                        error!(lease = %renewer.lease_name, "Lease renewal hung past the renew deadline, leadership lost");
                        return LeaseError::RenewDeadlineExceeded(renewer.renew_deadline);
                    }
                }
            }
        });
        Self {
            elector,
            renewal_handle: Some(handle),
        }
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.elector.holder
    }

    /// Resolves when leadership is lost
    pub async fn lost(&mut self) -> LeaseError {
        match self.renewal_handle.as_mut() {
            Some(handle) => match handle.await {
                Ok(e) => e,
                Err(join) => LeaseError::RenewalAborted(join.to_string()),
            },
            None => LeaseError::RenewalAborted("renewal not running".to_string()),
        }
    }

    /// Stop renewing and hand the lease back
    pub async fn release(mut self) -> Result<(), LeaseError> {
        if let Some(handle) = self.renewal_handle.take() {
            handle.abort();
        }
        self.elector.release().await?;
        info!(lease = %self.elector.lease_name, "Leadership released");
        Ok(())
    }
}

impl Drop for LeaderLease {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal_handle.take() {
            handle.abort();
        }
    }
}

fn renew_deadline_passed(last_renewed: Instant, now: Instant, deadline: Duration) -> bool {
    now.saturating_duration_since(last_renewed) >= deadline
}

fn holder_of(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.holder_identity.as_deref())
        .filter(|holder| !holder.is_empty())
}

/// A lease without a renew time or duration counts as expired
pub fn is_lease_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    let (Some(renew_time), Some(duration)) = (&spec.renew_time, spec.lease_duration_seconds) else {
        return true;
    };
    renew_time.0 + chrono::Duration::seconds(i64::from(duration)) < now
}

/// Spec for `holder` claiming a lease, counting a transition on change of holder
fn claim_spec(
    existing: Option<&LeaseSpec>,
    holder: &str,
    duration: Duration,
    now: DateTime<Utc>,
) -> LeaseSpec {
    let previous = existing.and_then(|spec| spec.holder_identity.as_deref());
    let transitions = existing.and_then(|spec| spec.lease_transitions).unwrap_or(0);
    let (acquire_time, transitions) = match (previous, existing) {
        (Some(p), Some(spec)) if p == holder => (spec.acquire_time.clone(), transitions),
        (None, None) => (Some(MicroTime(now)), 0),
        _ => (Some(MicroTime(now)), transitions + 1),
    };
    LeaseSpec {
        holder_identity: Some(holder.to_string()),
        lease_duration_seconds: Some(duration_seconds(duration)),
        acquire_time: acquire_time.or(Some(MicroTime(now))),
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(transitions),
        ..Default::default()
    }
}

fn duration_seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed: Option<DateTime<Utc>>, seconds: Option<i32>) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                renew_time: renewed.map(MicroTime),
                lease_duration_seconds: seconds,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn expiry_follows_renew_time_and_duration() {
        let now = Utc::now();
        let fresh = lease(Some("a"), Some(now - chrono::Duration::seconds(5)), Some(15));
        let stale = lease(Some("a"), Some(now - chrono::Duration::seconds(16)), Some(15));
        assert!(!is_lease_expired(&fresh, now));
        assert!(is_lease_expired(&stale, now));
        assert!(is_lease_expired(&lease(Some("a"), None, Some(15)), now));
        assert!(is_lease_expired(&Lease::default(), now));
    }

    #[test]
    fn claiming_counts_transitions() {
        let now = Utc::now();
        let fresh = claim_spec(None, "pod-a", Duration::from_secs(15), now);
        assert_eq!(fresh.holder_identity.as_deref(), Some("pod-a"));
        assert_eq!(fresh.lease_transitions, Some(0));
        assert_eq!(fresh.lease_duration_seconds, Some(15));

        let same = claim_spec(Some(&fresh), "pod-a", Duration::from_secs(15), now);
        assert_eq!(same.lease_transitions, Some(0));
        assert_eq!(same.acquire_time, fresh.acquire_time);

        let taken = claim_spec(Some(&same), "pod-b", Duration::from_secs(15), now);
        assert_eq!(taken.holder_identity.as_deref(), Some("pod-b"));
        assert_eq!(taken.lease_transitions, Some(1));
    }

    #[test]
    fn renew_deadline_is_measured_from_last_success() {
        let last = Instant::now();
        let deadline = Duration::from_secs(10);
        assert!(!renew_deadline_passed(last, last + Duration::from_secs(9), deadline));
        assert!(renew_deadline_passed(last, last + deadline, deadline));
        // clock readings before the last success never count as overdue
        assert!(!renew_deadline_passed(last + Duration::from_secs(1), last, deadline));
    }

    #[test]
    fn empty_holder_is_nobody() {
        assert_eq!(holder_of(&lease(Some(""), None, None)), None);
        assert_eq!(holder_of(&lease(Some("pod-a"), None, None)), Some("pod-a"));
    }
}
