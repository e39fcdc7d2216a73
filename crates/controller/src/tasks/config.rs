//! Controller Configuration
//!
//! Process-wide settings loaded from a mounted YAML file. Fencing
//! configurations themselves live in ConfigMaps and are handled by
//! `crate::fencing::registry`; this file only tunes the controller.

use crate::fencing::{Backoff, BuildSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ControllerConfig {
    /// Job construction and configuration discovery
    #[serde(default)]
    pub fencing: FencingSettings,

    /// Node health monitoring
    #[serde(default)]
    pub health: HealthConfig,

    /// Bounded retry around API writes
    #[serde(default)]
    pub retry: RetryConfig,

    /// Leader election
    #[serde(default)]
    pub leader: LeaderConfig,
}

/// Fencing job configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FencingSettings {
    /// Directory under which each secret volume is mounted
    pub secrets_mount_root: String,

    /// Label selector for ConfigMaps holding fencing configurations
    pub config_label_selector: String,

    /// ConfigMap data key holding the configuration YAML
    pub config_key: String,

    /// Image used by mechanisms whose driver has no default image.
    /// Overridden by `OPERATOR_IMAGE`.
    pub operator_image: String,

    /// Per-driver image overrides (`baremetal`, `openstack`, `echo`, `custom`)
    pub driver_images: BTreeMap<String, String>,

    /// How often a request with a running Job is re-checked
    pub job_poll_seconds: u64,
}

impl Default for FencingSettings {
    fn default() -> Self {
        Self {
            secrets_mount_root: "/etc/fencing/secrets".to_string(),
            config_label_selector: "fencing.clusterlabs.org/config=true".to_string(),
            config_key: "fencing-config".to_string(),
            operator_image: "ghcr.io/clusterlabs/fencing-controller:latest".to_string(),
            driver_images: BTreeMap::new(),
            job_poll_seconds: 15,
        }
    }
}

impl FencingSettings {
    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            secrets_mount_root: self.secrets_mount_root.clone(),
            operator_image: self.operator_image.clone(),
            driver_images: self.driver_images.clone(),
        }
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_seconds)
    }
}

/// What to do with outstanding requests when their node recovers
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RecoveryPolicy {
    /// Cancel as soon as the node reports Ready
    #[default]
    Immediate,
    /// Cancel once the node has been Ready for `stableSeconds`
    AfterStable {
        #[serde(rename = "stableSeconds")]
        stable_seconds: u64,
    },
    /// Never cancel; requests run to completion
    Disabled,
}

/// Node health monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    /// How long `Ready=Unknown` must persist before a node counts as failed
    pub unhealthy_after_seconds: u64,

    /// Interval of the periodic re-assessment of every known node
    pub sweep_interval_seconds: u64,

    /// Event source components whose warnings are considered
    pub problem_sources: Vec<String>,

    /// Treat an allow-listed warning as a failure signal on its own
    pub fence_on_problem_events: bool,

    pub recovery: RecoveryPolicy,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_after_seconds: 40,
            sweep_interval_seconds: 15,
            problem_sources: [
                "abrt-notification",
                "abrt-adaptor",
                "docker-monitor",
                "kernel-monitor",
                "kernel",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            fence_on_problem_events: false,
            recovery: RecoveryPolicy::Immediate,
        }
    }
}

impl HealthConfig {
    pub fn unhealthy_window(&self) -> Duration {
        Duration::from_secs(self.unhealthy_after_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Retry configuration for API writes
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub steps: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            factor: 1.2,
            steps: 5,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.initial_delay_ms),
            factor: self.factor,
            steps: self.steps,
        }
    }
}

/// Leader election configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderConfig {
    pub lease_name: String,
    pub lease_duration_seconds: u64,
    /// A renewal not confirmed within this long after the last success gives up leadership
    pub renew_deadline_seconds: u64,
    pub renew_interval_seconds: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_name: "fencing-controller-leader".to_string(),
            lease_duration_seconds: 15,
            renew_deadline_seconds: 10,
            renew_interval_seconds: 2,
        }
    }
}

impl ControllerConfig {
    /// Validate that the configuration is usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.fencing.config_key.trim().is_empty() {
            return Err(anyhow::anyhow!("fencing.configKey must not be empty"));
        }
        if self.fencing.operator_image.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "fencing.operatorImage must be set (or provide OPERATOR_IMAGE)"
            ));
        }
        if !self.fencing.secrets_mount_root.starts_with('/') {
            return Err(anyhow::anyhow!(format!(
                "fencing.secretsMountRoot must be an absolute path, got '{}'",
                self.fencing.secrets_mount_root
            )));
        }
        if self.fencing.job_poll_seconds == 0 || self.health.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "fencing.jobPollSeconds and health.sweepIntervalSeconds must be positive"
            ));
        }
        if self.retry.steps == 0 || self.retry.factor < 1.0 {
            return Err(anyhow::anyhow!(
                "retry.steps must be positive and retry.factor at least 1.0"
            ));
        }
        let leader = &self.leader;
        // stepping down must happen before a standby may consider the lease expired
        if leader.renew_interval_seconds == 0
            || leader.renew_interval_seconds >= leader.renew_deadline_seconds
            || leader.renew_deadline_seconds >= leader.lease_duration_seconds
        {
            return Err(anyhow::anyhow!(format!(
                "leader timing must satisfy 0 < renewIntervalSeconds ({}) < renewDeadlineSeconds ({}) < leaseDurationSeconds ({})",
                leader.renew_interval_seconds,
                leader.renew_deadline_seconds,
                leader.lease_duration_seconds
            )));
        }
        Ok(())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let mut config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment takes precedence over the file for deployment identity
    pub fn apply_env_overrides(&mut self) {
        if let Ok(image) = std::env::var("OPERATOR_IMAGE") {
            if !image.trim().is_empty() {
                self.fencing.operator_image = image;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
fencing:
  secretsMountRoot: "/run/secrets/fencing"
  operatorImage: "registry.local/fencing:1.0"
  driverImages:
    baremetal: "registry.local/fence-agents:4.12"
  jobPollSeconds: 5

health:
  unhealthyAfterSeconds: 90
  problemSources: ["kernel-monitor"]
  fenceOnProblemEvents: true
  recovery:
    mode: afterStable
    stableSeconds: 120

retry:
  steps: 3

leader:
  leaseName: "fencing-leader"
"#;

        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.fencing.secrets_mount_root, "/run/secrets/fencing");
        assert_eq!(config.fencing.config_key, "fencing-config");
        assert_eq!(
            config.fencing.driver_images.get("baremetal").map(String::as_str),
            Some("registry.local/fence-agents:4.12")
        );
        assert_eq!(config.health.unhealthy_after_seconds, 90);
        assert_eq!(config.health.sweep_interval_seconds, 15);
        assert!(config.health.fence_on_problem_events);
        assert_eq!(
            config.health.recovery,
            RecoveryPolicy::AfterStable { stable_seconds: 120 }
        );
        assert_eq!(config.retry.steps, 3);
        assert!((config.retry.factor - 1.2).abs() < f64::EPSILON);
        assert_eq!(config.leader.lease_name, "fencing-leader");
        assert_eq!(config.leader.lease_duration_seconds, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.fencing.secrets_mount_root, "/etc/fencing/secrets");
        assert_eq!(
            config.fencing.config_label_selector,
            "fencing.clusterlabs.org/config=true"
        );
        assert_eq!(config.health.unhealthy_after_seconds, 40);
        assert_eq!(config.health.problem_sources.len(), 5);
        assert_eq!(config.health.recovery, RecoveryPolicy::Immediate);
        assert_eq!(config.retry.backoff(), Backoff::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn recovery_modes_parse() {
        let disabled: RecoveryPolicy = serde_yaml::from_str("mode: disabled").unwrap();
        assert_eq!(disabled, RecoveryPolicy::Disabled);
        let immediate: RecoveryPolicy = serde_yaml::from_str("mode: immediate").unwrap();
        assert_eq!(immediate, RecoveryPolicy::Immediate);
    }

    #[test]
    fn validate_rejects_bad_leader_timing() {
        let mut config = ControllerConfig::default();
        config.leader.renew_interval_seconds = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn renew_deadline_must_fall_inside_the_lease() {
        let mut config = ControllerConfig::default();
        assert!(config.validate().is_ok());

        config.leader.renew_deadline_seconds = config.leader.lease_duration_seconds;
        assert!(config.validate().is_err());

        config.leader.renew_deadline_seconds = config.leader.renew_interval_seconds;
        assert!(config.validate().is_err());

        config.leader.renew_deadline_seconds = 12;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_relative_mount_root() {
        let mut config = ControllerConfig::default();
        config.fencing.secrets_mount_root = "secrets".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn operator_image_env_overrides_file() {
        let mut config = ControllerConfig::default();
        std::env::set_var("OPERATOR_IMAGE", "registry.local/fencing:from-env");
        config.apply_env_overrides();
        std::env::remove_var("OPERATOR_IMAGE");

        assert_eq!(config.fencing.operator_image, "registry.local/fencing:from-env");
        assert_eq!(
            config.fencing.build_settings().operator_image,
            "registry.local/fencing:from-env"
        );
    }
}
