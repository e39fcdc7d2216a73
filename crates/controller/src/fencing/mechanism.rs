//! Mechanism -> container
//!
//! Renders one `FencingMechanism` for one target into a container plus the
//! secret volumes it mounts. Configuration values are passed either as
//! `--key value` arguments (`cli`) or as environment variables (`env`).
//! Secrets never appear as literal values: each one is mounted read-only and
//! its path is exported as `SECRETPATH_<name>` so the image can read it.

use super::config::FencingMechanism;
use super::error::{EngineResult, FencingError};
use super::naming::ResourceNaming;
use crate::crds::FencingOperation;
use k8s_openapi::api::core::v1::{Container, EnvVar, SecretVolumeSource, Volume, VolumeMount};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How configuration reaches the fencing process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentFormat {
    Cli,
    Env,
}

impl ArgumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgumentFormat::Cli => "cli",
            ArgumentFormat::Env => "env",
        }
    }
}

impl fmt::Display for ArgumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArgumentFormat {
    type Err = FencingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cli" => Ok(ArgumentFormat::Cli),
            "env" => Ok(ArgumentFormat::Env),
            other => Err(FencingError::UnsupportedArgumentFormat(other.to_string())),
        }
    }
}

/// Process-wide inputs to container construction
#[derive(Debug, Clone, Default)]
pub struct BuildSettings {
    /// Directory under which each secret is mounted as `<root>/<secret>`
    pub secrets_mount_root: String,
    /// Fallback image when neither the mechanism nor the driver names one
    pub operator_image: String,
    /// Per-driver image overrides, keyed by driver name
    pub driver_images: BTreeMap<String, String>,
}

impl BuildSettings {
    /// explicit image > driver override > driver default > operator image
    fn image_for(&self, mechanism: &FencingMechanism) -> String {
        if let Some(image) = mechanism.image.as_ref().filter(|i| !i.is_empty()) {
            return image.clone();
        }
        if let Some(image) = self.driver_images.get(mechanism.driver.as_str()) {
            return image.clone();
        }
        mechanism
            .driver
            .default_image()
            .map_or_else(|| self.operator_image.clone(), str::to_string)
    }

    fn secret_path(&self, secret: &str) -> String {
        format!("{}/{secret}", self.secrets_mount_root.trim_end_matches('/'))
    }
}

/// A built mechanism: its container and the volumes the container mounts
#[derive(Debug, Clone)]
pub struct MechanismUnit {
    pub container: Container,
    pub volumes: Vec<Volume>,
}

/// Build the container for `mechanism` acting on `target`.
///
/// Fails without side effects when the argument format is unknown or a
/// dynamic field has no value for the target.
pub fn build_mechanism(
    mechanism: &FencingMechanism,
    index: usize,
    target: &str,
    operation: FencingOperation,
    settings: &BuildSettings,
) -> EngineResult<MechanismUnit> {
    let format: ArgumentFormat = mechanism.argument_format.parse()?;
    let pairs = resolve_pairs(mechanism, target)?;

    let mut command = mechanism
        .command
        .clone()
        .unwrap_or_else(|| mechanism.driver.default_command(mechanism.module.as_deref()));
    let mut args = Vec::new();

    let mut env = vec![env_var("SECRET_FORMAT", format.as_str())];
    env.extend(mechanism.env.iter().map(|(k, v)| env_var(k, v)));
    env.push(env_var("FENCING_OPERATION", &operation.to_string()));
    if let Some(timeout) = mechanism.timeout_seconds {
        env.push(env_var("FENCING_TIMEOUT_SECONDS", &timeout.to_string()));
    }

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for (name, secret) in &mechanism.secrets {
        let path = settings.secret_path(secret);
        env.push(env_var(&format!("SECRETPATH_{name}"), &path));

        let volume_name = ResourceNaming::secret_volume_name(index, secret);
        if volumes.iter().any(|v: &Volume| v.name == volume_name) {
            continue;
        }
        volumes.push(Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: path,
            read_only: Some(true),
            ..Default::default()
        });
    }

    match format {
        ArgumentFormat::Cli => {
            let rendered = render_cli(&pairs, mechanism.pass_target_as.as_deref(), target);
            if command.is_empty() {
                args = rendered;
            } else {
                command.extend(rendered);
            }
        }
        ArgumentFormat::Env => {
            env.extend(pairs.iter().map(|(k, v)| env_var(k, v)));
            if let Some(name) = mechanism.pass_target_as.as_deref() {
                env.push(env_var(name, target));
            }
        }
    }

    let container = Container {
        name: ResourceNaming::container_name(index, mechanism.driver.as_str()),
        image: Some(settings.image_for(mechanism)),
        command: (!command.is_empty()).then_some(command),
        args: (!args.is_empty()).then_some(args),
        env: Some(env),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    Ok(MechanismUnit { container, volumes })
}

/// Static config in declaration order, then dynamic config resolved for `target`
fn resolve_pairs(mechanism: &FencingMechanism, target: &str) -> EngineResult<Vec<(String, String)>> {
    let mut pairs: Vec<(String, String)> = mechanism
        .config
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for dc in &mechanism.dynamic_config {
        let value = dc
            .lookup(target)
            .ok_or_else(|| FencingError::MissingDynamicValue {
                field: dc.field.clone(),
                target: target.to_string(),
            })?;
        pairs.push((dc.field.clone(), value.to_string()));
    }
    Ok(pairs)
}

fn render_cli(pairs: &[(String, String)], pass_target_as: Option<&str>, target: &str) -> Vec<String> {
    let mut rendered = Vec::with_capacity(pairs.len() * 2 + 2);
    for (key, value) in pairs {
        rendered.push(format!("--{key}"));
        rendered.push(value.clone());
    }
    if let Some(flag) = pass_target_as.filter(|f| !f.is_empty()) {
        rendered.push(format!("--{flag}"));
    }
    rendered.push(target.to_string());
    rendered
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}
