//! End-to-end checks of the fencing engine: configuration parsing, selection,
//! Job construction and escalation, without an API server.

use fencing_controller::crds::{FencingOperation, FencingRequest, FencingRequestSpec};
use fencing_controller::fencing::{
    build_job, next_step, select_config, BuildSettings, ConfigRegistry, Decision, FencingError,
    JobState,
};
use std::collections::BTreeMap;
use std::time::Duration;

const RACK_CONFIG: &str = r"
nodeSelector:
  rack: r1
methods:
- name: ipmi
  retries: 2
  mechanisms:
  - driver: echo
    passTargetAs: host
    dynamicConfig:
    - field: ip
      default: 127.0.0.1
      values:
        badhost: 10.0.0.9
- name: nova
  mechanisms:
  - driver: openstack
    argumentFormat: env
    passTargetAs: INSTANCE
    secrets:
      OS_PASSWORD: openstack-creds
- name: manual
  requireAfterSeconds: 300
  mechanisms:
  - driver: echo
";

const CATCH_ALL: &str = r"
methods:
- name: noop
  mechanisms:
  - driver: echo
";

fn settings() -> BuildSettings {
    BuildSettings {
        secrets_mount_root: "/etc/fencing/secrets".to_string(),
        operator_image: "registry.local/fencing-controller:test".to_string(),
        driver_images: BTreeMap::new(),
    }
}

fn request(target: &str) -> FencingRequest {
    let mut request = FencingRequest::new(
        &format!("fence-{target}-1700000000"),
        FencingRequestSpec {
            target: target.to_string(),
            operation: FencingOperation::Off,
            ..Default::default()
        },
    );
    request.metadata.namespace = Some("fencing".to_string());
    request.metadata.uid = Some("0123456789abcdef".to_string());
    request
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn registry() -> ConfigRegistry {
    let registry = ConfigRegistry::new();
    registry.upsert("catch-all", CATCH_ALL).unwrap();
    registry.upsert("rack-1", RACK_CONFIG).unwrap();
    registry
}

#[test]
fn most_specific_configuration_wins() {
    let snapshot = registry().snapshot();

    let rack = select_config(None, "badhost", &labels(&[("rack", "r1")]), &snapshot).unwrap();
    assert_eq!(rack.name, "rack-1");

    let other = select_config(None, "otherhost", &labels(&[("rack", "r2")]), &snapshot).unwrap();
    assert_eq!(other.name, "catch-all");

    let sticky = select_config(Some("catch-all"), "badhost", &labels(&[("rack", "r1")]), &snapshot)
        .unwrap();
    assert_eq!(sticky.name, "catch-all");
}

#[test]
fn no_matching_configuration_is_reported() {
    let registry = ConfigRegistry::new();
    registry.upsert("rack-1", RACK_CONFIG).unwrap();

    let err = select_config(None, "n1", &BTreeMap::new(), &registry.snapshot()).unwrap_err();
    assert_eq!(
        err,
        FencingError::NoConfig {
            target: "n1".to_string()
        }
    );
}

#[test]
fn dynamic_values_resolve_per_target() {
    let config = registry().get("rack-1").unwrap();
    let method = &config.methods[0];

    let bad = build_job(&request("badhost"), &config, method, &settings()).unwrap();
    let command = bad.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
        .command
        .clone()
        .unwrap();
    assert_eq!(command, vec!["echo", "--ip", "10.0.0.9", "--host", "badhost"]);

    let other = build_job(&request("otherhost"), &config, method, &settings()).unwrap();
    let command = other.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
        .command
        .clone()
        .unwrap();
    assert_eq!(command, vec!["echo", "--ip", "127.0.0.1", "--host", "otherhost"]);

    let spec = bad.spec.unwrap();
    assert_eq!(spec.backoff_limit, Some(2));
    let owner = &bad.metadata.owner_references.unwrap()[0];
    assert_eq!(owner.kind, "FencingRequest");
    assert_eq!(owner.controller, Some(true));
}

#[test]
fn secrets_are_mounted_for_env_mechanisms() {
    let config = registry().get("rack-1").unwrap();
    let job = build_job(&request("badhost"), &config, &config.methods[1], &settings()).unwrap();
    let pod = job.spec.unwrap().template.spec.unwrap();

    let volumes = pod.volumes.unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(
        volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
        Some("openstack-creds")
    );

    let env = pod.containers[0].env.clone().unwrap();
    assert!(env
        .iter()
        .any(|e| e.name == "INSTANCE" && e.value.as_deref() == Some("badhost")));
    assert!(!env
        .iter()
        .any(|e| e.value.as_deref() == Some("openstack-creds") && e.name == "OS_PASSWORD"));
}

#[test]
fn unresolved_dynamic_value_aborts_the_method() {
    let raw = r"
methods:
- name: strict
  mechanisms:
  - driver: echo
    dynamicConfig:
    - field: port
      values:
        badhost: '3'
";
    let registry = ConfigRegistry::new();
    registry.upsert("strict", raw).unwrap();
    let config = registry.get("strict").unwrap();

    let err = build_job(&request("otherhost"), &config, &config.methods[0], &settings()).unwrap_err();
    assert!(matches!(err, FencingError::MethodAborted { ref method, .. } if method == "strict"));
    assert!(err.to_string().contains("No value of 'port' found for 'otherhost'"));
}

#[test]
fn methods_escalate_in_declared_order() {
    let config = registry().get("rack-1").unwrap();
    let early = Duration::from_secs(10);
    let late = Duration::from_secs(600);

    assert_eq!(
        next_step(&config, None, JobState::Missing, early),
        Decision::Dispatch { index: 0 }
    );
    assert_eq!(
        next_step(&config, Some("ipmi"), JobState::Running, early),
        Decision::Wait {
            method: "ipmi".to_string()
        }
    );
    assert_eq!(
        next_step(&config, Some("ipmi"), JobState::Failed, early),
        Decision::Dispatch { index: 1 }
    );
    assert_eq!(
        next_step(&config, Some("nova"), JobState::Failed, early),
        Decision::Delay {
            index: 2,
            remaining: Duration::from_secs(290)
        }
    );
    assert_eq!(
        next_step(&config, Some("nova"), JobState::Failed, late),
        Decision::Dispatch { index: 2 }
    );
    assert_eq!(
        next_step(&config, Some("manual"), JobState::Failed, late),
        Decision::Exhausted {
            last: Some("manual".to_string())
        }
    );
    assert_eq!(
        next_step(&config, Some("nova"), JobState::Succeeded, late),
        Decision::Complete {
            method: "nova".to_string()
        }
    );
}
