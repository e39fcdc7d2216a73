//! Method -> Job
//!
//! A fencing method runs as one `batch/v1` Job with one container per
//! mechanism. The Job is owned by its `FencingRequest` so the request
//! controller sees its status changes, and so cascading deletion of the request
//! takes the Job with it.

use super::config::{FencingConfig, FencingMethod};
use super::error::{EngineResult, FencingError};
use super::mechanism::{build_mechanism, BuildSettings};
use super::naming::ResourceNaming;
use crate::crds::{FencingRequest, TARGET_LABEL};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

pub const APP_LABEL: &str = "app";
pub const APP_NAME: &str = "fencing-controller";
pub const REQUEST_LABEL: &str = "fencing.clusterlabs.org/request";
pub const CONFIG_LABEL: &str = "fencing.clusterlabs.org/config";
pub const METHOD_LABEL: &str = "fencing.clusterlabs.org/method";

/// Build the Job executing `method` of `config` for `request`.
///
/// Every mechanism must build; the first failure rejects the whole method and
/// no partial Job is returned.
pub fn build_job(
    request: &FencingRequest,
    config: &FencingConfig,
    method: &FencingMethod,
    settings: &BuildSettings,
) -> EngineResult<Job> {
    let target = request.spec.target.as_str();

    let mut containers = Vec::with_capacity(method.mechanisms.len());
    let mut volumes = Vec::new();
    for (index, mechanism) in method.mechanisms.iter().enumerate() {
        let unit = build_mechanism(mechanism, index, target, request.spec.operation, settings)
            .map_err(|e| FencingError::MethodAborted {
                method: method.name.clone(),
                reason: e.to_string(),
            })?;
        containers.push(unit.container);
        volumes.extend(unit.volumes);
    }

    let labels = job_labels(request, config, method);
    let owner_ref = OwnerReference {
        api_version: FencingRequest::api_version(&()).to_string(),
        kind: FencingRequest::kind(&()).to_string(),
        name: request.name_any(),
        uid: request.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    let active_deadline_seconds = method
        .mechanisms
        .iter()
        .filter_map(|m| m.timeout_seconds)
        .max()
        .map(|timeout| i64::from(timeout) * (i64::from(method.retries) + 1));

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(ResourceNaming::job_name(request, &method.name)),
            namespace: request.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(method.retries),
            active_deadline_seconds,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    restart_policy: Some("OnFailure".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn job_labels(
    request: &FencingRequest,
    config: &FencingConfig,
    method: &FencingMethod,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), APP_NAME.to_string());
    labels.insert(
        TARGET_LABEL.to_string(),
        ResourceNaming::label_value(&request.spec.target),
    );
    labels.insert(
        REQUEST_LABEL.to_string(),
        ResourceNaming::label_value(&request.name_any()),
    );
    labels.insert(
        CONFIG_LABEL.to_string(),
        ResourceNaming::label_value(&config.name),
    );
    labels.insert(
        METHOD_LABEL.to_string(),
        ResourceNaming::label_value(&method.name),
    );
    labels
}

/// Label selector matching the Jobs of one method of one request
pub fn job_selector(request_name: &str, method: &str) -> String {
    format!(
        "{REQUEST_LABEL}={},{METHOD_LABEL}={}",
        ResourceNaming::label_value(request_name),
        ResourceNaming::label_value(method)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{FencingOperation, FencingRequestSpec};

    const CONFIG: &str = r"
methods:
- name: ipmi
  retries: 2
  mechanisms:
  - driver: baremetal
    module: ipmilan
    timeoutSeconds: 20
    secrets:
      password: ipmi-secret
  - driver: echo
    timeoutSeconds: 45
- name: broken
  mechanisms:
  - driver: echo
  - driver: echo
    dynamicConfig:
    - field: ip
      values:
        somewhere-else: 10.0.0.1
";

    fn request() -> FencingRequest {
        let mut request = FencingRequest::new(
            "fence-worker-1-1700000000",
            FencingRequestSpec {
                target: "worker-1".to_string(),
                operation: FencingOperation::Off,
                ..Default::default()
            },
        );
        request.metadata.namespace = Some("fencing".to_string());
        request.metadata.uid = Some("abcdef12-3456".to_string());
        request
    }

    fn settings() -> BuildSettings {
        BuildSettings {
            secrets_mount_root: "/etc/fencing/secrets".to_string(),
            operator_image: "fencing-controller:dev".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn job_has_one_container_per_mechanism() {
        let config = FencingConfig::from_yaml("rack-1", CONFIG).unwrap();
        let (_, method) = config.method("ipmi").unwrap();
        let job = build_job(&request(), &config, method, &settings()).unwrap();

        assert_eq!(
            job.metadata.name.as_deref(),
            Some("fence-fence-worker-1-1700000000-ipmi-abcdef12")
        );
        assert_eq!(job.metadata.namespace.as_deref(), Some("fencing"));

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(2));
        assert_eq!(spec.active_deadline_seconds, Some(45 * 3));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["fence-0-baremetal", "fence-1-echo"]);
        assert_eq!(pod.volumes.unwrap().len(), 1);
    }

    #[test]
    fn job_is_labelled_and_owned_by_request() {
        let config = FencingConfig::from_yaml("rack-1", CONFIG).unwrap();
        let (_, method) = config.method("ipmi").unwrap();
        let job = build_job(&request(), &config, method, &settings()).unwrap();

        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels[APP_LABEL], APP_NAME);
        assert_eq!(labels[TARGET_LABEL], "worker-1");
        assert_eq!(labels[REQUEST_LABEL], "fence-worker-1-1700000000");
        assert_eq!(labels[CONFIG_LABEL], "rack-1");
        assert_eq!(labels[METHOD_LABEL], "ipmi");

        let owner = &job.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.api_version, "fencing.clusterlabs.org/v1alpha1");
        assert_eq!(owner.kind, "FencingRequest");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[test]
    fn one_failing_mechanism_aborts_the_method() {
        let config = FencingConfig::from_yaml("rack-1", CONFIG).unwrap();
        let (_, method) = config.method("broken").unwrap();
        let err = build_job(&request(), &config, method, &settings()).unwrap_err();

        assert_eq!(
            err,
            FencingError::MethodAborted {
                method: "broken".to_string(),
                reason: "No value of 'ip' found for 'worker-1'".to_string(),
            }
        );
    }

    #[test]
    fn no_deadline_without_timeouts() {
        let config = FencingConfig::from_yaml(
            "plain",
            "methods:\n- name: echo\n  mechanisms:\n  - driver: echo\n",
        )
        .unwrap();
        let job = build_job(&request(), &config, &config.methods[0], &settings()).unwrap();
        assert_eq!(job.spec.unwrap().active_deadline_seconds, None);
    }

    #[test]
    fn selector_matches_job_labels() {
        assert_eq!(
            job_selector("fence-worker-1-1700000000", "IPMI"),
            "fencing.clusterlabs.org/request=fence-worker-1-1700000000,fencing.clusterlabs.org/method=ipmi"
        );
    }
}
