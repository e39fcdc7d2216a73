use crate::crds::{FencingRequest, TARGET_LABEL};
use crate::fencing::ResourceNaming;
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};

/// Request and workload access used by the node monitor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Requests labelled with `target`
    async fn requests_for_target(&self, target: &str) -> Result<Vec<FencingRequest>>;

    /// Create a request; `409` maps to `Error::AlreadyExists`
    async fn create_request(&self, request: &FencingRequest) -> Result<()>;

    /// Delete a request; an already deleted request is not an error
    async fn delete_request(&self, name: &str) -> Result<()>;

    /// `namespace/name` of pods on `node` that mount PersistentVolumeClaims
    async fn durable_workloads(&self, node: &str) -> Result<Vec<String>>;
}

pub struct KubeRequestStore {
    requests: Api<FencingRequest>,
    pods: Api<Pod>,
}

impl KubeRequestStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            requests: Api::namespaced(client.clone(), namespace),
            pods: Api::all(client),
        }
    }
}

#[async_trait]
impl RequestStore for KubeRequestStore {
    async fn requests_for_target(&self, target: &str) -> Result<Vec<FencingRequest>> {
        let selector = format!("{TARGET_LABEL}={}", ResourceNaming::label_value(target));
        let list = self
            .requests
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items)
    }

    async fn create_request(&self, request: &FencingRequest) -> Result<()> {
        match self.requests.create(&PostParams::default(), request).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(Error::AlreadyExists(request.name_any()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_request(&self, name: &str) -> Result<()> {
        match self.requests.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn durable_workloads(&self, node: &str) -> Result<Vec<String>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let pods = self.pods.list(&params).await?;
        Ok(pods
            .items
            .iter()
            .filter(|pod| mounts_claims(pod))
            .map(|pod| {
                format!(
                    "{}/{}",
                    pod.namespace().unwrap_or_default(),
                    pod.name_any()
                )
            })
            .collect())
    }
}

/// Whether a pod mounts any PersistentVolumeClaim
pub fn mounts_claims(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|v| v.persistent_volume_claim.is_some()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimVolumeSource, PodSpec, Volume};

    #[test]
    fn only_claim_volumes_count() {
        let mut pod = Pod {
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "scratch".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!mounts_claims(&pod));

        if let Some(spec) = pod.spec.as_mut() {
            spec.volumes.get_or_insert_with(Vec::new).push(Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: "data-0".to_string(),
                    read_only: None,
                }),
                ..Default::default()
            });
        }
        assert!(mounts_claims(&pod));
    }
}
