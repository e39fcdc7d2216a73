use crate::crds::FencingRequest;
use kube::ResourceExt;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const MAX_LABEL_VALUE_LENGTH: usize = 63;
const FENCE_JOB_PREFIX: &str = "fence-";

pub struct ResourceNaming;

impl ResourceNaming {
    /// Job name for one method of a request.
    /// Format: fence-{request}-{method}-{uid}
    ///
    /// Deterministic for a given request and method so a repeated dispatch
    /// collides with the existing Job instead of creating a second one.
    pub fn job_name(request: &FencingRequest, method: &str) -> String {
        let name = Self::dns_label(&request.name_any());
        let method = Self::dns_label(method);
        let uid_suffix = request
            .metadata
            .uid
            .as_deref()
            .map(|uid| uid.chars().take(8).collect::<String>())
            .unwrap_or_else(|| "unknown".to_string());

        let base_name = format!("{name}-{method}-{uid_suffix}");
        let available = MAX_K8S_NAME_LENGTH.saturating_sub(FENCE_JOB_PREFIX.len());
        let trimmed = Self::ensure_k8s_name_length(&base_name, available);

        format!("{FENCE_JOB_PREFIX}{trimmed}")
    }

    /// Name for a request created by the node monitor.
    /// Format: fence-{node}-{unix seconds}
    pub fn request_name(node: &str, timestamp: i64) -> String {
        let base_name = format!("{}-{timestamp}", Self::dns_label(node));
        let available = MAX_K8S_NAME_LENGTH.saturating_sub(FENCE_JOB_PREFIX.len());
        format!(
            "{FENCE_JOB_PREFIX}{}",
            Self::ensure_k8s_name_length(&base_name, available)
        )
    }

    /// Container name for the mechanism at `index`
    pub fn container_name(index: usize, driver: &str) -> String {
        format!("fence-{index}-{}", Self::dns_label(driver))
    }

    /// Volume name for a mounted secret
    pub fn secret_volume_name(index: usize, secret: &str) -> String {
        Self::ensure_k8s_name_length(
            &format!("secret-{index}-{}", Self::dns_label(secret)),
            MAX_K8S_NAME_LENGTH,
        )
    }

    /// Coerce `input` into a valid label value. Over-long values keep a
    /// readable prefix plus a hash of the full input so distinct inputs stay
    /// distinct.
    pub fn label_value(input: &str) -> String {
        if input.is_empty() {
            return String::new();
        }

        let mut sanitized = input.to_lowercase().replace(' ', "-");
        sanitized.retain(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        let sanitized = sanitized
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string();

        if sanitized.len() <= MAX_LABEL_VALUE_LENGTH {
            return sanitized;
        }

        let hash = Self::hash_string(input);
        let keep = MAX_LABEL_VALUE_LENGTH - hash.len() - 1;
        let prefix = sanitized[..keep].trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
        format!("{prefix}-{hash}")
    }

    /// Lowercase DNS label form of `input`, as embedded in resource names
    pub fn dns_label(input: &str) -> String {
        let mut label: String = input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        while label.contains("--") {
            label = label.replace("--", "-");
        }
        let label = label.trim_matches('-');
        if label.is_empty() {
            "x".to_string()
        } else {
            label.to_string()
        }
    }

    fn ensure_k8s_name_length(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            return name.to_string();
        }
        // keep the tail (uid or timestamp) and hash the middle
        let hash = Self::hash_string(name);
        let tail = name.rsplit('-').next().unwrap_or_default();
        let reserved = hash.len() + tail.len() + 2;
        if reserved >= limit {
            return hash;
        }
        let head = name[..limit - reserved].trim_end_matches('-');
        format!("{head}-{hash}-{tail}")
    }

    fn hash_string(input: &str) -> String {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..8].to_string()
    }
}
