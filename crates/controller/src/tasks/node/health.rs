use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeHealth {
    /// `Ready=True`, with the time it became ready if reported
    Healthy { since: Option<DateTime<Utc>> },
    /// `Ready=Unknown`, but not for long enough to act on
    Suspect { remaining: Duration },
    /// `Ready=Unknown` for longer than the window: the kubelet is gone
    Failed { since: DateTime<Utc> },
    /// `Ready=False`: the kubelet is alive and reporting a problem itself
    NotReady,
    /// No Ready condition at all
    Unknown,
}

/// Classify a node from its Ready condition.
///
/// Only a lost heartbeat (`Unknown`) is a fencing signal; a kubelet that
/// reports `False` is still in control of the node.
pub fn assess_node(node: &Node, now: DateTime<Utc>, window: Duration) -> NodeHealth {
    let Some(ready) = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
    else {
        return NodeHealth::Unknown;
    };

    let since = ready.last_transition_time.as_ref().map(|t| t.0);
    match ready.status.as_str() {
        "True" => NodeHealth::Healthy { since },
        "False" => NodeHealth::NotReady,
        _ => {
            let since = since.unwrap_or(now);
            let elapsed = (now - since).to_std().unwrap_or_default();
            if elapsed > window {
                NodeHealth::Failed { since }
            } else {
                NodeHealth::Suspect {
                    remaining: window - elapsed,
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    pub(crate) fn node(name: &str, ready: Option<(&str, DateTime<Utc>)>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: ready.map(|(status, at)| {
                    vec![NodeCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        last_transition_time: Some(Time(at)),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    const WINDOW: Duration = Duration::from_secs(40);

    #[test]
    fn unknown_beyond_window_is_failed() {
        let now = Utc::now();
        let since = now - chrono::Duration::seconds(41);
        assert_eq!(
            assess_node(&node("n1", Some(("Unknown", since))), now, WINDOW),
            NodeHealth::Failed { since }
        );
    }

    #[test]
    fn unknown_within_window_is_suspect() {
        let now = Utc::now();
        let since = now - chrono::Duration::seconds(10);
        assert_eq!(
            assess_node(&node("n1", Some(("Unknown", since))), now, WINDOW),
            NodeHealth::Suspect {
                remaining: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn ready_and_not_ready() {
        let now = Utc::now();
        assert_eq!(
            assess_node(&node("n1", Some(("True", now))), now, WINDOW),
            NodeHealth::Healthy { since: Some(now) }
        );
        assert_eq!(
            assess_node(&node("n1", Some(("False", now))), now, WINDOW),
            NodeHealth::NotReady
        );
        assert_eq!(assess_node(&node("n1", None), now, WINDOW), NodeHealth::Unknown);
    }
}
