use super::config::FencingConfig;
use super::error::{EngineResult, FencingError};
use super::registry::ConfigSnapshot;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Pick the configuration that applies to `target`.
///
/// A sticky name recorded on the request wins while it still resolves.
/// Otherwise every configuration whose selector is a subset of the node's
/// labels is a candidate and the one with the most constraints wins; ties go to
/// the configuration seen first.
pub fn select_config(
    sticky: Option<&str>,
    target: &str,
    node_labels: &BTreeMap<String, String>,
    snapshot: &ConfigSnapshot,
) -> EngineResult<Arc<FencingConfig>> {
    if let Some(name) = sticky {
        if let Some(config) = snapshot.get(name) {
            return Ok(Arc::clone(config));
        }
        debug!(config = %name, target = %target, "Sticky configuration vanished, reselecting");
    }

    let mut best: Option<&Arc<FencingConfig>> = None;
    for candidate in snapshot.iter().filter(|c| c.matches(node_labels)) {
        // ties keep the first-seen config
        match best {
            Some(current) if candidate.specificity() <= current.specificity() => {}
            _ => best = Some(candidate),
        }
    }

    best.cloned().ok_or_else(|| FencingError::NoConfig {
        target: target.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn config(name: &str, selector: &[(&str, &str)]) -> FencingConfig {
        FencingConfig {
            name: name.to_string(),
            node_selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<IndexMap<_, _>>(),
            methods: Vec::new(),
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn most_specific_match_wins() {
        let snapshot: ConfigSnapshot = vec![
            config("catch-all", &[]),
            config("rack", &[("rack", "r1")]),
            config("rack-zone", &[("rack", "r1"), ("zone", "z1")]),
        ]
        .into_iter()
        .collect();

        let node = labels(&[("rack", "r1"), ("zone", "z1"), ("extra", "x")]);
        let chosen = select_config(None, "worker-1", &node, &snapshot).unwrap();
        assert_eq!(chosen.name, "rack-zone");

        let other = labels(&[("rack", "r2")]);
        let chosen = select_config(None, "worker-2", &other, &snapshot).unwrap();
        assert_eq!(chosen.name, "catch-all");
    }

    #[test]
    fn ties_go_to_first_seen() {
        let snapshot: ConfigSnapshot = vec![
            config("first", &[("rack", "r1")]),
            config("second", &[("zone", "z1")]),
        ]
        .into_iter()
        .collect();

        let node = labels(&[("rack", "r1"), ("zone", "z1")]);
        for _ in 0..3 {
            let chosen = select_config(None, "worker-1", &node, &snapshot).unwrap();
            assert_eq!(chosen.name, "first");
        }
    }

    #[test]
    fn sticky_config_is_kept_while_it_exists() {
        let snapshot: ConfigSnapshot = vec![
            config("general", &[]),
            config("specific", &[("rack", "r1")]),
        ]
        .into_iter()
        .collect();
        let node = labels(&[("rack", "r1")]);

        let chosen = select_config(Some("general"), "worker-1", &node, &snapshot).unwrap();
        assert_eq!(chosen.name, "general");

        let chosen = select_config(Some("deleted"), "worker-1", &node, &snapshot).unwrap();
        assert_eq!(chosen.name, "specific");
    }

    #[test]
    fn no_candidate_is_no_config() {
        let snapshot: ConfigSnapshot = vec![config("rack", &[("rack", "r1")])]
            .into_iter()
            .collect();
        let err = select_config(None, "worker-9", &BTreeMap::new(), &snapshot).unwrap_err();
        assert_eq!(
            err,
            FencingError::NoConfig {
                target: "worker-9".to_string()
            }
        );
    }
}
