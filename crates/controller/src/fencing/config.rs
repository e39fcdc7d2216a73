//! Fencing configuration model
//!
//! A configuration is YAML text stored under a data key of a ConfigMap:
//!
//! ```yaml
//! nodeSelector:
//!   topology.kubernetes.io/zone: rack-1
//! methods:
//! - name: ipmi
//!   retries: 2
//!   mechanisms:
//!   - driver: baremetal
//!     module: ipmilan
//!     passTargetAs: plug
//!     config:
//!       username: admin
//!     dynamicConfig:
//!     - field: ip
//!       default: 127.0.0.1
//!       values:
//!         worker-1: 10.0.0.11
//!     secrets:
//!       password: ipmi-secret
//! - name: nova
//!   requireAfterSeconds: 120
//!   mechanisms:
//!   - driver: openstack
//!     argumentFormat: env
//! ```
//!
//! Method order is significant: escalation walks the list top to bottom.

use super::error::{EngineResult, FencingError};
use super::naming::ResourceNaming;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

fn default_retries() -> i32 {
    1
}

fn default_stop_on_success() -> bool {
    true
}

fn default_argument_format() -> String {
    "cli".to_string()
}

/// Parsed fencing configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FencingConfig {
    /// Name of the source the configuration came from (set by the registry)
    #[serde(default)]
    pub name: String,

    /// Node labels a target must carry for this configuration to apply
    #[serde(default, deserialize_with = "scalar::string_map")]
    pub node_selector: IndexMap<String, String>,

    /// Ordered fallback list of methods
    #[serde(default)]
    pub methods: Vec<FencingMethod>,
}

/// One fencing attempt: every mechanism must succeed for the method to succeed
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FencingMethod {
    pub name: String,

    /// Retry budget handed to the Job (`backoffLimit`)
    #[serde(default = "default_retries")]
    pub retries: i32,

    /// Only run this method once the request has been valid for this long
    #[serde(default)]
    pub require_after_seconds: Option<u32>,

    /// Finish the request when this method succeeds
    #[serde(default = "default_stop_on_success")]
    pub stop_on_success: bool,

    #[serde(default)]
    pub mechanisms: Vec<FencingMechanism>,
}

/// Driver behind a mechanism
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MechanismDriver {
    /// fence-agents against a BMC (`/sbin/fence_<module>`)
    Baremetal,
    /// Delete the instance through the OpenStack nova client
    Openstack,
    /// No-op driver that only echoes its arguments
    Echo,
    /// Image and command come entirely from the mechanism
    Custom,
}

impl MechanismDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            MechanismDriver::Baremetal => "baremetal",
            MechanismDriver::Openstack => "openstack",
            MechanismDriver::Echo => "echo",
            MechanismDriver::Custom => "custom",
        }
    }

    /// Image used when the mechanism does not name one
    pub fn default_image(&self) -> Option<&'static str> {
        match self {
            MechanismDriver::Baremetal => Some("quay.io/beekhof/rhelha-fencing"),
            MechanismDriver::Openstack => Some("quay.io/beekhof/openstack-novaclient"),
            MechanismDriver::Echo => Some("busybox"),
            MechanismDriver::Custom => None,
        }
    }

    /// Base command used when the mechanism does not supply one
    pub fn default_command(&self, module: Option<&str>) -> Vec<String> {
        match self {
            MechanismDriver::Baremetal => {
                vec![format!("/sbin/fence_{}", module.unwrap_or_default())]
            }
            MechanismDriver::Openstack => vec!["/bin/nova".to_string(), "delete".to_string()],
            MechanismDriver::Echo => vec!["echo".to_string()],
            MechanismDriver::Custom => Vec::new(),
        }
    }
}

impl fmt::Display for MechanismDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete, driver-specific fencing action
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FencingMechanism {
    pub driver: MechanismDriver,

    /// fence-agents module for the baremetal driver (e.g. "ipmilan")
    #[serde(default)]
    pub module: Option<String>,

    /// Explicit container image, overrides the driver default
    #[serde(default)]
    pub image: Option<String>,

    /// Explicit base command, overrides the driver default
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// "cli" or "env"; validated when the mechanism is built
    #[serde(default = "default_argument_format")]
    pub argument_format: String,

    /// Flag (cli) or variable (env) name under which the target is passed
    #[serde(default)]
    pub pass_target_as: Option<String>,

    #[serde(default)]
    pub timeout_seconds: Option<u32>,

    /// Static key/value configuration, in declaration order
    #[serde(default, deserialize_with = "scalar::string_map")]
    pub config: IndexMap<String, String>,

    /// Per-target values
    #[serde(default)]
    pub dynamic_config: Vec<DynamicConfig>,

    /// Logical name -> Secret name; mounted, never inlined
    #[serde(default, deserialize_with = "scalar::string_map")]
    pub secrets: IndexMap<String, String>,

    /// Extra plain environment for the container
    #[serde(default, deserialize_with = "scalar::string_map")]
    pub env: IndexMap<String, String>,
}

/// A configuration field whose value depends on the target
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConfig {
    pub field: String,

    #[serde(default, deserialize_with = "scalar::opt_string")]
    pub default: Option<String>,

    #[serde(default, deserialize_with = "scalar::string_map")]
    pub values: IndexMap<String, String>,
}

impl DynamicConfig {
    /// Value for `target`: exact entry, else a non-empty default
    pub fn lookup(&self, target: &str) -> Option<&str> {
        if let Some(value) = self.values.get(target) {
            return Some(value.as_str());
        }
        self.default.as_deref().filter(|d| !d.is_empty())
    }
}

impl FencingConfig {
    /// Parse and validate configuration text; nothing is returned unless the
    /// whole source is valid.
    pub fn from_yaml(name: &str, raw: &str) -> EngineResult<Self> {
        let mut config: FencingConfig =
            serde_yaml::from_str(raw).map_err(|e| FencingError::Parse {
                name: name.to_string(),
                details: e.to_string(),
            })?;
        config.name = name.to_string();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> EngineResult<()> {
        let invalid = |reason: String| FencingError::InvalidConfig {
            name: self.name.clone(),
            reason,
        };

        if self.methods.is_empty() {
            return Err(invalid("no methods defined".to_string()));
        }

        let mut seen = HashSet::new();
        // Job names and method labels are lowercased and sanitized
        let mut name_forms = HashSet::new();
        let mut label_forms = HashSet::new();
        for method in &self.methods {
            if method.name.trim().is_empty() {
                return Err(invalid("method without a name".to_string()));
            }
            if !seen.insert(method.name.as_str()) {
                return Err(invalid(format!("duplicate method '{}'", method.name)));
            }
            if !name_forms.insert(ResourceNaming::dns_label(&method.name))
                || !label_forms.insert(ResourceNaming::label_value(&method.name))
            {
                return Err(invalid(format!(
                    "method '{}' is indistinguishable from another method once normalized for Job names and labels",
                    method.name
                )));
            }
            if method.retries < 0 {
                return Err(invalid(format!(
                    "method '{}' has negative retries",
                    method.name
                )));
            }
            if method.mechanisms.is_empty() {
                return Err(invalid(format!(
                    "method '{}' has no mechanisms",
                    method.name
                )));
            }
            for mechanism in &method.mechanisms {
                match mechanism.driver {
                    MechanismDriver::Baremetal
                        if mechanism.module.as_deref().unwrap_or("").is_empty()
                            && mechanism.command.is_none() =>
                    {
                        return Err(invalid(format!(
                            "baremetal mechanism in '{}' needs a module or a command",
                            method.name
                        )));
                    }
                    MechanismDriver::Custom
                        if mechanism.image.is_none() || mechanism.command.is_none() =>
                    {
                        return Err(invalid(format!(
                            "custom mechanism in '{}' needs an image and a command",
                            method.name
                        )));
                    }
                    _ => {}
                }
                if mechanism.dynamic_config.iter().any(|dc| dc.field.is_empty()) {
                    return Err(invalid(format!(
                        "dynamic config without a field in '{}'",
                        method.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Label-subset match against the target node's labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.node_selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// Number of label constraints; more is more specific
    pub fn specificity(&self) -> usize {
        self.node_selector.len()
    }

    /// Position and definition of a method by name
    pub fn method(&self, name: &str) -> Option<(usize, &FencingMethod)> {
        self.methods
            .iter()
            .enumerate()
            .find(|(_, method)| method.name == name)
    }
}

/// Lenient string deserialization for YAML maps: numbers and booleans are
/// accepted as strings, and the older list-of-single-entry-maps form
/// (`- user: admin`) is folded into one ordered map.
mod scalar {
    use indexmap::IndexMap;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_yaml::Value;

    fn to_string(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null => Some(String::new()),
            _ => None,
        }
    }

    fn fold<E: serde::de::Error>(
        mapping: &serde_yaml::Mapping,
        out: &mut IndexMap<String, String>,
    ) -> Result<(), E> {
        for (key, value) in mapping {
            let key = to_string(key).ok_or_else(|| E::custom("map keys must be scalars"))?;
            let value = to_string(value)
                .ok_or_else(|| E::custom(format!("value of '{key}' must be a scalar")))?;
            out.insert(key, value);
        }
        Ok(())
    }

    pub fn string_map<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut out = IndexMap::new();
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => {}
            Some(Value::Mapping(mapping)) => fold::<D::Error>(&mapping, &mut out)?,
            Some(Value::Sequence(items)) => {
                for item in items {
                    match item {
                        Value::Mapping(mapping) => fold::<D::Error>(&mapping, &mut out)?,
                        _ => return Err(D::Error::custom("list entries must be maps")),
                    }
                }
            }
            Some(_) => return Err(D::Error::custom("expected a map")),
        }
        Ok(out)
    }

    pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => to_string(&value)
                .map(Some)
                .ok_or_else(|| D::Error::custom("expected a scalar")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPMI_CONFIG: &str = r"
nodeSelector:
  rack: r1
methods:
- name: ipmi
  retries: 2
  mechanisms:
  - driver: baremetal
    module: ipmilan
    passTargetAs: plug
    config:
      username: admin
      lanplus: true
      port: 623
    dynamicConfig:
    - field: ip
      default: 127.0.0.1
      values:
        worker-1: 10.0.0.11
    secrets:
      password: ipmi-secret
- name: nova
  stopOnSuccess: false
  requireAfterSeconds: 120
  mechanisms:
  - driver: openstack
    argumentFormat: env
";

    #[test]
    fn test_config_deserialization() {
        let config = FencingConfig::from_yaml("rack-1", IPMI_CONFIG).unwrap();

        assert_eq!(config.name, "rack-1");
        assert_eq!(config.node_selector.get("rack").map(String::as_str), Some("r1"));
        assert_eq!(config.methods.len(), 2);

        let ipmi = &config.methods[0];
        assert_eq!(ipmi.name, "ipmi");
        assert_eq!(ipmi.retries, 2);
        assert!(ipmi.stop_on_success);
        assert_eq!(ipmi.require_after_seconds, None);

        let mechanism = &ipmi.mechanisms[0];
        assert_eq!(mechanism.driver, MechanismDriver::Baremetal);
        assert_eq!(mechanism.argument_format, "cli");
        let keys: Vec<_> = mechanism.config.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["username", "lanplus", "port"]);
        assert_eq!(mechanism.config["lanplus"], "true");
        assert_eq!(mechanism.config["port"], "623");
        assert_eq!(mechanism.secrets["password"], "ipmi-secret");

        let nova = &config.methods[1];
        assert_eq!(nova.retries, 1);
        assert!(!nova.stop_on_success);
        assert_eq!(nova.require_after_seconds, Some(120));
    }

    #[test]
    fn list_form_maps_are_folded_in_order() {
        let raw = r"
methods:
- name: echo
  mechanisms:
  - driver: echo
    dynamicConfig:
    - field: ip
      default: 127.0.0.1
      values:
      - somehost: 1.2.3.4
      - otherhost: 1.2.3.5
    config:
    - user: admin
    secrets:
    - password: ipmi-secret
";
        let config = FencingConfig::from_yaml("legacy", raw).unwrap();
        let mechanism = &config.methods[0].mechanisms[0];
        assert_eq!(mechanism.config["user"], "admin");
        assert_eq!(mechanism.secrets["password"], "ipmi-secret");
        assert_eq!(mechanism.dynamic_config[0].lookup("otherhost"), Some("1.2.3.5"));
    }

    #[test]
    fn dynamic_lookup_prefers_exact_then_default() {
        let mut values = IndexMap::new();
        values.insert("badhost".to_string(), "10.0.0.9".to_string());
        let dc = DynamicConfig {
            field: "ip".to_string(),
            default: Some("127.0.0.1".to_string()),
            values,
        };
        assert_eq!(dc.lookup("badhost"), Some("10.0.0.9"));
        assert_eq!(dc.lookup("otherhost"), Some("127.0.0.1"));

        let no_default = DynamicConfig {
            default: Some(String::new()),
            ..dc
        };
        assert_eq!(no_default.lookup("otherhost"), None);
    }

    #[test]
    fn malformed_sources_fail_atomically() {
        let unknown_driver = "methods:\n- name: a\n  mechanisms:\n  - driver: toaster\n";
        assert!(matches!(
            FencingConfig::from_yaml("bad", unknown_driver),
            Err(FencingError::Parse { .. })
        ));

        let duplicate = "methods:\n- name: a\n  mechanisms:\n  - driver: echo\n- name: a\n  mechanisms:\n  - driver: echo\n";
        assert!(matches!(
            FencingConfig::from_yaml("dup", duplicate),
            Err(FencingError::InvalidConfig { .. })
        ));

        let empty_method = "methods:\n- name: a\n  mechanisms: []\n";
        assert!(FencingConfig::from_yaml("empty", empty_method).is_err());

        let no_module = "methods:\n- name: a\n  mechanisms:\n  - driver: baremetal\n";
        assert!(FencingConfig::from_yaml("nomodule", no_module).is_err());

        assert!(FencingConfig::from_yaml("nomethods", "nodeSelector: {}\n").is_err());
    }

    #[test]
    fn method_names_must_stay_distinct_in_job_names() {
        for (first, second) in [("ipmi", "IPMI"), ("ipmi.lan", "ipmi_lan"), ("a b", "a-b")] {
            let raw = format!(
                "methods:\n- name: {first}\n  mechanisms:\n  - driver: echo\n- name: '{second}'\n  mechanisms:\n  - driver: echo\n"
            );
            let err = FencingConfig::from_yaml("case", &raw).unwrap_err();
            assert!(
                matches!(err, FencingError::InvalidConfig { ref reason, .. } if reason.contains("indistinguishable")),
                "{first} / {second}: {err}"
            );
        }

        let distinct = "methods:\n- name: ipmi\n  mechanisms:\n  - driver: echo\n- name: ipmi-2\n  mechanisms:\n  - driver: echo\n";
        assert!(FencingConfig::from_yaml("ok", distinct).is_ok());
    }

    #[test]
    fn selector_matching_is_label_subset() {
        let config = FencingConfig::from_yaml("rack-1", IPMI_CONFIG).unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("kubernetes.io/hostname".to_string(), "worker-1".to_string());
        assert!(!config.matches(&labels));

        labels.insert("rack".to_string(), "r1".to_string());
        assert!(config.matches(&labels));
        assert_eq!(config.specificity(), 1);

        labels.insert("rack".to_string(), "r2".to_string());
        assert!(!config.matches(&labels));
    }

    #[test]
    fn method_lookup_returns_declared_position() {
        let config = FencingConfig::from_yaml("rack-1", IPMI_CONFIG).unwrap();
        assert_eq!(config.method("nova").map(|(i, _)| i), Some(1));
        assert!(config.method("missing").is_none());
    }
}
