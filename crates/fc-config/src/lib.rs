//! FlowCatalyst Endpoint Configuration
//!
//! TOML model for endpoint trees:
//! - `[defaults]`: environment-wide settings such as the global timeout
//! - `[[endpoints]]`: address, failover, HTTP-status failover and resolving endpoints
//! - `[endpoints.policy]`: resilience policy; every field takes a literal or a
//!   `${...}` expression evaluated per message
//!
//! Children are referenced by name. `validate()` checks references, required
//! fields per kind, duplicate names and cycles before anything is built.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use fc_common::TimeoutAction;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_GLOBAL_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid endpoint configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Values
// ============================================================================

/// A policy value: either a literal or an expression string such as `${ctx:retries}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue<T> {
    Literal(T),
    Expression(String),
}

impl<T> ConfigValue<T> {
    pub fn expression(&self) -> Option<&str> {
        match self {
            ConfigValue::Expression(expr) => Some(expr),
            ConfigValue::Literal(_) => None,
        }
    }
}

/// True when a string uses the `${source:path}` expression syntax
pub fn is_expression(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.starts_with("${") && trimmed.ends_with('}') && trimmed.contains(':')
}

// ============================================================================
// Endpoint Definitions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_global_timeout_ms")]
    pub global_timeout_ms: u64,
}

fn default_global_timeout_ms() -> u64 {
    DEFAULT_GLOBAL_TIMEOUT_MS
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            global_timeout_ms: DEFAULT_GLOBAL_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Address,
    Failover,
    HttpStatusFailover,
    Resolving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverModeConfig {
    #[default]
    Dynamic,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyScopeConfig {
    #[default]
    Default,
    Transport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub name: String,
    /// Literal text, or an expression when written as `${...}`
    pub value: String,
    #[serde(default)]
    pub scope: PropertyScopeConfig,
}

/// Resilience policy as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub timeout_duration_ms: Option<ConfigValue<u64>>,
    pub timeout_action: Option<ConfigValue<TimeoutAction>>,
    pub initial_suspend_duration_ms: Option<ConfigValue<i64>>,
    pub suspend_progression_factor: Option<ConfigValue<f64>>,
    pub suspend_maximum_duration_ms: Option<ConfigValue<u64>>,
    pub suspend_error_codes: Option<ConfigValue<Vec<i32>>>,
    pub timeout_error_codes: Option<ConfigValue<Vec<i32>>>,
    pub retries_on_timeout_before_suspend: Option<ConfigValue<u32>>,
    pub retry_duration_on_timeout_ms: Option<ConfigValue<u64>>,
    pub retry_disabled_error_codes: Option<ConfigValue<Vec<i32>>>,
    pub retry_enabled_error_codes: Option<ConfigValue<Vec<i32>>>,
    /// Outgoing message format; any value forces message conversion
    pub format: Option<String>,
    #[serde(default)]
    pub security_enabled: bool,
    #[serde(default)]
    pub reliable_messaging_enabled: bool,
}

impl PolicyConfig {
    fn expressions(&self) -> Vec<(&'static str, &str)> {
        let fields: [(&'static str, Option<&str>); 11] = [
            ("timeout_duration_ms", expr_of(&self.timeout_duration_ms)),
            ("timeout_action", expr_of(&self.timeout_action)),
            ("initial_suspend_duration_ms", expr_of(&self.initial_suspend_duration_ms)),
            ("suspend_progression_factor", expr_of(&self.suspend_progression_factor)),
            ("suspend_maximum_duration_ms", expr_of(&self.suspend_maximum_duration_ms)),
            ("suspend_error_codes", expr_of(&self.suspend_error_codes)),
            ("timeout_error_codes", expr_of(&self.timeout_error_codes)),
            ("retries_on_timeout_before_suspend", expr_of(&self.retries_on_timeout_before_suspend)),
            ("retry_duration_on_timeout_ms", expr_of(&self.retry_duration_on_timeout_ms)),
            ("retry_disabled_error_codes", expr_of(&self.retry_disabled_error_codes)),
            ("retry_enabled_error_codes", expr_of(&self.retry_enabled_error_codes)),
        ];
        fields
            .into_iter()
            .filter_map(|(field, expr)| expr.map(|e| (field, e)))
            .collect()
    }
}

fn expr_of<T>(value: &Option<ConfigValue<T>>) -> Option<&str> {
    value.as_ref().and_then(|v| v.expression())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name; unnamed endpoints get an anonymous name at build time
    pub name: Option<String>,
    pub kind: EndpointKind,
    /// Destination address (address endpoints)
    pub address: Option<String>,
    /// Routing mode (failover endpoints)
    #[serde(default)]
    pub mode: FailoverModeConfig,
    /// Child endpoint names, in priority order
    #[serde(default)]
    pub children: Vec<String>,
    /// Status codes that trigger failover (HTTP status failover endpoints)
    #[serde(default)]
    pub failover_http_status_codes: Vec<u16>,
    /// Library key to delegate to (resolving endpoints)
    pub key: Option<String>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl EndpointsConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EndpointsConfig = toml::from_str(content)?;
        config.validate()?;
        debug!(endpoints = config.endpoints.len(), "Parsed endpoint configuration");
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name.as_deref() == Some(name))
    }

    /// Endpoints no other endpoint references as a child
    pub fn roots(&self) -> Vec<&EndpointConfig> {
        let referenced: HashSet<&str> = self
            .endpoints
            .iter()
            .flat_map(|e| e.children.iter().map(String::as_str))
            .collect();

        self.endpoints
            .iter()
            .filter(|e| e.name.as_deref().map_or(true, |n| !referenced.contains(n)))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if let Some(name) = &endpoint.name {
                if name.trim().is_empty() {
                    return Err(ConfigError::Invalid("endpoint name must not be blank".to_string()));
                }
                if !names.insert(name.as_str()) {
                    return Err(ConfigError::Invalid(format!("duplicate endpoint name '{}'", name)));
                }
            }
        }

        // a child has exactly one parent
        let mut parents: HashMap<&str, &str> = HashMap::new();
        for endpoint in &self.endpoints {
            let label = endpoint.name.as_deref().unwrap_or("<anonymous>");
            validate_kind(label, endpoint)?;

            for child in &endpoint.children {
                if !names.contains(child.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "endpoint '{}' references unknown child '{}'",
                        label, child
                    )));
                }
                if let Some(other) = parents.insert(child.as_str(), label) {
                    return Err(ConfigError::Invalid(format!(
                        "endpoint '{}' is a child of both '{}' and '{}'",
                        child, other, label
                    )));
                }
            }

            for (field, expr) in endpoint.policy.expressions() {
                if !is_expression(expr) {
                    return Err(ConfigError::Invalid(format!(
                        "endpoint '{}' policy field '{}' has invalid value '{}'",
                        label, field, expr
                    )));
                }
            }

            if let Some(ConfigValue::Literal(factor)) = &endpoint.policy.suspend_progression_factor {
                if *factor < 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "endpoint '{}' has negative suspend progression factor",
                        label
                    )));
                }
            }
        }

        self.check_cycles()
    }

    fn check_cycles(&self) -> Result<()> {
        let children: HashMap<&str, &[String]> = self
            .endpoints
            .iter()
            .filter_map(|e| e.name.as_deref().map(|n| (n, e.children.as_slice())))
            .collect();

        fn visit<'a>(
            name: &'a str,
            children: &HashMap<&'a str, &'a [String]>,
            path: &mut Vec<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> Result<()> {
            if done.contains(name) {
                return Ok(());
            }
            if path.contains(&name) {
                return Err(ConfigError::Invalid(format!(
                    "endpoint cycle detected: {} -> {}",
                    path.join(" -> "),
                    name
                )));
            }
            path.push(name);
            for child in children.get(name).copied().unwrap_or_default() {
                visit(child, children, path, done)?;
            }
            path.pop();
            done.insert(name);
            Ok(())
        }

        let mut done = HashSet::new();
        for name in children.keys() {
            visit(*name, &children, &mut Vec::new(), &mut done)?;
        }
        Ok(())
    }
}

fn validate_kind(label: &str, endpoint: &EndpointConfig) -> Result<()> {
    match endpoint.kind {
        EndpointKind::Address => {
            if endpoint.address.as_deref().map_or(true, |a| a.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!("address endpoint '{}' has no address", label)));
            }
            if !endpoint.children.is_empty() {
                return Err(ConfigError::Invalid(format!("address endpoint '{}' cannot have children", label)));
            }
        }
        EndpointKind::Failover | EndpointKind::HttpStatusFailover => {
            if endpoint.children.is_empty() {
                return Err(ConfigError::Invalid(format!("failover endpoint '{}' has no children", label)));
            }
            if endpoint.kind == EndpointKind::HttpStatusFailover
                && endpoint.failover_http_status_codes.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "http status failover endpoint '{}' has no failover status codes",
                    label
                )));
            }
        }
        EndpointKind::Resolving => {
            if endpoint.key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!("resolving endpoint '{}' has no key", label)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[defaults]
global_timeout_ms = 30000

[[endpoints]]
name = "orders"
kind = "failover"
mode = "static"
children = ["orders-a", "orders-b"]

[[endpoints]]
name = "orders-a"
kind = "address"
address = "http://a.internal/orders"

[endpoints.policy]
initial_suspend_duration_ms = 1000
suspend_progression_factor = 2.0
suspend_maximum_duration_ms = 8000
suspend_error_codes = [101503]
retries_on_timeout_before_suspend = "${ctx:retries}"
timeout_action = "discard_and_fault"

[[endpoints.properties]]
name = "x-route"
value = "orders-a"
scope = "transport"

[[endpoints]]
name = "orders-b"
kind = "address"
address = "http://b.internal/orders"
"#;

    #[test]
    fn test_parse_sample() {
        let config = EndpointsConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.defaults.global_timeout_ms, 30000);
        assert_eq!(config.endpoints.len(), 3);

        let orders = config.endpoint("orders").unwrap();
        assert_eq!(orders.kind, EndpointKind::Failover);
        assert_eq!(orders.mode, FailoverModeConfig::Static);

        let a = config.endpoint("orders-a").unwrap();
        assert_eq!(a.policy.initial_suspend_duration_ms, Some(ConfigValue::Literal(1000)));
        assert_eq!(a.policy.suspend_error_codes, Some(ConfigValue::Literal(vec![101503])));
        assert_eq!(
            a.policy.retries_on_timeout_before_suspend,
            Some(ConfigValue::Expression("${ctx:retries}".to_string()))
        );
        assert_eq!(
            a.policy.timeout_action,
            Some(ConfigValue::Literal(TimeoutAction::DiscardAndFault))
        );
        assert_eq!(a.properties[0].scope, PropertyScopeConfig::Transport);
    }

    #[test]
    fn test_roots() {
        let config = EndpointsConfig::from_toml_str(SAMPLE).unwrap();
        let roots: Vec<_> = config.roots().iter().filter_map(|e| e.name.clone()).collect();
        assert_eq!(roots, vec!["orders".to_string()]);
    }

    #[test]
    fn test_defaults_applied() {
        let config = EndpointsConfig::from_toml_str(
            r#"
[[endpoints]]
name = "solo"
kind = "address"
address = "http://solo"
"#,
        )
        .unwrap();
        assert_eq!(config.defaults.global_timeout_ms, DEFAULT_GLOBAL_TIMEOUT_MS);
        assert!(config.endpoint("solo").unwrap().policy.timeout_duration_ms.is_none());
    }

    #[test]
    fn test_unknown_child_rejected() {
        let err = EndpointsConfig::from_toml_str(
            r#"
[[endpoints]]
name = "fo"
kind = "failover"
children = ["missing"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown child 'missing'"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = EndpointsConfig::from_toml_str(
            r#"
[[endpoints]]
name = "a"
kind = "address"
address = "http://a"

[[endpoints]]
name = "a"
kind = "address"
address = "http://a2"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate endpoint name"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = EndpointsConfig::from_toml_str(
            r#"
[[endpoints]]
name = "x"
kind = "failover"
children = ["y"]

[[endpoints]]
name = "y"
kind = "failover"
children = ["x"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_shared_child_rejected() {
        let err = EndpointsConfig::from_toml_str(
            r#"
[[endpoints]]
name = "left"
kind = "failover"
children = ["shared"]

[[endpoints]]
name = "right"
kind = "failover"
children = ["shared"]

[[endpoints]]
name = "shared"
kind = "address"
address = "http://shared"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("child of both 'left' and 'right'"));
    }

    #[test]
    fn test_bad_expression_rejected() {
        let err = EndpointsConfig::from_toml_str(
            r#"
[[endpoints]]
name = "a"
kind = "address"
address = "http://a"

[endpoints.policy]
initial_suspend_duration_ms = "soon"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("initial_suspend_duration_ms"));
    }

    #[test]
    fn test_missing_address_rejected() {
        let err = EndpointsConfig::from_toml_str(
            r#"
[[endpoints]]
name = "a"
kind = "address"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = EndpointsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.endpoints.len(), 3);
    }

    #[test]
    fn test_missing_file() {
        let err = EndpointsConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
