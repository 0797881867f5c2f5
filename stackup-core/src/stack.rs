//! Stack definition model and loader
//!
//! A stack is a named collection of service configurations plus shared
//! network/volume declarations. Everything here is read-only after load;
//! validation happens once, before any service is touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a service is started and stopped
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Container managed through the runtime driver
    Container,
    /// OS process spawned directly
    #[default]
    Process,
    /// Externally managed; only observed, never launched
    External,
}

/// The probe mechanism for a health check (at most one per service)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeKind {
    /// Shell command - exit 0 = healthy
    Command { command: String },
    /// HTTP GET - status 200 = healthy
    Http { url: String },
    /// TCP connect to localhost:port = healthy
    Tcp { port: u16 },
}

/// Health check configuration for a service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(flatten)]
    pub probe: ProbeKind,

    /// Milliseconds between checks
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Per-check timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures before a service is marked unhealthy
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Grace period after start during which failures do not count
    #[serde(default)]
    pub start_period_ms: u64,
}

fn default_interval_ms() -> u64 {
    5000
}
fn default_timeout_ms() -> u64 {
    2000
}
fn default_retries() -> u32 {
    3
}

impl HealthCheckSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn start_period(&self) -> Duration {
        Duration::from_millis(self.start_period_ms)
    }
}

/// Resource limits passed through to the runtime driver (not enforced locally)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes
    #[serde(default)]
    pub memory_bytes: Option<i64>,

    /// CPU fraction (1.0 = one core)
    #[serde(default)]
    pub cpus: Option<f64>,
}

/// Service definition in the stack file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service kind (container, process, external)
    #[serde(default)]
    pub kind: ServiceKind,

    /// Container image (container kind)
    #[serde(default)]
    pub image: Option<String>,

    /// Dockerfile to build before running (container kind)
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,

    /// Build context directory, defaults to the dockerfile's directory
    #[serde(default)]
    pub build_context: Option<PathBuf>,

    /// Start command, run through a shell (process kind)
    #[serde(default)]
    pub command: Option<String>,

    /// Working directory for the command
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Container port -> host port
    #[serde(default)]
    pub ports: BTreeMap<u16, u16>,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Host path -> container path
    #[serde(default)]
    pub volumes: BTreeMap<PathBuf, PathBuf>,

    /// Services this one depends on (affects start order)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Restart policy token, passed through to the runtime driver uninterpreted
    #[serde(default)]
    pub restart: Option<String>,

    /// Health check configuration
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,

    /// Resource limits, passed through to the runtime driver
    #[serde(default)]
    pub resources: Option<ResourceLimits>,

    /// Description for display
    #[serde(default)]
    pub description: Option<String>,
}

/// Root stack file structure
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceStack {
    /// Stack file version, an opaque token (a bare `version: 1` is fine)
    #[serde(default = "default_version", deserialize_with = "version_token")]
    pub version: String,

    /// Stack name
    pub name: String,

    /// Service definitions, keyed by service name
    pub services: BTreeMap<String, ServiceConfig>,

    /// Network declarations, consumed only by the runtime driver
    #[serde(default)]
    pub networks: BTreeMap<String, serde_yaml::Value>,

    /// Named volume declarations, consumed only by the runtime driver
    #[serde(default)]
    pub volumes: BTreeMap<String, serde_yaml::Value>,

    /// Extra config blobs, consumed only by the runtime driver
    #[serde(default)]
    pub configs: BTreeMap<String, serde_yaml::Value>,
}

fn default_version() -> String {
    "1".into()
}

/// YAML writers leave version numbers unquoted; accept both forms.
fn version_token<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("version must be a string or number")),
    }
}

/// Stack loading and validation errors
#[derive(Debug, Error)]
pub enum StackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("service '{service}' has no command specified")]
    MissingCommand { service: String },

    #[error("service '{service}' has no image or dockerfile specified")]
    MissingImage { service: String },
}

impl ServiceStack {
    /// Load a stack definition from a file
    pub fn load(path: &Path) -> Result<Self, StackError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load a stack definition from a string (useful for testing)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, StackError> {
        let stack: ServiceStack = serde_yaml::from_str(content)?;
        stack.validate()?;
        Ok(stack)
    }

    /// Validate the stack: dependency references and kind-specific fields
    fn validate(&self) -> Result<(), StackError> {
        for (name, svc) in &self.services {
            for dep in &svc.depends_on {
                if !self.services.contains_key(dep) {
                    return Err(StackError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            match svc.kind {
                ServiceKind::Process => {
                    if svc.command.as_deref().unwrap_or("").trim().is_empty() {
                        return Err(StackError::MissingCommand {
                            service: name.clone(),
                        });
                    }
                }
                ServiceKind::Container => {
                    if svc.image.is_none() && svc.dockerfile.is_none() {
                        return Err(StackError::MissingImage {
                            service: name.clone(),
                        });
                    }
                }
                ServiceKind::External => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_stack() {
        let yaml = r#"
name: demo
services:
  api:
    command: node server.js
    ports:
      8000: 8000
"#;
        let stack = ServiceStack::from_str(yaml).unwrap();
        assert_eq!(stack.name, "demo");
        assert_eq!(stack.version, "1");
        let api = &stack.services["api"];
        assert_eq!(api.kind, ServiceKind::Process);
        assert_eq!(api.command.as_deref(), Some("node server.js"));
        assert_eq!(api.ports.get(&8000), Some(&8000));
    }

    #[test]
    fn unquoted_numeric_version_is_accepted() {
        let yaml = r#"
version: 2
name: demo
services:
  api:
    command: node server.js
"#;
        let stack = ServiceStack::from_str(yaml).unwrap();
        assert_eq!(stack.version, "2");

        let yaml = r#"
version: "3.1"
name: demo
services:
  api:
    command: node server.js
"#;
        let stack = ServiceStack::from_str(yaml).unwrap();
        assert_eq!(stack.version, "3.1");
    }

    #[test]
    fn parse_container_service() {
        let yaml = r#"
name: demo
services:
  db:
    kind: container
    image: postgres:16
    env:
      POSTGRES_PASSWORD: secret
    volumes:
      /tmp/pgdata: /var/lib/postgresql/data
    restart: on-failure
    resources:
      memory_bytes: 536870912
      cpus: 1.5
"#;
        let stack = ServiceStack::from_str(yaml).unwrap();
        let db = &stack.services["db"];
        assert_eq!(db.kind, ServiceKind::Container);
        assert_eq!(db.image.as_deref(), Some("postgres:16"));
        assert_eq!(db.restart.as_deref(), Some("on-failure"));
        let limits = db.resources.as_ref().unwrap();
        assert_eq!(limits.memory_bytes, Some(536870912));
        assert_eq!(limits.cpus, Some(1.5));
    }

    #[test]
    fn parse_health_check_variants() {
        let yaml = r#"
name: demo
services:
  api:
    command: node server.js
    health_check:
      type: http
      url: http://127.0.0.1:8000/healthz
      retries: 5
  cache:
    kind: external
    health_check:
      type: tcp
      port: 6379
      interval_ms: 1000
  worker:
    command: python worker.py
    health_check:
      type: command
      command: pgrep -f worker.py
      start_period_ms: 3000
"#;
        let stack = ServiceStack::from_str(yaml).unwrap();

        let api = stack.services["api"].health_check.as_ref().unwrap();
        assert!(matches!(api.probe, ProbeKind::Http { ref url } if url.ends_with("/healthz")));
        assert_eq!(api.retries, 5);
        assert_eq!(api.interval_ms, 5000);

        let cache = stack.services["cache"].health_check.as_ref().unwrap();
        assert_eq!(cache.probe, ProbeKind::Tcp { port: 6379 });
        assert_eq!(cache.interval(), Duration::from_millis(1000));

        let worker = stack.services["worker"].health_check.as_ref().unwrap();
        assert!(matches!(worker.probe, ProbeKind::Command { .. }));
        assert_eq!(worker.start_period(), Duration::from_millis(3000));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let yaml = r#"
name: demo
services:
  api:
    command: node server.js
    depends_on: [ghost]
"#;
        let err = ServiceStack::from_str(yaml).unwrap_err();
        assert!(matches!(err, StackError::UnknownDependency { .. }));
    }

    #[test]
    fn process_without_command_rejected() {
        let yaml = r#"
name: demo
services:
  api: {}
"#;
        let err = ServiceStack::from_str(yaml).unwrap_err();
        assert!(matches!(err, StackError::MissingCommand { .. }));
    }

    #[test]
    fn container_without_image_rejected() {
        let yaml = r#"
name: demo
services:
  db:
    kind: container
"#;
        let err = ServiceStack::from_str(yaml).unwrap_err();
        assert!(matches!(err, StackError::MissingImage { .. }));
    }

    #[test]
    fn external_needs_nothing() {
        let yaml = r#"
name: demo
services:
  redis:
    kind: external
"#;
        let stack = ServiceStack::from_str(yaml).unwrap();
        assert_eq!(stack.services["redis"].kind, ServiceKind::External);
    }
}
