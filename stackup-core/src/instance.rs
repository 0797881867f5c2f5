//! Runtime state of managed services
//!
//! A `ServiceInstance` exists only while the orchestrator considers the
//! service live: it is created on a successful start and destroyed when the
//! service is removed from the live table. "Stopped" services have no
//! instance at all.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::stack::{ServiceConfig, ServiceKind};

/// Lifecycle status of a service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Launch attempted, not yet confirmed
    Starting,
    /// Launch succeeded, process/container believed alive
    Running,
    /// Stop in progress
    Stopping,
    /// No live instance (reported in snapshots only)
    #[default]
    Stopped,
    /// Launch failed or the underlying process/container is gone
    Failed,
    /// Running but the latest health probe failed
    Unhealthy,
}

/// Health as reported by the most recent probe
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No probe has run yet, or none is configured for a stopped service
    #[default]
    Unknown,
    Healthy,
    Unhealthy { reason: String },
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Unknown => f.write_str("unknown"),
            HealthState::Healthy => f.write_str("healthy"),
            HealthState::Unhealthy { reason } => write!(f, "unhealthy ({})", reason),
        }
    }
}

/// Live record for a started service
#[derive(Clone, Debug)]
pub struct ServiceInstance {
    /// Unique id for this lifecycle pass
    pub id: String,

    /// Shared, read-only configuration
    pub config: Arc<ServiceConfig>,

    pub status: ServiceStatus,

    /// Populated for container services
    pub container_id: Option<String>,

    /// Populated for process services
    pub pid: Option<u32>,

    pub started_at: Instant,

    pub last_health_check: Option<Instant>,

    pub health: HealthState,

    pub restart_count: u32,
}

impl ServiceInstance {
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            status: ServiceStatus::Starting,
            container_id: None,
            pid: None,
            started_at: Instant::now(),
            last_health_check: None,
            health: HealthState::Unknown,
            restart_count: 0,
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.config.kind
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Point-in-time view of a service, composed by status aggregation
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub status: ServiceStatus,
    pub health: HealthState,
    pub uptime_secs: u64,
    pub restart_count: u32,
}

impl StatusSnapshot {
    /// Snapshot for a configured service with no live instance
    pub fn stopped() -> Self {
        Self {
            status: ServiceStatus::Stopped,
            health: HealthState::Unknown,
            uptime_secs: 0,
            restart_count: 0,
        }
    }
}

/// Per-service outcome of a stack operation
#[derive(Clone, Debug, Serialize)]
pub struct ServiceResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ServiceStack;

    #[test]
    fn new_instance_is_starting() {
        let stack = ServiceStack::from_str(
            r#"
name: demo
services:
  api:
    command: sleep 1
"#,
        )
        .unwrap();
        let config = Arc::new(stack.services["api"].clone());
        let instance = ServiceInstance::new(config);

        assert_eq!(instance.status, ServiceStatus::Starting);
        assert_eq!(instance.health, HealthState::Unknown);
        assert!(instance.container_id.is_none());
        assert!(instance.pid.is_none());
        assert_eq!(instance.restart_count, 0);
    }

    #[test]
    fn stopped_snapshot_shape() {
        let snap = StatusSnapshot::stopped();
        assert_eq!(snap.status, ServiceStatus::Stopped);
        assert_eq!(snap.health, HealthState::Unknown);
        assert_eq!(snap.uptime_secs, 0);
    }
}
