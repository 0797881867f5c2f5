//! Container runtime driver contract
//!
//! The orchestrator treats the container runtime as an opaque capability:
//! build, run detached, stop, remove, liveness. Implementations live outside
//! this crate (the CLI ships a Docker-backed one); tests substitute fakes.

use async_trait::async_trait;
use thiserror::Error;

use crate::stack::ServiceConfig;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("image build failed for '{service}': {reason}")]
    BuildFailed { service: String, reason: String },

    #[error("container run failed for '{service}': {reason}")]
    RunFailed { service: String, reason: String },

    #[error("failed to stop container {container_id}: {reason}")]
    StopFailed {
        container_id: String,
        reason: String,
    },

    #[error("failed to remove container {container_id}: {reason}")]
    RemoveFailed {
        container_id: String,
        reason: String,
    },

    #[error("failed to inspect container {container_id}: {reason}")]
    InspectFailed {
        container_id: String,
        reason: String,
    },
}

/// Backend that actually runs containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build the image for a service that declares a dockerfile.
    async fn build(&self, service: &str, config: &ServiceConfig) -> Result<(), RuntimeError>;

    /// Run a detached container; returns the container id.
    ///
    /// Ports, env, volumes, labels and resource limits come from `config`.
    /// The container must not be auto-removed; removal is explicit.
    async fn run(&self, service: &str, config: &ServiceConfig) -> Result<String, RuntimeError>;

    /// Stop a running container.
    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Remove a stopped container.
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Whether the container currently exists and is running.
    async fn is_running(&self, container_id: &str) -> Result<bool, RuntimeError>;
}
