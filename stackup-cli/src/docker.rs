//! Docker-backed container runtime driver
//!
//! Implements the `ContainerRuntime` contract over the local Docker daemon.
//! Containers run detached and are removed explicitly on stop. Image builds
//! shell out to the docker CLI; everything else goes through the API client.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use stackup_core::runtime::{ContainerRuntime, RuntimeError};
use stackup_core::stack::ServiceConfig;

/// Seconds Docker waits before killing a container on stop
const STOP_TIMEOUT_SECS: i64 = 10;

pub struct DockerRuntime {
    client: OnceCell<Docker>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Docker, RuntimeError> {
        self.client
            .get_or_try_init(|| async {
                let docker = Docker::connect_with_local_defaults().map_err(|e| {
                    RuntimeError::Unavailable {
                        reason: e.to_string(),
                    }
                })?;
                docker.ping().await.map_err(|e| RuntimeError::Unavailable {
                    reason: format!("ping failed: {}", e),
                })?;
                debug!("connected to Docker");
                Ok(docker)
            })
            .await
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic container name, also usable for rediscovery after restart
pub fn container_name(service: &str) -> String {
    format!("stackup-{}", service)
}

fn image_tag(service: &str, config: &ServiceConfig) -> String {
    config
        .image
        .clone()
        .unwrap_or_else(|| format!("stackup/{}", service))
}

fn restart_policy(token: &str) -> Option<RestartPolicyNameEnum> {
    match token {
        "no" => Some(RestartPolicyNameEnum::NO),
        "always" => Some(RestartPolicyNameEnum::ALWAYS),
        "on-failure" => Some(RestartPolicyNameEnum::ON_FAILURE),
        "unless-stopped" => Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        _ => None,
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build(&self, service: &str, config: &ServiceConfig) -> Result<(), RuntimeError> {
        let dockerfile = config
            .dockerfile
            .as_ref()
            .ok_or_else(|| RuntimeError::BuildFailed {
                service: service.to_string(),
                reason: "no dockerfile configured".into(),
            })?;

        let context = config
            .build_context
            .clone()
            .or_else(|| dockerfile.parent().map(PathBuf::from))
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        let tag = image_tag(service, config);

        info!(service, %tag, "building image");

        let output = tokio::process::Command::new("docker")
            .arg("build")
            .arg("-t")
            .arg(&tag)
            .arg("-f")
            .arg(dockerfile)
            .arg(&context)
            .output()
            .await
            .map_err(|e| RuntimeError::BuildFailed {
                service: service.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .last()
                .map(str::to_string)
                .unwrap_or_else(|| format!("exit code: {:?}", output.status.code()));
            return Err(RuntimeError::BuildFailed {
                service: service.to_string(),
                reason,
            });
        }

        Ok(())
    }

    async fn run(&self, service: &str, config: &ServiceConfig) -> Result<String, RuntimeError> {
        let client = self.client().await?;

        let image = if config.dockerfile.is_some() {
            image_tag(service, config)
        } else {
            config.image.clone().ok_or_else(|| RuntimeError::RunFailed {
                service: service.to_string(),
                reason: "no image configured".into(),
            })?
        };

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (container_port, host_port) in &config.ports {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = config
            .volumes
            .iter()
            .map(|(host, container)| format!("{}:{}", host.display(), container.display()))
            .collect();

        let mut labels = HashMap::new();
        labels.insert("stackup.service".to_string(), service.to_string());

        let limits = config.resources.clone().unwrap_or_default();
        let host_config = HostConfig {
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            binds: (!binds.is_empty()).then_some(binds),
            memory: limits.memory_bytes,
            nano_cpus: limits.cpus.map(|c| (c * 1_000_000_000.0) as i64),
            restart_policy: config.restart.as_deref().and_then(restart_policy).map(|name| {
                RestartPolicy {
                    name: Some(name),
                    maximum_retry_count: None,
                }
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(image),
            env: (!env.is_empty()).then_some(env),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name(service),
            platform: None,
        };

        let response = client
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| RuntimeError::RunFailed {
                service: service.to_string(),
                reason: e.to_string(),
            })?;

        client
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::RunFailed {
                service: service.to_string(),
                reason: e.to_string(),
            })?;

        info!(service, container_id = %response.id, "container running");
        Ok(response.id)
    }

    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError> {
        let client = self.client().await?;

        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone counts as stopped
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::StopFailed {
                container_id: container_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let client = self.client().await?;

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match client.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::RemoveFailed {
                container_id: container_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, RuntimeError> {
        let client = self.client().await?;

        match client.inspect_container(container_id, None).await {
            Ok(details) => Ok(details
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(RuntimeError::InspectFailed {
                container_id: container_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
