//! Single-shot health probes
//!
//! One probe, one verdict. Retry policy (`retries`, `interval_ms`,
//! `start_period_ms`) belongs to the monitoring loop, not here. A failed
//! probe is a normal outcome and comes back as data, never as an error.

use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

use stackup_core::instance::HealthState;
use stackup_core::stack::{HealthCheckSpec, ProbeKind};

#[derive(Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Run the configured probe once, bounded by the spec's timeout.
    pub async fn check(&self, spec: &HealthCheckSpec) -> HealthState {
        let timeout = spec.timeout();
        let state = match &spec.probe {
            ProbeKind::Command { command } => self.check_command(command, timeout).await,
            ProbeKind::Http { url } => self.check_http(url, timeout).await,
            ProbeKind::Tcp { port } => self.check_tcp(*port, timeout).await,
        };
        debug!(probe = ?spec.probe, ?state, "health probe finished");
        state
    }

    /// Shell command: exit 0 = healthy, force-killed at the timeout.
    async fn check_command(&self, command: &str, timeout: Duration) -> HealthState {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return HealthState::Unhealthy {
                    reason: format!("failed to run check: {}", e),
                };
            }
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => HealthState::Healthy,
            Ok(Ok(status)) => HealthState::Unhealthy {
                reason: format!("exit code: {:?}", status.code()),
            },
            Ok(Err(e)) => HealthState::Unhealthy {
                reason: e.to_string(),
            },
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                HealthState::Unhealthy {
                    reason: format!("check timed out after {:?}", timeout),
                }
            }
        }
    }

    /// HTTP GET: healthy iff the status is exactly 200 within the timeout.
    async fn check_http(&self, url: &str, timeout: Duration) -> HealthState {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => HealthState::Healthy,
            Ok(resp) => HealthState::Unhealthy {
                reason: format!("HTTP {}", resp.status()),
            },
            Err(e) if e.is_timeout() => HealthState::Unhealthy {
                reason: format!("request timed out after {:?}", timeout),
            },
            Err(e) => HealthState::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    /// TCP connect to localhost: reachable = healthy.
    async fn check_tcp(&self, port: u16, timeout: Duration) -> HealthState {
        let addr = format!("127.0.0.1:{}", port);

        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => HealthState::Healthy,
            Ok(Err(e)) => HealthState::Unhealthy {
                reason: e.to_string(),
            },
            Err(_) => HealthState::Unhealthy {
                reason: "connection timeout".into(),
            },
        }
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}
