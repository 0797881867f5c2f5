//! Service launcher
//!
//! Type-polymorphic start/stop with a single dispatch point on
//! `ServiceKind`. Containers go through the runtime driver, processes are
//! spawned in their own session with captured output, external services are
//! only probed for readiness.

use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[cfg(unix)]
#[allow(unused_imports)]
use std::os::unix::process::CommandExt;

use stackup_core::instance::{HealthState, ServiceInstance, ServiceStatus};
use stackup_core::runtime::{ContainerRuntime, RuntimeError};
use stackup_core::stack::{ServiceConfig, ServiceKind};

use crate::probe::HealthProbe;

/// Lines kept per service for later inspection
const LOG_CAPACITY: usize = 1000;

/// Grace period between SIGTERM and SIGKILL
const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("service '{service}' is already running")]
    AlreadyRunning { service: String },

    #[error("service '{service}' has no start command")]
    MissingCommand { service: String },

    #[error("failed to spawn '{service}': {source}")]
    Spawn {
        service: String,
        source: std::io::Error,
    },

    #[error("external service '{service}' is not ready: {reason}")]
    NotReady { service: String, reason: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

struct ProcessHandle {
    child: Child,
    pgid: i32,
}

pub struct ServiceLauncher {
    runtime: Arc<dyn ContainerRuntime>,
    probe: HealthProbe,
    processes: Mutex<BTreeMap<String, ProcessHandle>>,
    logs: Arc<StdMutex<BTreeMap<String, VecDeque<LogLine>>>>,
    sys: Mutex<System>,
}

impl ServiceLauncher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            probe: HealthProbe::new(),
            processes: Mutex::new(BTreeMap::new()),
            logs: Arc::new(StdMutex::new(BTreeMap::new())),
            sys: Mutex::new(System::new()),
        }
    }

    /// Start one service according to its kind.
    pub async fn start(
        &self,
        name: &str,
        config: Arc<ServiceConfig>,
        build: bool,
    ) -> Result<ServiceInstance, LaunchError> {
        match config.kind {
            ServiceKind::Container => self.start_container(name, config, build).await,
            ServiceKind::Process => self.start_process(name, config).await,
            ServiceKind::External => self.start_external(name, config).await,
        }
    }

    async fn start_container(
        &self,
        name: &str,
        config: Arc<ServiceConfig>,
        build: bool,
    ) -> Result<ServiceInstance, LaunchError> {
        if build && config.dockerfile.is_some() {
            // Fail fast on build errors, before any run attempt
            self.runtime.build(name, &config).await?;
        }

        let container_id = self.runtime.run(name, &config).await?;
        debug!(service = name, container_id, "container started");

        let mut instance = ServiceInstance::new(config);
        instance.container_id = Some(container_id);
        instance.status = ServiceStatus::Running;
        Ok(instance)
    }

    async fn start_process(
        &self,
        name: &str,
        config: Arc<ServiceConfig>,
    ) -> Result<ServiceInstance, LaunchError> {
        let command = config
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LaunchError::MissingCommand {
                service: name.to_string(),
            })?;

        let mut processes = self.processes.lock().await;
        if processes.contains_key(name) {
            return Err(LaunchError::AlreadyRunning {
                service: name.to_string(),
            });
        }

        #[cfg(unix)]
        let mut cmd = {
            let mut c = Command::new("sh");
            c.arg("-c");
            c.arg(command);
            c
        };
        #[cfg(windows)]
        let mut cmd = {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        };

        if let Some(cwd) = &config.working_dir {
            cmd.current_dir(cwd);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        // Own session so the whole process group can be signalled on stop
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            service: name.to_string(),
            source: e,
        })?;
        let pid = child.id();
        let pgid = pid.map(|p| p as i32).unwrap_or(-1);

        self.logs.lock().unwrap().insert(name.to_string(), VecDeque::new());

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(name, LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(name, LogStream::Stderr, stderr);
        }

        processes.insert(name.to_string(), ProcessHandle { child, pgid });
        debug!(service = name, pid, "process spawned");

        // Whether it survives its first moments is the monitor's problem
        let mut instance = ServiceInstance::new(config);
        instance.pid = pid;
        instance.status = ServiceStatus::Running;
        Ok(instance)
    }

    async fn start_external(
        &self,
        name: &str,
        config: Arc<ServiceConfig>,
    ) -> Result<ServiceInstance, LaunchError> {
        let mut instance = ServiceInstance::new(config.clone());

        // The one kind where "starting" is a readiness check, not a side effect
        if let Some(spec) = &config.health_check {
            match self.probe.check(spec).await {
                HealthState::Healthy => instance.health = HealthState::Healthy,
                HealthState::Unhealthy { reason } => {
                    return Err(LaunchError::NotReady {
                        service: name.to_string(),
                        reason,
                    });
                }
                HealthState::Unknown => {}
            }
        }

        instance.status = ServiceStatus::Running;
        Ok(instance)
    }

    fn spawn_reader(
        &self,
        name: &str,
        stream: LogStream,
        source: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let logs = self.logs.clone();
        let service = name.to_string();
        tokio::spawn(async move {
            let reader = BufReader::new(source);
            let mut lines = reader.lines();
            while let Ok(Some(text)) = lines.next_line().await {
                let mut logs = logs.lock().unwrap();
                let buffer = logs.entry(service.clone()).or_default();
                if buffer.len() >= LOG_CAPACITY {
                    buffer.pop_front();
                }
                buffer.push_back(LogLine { stream, text });
            }
        });
    }

    /// Stop one service. Unknown/already-stopped instances are a no-op.
    pub async fn stop(&self, name: &str, instance: &ServiceInstance) -> Result<(), LaunchError> {
        match instance.kind() {
            ServiceKind::Container => {
                if let Some(container_id) = &instance.container_id {
                    self.runtime.stop(container_id).await?;
                    self.runtime.remove(container_id).await?;
                }
                Ok(())
            }
            ServiceKind::Process => {
                let handle = self.processes.lock().await.remove(name);
                match handle {
                    Some(handle) => {
                        Self::terminate(handle).await;
                        Ok(())
                    }
                    // Already stopped, or started by a previous run: nothing to signal
                    None => Ok(()),
                }
            }
            ServiceKind::External => Ok(()),
        }
    }

    async fn terminate(mut handle: ProcessHandle) {
        #[cfg(unix)]
        if handle.pgid > 0 {
            unsafe {
                libc::killpg(handle.pgid, libc::SIGTERM);
            }

            tokio::time::sleep(STOP_GRACE).await;

            if handle.child.try_wait().ok().flatten().is_none() {
                warn!(pgid = handle.pgid, "process group ignored SIGTERM, killing");
                unsafe {
                    libc::killpg(handle.pgid, libc::SIGKILL);
                }
            }
            let _ = handle.child.wait().await;
            return;
        }

        let _ = handle.child.kill().await;
    }

    /// Liveness: does the underlying process/container still exist?
    pub async fn is_alive(&self, name: &str, instance: &ServiceInstance) -> bool {
        match instance.kind() {
            ServiceKind::Container => match &instance.container_id {
                Some(container_id) => self.runtime.is_running(container_id).await.unwrap_or(false),
                None => false,
            },
            ServiceKind::Process => {
                let mut processes = self.processes.lock().await;
                if let Some(handle) = processes.get_mut(name) {
                    return matches!(handle.child.try_wait(), Ok(None));
                }
                drop(processes);

                match instance.pid {
                    Some(pid) => self.pid_alive(pid).await,
                    None => false,
                }
            }
            // Externally managed: existence is assumed, health is the probe's job
            ServiceKind::External => true,
        }
    }

    async fn pid_alive(&self, pid: u32) -> bool {
        let mut sys = self.sys.lock().await;
        sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
        sys.process(Pid::from_u32(pid)).is_some()
    }

    /// Captured stdout/stderr for a process service.
    pub fn logs(&self, name: &str) -> Vec<LogLine> {
        self.logs
            .lock()
            .unwrap()
            .get(name)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}
