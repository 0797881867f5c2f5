//! Stack orchestration façade
//!
//! Owns the live-instance table and sequences starts/stops in dependency
//! order. Per-service failures come back as data in a result map and
//! propagate only forward, to dependents that have not started yet. Graph
//! errors fail the whole call before anything is touched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use stackup_core::instance::{
    HealthState, ServiceInstance, ServiceResult, ServiceStatus, StatusSnapshot,
};
use stackup_core::resolver::{self, ResolveError};
use stackup_core::runtime::ContainerRuntime;
use stackup_core::stack::{ServiceConfig, ServiceKind, ServiceStack};

use crate::docker::container_name;
use crate::launcher::ServiceLauncher;
use crate::probe::HealthProbe;

/// Pause between consecutive launches. A throttle, not a correctness wait.
const DEFAULT_STAGGER: Duration = Duration::from_millis(250);

pub struct Orchestrator {
    services: BTreeMap<String, ServiceConfig>,
    configs: BTreeMap<String, Arc<ServiceConfig>>,
    runtime: Arc<dyn ContainerRuntime>,
    launcher: ServiceLauncher,
    probe: HealthProbe,
    instances: Arc<Mutex<BTreeMap<String, ServiceInstance>>>,
    stagger: Duration,
}

impl Orchestrator {
    pub fn new(stack: ServiceStack, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let configs = stack
            .services
            .iter()
            .map(|(name, config)| (name.clone(), Arc::new(config.clone())))
            .collect();

        Self {
            services: stack.services,
            configs,
            runtime: runtime.clone(),
            launcher: ServiceLauncher::new(runtime),
            probe: HealthProbe::new(),
            instances: Arc::new(Mutex::new(BTreeMap::new())),
            stagger: DEFAULT_STAGGER,
        }
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    /// Shared handle to the live table, for the health monitor.
    pub fn instances(&self) -> Arc<Mutex<BTreeMap<String, ServiceInstance>>> {
        self.instances.clone()
    }

    pub fn launcher(&self) -> &ServiceLauncher {
        &self.launcher
    }

    fn subset_or_all(&self, subset: &[String]) -> Vec<String> {
        if subset.is_empty() {
            self.services.keys().cloned().collect()
        } else {
            subset.to_vec()
        }
    }

    /// Start services in dependency order.
    ///
    /// Launch failures do not abort the call; they mark the service failed
    /// and every not-yet-started dependent inherits the failure without a
    /// launch attempt. Dropping the returned future cancels scheduling of
    /// the remaining services; whatever already started keeps running.
    pub async fn start_stack(
        &self,
        subset: &[String],
        build: bool,
    ) -> Result<BTreeMap<String, ServiceResult>, ResolveError> {
        let subset = self.subset_or_all(subset);
        let order = resolver::resolve(&self.services, &subset)?;

        let mut results = BTreeMap::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();

        for (i, name) in order.iter().enumerate() {
            let config = self.configs[name].clone();

            if let Some(dep) = config.depends_on.iter().find(|d| failed.contains(*d)) {
                warn!(service = %name, dependency = %dep, "skipping, dependency failed");
                results.insert(name.clone(), ServiceResult::err(format!("dependency '{}' failed", dep)));
                failed.insert(name.clone());
                continue;
            }

            if self.instances.lock().await.contains_key(name) {
                results.insert(name.clone(), ServiceResult::err("already running"));
                continue;
            }

            info!(service = %name, "starting");
            match self.launcher.start(name, config, build).await {
                Ok(instance) => {
                    self.instances.lock().await.insert(name.clone(), instance);
                    results.insert(name.clone(), ServiceResult::ok());
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "start failed");
                    failed.insert(name.clone());
                    results.insert(name.clone(), ServiceResult::err(e.to_string()));
                }
            }

            if i + 1 < order.len() && !self.stagger.is_zero() {
                tokio::time::sleep(self.stagger).await;
            }
        }

        Ok(results)
    }

    /// Stop services in reverse dependency order.
    ///
    /// Services with no live instance are already-stopped successes; no
    /// collaborator is called for them.
    pub async fn stop_stack(
        &self,
        subset: &[String],
    ) -> Result<BTreeMap<String, ServiceResult>, ResolveError> {
        let subset = self.subset_or_all(subset);
        let order = resolver::shutdown_order(&self.services, &subset)?;

        let mut results = BTreeMap::new();

        for name in order {
            let instance = self.instances.lock().await.remove(&name);
            let Some(mut instance) = instance else {
                debug!(service = %name, "not running, nothing to stop");
                results.insert(name, ServiceResult::ok());
                continue;
            };

            info!(service = %name, "stopping");
            instance.status = ServiceStatus::Stopping;
            match self.launcher.stop(&name, &instance).await {
                Ok(()) => {
                    results.insert(name, ServiceResult::ok());
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "stop failed");
                    // Still out there: keep the instance so a retry reaches it
                    instance.status = ServiceStatus::Running;
                    self.instances.lock().await.insert(name.clone(), instance);
                    results.insert(name, ServiceResult::err(e.to_string()));
                }
            }
        }

        Ok(results)
    }

    /// Current view of every configured service.
    ///
    /// Liveness checks and health probes for all live instances run
    /// concurrently, then merge under the table lock in one pass. A dead
    /// instance is marked failed; health flips status only in the monitor.
    pub async fn status(&self) -> BTreeMap<String, StatusSnapshot> {
        let live: Vec<(String, ServiceInstance)> = self
            .instances
            .lock()
            .await
            .iter()
            .map(|(name, instance)| (name.clone(), instance.clone()))
            .collect();

        let checks = live.iter().map(|(name, instance)| async move {
            let alive = self.launcher.is_alive(name, instance).await;
            let health = match &instance.config.health_check {
                Some(spec) => self.probe.check(spec).await,
                // No probe configured: nothing to contradict liveness
                None => HealthState::Healthy,
            };
            (name.clone(), alive, health)
        });
        let outcomes = join_all(checks).await;

        let mut table = self.instances.lock().await;
        for (name, alive, health) in outcomes {
            let Some(instance) = table.get_mut(&name) else {
                continue;
            };
            if !alive {
                warn!(service = %name, "instance is gone");
                instance.status = ServiceStatus::Failed;
                continue;
            }
            instance.health = health;
            instance.last_health_check = Some(Instant::now());
        }

        self.configs
            .keys()
            .map(|name| {
                let snapshot = match table.get(name) {
                    Some(instance) => StatusSnapshot {
                        status: instance.status.clone(),
                        health: instance.health.clone(),
                        uptime_secs: instance.uptime_secs(),
                        restart_count: instance.restart_count,
                    },
                    None => StatusSnapshot::stopped(),
                };
                (name.clone(), snapshot)
            })
            .collect()
    }

    /// Stop and start one service, carrying the restart counter forward.
    pub async fn restart_service(&self, name: &str, build: bool) -> ServiceResult {
        let Some(config) = self.configs.get(name).cloned() else {
            return ServiceResult::err(format!("unknown service '{}'", name));
        };

        let previous = self.instances.lock().await.remove(name);
        let restart_count = previous.as_ref().map(|i| i.restart_count + 1).unwrap_or(0);

        if let Some(mut instance) = previous {
            instance.status = ServiceStatus::Stopping;
            if let Err(e) = self.launcher.stop(name, &instance).await {
                instance.status = ServiceStatus::Running;
                self.instances.lock().await.insert(name.to_string(), instance);
                return ServiceResult::err(e.to_string());
            }
        }

        match self.launcher.start(name, config, build).await {
            Ok(mut instance) => {
                instance.restart_count = restart_count;
                self.instances.lock().await.insert(name.to_string(), instance);
                ServiceResult::ok()
            }
            Err(e) => ServiceResult::err(e.to_string()),
        }
    }

    /// Adopt containers left running by a previous invocation.
    ///
    /// Containers are found by their deterministic name; processes do not
    /// survive the parent and stay stopped.
    pub async fn rediscover(&self) {
        let mut table = self.instances.lock().await;

        for (name, config) in &self.configs {
            if config.kind != ServiceKind::Container || table.contains_key(name) {
                continue;
            }

            let container = container_name(name);
            if self.runtime.is_running(&container).await.unwrap_or(false) {
                debug!(service = %name, container, "adopted running container");
                let mut instance = ServiceInstance::new(config.clone());
                instance.container_id = Some(container);
                instance.status = ServiceStatus::Running;
                table.insert(name.clone(), instance);
            }
        }
    }
}
