//! Background health monitoring
//!
//! A single loop over the live-instance table. Each tick probes every
//! instance whose interval elapsed, all concurrently, then merges the
//! verdicts under the table lock. Only the monitor moves a service between
//! `Running` and `Unhealthy`; one failed probe is not enough, `retries`
//! consecutive failures are.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use stackup_core::instance::{HealthState, ServiceInstance, ServiceStatus};
use stackup_core::stack::HealthCheckSpec;

use crate::probe::HealthProbe;

const TICK: Duration = Duration::from_secs(1);

pub struct HealthMonitor {
    probe: HealthProbe,
    instances: Arc<Mutex<BTreeMap<String, ServiceInstance>>>,
    /// Consecutive failures, keyed by instance id so a restart resets them
    failures: BTreeMap<String, u32>,
}

impl HealthMonitor {
    pub fn new(instances: Arc<Mutex<BTreeMap<String, ServiceInstance>>>) -> Self {
        Self {
            probe: HealthProbe::new(),
            instances,
            failures: BTreeMap::new(),
        }
    }

    /// Run until the task is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick_once().await;
        }
    }

    /// One monitoring pass: probe everything due, merge the verdicts.
    pub async fn tick_once(&mut self) {
        let due: Vec<(String, String, Instant, HealthCheckSpec)> = {
            let table = self.instances.lock().await;

            // Drop counters for instances that were stopped or replaced
            self.failures
                .retain(|id, _| table.values().any(|instance| instance.id == *id));

            table
                .iter()
                .filter(|(_, instance)| {
                    matches!(
                        instance.status,
                        ServiceStatus::Running | ServiceStatus::Unhealthy
                    )
                })
                .filter_map(|(name, instance)| {
                    let spec = instance.config.health_check.as_ref()?;
                    let elapsed_interval = instance
                        .last_health_check
                        .map(|at| at.elapsed() >= spec.interval())
                        .unwrap_or(true);
                    elapsed_interval.then(|| {
                        (
                            name.clone(),
                            instance.id.clone(),
                            instance.started_at,
                            spec.clone(),
                        )
                    })
                })
                .collect()
        };

        if due.is_empty() {
            return;
        }

        let probe = &self.probe;
        let probes = due.iter().map(|(name, id, started_at, spec)| async move {
            let state = probe.check(spec).await;
            (name.clone(), id.clone(), *started_at, spec.clone(), state)
        });
        let verdicts = join_all(probes).await;

        let mut table = self.instances.lock().await;
        for (name, id, started_at, spec, state) in verdicts {
            let Some(instance) = table.get_mut(&name) else {
                continue;
            };
            // Restarted while we were probing: verdict belongs to a dead instance
            if instance.id != id {
                continue;
            }

            instance.last_health_check = Some(Instant::now());

            match state {
                HealthState::Healthy => {
                    self.failures.remove(&id);
                    instance.health = HealthState::Healthy;
                    if instance.status == ServiceStatus::Unhealthy {
                        info!(service = %name, "recovered");
                        instance.status = ServiceStatus::Running;
                    }
                }
                HealthState::Unhealthy { reason } => {
                    // Failures during the start grace period do not count
                    if started_at.elapsed() < spec.start_period() {
                        continue;
                    }
                    let count = self.failures.entry(id).or_insert(0);
                    *count += 1;
                    warn!(service = %name, %reason, failures = *count, "health check failed");
                    instance.health = HealthState::Unhealthy { reason };
                    if *count >= spec.retries && instance.status == ServiceStatus::Running {
                        instance.status = ServiceStatus::Unhealthy;
                    }
                }
                HealthState::Unknown => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackup_core::stack::ServiceStack;

    fn live_table(yaml: &str) -> Arc<Mutex<BTreeMap<String, ServiceInstance>>> {
        let stack = ServiceStack::from_str(yaml).unwrap();
        let table: BTreeMap<String, ServiceInstance> = stack
            .services
            .into_iter()
            .map(|(name, config)| {
                let mut instance = ServiceInstance::new(Arc::new(config));
                instance.status = ServiceStatus::Running;
                (name, instance)
            })
            .collect();
        Arc::new(Mutex::new(table))
    }

    async fn status_of(
        table: &Arc<Mutex<BTreeMap<String, ServiceInstance>>>,
        name: &str,
    ) -> (ServiceStatus, HealthState) {
        let table = table.lock().await;
        let instance = &table[name];
        (instance.status.clone(), instance.health.clone())
    }

    #[tokio::test]
    async fn consecutive_failures_flip_status_at_the_retry_threshold() {
        let table = live_table(
            r#"
name: demo
services:
  api:
    command: sleep 30
    health_check:
      type: command
      command: "false"
      interval_ms: 0
      retries: 2
"#,
        );
        let mut monitor = HealthMonitor::new(table.clone());

        monitor.tick_once().await;
        let (status, health) = status_of(&table, "api").await;
        assert_eq!(status, ServiceStatus::Running);
        assert!(matches!(health, HealthState::Unhealthy { .. }));

        monitor.tick_once().await;
        let (status, _) = status_of(&table, "api").await;
        assert_eq!(status, ServiceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn recovery_returns_to_running_and_resets_the_counter() {
        let marker = std::env::temp_dir().join(format!("stackup-test-{}", uuid::Uuid::new_v4()));
        let table = live_table(&format!(
            r#"
name: demo
services:
  api:
    command: sleep 30
    health_check:
      type: command
      command: "test -f {}"
      interval_ms: 0
      retries: 1
"#,
            marker.display()
        ));
        let mut monitor = HealthMonitor::new(table.clone());

        monitor.tick_once().await;
        let (status, _) = status_of(&table, "api").await;
        assert_eq!(status, ServiceStatus::Unhealthy);

        std::fs::write(&marker, b"up").unwrap();
        monitor.tick_once().await;
        let (status, health) = status_of(&table, "api").await;
        assert_eq!(status, ServiceStatus::Running);
        assert_eq!(health, HealthState::Healthy);
        assert!(monitor.failures.is_empty());

        std::fs::remove_file(&marker).unwrap();
    }

    #[tokio::test]
    async fn failures_inside_the_start_grace_period_are_ignored() {
        let table = live_table(
            r#"
name: demo
services:
  api:
    command: sleep 30
    health_check:
      type: command
      command: "false"
      interval_ms: 0
      retries: 1
      start_period_ms: 60000
"#,
        );
        let mut monitor = HealthMonitor::new(table.clone());

        monitor.tick_once().await;
        let (status, health) = status_of(&table, "api").await;
        assert_eq!(status, ServiceStatus::Running);
        assert_eq!(health, HealthState::Unknown);
    }

    #[tokio::test]
    async fn counters_for_removed_instances_are_pruned() {
        let table = live_table(
            r#"
name: demo
services:
  api:
    command: sleep 30
    health_check:
      type: command
      command: "false"
      interval_ms: 0
      retries: 5
"#,
        );
        let mut monitor = HealthMonitor::new(table.clone());

        monitor.tick_once().await;
        assert_eq!(monitor.failures.len(), 1);

        // The instance goes away while still unhealthy
        table.lock().await.clear();
        monitor.tick_once().await;
        assert!(monitor.failures.is_empty());
    }

    #[tokio::test]
    async fn services_without_a_check_are_left_alone() {
        let table = live_table(
            r#"
name: demo
services:
  api:
    command: sleep 30
"#,
        );
        let mut monitor = HealthMonitor::new(table.clone());

        monitor.tick_once().await;
        let (status, health) = status_of(&table, "api").await;
        assert_eq!(status, ServiceStatus::Running);
        assert_eq!(health, HealthState::Unknown);
    }
}
