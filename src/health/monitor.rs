//! Health check registry and background poll loop.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::HealthStatus;
use crate::config::HealthConfig;
use crate::logging::panic_message;

type HealthPredicate = Arc<dyn Fn() -> anyhow::Result<bool> + Send + Sync>;

struct RegisteredCheck {
    predicate: HealthPredicate,
    status: HealthStatus,
    last_check: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// Result of one named check as of its last evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub name: String,
    pub status: HealthStatus,
    /// `None` until the check has been evaluated once
    pub last_check: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Service-level health snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub service: String,
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<CheckReport>,
}

impl HealthReport {
    /// Pretty-printed JSON for status endpoints and files
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// One-line summary for logs
    pub fn format_summary(&self) -> String {
        let healthy = self
            .checks
            .iter()
            .filter(|check| check.status.is_healthy())
            .count();
        format!(
            "Health status - {}: {} ({}/{} checks healthy, uptime {} min)",
            self.service,
            self.status.as_str().to_uppercase(),
            healthy,
            self.checks.len(),
            self.uptime_seconds / 60
        )
    }
}

struct Registry {
    service_name: String,
    started_at: Instant,
    checks: Mutex<BTreeMap<String, RegisteredCheck>>,
}

impl Registry {
    fn evaluate(&self, name: &str) -> HealthStatus {
        // Predicates run without the lock so they may call back into the monitor
        let Some(predicate) = self
            .checks
            .lock()
            .get(name)
            .map(|check| Arc::clone(&check.predicate))
        else {
            return HealthStatus::Unhealthy;
        };

        let (status, error) = match panic::catch_unwind(AssertUnwindSafe(|| predicate())) {
            Ok(Ok(true)) => (HealthStatus::Healthy, None),
            Ok(Ok(false)) => (HealthStatus::Unhealthy, Some("check returned false".to_string())),
            Ok(Err(err)) => {
                warn!(check = name, error = %err, "Health check failed");
                (HealthStatus::Unhealthy, Some(format!("{err:#}")))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(check = name, panic = %message, "Health check panicked");
                (HealthStatus::Unhealthy, Some(format!("check panicked: {message}")))
            }
        };

        if let Some(check) = self.checks.lock().get_mut(name) {
            check.status = status;
            check.last_check = Some(Utc::now());
            check.error = error;
        }
        status
    }

    fn evaluate_all(&self) -> HealthStatus {
        let names: Vec<String> = self.checks.lock().keys().cloned().collect();
        HealthStatus::aggregate(names.iter().map(|name| self.evaluate(name)))
    }
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Registry of named health checks with an optional background poll loop
pub struct HealthMonitor {
    registry: Arc<Registry>,
    interval: Duration,
    stop_timeout: Duration,
    task: Mutex<Option<MonitorTask>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("service_name", &self.registry.service_name)
            .field("interval", &self.interval)
            .field("checks", &self.registry.checks.lock().keys().collect::<Vec<_>>())
            .field("running", &self.is_running())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(service_name: impl Into<String>, interval: Duration, stop_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Registry {
                service_name: service_name.into(),
                started_at: Instant::now(),
                checks: Mutex::new(BTreeMap::new()),
            }),
            interval,
            stop_timeout,
            task: Mutex::new(None),
        }
    }

    pub fn from_config(service_name: impl Into<String>, config: &HealthConfig) -> Self {
        Self::new(service_name, config.interval(), config.stop_timeout())
    }

    pub fn service_name(&self) -> &str {
        &self.registry.service_name
    }

    /// Add or replace a named check. It reports healthy until first evaluated.
    pub fn register_check<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(check = %name, service = %self.registry.service_name, "Health check registered");
        self.registry.checks.lock().insert(
            name,
            RegisteredCheck {
                predicate: Arc::new(predicate),
                status: HealthStatus::Healthy,
                last_check: None,
                error: None,
            },
        );
    }

    /// Evaluate one check now; unknown names are unhealthy
    pub fn check(&self, name: &str) -> HealthStatus {
        self.registry.evaluate(name)
    }

    /// Evaluate every check now and aggregate the results
    pub fn check_all(&self) -> HealthStatus {
        self.registry.evaluate_all()
    }

    /// Evaluate every check and return a full snapshot
    pub fn report(&self) -> HealthReport {
        let status = self.check_all();
        let checks = self
            .registry
            .checks
            .lock()
            .iter()
            .map(|(name, check)| CheckReport {
                name: name.clone(),
                status: check.status,
                last_check: check.last_check,
                error: check.error.clone(),
            })
            .collect();

        HealthReport {
            service: self.registry.service_name.clone(),
            status,
            uptime_seconds: self.registry.started_at.elapsed().as_secs(),
            timestamp: Utc::now(),
            checks,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Spawn the background poll loop. Returns false if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_monitor_loop(
            Arc::clone(&self.registry),
            self.interval.max(Duration::from_millis(1)),
            shutdown_rx,
        ));
        *task = Some(MonitorTask { shutdown, handle });

        info!(
            service = %self.registry.service_name,
            interval_secs = self.interval.as_secs_f64(),
            "Health check monitor started"
        );
        true
    }

    /// Signal the loop and wait up to the stop timeout for it to exit, aborting
    /// it otherwise. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(MonitorTask { shutdown, mut handle }) = self.task.lock().take() else {
            return false;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(_) => info!(service = %self.registry.service_name, "Health check monitor stopped"),
            Err(_) => {
                warn!(
                    service = %self.registry.service_name,
                    timeout_secs = self.stop_timeout.as_secs_f64(),
                    "Health check monitor did not stop in time, aborting"
                );
                handle.abort();
            }
        }
        true
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}

async fn run_monitor_loop(
    registry: Arc<Registry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = HealthStatus::Healthy;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let status = registry.evaluate_all();
        if status != previous {
            if status.is_healthy() {
                info!(service = %registry.service_name, from = %previous, "Service recovered");
            } else {
                warn!(service = %registry.service_name, from = %previous, to = %status, "Service health changed");
            }
            previous = status;
        }
    }

    debug!(service = %registry.service_name, "Health check loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn monitor() -> HealthMonitor {
        HealthMonitor::new("test-service", Duration::from_secs(30), Duration::from_secs(5))
    }

    #[test]
    fn test_registered_check_starts_healthy() {
        let monitor = monitor();
        monitor.register_check("broker", || Ok(false));

        let checks = monitor.registry.checks.lock();
        assert_eq!(checks["broker"].status, HealthStatus::Healthy);
        assert!(checks["broker"].last_check.is_none());
    }

    #[test]
    fn test_unknown_check_is_unhealthy() {
        assert_eq!(monitor().check("missing"), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_check_all_aggregation() {
        let monitor = monitor();
        assert_eq!(monitor.check_all(), HealthStatus::Healthy);

        monitor.register_check("a", || Ok(true));
        monitor.register_check("b", || Ok(true));
        assert_eq!(monitor.check_all(), HealthStatus::Healthy);

        monitor.register_check("b", || Ok(false));
        assert_eq!(monitor.check_all(), HealthStatus::Degraded);

        monitor.register_check("c", || anyhow::bail!("connection refused"));
        assert_eq!(monitor.check_all(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_single_erroring_check_is_unhealthy() {
        let monitor = monitor();
        monitor.register_check("broker", || anyhow::bail!("connection refused"));
        assert_eq!(monitor.check_all(), HealthStatus::Unhealthy);

        let report = monitor.report();
        assert_eq!(report.checks[0].error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_panicking_check_is_recorded() {
        let monitor = monitor();
        monitor.register_check("flaky", || panic!("sensor unplugged"));

        assert_eq!(monitor.check("flaky"), HealthStatus::Unhealthy);
        let report = monitor.report();
        assert!(report.checks[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("sensor unplugged")));
    }

    #[test]
    fn test_recovery_clears_error() {
        let monitor = monitor();
        let up = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&up);
        monitor.register_check("broker", move || Ok(flag.load(Ordering::SeqCst)));

        assert_eq!(monitor.check("broker"), HealthStatus::Unhealthy);
        up.store(true, Ordering::SeqCst);
        assert_eq!(monitor.check("broker"), HealthStatus::Healthy);
        assert!(monitor.report().checks[0].error.is_none());
    }

    #[test]
    fn test_report_shape() {
        let monitor = monitor();
        monitor.register_check("broker", || Ok(true));
        monitor.register_check("circuit", || Ok(false));

        let report = monitor.report();
        assert_eq!(report.service, "test-service");
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.checks.len(), 2);
        assert!(report.checks.iter().all(|c| c.last_check.is_some()));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["checks"][1]["error"], "check returned false");

        assert!(report.to_json().unwrap().contains("\n  \"service\""));

        let summary = report.format_summary();
        assert_eq!(
            summary,
            "Health status - test-service: DEGRADED (1/2 checks healthy, uptime 0 min)"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_polls_until_stopped() {
        let monitor = monitor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        monitor.register_check("broker", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });

        assert!(monitor.start());
        assert!(!monitor.start());
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(calls.load(Ordering::SeqCst) >= 3);

        assert!(monitor.stop().await);
        assert!(!monitor.is_running());
        let after_stop = calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
        assert!(!monitor.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let monitor = monitor();
        assert!(monitor.start());
        assert!(monitor.stop().await);
        assert!(monitor.start());
        assert!(monitor.stop().await);
    }
}
