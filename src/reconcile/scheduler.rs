//! The periodic tick driving the reconciler loop (spec §4's component
//! table, row 7; spec §5's concurrency model).
//!
//! Scheduling is single-threaded cooperative at the reconciler level: one
//! cycle runs at a time, and at least [`MIN_TICK_INTERVAL`] of wall-clock
//! sleep separates the end of one cycle from the start of the next. The
//! optional clean pass runs on its own interval but is routed through the
//! same `tokio::sync::Mutex<Reconciler>` so it can never race a main cycle
//! (spec §5, §9 "Single-writer invariant").

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::reconcile::reconciler::Reconciler;

/// Minimum wall-clock sleep between the end of one cycle and the start of
/// the next (spec §5).
pub const MIN_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Drives the main reconcile loop and, optionally, a concurrent clean-pass
/// loop, both serialized through one [`Mutex`].
pub struct Scheduler {
    reconciler: Arc<Mutex<Reconciler>>,
    tick_interval: Duration,
    clean_interval: Option<Duration>,
}

impl Scheduler {
    pub fn new(reconciler: Reconciler, tick_interval: Duration, clean_interval: Option<Duration>) -> Self {
        Self {
            reconciler: Arc::new(Mutex::new(reconciler)),
            tick_interval: tick_interval.max(MIN_TICK_INTERVAL),
            clean_interval,
        }
    }

    /// Runs a single cycle and returns, independent of the periodic loop
    /// (spec §6 CLI flag `--once`).
    pub async fn run_once(&self) -> crate::Result<crate::reconcile::reconciler::CycleReport> {
        self.reconciler.lock().await.run_once().await
    }

    /// Runs the scheduler loop forever, until `shutdown` resolves. The
    /// between-tick sleep is what a process signal interrupts (spec §5
    /// "Cancellation & timeouts": "Cancellation of the daemon interrupts
    /// the between-tick sleep, not a cycle in flight").
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        let clean_task = self.clean_interval.map(|interval| {
            let reconciler = self.reconciler.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let mut guard = reconciler.lock().await;
                    match guard.run_clean_pass().await {
                        Ok(report) if report.removed > 0 || report.errors > 0 => {
                            info!(removed = report.removed, errors = report.errors, "clean pass complete");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "clean pass failed"),
                    }
                }
            })
        });

        loop {
            // A running cycle is never raced against shutdown: a signal
            // arriving mid-cycle must let it finish (spec §5
            // "Cancellation & timeouts" — only the between-tick sleep
            // below is shutdown-interruptible).
            {
                let mut guard = self.reconciler.lock().await;
                if let Err(e) = guard.run_once().await {
                    warn!(error = %e, "reconciliation cycle failed");
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received during tick sleep, exiting scheduler loop");
                    break;
                }
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
        }

        if let Some(task) = clean_task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ContainerCreateRequest, ContainerDriver, CreateOutcome, RegisteredService, RegistryDriver, StartOutcome};
    use crate::model::{ContainerInspect, ContainerSummary, Value};
    use crate::reconcile::normalizer::NormalizerConfig;
    use crate::reconcile::sidecar::SidecarConfig;
    use crate::Metrics;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tick_interval_is_floored_at_the_spec_minimum() {
        assert_eq!(
            Duration::from_secs(3).max(MIN_TICK_INTERVAL),
            MIN_TICK_INTERVAL
        );
        assert_eq!(Duration::from_secs(20).max(MIN_TICK_INTERVAL), Duration::from_secs(20));
    }

    /// A container driver whose `list` call takes long enough that a
    /// shutdown signal fired right after `run` starts will land squarely
    /// in the middle of the first cycle.
    struct SlowContainerDriver {
        delay: Duration,
        completed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ContainerDriver for SlowContainerDriver {
        async fn list(&self, _all: bool) -> anyhow::Result<Vec<ContainerSummary>> {
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn inspect(&self, _id: &str) -> anyhow::Result<ContainerInspect> {
            unreachable!()
        }
        async fn exists(&self, _id: &str) -> anyhow::Result<bool> {
            unreachable!()
        }
        async fn start(&self, _id: &str) -> anyhow::Result<StartOutcome> {
            unreachable!()
        }
        async fn create(&self, _r: &ContainerCreateRequest) -> anyhow::Result<CreateOutcome> {
            unreachable!()
        }
        async fn remove(&self, _id: &str, _force: bool) -> anyhow::Result<()> {
            unreachable!()
        }
    }

    struct NoopRegistryDriver;

    #[async_trait]
    impl RegistryDriver for NoopRegistryDriver {
        async fn register(&self, _definition: &Value, _replace: bool) -> anyhow::Result<()> {
            Ok(())
        }
        async fn deregister(&self, _id: &str, _ns: Option<&str>, _partition: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn pass_check(&self, _check_id: &str, _note: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn services(&self) -> anyhow::Result<BTreeMap<String, RegisteredService>> {
            Ok(BTreeMap::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_cycle_lets_the_cycle_finish() {
        let completed = Arc::new(AtomicUsize::new(0));
        let container_driver = Arc::new(SlowContainerDriver {
            delay: Duration::from_secs(5),
            completed: completed.clone(),
        });
        let registry_driver = Arc::new(NoopRegistryDriver);
        let state_path = std::env::temp_dir()
            .join(format!("registrator-scheduler-test-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&state_path);

        let metrics = Metrics::default().register(&prometheus::Registry::new()).unwrap();
        let reconciler = Reconciler::new(
            container_driver,
            registry_driver,
            &state_path,
            NormalizerConfig::default(),
            SidecarConfig::default(),
            "consul-registrator".to_string(),
            metrics,
        );
        let scheduler = Scheduler::new(reconciler, Duration::from_secs(30), None);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let shutdown = async {
            let _ = rx.await;
        };

        let run = tokio::spawn(scheduler.run(shutdown));
        // Let the cycle start (and block on its simulated delay), then
        // signal shutdown while it is still in flight.
        tokio::time::sleep(Duration::from_millis(1)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(10), run).await.unwrap().unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 1, "in-flight cycle must run to completion");
        std::fs::remove_file(&state_path).ok();
    }
}
