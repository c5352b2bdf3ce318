use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
};

use crate::Error;

/// Prometheus metrics for the reconciliation loop, registered into a
/// caller-owned [`Registry`] so the binary can scrape them over HTTP.
#[derive(Clone)]
pub struct Metrics {
    cycles_total: IntCounter,
    cycle_errors_total: IntCounterVec,
    cycle_duration_seconds: HistogramVec,
    services_registered: IntGauge,
    sidecars_running: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            cycles_total: IntCounter::new("reconcile_cycles_total", "total reconciliation cycles run")
                .unwrap(),
            cycle_errors_total: IntCounterVec::new(
                opts!("reconcile_errors_total", "errors encountered during reconciliation, by kind"),
                &["kind"],
            )
            .unwrap(),
            cycle_duration_seconds: HistogramVec::new(
                histogram_opts!("reconcile_cycle_duration_seconds", "reconciliation cycle duration"),
                &["outcome"],
            )
            .unwrap(),
            services_registered: IntGauge::new(
                "reconcile_services_registered",
                "services currently believed registered",
            )
            .unwrap(),
            sidecars_running: IntGauge::new("reconcile_sidecars_running", "sidecar containers currently running")
                .unwrap(),
        }
    }
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> prometheus::Result<Self> {
        registry.register(Box::new(self.cycles_total.clone()))?;
        registry.register(Box::new(self.cycle_errors_total.clone()))?;
        registry.register(Box::new(self.cycle_duration_seconds.clone()))?;
        registry.register(Box::new(self.services_registered.clone()))?;
        registry.register(Box::new(self.sidecars_running.clone()))?;
        Ok(self)
    }

    /// Starts a timer for one cycle; dropping the guard records the
    /// duration and increments the cycle counter.
    pub fn count_and_measure(&self) -> CycleTimer<'_> {
        self.cycles_total.inc();
        CycleTimer {
            metrics: self,
            started: std::time::Instant::now(),
            outcome: "ok",
        }
    }

    pub fn reconcile_failure(&self, error: &Error) {
        self.cycle_errors_total.with_label_values(&[error.metric_label()]).inc();
    }

    pub fn set_services_registered(&self, count: usize) {
        self.services_registered.set(count as i64);
    }

    pub fn set_sidecars_running(&self, count: usize) {
        self.sidecars_running.set(count as i64);
    }
}

pub struct CycleTimer<'a> {
    metrics: &'a Metrics,
    started: std::time::Instant,
    outcome: &'static str,
}

impl CycleTimer<'_> {
    pub fn mark_failed(&mut self) {
        self.outcome = "failed";
    }
}

impl Drop for CycleTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .cycle_duration_seconds
            .with_label_values(&[self.outcome])
            .observe(self.started.elapsed().as_secs_f64());
    }
}
