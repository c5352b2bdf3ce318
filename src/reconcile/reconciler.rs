//! Drives one reconciliation cycle end to end (spec §4.6): list → inspect
//! → parse → normalize → diff → apply → persist.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{field, info, instrument, warn, Span};

use crate::drivers::{ContainerDriver, CreateOutcome, RegistryDriver};
use crate::model::{ContainerSummary, ServiceIdentity};
use crate::reconcile::change_detector::{self, ChangeDetector};
use crate::reconcile::label_parser;
use crate::reconcile::normalizer::{self, NormalizerConfig};
use crate::reconcile::sidecar::{self, SidecarConfig, SidecarDecision};
use crate::reconcile::state_store::StateStore;
use crate::{telemetry, Error, Metrics, Result};

/// Per-cycle wall-clock budget (spec §4.6, §5).
pub const CYCLE_DEADLINE: Duration = Duration::from_secs(30);

/// Per-tick counters, logged as one structured summary line at the end of
/// every cycle (spec §9 "Supplemented", the ambient-logging analogue of
/// the teacher's `Diagnostics::last_event` update).
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub containers_seen: usize,
    pub services_seen: usize,
    pub registered: usize,
    pub deregistered: usize,
    pub sidecars_launched: usize,
    pub sidecars_started: usize,
    pub sidecars_removed: usize,
    pub errors: usize,
}

/// Outcome of a periodic clean pass (spec §5 / §9 "Supplemented").
#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    pub removed: usize,
    pub errors: usize,
}

/// Drives the reconciliation engine. Owns every piece of mutable state
/// spec §5 calls out as single-writer: the state store, the change
/// detector's fingerprint/timestamp maps. No other task is allowed to
/// touch them (spec §9 "Single-writer invariant" — in practice this means
/// a clean pass runs through the same `Reconciler`, never a second one).
pub struct Reconciler {
    container_driver: Arc<dyn ContainerDriver>,
    registry_driver: Arc<dyn RegistryDriver>,
    state: StateStore,
    detector: ChangeDetector,
    normalizer_config: NormalizerConfig,
    sidecar_config: SidecarConfig,
    agent_id: String,
    metrics: Metrics,
}

impl Reconciler {
    pub fn new(
        container_driver: Arc<dyn ContainerDriver>,
        registry_driver: Arc<dyn RegistryDriver>,
        state_path: impl Into<std::path::PathBuf>,
        normalizer_config: NormalizerConfig,
        sidecar_config: SidecarConfig,
        agent_id: String,
        metrics: Metrics,
    ) -> Self {
        let state = StateStore::load(state_path);
        let mut detector = ChangeDetector::new(change_detector::DEFAULT_REFRESH_INTERVAL);
        for identity in state.identities() {
            if let Some(fp) = state.fingerprint_for(identity) {
                detector.seed_fingerprint(identity.clone(), *fp);
            }
        }
        Self {
            container_driver,
            registry_driver,
            state,
            detector,
            normalizer_config,
            sidecar_config,
            agent_id,
            metrics,
        }
    }

    /// Runs exactly one cycle, bounded by [`CYCLE_DEADLINE`] (spec §5
    /// "Cancellation & timeouts").
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        let mut timer = self.metrics.count_and_measure();
        match tokio::time::timeout(CYCLE_DEADLINE, self.run_cycle()).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => {
                timer.mark_failed();
                self.metrics.reconcile_failure(&e);
                Err(e)
            }
            Err(_) => {
                timer.mark_failed();
                let e = Error::DeadlineExceeded;
                self.metrics.reconcile_failure(&e);
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(trace_id))]
    async fn run_cycle(&mut self) -> Result<CycleReport> {
        let trace_id = telemetry::get_trace_id();
        Span::current().record("trace_id", field::display(&trace_id));

        let mut report = CycleReport::default();

        // Step 1: list containers. Failure aborts the whole cycle (spec §4.6 step 1, §7).
        let containers = self
            .container_driver
            .list(true)
            .await
            .map_err(Error::ContainerDriver)?;
        report.containers_seen = containers.len();

        // Step 2: build the sidecar index.
        let mut sidecar_index = sidecar::index_sidecars(&containers);

        // Step 3: seen set.
        let mut seen: HashSet<ServiceIdentity> = HashSet::new();

        // Step 4: process every non-sidecar container.
        for container in containers.iter().filter(|c| !c.is_engine_sidecar()) {
            self.process_container(container, &sidecar_index, &mut seen, &mut report).await;
        }

        // Step 5: deregister identities in local state not seen this tick.
        let stale: Vec<ServiceIdentity> = self
            .state
            .identities()
            .filter(|id| !seen.contains(id))
            .cloned()
            .collect();
        for identity in stale {
            match self.registry_driver.deregister(&identity.to_string(), None, None).await {
                Ok(()) => {
                    self.state.remove(&identity);
                    self.detector.forget(&identity);
                    report.deregistered += 1;
                }
                Err(e) => {
                    // Left in local state, retried next tick (spec §7).
                    warn!(identity = %identity, error = %e, "deregister failed, will retry next tick");
                    report.errors += 1;
                }
            }
        }

        // Step 6: remove orphaned sidecars whose target is gone.
        let orphaned: Vec<ServiceIdentity> = sidecar_index
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for identity in orphaned {
            let indexed = sidecar_index.remove(&identity).expect("key came from this map");
            match self.container_driver.remove(&indexed.container_id, true).await {
                Ok(()) => report.sidecars_removed += 1,
                Err(e) => {
                    warn!(identity = %identity, error = %e, "failed to remove orphaned sidecar");
                    report.errors += 1;
                }
            }
        }

        // Step 7: persist state store atomically.
        if let Err(e) = self.state.persist() {
            warn!(error = %e, "failed to persist state store, next cycle will retry");
            report.errors += 1;
        }

        self.metrics.set_services_registered(self.state.len());
        self.metrics.set_sidecars_running(sidecar_index.len());

        info!(
            containers_seen = report.containers_seen,
            services_seen = report.services_seen,
            registered = report.registered,
            deregistered = report.deregistered,
            sidecars_launched = report.sidecars_launched,
            sidecars_started = report.sidecars_started,
            sidecars_removed = report.sidecars_removed,
            errors = report.errors,
            "reconciliation cycle complete"
        );

        Ok(report)
    }

    async fn process_container(
        &mut self,
        container: &ContainerSummary,
        sidecar_index: &std::collections::HashMap<ServiceIdentity, sidecar::IndexedSidecar>,
        seen: &mut HashSet<ServiceIdentity>,
        report: &mut CycleReport,
    ) {
        if container.has_bare_service_label() {
            warn!(container_id = %container.id, "ignoring bare `consul.service` label with no name suffix");
        }

        let label_keys: Vec<String> = container.service_label_keys().into_iter().map(str::to_string).collect();
        if label_keys.is_empty() {
            return;
        }

        let inspect = match self.container_driver.inspect(&container.id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                warn!(container_id = %container.id, error = %e, "failed to inspect container");
                report.errors += 1;
                return;
            }
        };

        for key in label_keys {
            let Some(name) = ContainerSummary::service_label_suffix(&key) else { continue };
            let Some(source) = container.labels.get(&key) else { continue };

            let parsed = match label_parser::parse_service_block(source) {
                Ok(v) => v,
                Err(e) => {
                    warn!(container_id = %container.id, label = %key, error = %e, "failed to parse service label");
                    report.errors += 1;
                    continue;
                }
            };

            let sidecar_requested = container.requests_sidecar(name);

            let normalized = match normalizer::normalize(
                parsed,
                &container.id,
                name,
                &inspect,
                &self.normalizer_config,
                sidecar_requested,
            ) {
                Ok(v) => v,
                Err(e) => {
                    warn!(container_id = %container.id, label = %key, error = %e, "failed to normalize service definition");
                    report.errors += 1;
                    continue;
                }
            };

            let identity = ServiceIdentity::new(container.id.clone(), name);
            seen.insert(identity.clone());
            report.services_seen += 1;

            let decision = self.detector.decide(&identity, &normalized);
            if decision.should_register() {
                match self.registry_driver.register(&normalized, true).await {
                    Ok(()) => {
                        self.detector.record_registered(identity.clone(), &normalized);
                        self.state
                            .mark_registered(identity.clone(), change_detector::fingerprint(&normalized));
                        report.registered += 1;
                    }
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "register failed");
                        report.errors += 1;
                    }
                }
            }

            if sidecar_requested {
                self.drive_sidecar(&identity, container, &normalized, sidecar_index.get(&identity), report)
                    .await;
            }
        }
    }

    async fn drive_sidecar(
        &self,
        identity: &ServiceIdentity,
        container: &ContainerSummary,
        normalized: &crate::model::Value,
        indexed: Option<&sidecar::IndexedSidecar>,
        report: &mut CycleReport,
    ) {
        match sidecar::decide(true, &self.sidecar_config, indexed) {
            SidecarDecision::NotRequested | SidecarDecision::AlreadyRunning => {}
            SidecarDecision::Misconfigured => {
                warn!(
                    identity = %identity,
                    "sidecar requested but engine is not fully configured; leaving service registered without a sidecar"
                );
            }
            SidecarDecision::Start { container_id } => match self.container_driver.start(&container_id).await {
                Ok(_) => report.sidecars_started += 1,
                Err(e) => {
                    warn!(identity = %identity, error = %e, "failed to start existing sidecar");
                    report.errors += 1;
                }
            },
            SidecarDecision::Launch => {
                let transparent_proxy = normalized
                    .get_path(&["connect", "sidecar_service", "proxy", "transparent_proxy"])
                    .is_some();
                let request = sidecar::build_create_request(identity, &container.id, transparent_proxy, &self.sidecar_config);
                match self.container_driver.create(&request).await {
                    Ok(CreateOutcome::Created(_)) | Ok(CreateOutcome::AlreadyExists) => {
                        // A 409 name collision is treated as idempotent success and
                        // flows into "ensure running" (spec §4.5, §5).
                        match self.container_driver.start(&request.name).await {
                            Ok(_) => report.sidecars_launched += 1,
                            Err(e) => {
                                warn!(identity = %identity, error = %e, "sidecar created but failed to start");
                                report.errors += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "failed to create sidecar");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    /// Deregisters registry entries tagged as owned by this agent whose
    /// backing container no longer exists (spec §5's optional clean pass,
    /// §9 "Supplemented"). Read-only against the in-memory maps; routed
    /// through the same `&mut self` as `run_once` so it can never race a
    /// main cycle (spec §9 "Single-writer invariant").
    pub async fn run_clean_pass(&mut self) -> Result<CleanReport> {
        let mut clean = CleanReport::default();
        let services = self.registry_driver.services().await.map_err(Error::RegistryDriver)?;

        for (id, service) in services {
            let owned = service
                .meta
                .get("managed-by")
                .map(|v| v == &self.agent_id)
                .unwrap_or(false);
            if !owned {
                continue;
            }
            let Ok(identity) = id.parse::<ServiceIdentity>() else { continue };

            match self.container_driver.exists(identity.container_id()).await {
                Ok(true) => {}
                Ok(false) => {
                    match self
                        .registry_driver
                        .deregister(&id, service.namespace.as_deref(), service.partition.as_deref())
                        .await
                    {
                        Ok(()) => {
                            self.state.remove(&identity);
                            self.detector.forget(&identity);
                            clean.removed += 1;
                        }
                        Err(e) => {
                            warn!(identity = %identity, error = %e, "clean pass deregister failed");
                            clean.errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "clean pass failed to check container existence");
                    clean.errors += 1;
                }
            }
        }

        Ok(clean)
    }

    pub fn state_len(&self) -> usize {
        self.state.len()
    }
}
