//! Decides whether a normalized service payload must be (re-)registered
//! this tick (spec §4.3).
//!
//! Two in-memory maps, keyed by service identity, are all the state this
//! component owns: the fingerprint of the last payload successfully
//! registered, and the wall-clock time of that registration. Both are
//! only mutated by the reconciler, on successful register (spec §9,
//! "single-writer invariant").

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::model::{ServiceIdentity, Value};

/// Wall-clock bound after which an unchanged service is re-registered
/// anyway (spec §4.3, GLOSSARY "Refresh interval").
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub type Fingerprint = [u8; 32];

/// SHA-256 of the payload's canonical serialized form (spec §4.3,
/// GLOSSARY "Fingerprint").
pub fn fingerprint(payload: &Value) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_canonical_json());
    hasher.finalize().into()
}

pub fn fingerprint_hex(fp: &Fingerprint) -> String {
    fp.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn fingerprint_from_hex(hex: &str) -> Option<Fingerprint> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Why the change detector decided to register (or not) — surfaced for
/// logging/diagnostics, not load-bearing for the decision itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterDecision {
    FirstObservation,
    FingerprintChanged,
    RefreshDue,
    Skip,
}

impl RegisterDecision {
    pub fn should_register(self) -> bool {
        !matches!(self, RegisterDecision::Skip)
    }
}

/// The change detector's in-memory bookkeeping.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    fingerprints: HashMap<ServiceIdentity, Fingerprint>,
    last_registered: HashMap<ServiceIdentity, Instant>,
    refresh_interval: Option<Duration>,
}

impl ChangeDetector {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            fingerprints: HashMap::new(),
            last_registered: HashMap::new(),
            refresh_interval: Some(refresh_interval),
        }
    }

    /// Seeds the fingerprint map from a reloaded [`crate::reconcile::state_store::StateStore`]
    /// without seeding a last-registered timestamp — a restarted process
    /// has no wall-clock memory of when it last registered, so the
    /// refresh clock effectively restarts (benign: re-registering the
    /// same identity is idempotent per spec §9).
    pub fn seed_fingerprint(&mut self, identity: ServiceIdentity, fp: Fingerprint) {
        self.fingerprints.insert(identity, fp);
    }

    /// Spec §4.3: register iff identity unseen, fingerprint differs, or
    /// the refresh interval has elapsed since last register.
    pub fn decide(&self, identity: &ServiceIdentity, payload: &Value) -> RegisterDecision {
        let fp = fingerprint(payload);
        match self.fingerprints.get(identity) {
            None => RegisterDecision::FirstObservation,
            Some(stored) if *stored != fp => RegisterDecision::FingerprintChanged,
            Some(_) => match (self.refresh_interval, self.last_registered.get(identity)) {
                (Some(interval), Some(last)) if last.elapsed() >= interval => RegisterDecision::RefreshDue,
                (Some(_), None) => RegisterDecision::RefreshDue,
                _ => RegisterDecision::Skip,
            },
        }
    }

    /// Records a successful register: updates both maps (spec §4.3,
    /// "On successful register, update both maps").
    pub fn record_registered(&mut self, identity: ServiceIdentity, payload: &Value) {
        self.fingerprints.insert(identity.clone(), fingerprint(payload));
        self.last_registered.insert(identity, Instant::now());
    }

    /// Drops all bookkeeping for an identity that has been deregistered
    /// or whose sidecar was removed.
    pub fn forget(&mut self, identity: &ServiceIdentity) {
        self.fingerprints.remove(identity);
        self.last_registered.remove(identity);
    }

    pub fn fingerprint_for(&self, identity: &ServiceIdentity) -> Option<&Fingerprint> {
        self.fingerprints.get(identity)
    }

    pub fn known_identities(&self) -> impl Iterator<Item = &ServiceIdentity> {
        self.fingerprints.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Map;

    fn payload(port: i64) -> Value {
        let mut m = Map::new();
        m.insert("port".into(), Value::Integer(port));
        Value::Object(m)
    }

    #[test]
    fn first_observation_registers() {
        let detector = ChangeDetector::new(DEFAULT_REFRESH_INTERVAL);
        let id = ServiceIdentity::new("c1", "api");
        assert_eq!(detector.decide(&id, &payload(80)), RegisterDecision::FirstObservation);
    }

    #[test]
    fn unchanged_payload_within_refresh_window_skips() {
        let mut detector = ChangeDetector::new(DEFAULT_REFRESH_INTERVAL);
        let id = ServiceIdentity::new("c1", "api");
        detector.record_registered(id.clone(), &payload(80));
        assert_eq!(detector.decide(&id, &payload(80)), RegisterDecision::Skip);
    }

    #[test]
    fn changed_fingerprint_registers() {
        let mut detector = ChangeDetector::new(DEFAULT_REFRESH_INTERVAL);
        let id = ServiceIdentity::new("c1", "api");
        detector.record_registered(id.clone(), &payload(80));
        assert_eq!(
            detector.decide(&id, &payload(81)),
            RegisterDecision::FingerprintChanged
        );
    }

    #[test]
    fn refresh_interval_elapsed_forces_register() {
        let mut detector = ChangeDetector::new(Duration::from_millis(0));
        let id = ServiceIdentity::new("c1", "api");
        detector.record_registered(id.clone(), &payload(80));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(detector.decide(&id, &payload(80)), RegisterDecision::RefreshDue);
    }

    #[test]
    fn fingerprint_hex_round_trips() {
        let fp = fingerprint(&payload(80));
        let hex = fingerprint_hex(&fp);
        assert_eq!(fingerprint_from_hex(&hex).unwrap(), fp);
    }

    #[test]
    fn forget_drops_bookkeeping() {
        let mut detector = ChangeDetector::new(DEFAULT_REFRESH_INTERVAL);
        let id = ServiceIdentity::new("c1", "api");
        detector.record_registered(id.clone(), &payload(80));
        detector.forget(&id);
        assert_eq!(detector.decide(&id, &payload(80)), RegisterDecision::FirstObservation);
    }
}
