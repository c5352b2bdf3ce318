//! Persists the set of service identities the engine believes are
//! registered, plus their last-known fingerprints, to a single JSON file
//! (spec §4.4, §6 "State-store on-disk format").
//!
//! The file is a disaster-recovery hint only: losing it never causes
//! duplicate registrations because the registry itself is the source of
//! truth and re-registering an identity is benign (spec §4.4, §9).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::ServiceIdentity;
use crate::reconcile::change_detector::{fingerprint_from_hex, fingerprint_hex, Fingerprint};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OnDisk {
    #[serde(default)]
    services: BTreeMap<String, bool>,
    #[serde(default)]
    service_hashes: BTreeMap<String, String>,
}

/// In-memory view of the persisted state, reloaded at startup and
/// rewritten atomically at the end of every cycle.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    path: PathBuf,
    services: BTreeMap<ServiceIdentity, bool>,
    hashes: BTreeMap<ServiceIdentity, Fingerprint>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            services: BTreeMap::new(),
            hashes: BTreeMap::new(),
        }
    }

    /// Loads state from disk. A missing or unreadable file loads as empty
    /// state rather than erroring (spec §4.4: "readers tolerate absent or
    /// unreadable files").
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Self::new(path),
        };
        let on_disk: OnDisk = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(_) => return Self::new(path),
        };

        let mut services = BTreeMap::new();
        for (id, present) in on_disk.services {
            if let Ok(identity) = id.parse::<ServiceIdentity>() {
                services.insert(identity, present);
            }
        }
        let mut hashes = BTreeMap::new();
        for (id, hex) in on_disk.service_hashes {
            if let (Ok(identity), Some(fp)) = (id.parse::<ServiceIdentity>(), fingerprint_from_hex(&hex)) {
                hashes.insert(identity, fp);
            }
        }

        Self { path, services, hashes }
    }

    pub fn contains(&self, identity: &ServiceIdentity) -> bool {
        self.services.contains_key(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &ServiceIdentity> {
        self.services.keys()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn fingerprint_for(&self, identity: &ServiceIdentity) -> Option<&Fingerprint> {
        self.hashes.get(identity)
    }

    /// Marks an identity as registered; only ever called after a
    /// successful register (spec §3 invariant: "never records ... a
    /// service it has not just successfully registered").
    pub fn mark_registered(&mut self, identity: ServiceIdentity, fingerprint: Fingerprint) {
        self.hashes.insert(identity.clone(), fingerprint);
        self.services.insert(identity, true);
    }

    pub fn remove(&mut self, identity: &ServiceIdentity) {
        self.services.remove(identity);
        self.hashes.remove(identity);
    }

    /// Replaces the whole file at `self.path` (spec §4.4: "Writes are
    /// whole-file replacements"), by writing to a sibling temp file and
    /// renaming over the target so a crash mid-write never leaves a
    /// truncated file (spec §5: "a partial cycle's state-store write is
    /// either complete or absent").
    pub fn persist(&self) -> io::Result<()> {
        let on_disk = OnDisk {
            services: self.services.keys().map(|id| (id.to_string(), true)).collect(),
            service_hashes: self
                .hashes
                .iter()
                .map(|(id, fp)| (id.to_string(), fingerprint_hex(fp)))
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&on_disk).expect("state store serialization is infallible");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = tmp_path_for(&self.path);
        std::fs::write(&tmp_path, &body)?;
        set_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os_name = path.file_name().unwrap_or_default().to_os_string();
    os_name.push(".tmp");
    path.with_file_name(os_name)
}

#[cfg(unix)]
fn set_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_empty_state() {
        let store = StateStore::load("/nonexistent/path/state.json");
        assert!(store.is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("registrator-state-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let mut store = StateStore::new(&path);
        let id = ServiceIdentity::new("abc123", "api");
        store.mark_registered(id.clone(), [7u8; 32]);
        store.persist().unwrap();

        let reloaded = StateStore::load(&path);
        assert!(reloaded.contains(&id));
        assert_eq!(reloaded.fingerprint_for(&id), Some(&[7u8; 32]));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"services\""));
        assert!(raw.contains("\"service_hashes\""));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_file_loads_as_empty_state() {
        let dir = std::env::temp_dir().join(format!("registrator-state-test-corrupt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = StateStore::load(&path);
        assert!(store.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn remove_drops_both_maps() {
        let mut store = StateStore::new("/tmp/unused-state.json");
        let id = ServiceIdentity::new("abc123", "api");
        store.mark_registered(id.clone(), [1u8; 32]);
        store.remove(&id);
        assert!(!store.contains(&id));
        assert!(store.fingerprint_for(&id).is_none());
    }
}
