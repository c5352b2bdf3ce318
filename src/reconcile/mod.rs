//! The reconciliation engine: label parsing, payload normalization,
//! change detection, state persistence, sidecar lifecycle, the top-level
//! reconciler, and the scheduler loop that drives it (spec §2, §4).

pub mod change_detector;
pub mod label_parser;
pub mod normalizer;
pub mod reconciler;
pub mod scheduler;
pub mod sidecar;
pub mod state_store;

pub use change_detector::ChangeDetector;
pub use reconciler::{CleanReport, CycleReport, Reconciler};
pub use scheduler::Scheduler;
pub use sidecar::SidecarConfig;
pub use state_store::StateStore;
