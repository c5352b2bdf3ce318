use thiserror::Error;

/// Container/registry data model: the `Value` tree, container descriptors,
/// service definitions and service identity.
pub mod model;

/// Driver traits for the container runtime and the registry agent, plus
/// `reqwest`-backed default implementations of both.
pub mod drivers;

/// The reconciliation engine: label parsing, payload normalization,
/// change detection, state persistence, sidecar lifecycle and the
/// top-level reconciler/scheduler.
pub mod reconcile;

/// Environment-driven configuration.
pub mod config;

/// Log and trace integrations.
pub mod telemetry;

/// Metrics.
mod metrics;
pub use metrics::Metrics;

pub use config::Config;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ParseError: {0}")]
    Parse(#[from] reconcile::label_parser::ParseError),

    #[error("NormalizationError: {0}")]
    Normalization(#[from] reconcile::normalizer::NormalizationError),

    #[error("container driver error: {0}")]
    ContainerDriver(#[source] anyhow::Error),

    #[error("registry driver error: {0}")]
    RegistryDriver(#[source] anyhow::Error),

    #[error("state store error: {0}")]
    State(#[source] std::io::Error),

    #[error("cycle deadline exceeded")]
    DeadlineExceeded,

    #[error("fatal configuration error: {0}")]
    Fatal(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// A lowercase label stable enough to use as a Prometheus metric label.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Parse(_) => "parse",
            Error::Normalization(_) => "normalization",
            Error::ContainerDriver(_) => "container_driver",
            Error::RegistryDriver(_) => "registry_driver",
            Error::State(_) => "state",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::Fatal(_) => "fatal",
        }
    }
}
