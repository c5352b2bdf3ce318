//! The container-runtime and registry-agent drivers.
//!
//! The reconciliation engine only ever depends on the [`ContainerDriver`] /
//! [`RegistryDriver`] traits below, never on `reqwest` or a transport detail
//! directly. Default `reqwest`-backed implementations are still shipped so
//! the crate builds into a runnable daemon.

mod container_http;
mod registry_http;

pub use container_http::HttpContainerDriver;
pub use registry_http::HttpRegistryDriver;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::model::{ContainerInspect, ContainerSummary, Value};

/// Outcome of a container-create request. A 409 name collision is treated
/// as idempotent success and the caller should fall through to "ensure
/// running" rather than treat it as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(String),
    AlreadyExists,
}

/// Outcome of a container-start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Everything needed to create a sidecar container.
#[derive(Debug, Clone)]
pub struct ContainerCreateRequest {
    pub name: String,
    pub image: String,
    /// Share the parent container's network namespace, e.g. `container:<parent-id>`.
    pub network_mode: String,
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Linux capabilities to add, e.g. `NET_ADMIN` for transparent proxy mode.
    pub cap_add: Vec<String>,
    /// Security options, e.g. `no-new-privileges` for transparent proxy mode.
    pub security_opt: Vec<String>,
}

/// The consumed capability set of a container-runtime HTTP driver.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn list(&self, all: bool) -> anyhow::Result<Vec<ContainerSummary>>;
    async fn inspect(&self, id: &str) -> anyhow::Result<ContainerInspect>;
    async fn exists(&self, id: &str) -> anyhow::Result<bool>;
    async fn start(&self, id_or_name: &str) -> anyhow::Result<StartOutcome>;
    async fn create(&self, request: &ContainerCreateRequest) -> anyhow::Result<CreateOutcome>;
    async fn remove(&self, id: &str, force: bool) -> anyhow::Result<()>;
}

/// A service entry as reported by the registry's `services()` listing.
#[derive(Debug, Clone)]
pub struct RegisteredService {
    pub service: String,
    pub namespace: Option<String>,
    pub partition: Option<String>,
    pub meta: BTreeMap<String, String>,
}

/// The consumed capability set of a registry-agent HTTP driver.
#[async_trait]
pub trait RegistryDriver: Send + Sync {
    async fn register(&self, definition: &Value, replace_existing_checks: bool) -> anyhow::Result<()>;
    async fn deregister(&self, id: &str, namespace: Option<&str>, partition: Option<&str>) -> anyhow::Result<()>;
    async fn pass_check(&self, check_id: &str, note: Option<&str>) -> anyhow::Result<()>;
    async fn services(&self) -> anyhow::Result<BTreeMap<String, RegisteredService>>;
}
