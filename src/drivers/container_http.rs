use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::info;

use super::{ContainerCreateRequest, ContainerDriver, CreateOutcome, StartOutcome};
use crate::model::{ContainerInspect, ContainerState, ContainerSummary, HealthcheckSpec, NetworkEndpoint};

/// A `reqwest`-backed [`ContainerDriver`] speaking a Docker-Engine-API-compatible
/// HTTP protocol over a configured base URL (typically a UNIX socket proxied
/// through a local HTTP shim, or a TCP endpoint).
pub struct HttpContainerDriver {
    base_url: String,
    client: reqwest::Client,
    /// `DRY_RUN` / `--dry-run`: mutating calls (`create`/`start`/`remove`)
    /// are logged and short-circuited to a synthetic success instead of
    /// reaching the runtime.
    dry_run: bool,
}

impl HttpContainerDriver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_dry_run(base_url, false)
    }

    pub fn with_dry_run(base_url: impl Into<String>, dry_run: bool) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client builds with static configuration");
        Self {
            base_url: base_url.into(),
            client,
            dry_run,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Deserialize)]
struct RawSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
}

fn parse_state(raw: &str) -> ContainerState {
    match raw {
        "created" => ContainerState::Created,
        "running" => ContainerState::Running,
        "paused" => ContainerState::Paused,
        "restarting" => ContainerState::Restarting,
        "removing" => ContainerState::Removing,
        "exited" => ContainerState::Exited,
        _ => ContainerState::Dead,
    }
}

#[derive(Deserialize)]
struct RawInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: RawInspectState,
    #[serde(rename = "Config")]
    config: RawInspectConfig,
    #[serde(rename = "NetworkSettings")]
    network_settings: RawNetworkSettings,
}

#[derive(Deserialize)]
struct RawInspectState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Deserialize)]
struct RawInspectConfig {
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "Healthcheck", default)]
    healthcheck: Option<RawHealthcheck>,
}

#[derive(Deserialize)]
struct RawHealthcheck {
    #[serde(rename = "Test", default)]
    test: Vec<String>,
    #[serde(rename = "Interval", default)]
    interval: Option<i64>,
}

#[derive(Deserialize)]
struct RawNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: BTreeMap<String, RawNetwork>,
}

#[derive(Deserialize)]
struct RawNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[async_trait]
impl ContainerDriver for HttpContainerDriver {
    async fn list(&self, all: bool) -> anyhow::Result<Vec<ContainerSummary>> {
        let resp = self
            .client
            .get(self.url("/containers/json"))
            .query(&[("all", all.to_string())])
            .send()
            .await?
            .error_for_status()?;
        let raw: Vec<RawSummary> = resp.json().await?;
        Ok(raw
            .into_iter()
            .map(|r| ContainerSummary {
                id: r.id,
                state: parse_state(&r.state),
                labels: r.labels,
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> anyhow::Result<ContainerInspect> {
        let resp = self
            .client
            .get(self.url(&format!("/containers/{id}/json")))
            .send()
            .await?
            .error_for_status()?;
        let raw: RawInspect = resp.json().await?;

        let summary = ContainerSummary {
            id: raw.id,
            state: parse_state(&raw.state.status),
            labels: raw.config.labels,
        };
        let networks = raw
            .network_settings
            .networks
            .into_iter()
            .map(|(network_name, n)| NetworkEndpoint {
                network_name,
                ip_address: n.ip_address,
            })
            .collect();
        let healthcheck = raw.config.healthcheck.map(|h| HealthcheckSpec {
            test: h.test,
            interval_ns: h.interval,
        });

        Ok(ContainerInspect {
            summary,
            name: raw.name,
            networks,
            healthcheck,
        })
    }

    async fn exists(&self, id: &str) -> anyhow::Result<bool> {
        let resp = self
            .client
            .get(self.url(&format!("/containers/{id}/json")))
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => anyhow::bail!("unexpected status inspecting container {id}: {status}"),
        }
    }

    async fn start(&self, id_or_name: &str) -> anyhow::Result<StartOutcome> {
        if self.dry_run {
            info!(id_or_name, "dry-run: would start container");
            return Ok(StartOutcome::Started);
        }
        let resp = self
            .client
            .post(self.url(&format!("/containers/{id_or_name}/start")))
            .send()
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT => Ok(StartOutcome::Started),
            StatusCode::NOT_MODIFIED => Ok(StartOutcome::AlreadyRunning),
            status => anyhow::bail!("unexpected status starting container {id_or_name}: {status}"),
        }
    }

    async fn create(&self, request: &ContainerCreateRequest) -> anyhow::Result<CreateOutcome> {
        if self.dry_run {
            info!(name = %request.name, image = %request.image, "dry-run: would create sidecar container");
            return Ok(CreateOutcome::Created(format!("dry-run-{}", request.name)));
        }
        let body = serde_json::json!({
            "Image": request.image,
            "Cmd": request.command,
            "Labels": request.labels,
            "HostConfig": {
                "NetworkMode": request.network_mode,
                "CapAdd": request.cap_add,
                "SecurityOpt": request.security_opt,
            },
        });
        let resp = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", request.name.as_str())])
            .json(&body)
            .send()
            .await?;
        match resp.status() {
            StatusCode::CONFLICT => Ok(CreateOutcome::AlreadyExists),
            status if status.is_success() => {
                #[derive(Deserialize)]
                struct CreateResponse {
                    #[serde(rename = "Id")]
                    id: String,
                }
                let created: CreateResponse = resp.json().await?;
                Ok(CreateOutcome::Created(created.id))
            }
            status => anyhow::bail!("unexpected status creating container {}: {status}", request.name),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> anyhow::Result<()> {
        if self.dry_run {
            info!(id, "dry-run: would remove container");
            return Ok(());
        }
        let resp = self
            .client
            .delete(self.url(&format!("/containers/{id}")))
            .query(&[("force", force.to_string())])
            .send()
            .await?;
        match resp.status() {
            status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
            status => anyhow::bail!("unexpected status removing container {id}: {status}"),
        }
    }
}
