use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::info;

use super::{RegisteredService, RegistryDriver};
use crate::model::Value;

/// A `reqwest`-backed [`RegistryDriver`] speaking the registry agent's local
/// HTTP API (Consul-agent-compatible: `/v1/agent/service/*`, `/v1/agent/check/*`).
pub struct HttpRegistryDriver {
    base_url: String,
    client: reqwest::Client,
    /// `DRY_RUN` / `--dry-run`: mutating calls (`register`/`deregister`)
    /// are logged and short-circuited to a synthetic success instead of
    /// reaching the agent.
    dry_run: bool,
}

impl HttpRegistryDriver {
    pub fn new(base_url: impl Into<String>, token: Option<&str>) -> Self {
        Self::with_dry_run(base_url, token, false)
    }

    pub fn with_dry_run(base_url: impl Into<String>, token: Option<&str>, dry_run: bool) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(token).expect("token is a valid header value");
            value.set_sensitive(true);
            headers.insert("X-Consul-Token", value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .default_headers(headers)
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
struct RawService {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Namespace", default)]
    namespace: Option<String>,
    #[serde(rename = "Partition", default)]
    partition: Option<String>,
    #[serde(rename = "Meta", default)]
    meta: BTreeMap<String, String>,
}

#[async_trait]
impl RegistryDriver for HttpRegistryDriver {
    async fn register(&self, definition: &Value, replace_existing_checks: bool) -> anyhow::Result<()> {
        if self.dry_run {
            let id = definition.as_object().and_then(|o| o.get("id")).and_then(Value::as_str);
            info!(id = ?id, "dry-run: would register service");
            return Ok(());
        }
        self.client
            .put(self.url("/v1/agent/service/register"))
            .query(&[(
                "replace-existing-checks",
                replace_existing_checks.to_string(),
            )])
            .header("content-type", "application/json")
            .body(definition.to_canonical_json())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn deregister(
        &self,
        id: &str,
        namespace: Option<&str>,
        partition: Option<&str>,
    ) -> anyhow::Result<()> {
        if self.dry_run {
            info!(id, "dry-run: would deregister service");
            return Ok(());
        }
        let mut query = Vec::new();
        if let Some(ns) = namespace {
            query.push(("ns", ns));
        }
        if let Some(partition) = partition {
            query.push(("partition", partition));
        }
        self.client
            .put(self.url(&format!("/v1/agent/service/deregister/{id}")))
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn pass_check(&self, check_id: &str, note: Option<&str>) -> anyhow::Result<()> {
        let mut query = Vec::new();
        if let Some(note) = note {
            query.push(("note", note));
        }
        self.client
            .put(self.url(&format!("/v1/agent/check/pass/{check_id}")))
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn services(&self) -> anyhow::Result<BTreeMap<String, RegisteredService>> {
        let resp = self
            .client
            .get(self.url("/v1/agent/services"))
            .send()
            .await?
            .error_for_status()?;
        let raw: BTreeMap<String, RawService> = resp.json().await?;
        Ok(raw
            .into_iter()
            .map(|(id, s)| {
                (
                    id,
                    RegisteredService {
                        service: s.service,
                        namespace: s.namespace,
                        partition: s.partition,
                        meta: s.meta,
                    },
                )
            })
            .collect())
    }
}
