use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required but was not set")]
    Missing(&'static str),
    #[error("{key} is set to an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Configuration recognized from the environment (spec §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub consul_http_addr: String,
    pub consul_http_token: Option<String>,
    pub docker_sock: String,
    pub state_path: String,
    pub metrics_addr: String,
    pub sidecar_enabled: bool,
    pub sidecar_image: Option<String>,
    pub sidecar_consul_http: Option<String>,
    pub sidecar_consul_grpc: Option<String>,
    pub sidecar_grpc_tls: bool,
    pub sidecar_grpc_ca_file: Option<String>,
    pub sidecar_prometheus_bind_addr: Option<String>,
    pub clean_interval: Duration,
    pub dry_run: bool,
    pub agent_id: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let consul_http_addr = require_env("CONSUL_HTTP_ADDR")?;
        let consul_http_token = optional_env("CONSUL_HTTP_TOKEN").filter(|v| !v.is_empty());

        let docker_sock = optional_env("DOCKER_SOCK")
            .or_else(|| optional_env("DOCKER_SOCKET"))
            .unwrap_or_else(|| "unix:///var/run/docker.sock".to_string());

        let state_path =
            optional_env("STATE_PATH").unwrap_or_else(|| "/var/lib/consul-registrator/state.json".to_string());

        let metrics_addr = optional_env("METRICS_ADDR").unwrap_or_else(|| "0.0.0.0:9102".to_string());

        let sidecar_enabled = parse_bool(optional_env("SIDECAR_ENABLED").as_deref());
        let sidecar_image = optional_env("SIDECAR_IMAGE");
        let sidecar_consul_http = optional_env("SIDECAR_CONSUL_HTTP");
        let sidecar_consul_grpc = optional_env("SIDECAR_CONSUL_GRPC");
        let sidecar_grpc_tls = parse_bool(optional_env("SIDECAR_GRPC_TLS").as_deref());
        let sidecar_grpc_ca_file = optional_env("SIDECAR_GRPC_CA_FILE");

        let sidecar_prometheus_bind_addr = optional_env("SIDECAR_PROMETHEUS_BIND_ADDR")
            .filter(|v| !matches!(v.trim().to_lowercase().as_str(), "" | "0" | "off" | "false" | "disabled"));

        let clean_interval_secs: u64 = optional_env("CLEAN_INTERVAL")
            .map(|v| {
                v.parse().map_err(|_| ConfigError::Invalid {
                    key: "CLEAN_INTERVAL",
                    value: v.clone(),
                    reason: "must be an integer number of seconds",
                })
            })
            .transpose()?
            .unwrap_or(300);

        let dry_run = parse_bool(optional_env("DRY_RUN").as_deref());
        let agent_id = optional_env("AGENT_ID").unwrap_or_else(|| "consul-registrator".to_string());

        Ok(Config {
            consul_http_addr,
            consul_http_token,
            docker_sock,
            state_path,
            metrics_addr,
            sidecar_enabled,
            sidecar_image,
            sidecar_consul_http,
            sidecar_consul_grpc,
            sidecar_grpc_tls,
            sidecar_grpc_ca_file,
            sidecar_prometheus_bind_addr,
            clean_interval: Duration::from_secs(clean_interval_secs),
            dry_run,
            agent_id,
        })
    }

    /// Whether enough configuration is present to create sidecars at all
    /// (spec §4.5's "misconfigured" state).
    pub fn sidecar_configured(&self) -> bool {
        self.sidecar_enabled
            && self.sidecar_image.is_some()
            && self.sidecar_consul_http.is_some()
            && self.sidecar_consul_grpc.is_some()
    }
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Boolean coercion per spec §4.2's "Boolean coercion" rule: native
/// booleans and the strings `1|true|yes|y|on` (case-insensitive, trimmed)
/// are true; everything else is false.
pub(crate) fn parse_bool(raw: Option<&str>) -> bool {
    match raw {
        Some(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_coercion_accepts_documented_truthy_strings() {
        for v in ["1", "true", "YES", " y ", "On"] {
            assert!(parse_bool(Some(v)), "{v:?} should be truthy");
        }
        for v in ["0", "false", "no", "", "maybe"] {
            assert!(!parse_bool(Some(v)), "{v:?} should be falsy");
        }
        assert!(!parse_bool(None));
    }
}
