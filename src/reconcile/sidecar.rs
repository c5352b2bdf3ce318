//! Sidecar container lifecycle (spec §4.5): indexes existing engine-owned
//! sidecars, decides whether a target service needs one launched, started,
//! or removed, and builds the create-request shape the container driver
//! needs.

use std::collections::HashMap;

use crate::drivers::ContainerCreateRequest;
use crate::model::{ContainerState, ContainerSummary, ServiceIdentity};

/// The narrow slice of [`crate::Config`] the sidecar lifecycle needs.
#[derive(Debug, Clone, Default)]
pub struct SidecarConfig {
    pub enabled: bool,
    pub image: Option<String>,
    pub consul_http: Option<String>,
    pub consul_grpc: Option<String>,
    pub grpc_tls: bool,
    pub grpc_ca_file: Option<String>,
}

impl SidecarConfig {
    /// Whether enough configuration is present to launch sidecars at all
    /// (spec §4.5's "engine has required driver config").
    pub fn is_configured(&self) -> bool {
        self.enabled && self.image.is_some() && self.consul_http.is_some() && self.consul_grpc.is_some()
    }
}

/// One entry in the sidecar index: the container id and coarse state of
/// an engine-owned sidecar, keyed by the service identity it targets.
#[derive(Debug, Clone)]
pub struct IndexedSidecar {
    pub container_id: String,
    pub state: ContainerState,
}

/// Indexes containers carrying `consul-registrator=sidecar` by the
/// `service-id` label they carry (spec §4.5: "The engine indexes them
/// once per tick").
pub fn index_sidecars(containers: &[ContainerSummary]) -> HashMap<ServiceIdentity, IndexedSidecar> {
    containers
        .iter()
        .filter(|c| c.is_engine_sidecar())
        .filter_map(|c| {
            let identity: ServiceIdentity = c.sidecar_target_identity()?.parse().ok()?;
            Some((
                identity,
                IndexedSidecar {
                    container_id: c.id.clone(),
                    state: c.state,
                },
            ))
        })
        .collect()
}

/// What the reconciler should do about one service identity's sidecar
/// this tick (spec §4.5's state machine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarDecision {
    /// No `consul.sidecar.<name>` label on the container, or sidecars are
    /// globally disabled: nothing to do.
    NotRequested,
    /// Indexed but not running: best-effort start.
    Start { container_id: String },
    /// Already indexed and running: nothing to do.
    AlreadyRunning,
    /// Not yet indexed: launch a new sidecar container.
    Launch,
    /// Requested but the engine lacks the driver configuration to create
    /// one; leave the target service registered and log the reason
    /// (spec §4.5's "misconfigured" state).
    Misconfigured,
}

/// Decides the sidecar action for one service identity (spec §4.5, §4.6
/// step 4e).
pub fn decide(
    requested: bool,
    config: &SidecarConfig,
    indexed: Option<&IndexedSidecar>,
) -> SidecarDecision {
    if !requested {
        return SidecarDecision::NotRequested;
    }
    if !config.is_configured() {
        return SidecarDecision::Misconfigured;
    }
    match indexed {
        None => SidecarDecision::Launch,
        Some(sidecar) if sidecar.state.is_running() => SidecarDecision::AlreadyRunning,
        Some(sidecar) => SidecarDecision::Start {
            container_id: sidecar.container_id.clone(),
        },
    }
}

/// Builds the create-request shape for a new sidecar (spec §4.5's
/// "Create-request shape"): shares the parent's network namespace,
/// declares itself in its command line, binds admin to loopback and
/// readiness to `0.0.0.0:19100`, and speaks to the registry via the
/// configured gRPC + HTTP endpoints. Grants `NET_ADMIN` and
/// `no-new-privileges` when transparent-proxy mode was requested.
pub fn build_create_request(
    identity: &ServiceIdentity,
    parent_container_id: &str,
    transparent_proxy: bool,
    config: &SidecarConfig,
) -> ContainerCreateRequest {
    let mut command = vec![
        "consul-sidecar".to_string(),
        "-sidecar-for".to_string(),
        identity.to_string(),
        "-admin-bind".to_string(),
        "127.0.0.1:19001".to_string(),
        "-ready-bind".to_string(),
        "0.0.0.0:19100".to_string(),
    ];
    if let Some(http) = &config.consul_http {
        command.push("-http-addr".to_string());
        command.push(http.clone());
    }
    if let Some(grpc) = &config.consul_grpc {
        command.push("-grpc-addr".to_string());
        command.push(grpc.clone());
    }
    if config.grpc_tls {
        command.push("-grpc-tls".to_string());
    }
    if let Some(ca) = &config.grpc_ca_file {
        command.push("-grpc-ca-file".to_string());
        command.push(ca.clone());
    }
    if transparent_proxy {
        command.push("-transparent-proxy".to_string());
    }

    let mut labels = std::collections::BTreeMap::new();
    labels.insert("consul-registrator".to_string(), "sidecar".to_string());
    labels.insert("service-id".to_string(), identity.to_string());

    let (cap_add, security_opt) = if transparent_proxy {
        (vec!["NET_ADMIN".to_string()], vec!["no-new-privileges".to_string()])
    } else {
        (Vec::new(), Vec::new())
    };

    ContainerCreateRequest {
        name: identity.sidecar_container_name(),
        image: config.image.clone().unwrap_or_default(),
        network_mode: format!("container:{parent_container_id}"),
        command,
        labels,
        cap_add,
        security_opt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContainerState;

    fn configured() -> SidecarConfig {
        SidecarConfig {
            enabled: true,
            image: Some("consul-sidecar:latest".into()),
            consul_http: Some("http://127.0.0.1:8500".into()),
            consul_grpc: Some("127.0.0.1:8502".into()),
            grpc_tls: false,
            grpc_ca_file: None,
        }
    }

    #[test]
    fn not_requested_short_circuits_before_config_check() {
        assert_eq!(decide(false, &SidecarConfig::default(), None), SidecarDecision::NotRequested);
    }

    #[test]
    fn missing_config_is_misconfigured() {
        assert_eq!(decide(true, &SidecarConfig::default(), None), SidecarDecision::Misconfigured);
    }

    #[test]
    fn unindexed_requests_launch() {
        assert_eq!(decide(true, &configured(), None), SidecarDecision::Launch);
    }

    #[test]
    fn stopped_sidecar_requests_start() {
        let indexed = IndexedSidecar {
            container_id: "sc1".into(),
            state: ContainerState::Exited,
        };
        assert_eq!(
            decide(true, &configured(), Some(&indexed)),
            SidecarDecision::Start { container_id: "sc1".into() }
        );
    }

    #[test]
    fn running_sidecar_is_a_no_op() {
        let indexed = IndexedSidecar {
            container_id: "sc1".into(),
            state: ContainerState::Running,
        };
        assert_eq!(decide(true, &configured(), Some(&indexed)), SidecarDecision::AlreadyRunning);
    }

    #[test]
    fn create_request_shares_network_namespace_and_names_deterministically() {
        let identity = ServiceIdentity::new("abc123", "api");
        let req = build_create_request(&identity, "abc123", false, &configured());
        assert_eq!(req.name, "consul-sidecar-abc123_api");
        assert_eq!(req.network_mode, "container:abc123");
        assert!(req.cap_add.is_empty());
        assert!(req.command.contains(&"abc123:api".to_string()));
    }

    #[test]
    fn transparent_proxy_grants_net_admin_and_no_new_privileges() {
        let identity = ServiceIdentity::new("abc123", "api");
        let req = build_create_request(&identity, "abc123", true, &configured());
        assert!(req.cap_add.contains(&"NET_ADMIN".to_string()));
        assert!(req.security_opt.contains(&"no-new-privileges".to_string()));
        assert!(req.command.contains(&"-transparent-proxy".to_string()));
    }

    #[test]
    fn index_sidecars_keys_by_target_identity() {
        let containers = vec![ContainerSummary {
            id: "sc1".into(),
            state: ContainerState::Running,
            labels: [
                ("consul-registrator".to_string(), "sidecar".to_string()),
                ("service-id".to_string(), "abc123:api".to_string()),
            ]
            .into_iter()
            .collect(),
        }];
        let index = index_sidecars(&containers);
        assert_eq!(index.len(), 1);
        assert!(index.contains_key(&ServiceIdentity::new("abc123", "api")));
    }
}
