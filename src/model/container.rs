use std::collections::BTreeMap;

/// Coarse lifecycle state of a container, as reported by the runtime
/// driver's list/inspect calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

/// The summary form returned by the runtime driver's `list` call: just
/// enough to find containers and read their labels without paying for a
/// full inspect.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub state: ContainerState,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSummary {
    /// Is this container one the engine itself created as a sidecar?
    pub fn is_engine_sidecar(&self) -> bool {
        self.labels
            .get("consul-registrator")
            .map(|v| v == "sidecar")
            .unwrap_or(false)
    }

    /// The `service-id` label value an engine-owned sidecar carries.
    pub fn sidecar_target_identity(&self) -> Option<&str> {
        self.labels.get("service-id").map(String::as_str)
    }

    /// Label keys of the form `consul.service.<name>`, sorted for
    /// deterministic processing order.
    pub fn service_label_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .labels
            .keys()
            .filter(|k| k.starts_with("consul.service.") && k.len() > "consul.service.".len())
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Whether the exact key `consul.service` (no suffix) is present —
    /// warned about and ignored.
    pub fn has_bare_service_label(&self) -> bool {
        self.labels.contains_key("consul.service")
    }

    /// The label suffix of a `consul.service.<name>` key.
    pub fn service_label_suffix(key: &str) -> Option<&str> {
        key.strip_prefix("consul.service.")
    }

    /// Whether `consul.sidecar.<name>` is present for the given service name.
    pub fn requests_sidecar(&self, service_name: &str) -> bool {
        self.labels
            .contains_key(&format!("consul.sidecar.{service_name}"))
    }
}

/// A single IP endpoint on one of the container's attached networks.
#[derive(Debug, Clone)]
pub struct NetworkEndpoint {
    pub network_name: String,
    pub ip_address: String,
}

/// A container-level healthcheck as reported by the runtime's inspect form.
/// The engine only reads this; it never writes it.
#[derive(Debug, Clone, Default)]
pub struct HealthcheckSpec {
    pub test: Vec<String>,
    pub interval_ns: Option<i64>,
}

/// The richer form returned by the runtime driver's `inspect` call.
#[derive(Debug, Clone)]
pub struct ContainerInspect {
    pub summary: ContainerSummary,
    /// Display name as reported by the runtime, e.g. `/my-app-1`.
    pub name: String,
    pub networks: Vec<NetworkEndpoint>,
    pub healthcheck: Option<HealthcheckSpec>,
}

impl ContainerInspect {
    /// The container's display name stripped of a leading `/`.
    pub fn stripped_name(&self) -> &str {
        self.name.strip_prefix('/').unwrap_or(&self.name)
    }

    /// The first non-empty IP address across the inspected networks, in
    /// whatever order the runtime driver reported them.
    pub fn first_network_address(&self) -> Option<&str> {
        self.networks
            .iter()
            .map(|n| n.ip_address.as_str())
            .find(|ip| !ip.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(labels: &[(&str, &str)]) -> ContainerSummary {
        ContainerSummary {
            id: "abc123".into(),
            state: ContainerState::Running,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn service_label_keys_are_sorted_and_filtered() {
        let s = summary(&[
            ("consul.service.zeta", "a"),
            ("consul.service.alpha", "b"),
            ("consul.service", "c"),
            ("other", "d"),
        ]);
        assert_eq!(s.service_label_keys(), vec!["consul.service.alpha", "consul.service.zeta"]);
        assert!(s.has_bare_service_label());
    }

    #[test]
    fn sidecar_detection_reads_engine_labels() {
        let s = summary(&[("consul-registrator", "sidecar"), ("service-id", "abc123:api")]);
        assert!(s.is_engine_sidecar());
        assert_eq!(s.sidecar_target_identity(), Some("abc123:api"));
    }
}
