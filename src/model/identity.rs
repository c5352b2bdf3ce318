use std::fmt;

/// The durable key for a registered service and its sidecar: the engine
/// never records, proxies, or looks up anything except by this identity.
///
/// Stable for as long as the backing container exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceIdentity {
    container_id: String,
    service_name: String,
}

impl ServiceIdentity {
    pub fn new(container_id: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            service_name: service_name.into(),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The sidecar container name this identity's sidecar would carry:
    /// `consul-sidecar-<identity-with-":"-replaced-by-"_">`.
    pub fn sidecar_container_name(&self) -> String {
        format!("consul-sidecar-{}_{}", self.container_id, self.service_name)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container_id, self.service_name)
    }
}

impl std::str::FromStr for ServiceIdentity {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (container_id, service_name) = s.split_once(':').ok_or(ParseIdentityError)?;
        if container_id.is_empty() || service_name.is_empty() {
            return Err(ParseIdentityError);
        }
        Ok(ServiceIdentity::new(container_id, service_name))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("service identity must be of the form <container-id>:<service-name>")]
pub struct ParseIdentityError;
