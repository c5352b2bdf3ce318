pub mod container;
pub mod identity;
pub mod value;

pub use container::{ContainerInspect, ContainerState, ContainerSummary, HealthcheckSpec, NetworkEndpoint};
pub use identity::ServiceIdentity;
pub use value::{Map, Value};
