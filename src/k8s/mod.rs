/// Kubernetes cluster access and ephemeral resource handling
pub mod dynamic;
pub mod exec;
pub mod gateway;
pub mod lifecycle;
pub mod naming;
pub mod resources;

#[cfg(test)]
pub mod fake;

pub use gateway::{ClusterGateway, GatewayError, KubeGateway};
pub use lifecycle::ResourceManager;
