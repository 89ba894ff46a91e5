use crate::types::{ContainerDetails, ContainerSummary, NetworkId, NetworkInfo, RuntimeEvent};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub mod docker;
pub use docker::DockerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to connect to container runtime: {0}")]
    Connect(#[source] bollard::errors::Error),
    #[error("runtime request `{op}` failed: {source}")]
    Request {
        op: &'static str,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("runtime returned {0} without an id")]
    MissingId(&'static str),
    #[error("event stream failed: {0}")]
    EventStream(#[source] bollard::errors::Error),
}

pub type EventStream = BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;

/// Read access to a container runtime.
///
/// Everything the state cache knows is pulled through this trait; the
/// runtime never pushes state except through [`ContainerRuntime::events`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists containers, including stopped ones when `all` is set.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    async fn list_networks(&self) -> Result<Vec<NetworkId>, RuntimeError>;

    /// Inspects a network including the endpoint of every attached container.
    async fn inspect_network(&self, id: &str) -> Result<NetworkInfo, RuntimeError>;

    /// Subscribes to container and network events. The stream ends or yields
    /// an error when the connection to the runtime is lost.
    fn events(&self) -> EventStream;
}
