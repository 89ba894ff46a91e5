//! Graph sink: where discovered nodes and dependency edges are persisted.

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::types::{ContainerDetails, ContainerId, ContainerStatus, PortMapping};

pub mod neo4j;
pub use neo4j::Neo4jSink;

/// Edge content used when a frame carried no TCP/UDP payload.
pub const NO_APP_LAYER: &str = "no app layer";

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to connect to graph store: {0}")]
    Connect(#[source] neo4rs::Error),
    #[error("graph query `{op}` failed: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: neo4rs::Error,
    },
    #[error("graph store rejected request: {0}")]
    Rejected(String),
}

/// Properties of a container node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerNode {
    pub id: ContainerId,
    pub name: String,
    pub status: ContainerStatus,
    pub ports: Vec<PortMapping>,
    pub ip: Option<Ipv4Addr>,
    pub hostname: String,
}

impl ContainerNode {
    pub fn from_details(details: &ContainerDetails, ip: Option<Ipv4Addr>, hostname: &str) -> Self {
        Self {
            id: details.id.clone(),
            name: details.name.clone(),
            status: details.status,
            ports: details.ports.clone(),
            ip,
            hostname: hostname.to_string(),
        }
    }

    /// One `port/proto -> hostIP:hostPort` line per published binding.
    pub fn ports_property(&self) -> String {
        self.ports
            .iter()
            .map(|p| format!("{p}\n"))
            .collect()
    }

    /// Empty when the container has no address yet.
    pub fn ip_property(&self) -> String {
        self.ip.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

/// Opaque application-layer bytes seen on the first frame of a flow.
#[derive(Clone, PartialEq, Eq)]
pub enum AppLayerContent {
    Payload(Vec<u8>),
    Absent,
}

impl AppLayerContent {
    pub fn from_payload(payload: Option<&[u8]>) -> Self {
        match payload {
            Some(bytes) if !bytes.is_empty() => AppLayerContent::Payload(bytes.to_vec()),
            _ => AppLayerContent::Absent,
        }
    }
}

impl fmt::Debug for AppLayerContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppLayerContent::Payload(bytes) => write!(f, "Payload({} bytes)", bytes.len()),
            AppLayerContent::Absent => f.write_str(NO_APP_LAYER),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Container(ContainerId),
    External(Ipv4Addr),
}

/// "`source` was observed sending traffic to `target`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub source: ContainerId,
    pub target: Endpoint,
    pub content: AppLayerContent,
}

#[async_trait]
pub trait GraphSink: Send + Sync {
    async fn insert_container(&self, node: &ContainerNode) -> Result<(), SinkError>;

    /// Replaces the status label and every property of an existing node.
    async fn update_container(&self, node: &ContainerNode) -> Result<(), SinkError>;

    /// Removes the node and all of its relationships.
    async fn delete_container(&self, id: &str) -> Result<(), SinkError>;

    async fn insert_external(&self, ip: Ipv4Addr) -> Result<(), SinkError>;

    async fn add_dependency(&self, dependency: &Dependency) -> Result<(), SinkError>;

    /// Removes every node and relationship.
    async fn drop_all(&self) -> Result<(), SinkError>;
}
