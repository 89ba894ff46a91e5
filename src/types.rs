//! Data structures shared by the runtime adapter, the state cache and the
//! event dispatcher.
//!
//! These are deliberately smaller than the runtime client's own models: only
//! the fields the dependency graph needs survive the conversion in
//! [`crate::runtime::docker`], which keeps the cache cheap to clone and lets
//! tests build fixtures without a daemon.

use std::collections::HashMap;
use std::fmt;

pub type ContainerId = String;
pub type NetworkId = String;

/// Lifecycle status reported by the runtime for a container.
///
/// The lowercase form doubles as the dynamic label of the container node in
/// the graph store, so new variants must stay valid label identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub const ALL: [ContainerStatus; 8] = [
        ContainerStatus::Created,
        ContainerStatus::Running,
        ContainerStatus::Paused,
        ContainerStatus::Restarting,
        ContainerStatus::Removing,
        ContainerStatus::Exited,
        ContainerStatus::Dead,
        ContainerStatus::Unknown,
    ];

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A container as returned by the runtime's list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub names: Vec<String>,
    pub status: ContainerStatus,
}

/// A published port binding, e.g. `80/tcp -> 0.0.0.0:8080`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub port: String,
    pub protocol: String,
    pub host_ip: String,
    pub host_port: String,
}

impl PortMapping {
    /// Splits a runtime port key such as `"80/tcp"`; a key without a protocol
    /// is treated as tcp.
    pub fn from_key(key: &str, host_ip: String, host_port: String) -> Self {
        let (port, protocol) = key.split_once('/').unwrap_or((key, "tcp"));
        Self {
            port: port.to_string(),
            protocol: protocol.to_string(),
            host_ip,
            host_port,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> {}:{}",
            self.port, self.protocol, self.host_ip, self.host_port
        )
    }
}

/// The detailed view of a container obtained by inspecting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: ContainerId,
    pub name: String,
    pub status: ContainerStatus,
    pub ports: Vec<PortMapping>,
}

/// A network and the raw IPv4 endpoint (`10.0.0.2/24`) of every attached
/// container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: NetworkId,
    pub name: String,
    pub endpoints: HashMap<ContainerId, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Container,
    Network,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Start,
    Stop,
    Destroy,
    Connect,
    Disconnect,
    Other(String),
}

impl EventAction {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "create" => EventAction::Create,
            "start" => EventAction::Start,
            "stop" => EventAction::Stop,
            "destroy" => EventAction::Destroy,
            "connect" => EventAction::Connect,
            "disconnect" => EventAction::Disconnect,
            other => EventAction::Other(other.to_string()),
        }
    }
}

/// One entry of the runtime's event feed.
///
/// For network events `actor_id` is the network and the affected container
/// travels in the `container` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    pub action: EventAction,
    pub actor_id: String,
    pub attributes: HashMap<String, String>,
}

impl RuntimeEvent {
    pub fn new(kind: EventKind, action: EventAction, actor_id: impl Into<String>) -> Self {
        Self {
            kind,
            action,
            actor_id: actor_id.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn container_attribute(&self) -> Option<&str> {
        self.attributes
            .get("container")
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}
