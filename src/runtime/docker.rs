use super::{ContainerRuntime, EventStream, RuntimeError};
use crate::types::{
    ContainerDetails, ContainerStatus, ContainerSummary, EventAction, EventKind, NetworkId,
    NetworkInfo, PortMapping, RuntimeEvent,
};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{
    ContainerInspectResponse, ContainerSummary as DockerContainerSummary, EventMessage,
    EventMessageTypeEnum, Network,
};
use bollard::network::{InspectNetworkOptions, ListNetworksOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::debug;
use std::collections::HashMap;

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        // Unix socket on Linux, honouring DOCKER_HOST when set.
        let docker = Docker::connect_with_local_defaults().map_err(RuntimeError::Connect)?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|source| RuntimeError::Request {
                op: "list containers",
                source,
            })?;

        Ok(containers
            .into_iter()
            .filter_map(convert_summary)
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|source| RuntimeError::Request {
                op: "inspect container",
                source,
            })?;
        convert_details(detail)
    }

    async fn list_networks(&self) -> Result<Vec<NetworkId>, RuntimeError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|source| RuntimeError::Request {
                op: "list networks",
                source,
            })?;
        Ok(networks.into_iter().filter_map(|n| n.id).collect())
    }

    async fn inspect_network(&self, id: &str) -> Result<NetworkInfo, RuntimeError> {
        let opts = InspectNetworkOptions {
            verbose: true,
            scope: String::from("local"),
        };
        let network = self
            .docker
            .inspect_network(id, Some(opts))
            .await
            .map_err(|source| RuntimeError::Request {
                op: "inspect network",
                source,
            })?;
        convert_network(network)
    }

    fn events(&self) -> EventStream {
        let opts = EventsOptions::<String> {
            filters: [("type", ["container", "network"].as_slice())]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
            ..Default::default()
        };

        self.docker
            .events(Some(opts))
            .map(|msg| match msg {
                Ok(event) => Ok(convert_event(event)),
                Err(e) => Err(RuntimeError::EventStream(e)),
            })
            .boxed()
    }
}

fn convert_summary(summary: DockerContainerSummary) -> Option<ContainerSummary> {
    let id = summary.id?;
    let names = summary
        .names
        .unwrap_or_default()
        .into_iter()
        .map(|n| n.trim_start_matches('/').to_string())
        .collect();
    let status = summary
        .state
        .as_deref()
        .map(ContainerStatus::parse)
        .unwrap_or(ContainerStatus::Unknown);
    Some(ContainerSummary { id, names, status })
}

fn convert_details(detail: ContainerInspectResponse) -> Result<ContainerDetails, RuntimeError> {
    let id = detail.id.ok_or(RuntimeError::MissingId("container"))?;
    let name = detail
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let status = detail
        .state
        .and_then(|s| s.status)
        .map(|s| ContainerStatus::parse(&s.to_string()))
        .unwrap_or(ContainerStatus::Unknown);

    let mut ports = Vec::new();
    if let Some(port_map) = detail.network_settings.and_then(|s| s.ports) {
        for (key, bindings) in port_map {
            for binding in bindings.unwrap_or_default() {
                ports.push(PortMapping::from_key(
                    &key,
                    binding.host_ip.unwrap_or_default(),
                    binding.host_port.unwrap_or_default(),
                ));
            }
        }
    }
    // The port map is a hash map; keep the rendered property stable.
    ports.sort_by(|a, b| {
        (&a.port, &a.protocol, &a.host_ip).cmp(&(&b.port, &b.protocol, &b.host_ip))
    });

    Ok(ContainerDetails {
        id,
        name,
        status,
        ports,
    })
}

fn convert_network(network: Network) -> Result<NetworkInfo, RuntimeError> {
    let id = network.id.ok_or(RuntimeError::MissingId("network"))?;
    let endpoints = network
        .containers
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(container_id, endpoint)| {
            endpoint
                .ipv4_address
                .filter(|ip| !ip.is_empty())
                .map(|ip| (container_id, ip))
        })
        .collect();

    Ok(NetworkInfo {
        id,
        name: network.name.unwrap_or_default(),
        endpoints,
    })
}

fn convert_event(event: EventMessage) -> RuntimeEvent {
    let kind = match event.typ {
        Some(EventMessageTypeEnum::CONTAINER) => EventKind::Container,
        Some(EventMessageTypeEnum::NETWORK) => EventKind::Network,
        Some(other) => EventKind::Other(other.to_string()),
        None => EventKind::Other(String::new()),
    };
    let action = EventAction::parse(event.action.as_deref().unwrap_or_default());
    let (actor_id, attributes) = match event.actor {
        Some(actor) => (
            actor.id.unwrap_or_default(),
            actor.attributes.unwrap_or_default(),
        ),
        None => (String::new(), HashMap::new()),
    };
    debug!("Docker event: {:?} {:?} for {}", kind, action, actor_id);

    RuntimeEvent {
        kind,
        action,
        actor_id,
        attributes,
    }
}
