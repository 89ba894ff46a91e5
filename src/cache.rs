//! Runtime state cache.
//!
//! Holds what the rest of the daemon knows about containers, networks, IP
//! assignments and veths. The cache never polls on its own: the dispatcher
//! pulls fresh state through the `refresh_*` calls when an event says
//! something changed.
//!
//! Every refresh fetches first and commits second, so a runtime failure
//! leaves the cache at its last-known-good state. Commits happen under one
//! short write lock, which also makes IP rebuilds atomic for readers.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::RwLock;

use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::{ContainerDetails, ContainerId, ContainerSummary, NetworkId, NetworkInfo};
use crate::veth::{VethError, VethResolver};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Veth(#[from] VethError),
}

#[derive(Debug, Default)]
struct CacheState {
    containers: HashMap<ContainerId, ContainerSummary>,
    details: HashMap<ContainerId, ContainerDetails>,
    networks: HashMap<NetworkId, NetworkInfo>,
    ips: HashMap<ContainerId, Ipv4Addr>,
    veths: HashMap<ContainerId, String>,
    in_graph: HashSet<ContainerId>,
}

impl CacheState {
    /// Recomputes the whole IP table from the network snapshots.
    ///
    /// Endpoints of containers the cache does not know are skipped. Networks
    /// are visited in id order so a container attached to several networks
    /// always resolves to the same address.
    fn rebuild_ips(&mut self) {
        let mut network_ids: Vec<&NetworkId> = self.networks.keys().collect();
        network_ids.sort();

        let mut ips = HashMap::new();
        for network_id in network_ids {
            for (container_id, endpoint) in &self.networks[network_id].endpoints {
                if !self.containers.contains_key(container_id) {
                    continue;
                }
                match parse_endpoint_ip(endpoint) {
                    Some(ip) => {
                        ips.insert(container_id.clone(), ip);
                    }
                    None => debug!(
                        "ignoring endpoint `{}` of {} on network {}",
                        endpoint, container_id, network_id
                    ),
                }
            }
        }
        self.ips = ips;
    }
}

/// Strips the prefix length (or port) from a runtime endpoint such as
/// `10.0.0.2/24`.
pub fn parse_endpoint_ip(endpoint: &str) -> Option<Ipv4Addr> {
    endpoint
        .split(['/', ':'])
        .next()
        .and_then(|ip| ip.trim().parse().ok())
}

pub struct StateCache {
    runtime: Arc<dyn ContainerRuntime>,
    veths: Arc<dyn VethResolver>,
    state: RwLock<CacheState>,
}

impl StateCache {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, veths: Arc<dyn VethResolver>) -> Self {
        Self {
            runtime,
            veths,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Replaces containers, details, networks, IPs and veths with a fresh
    /// bulk load. DB-presence flags of containers that are still present
    /// are kept.
    pub async fn refresh_all(&self, include_stopped: bool) -> Result<(), CacheError> {
        let summaries = self.runtime.list_containers(include_stopped).await?;

        let mut details = HashMap::with_capacity(summaries.len());
        for summary in &summaries {
            let detail = self.runtime.inspect_container(&summary.id).await?;
            details.insert(summary.id.clone(), detail);
        }

        let mut networks = HashMap::new();
        for network_id in self.runtime.list_networks().await? {
            let network = self.runtime.inspect_network(&network_id).await?;
            networks.insert(network.id.clone(), network);
        }

        let veths = self.veths.veth_table().await?;

        let mut state = self.state.write().await;
        state.containers = summaries.into_iter().map(|s| (s.id.clone(), s)).collect();
        state.details = details;
        state.networks = networks;
        state.veths = veths;
        let CacheState {
            containers,
            in_graph,
            ..
        } = &mut *state;
        in_graph.retain(|id| containers.contains_key(id));
        state.rebuild_ips();

        info!(
            "Loaded {} containers, {} networks, {} IP assignments",
            state.containers.len(),
            state.networks.len(),
            state.ips.len()
        );
        Ok(())
    }

    /// Re-fetches one container and its detailed info.
    pub async fn refresh_container(&self, id: &str) -> Result<(), CacheError> {
        let summary = self
            .runtime
            .list_containers(true)
            .await?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        let detail = self.runtime.inspect_container(id).await?;

        let mut state = self.state.write().await;
        state.containers.insert(summary.id.clone(), summary);
        state.details.insert(id.to_string(), detail);
        state.rebuild_ips();
        Ok(())
    }

    /// Re-fetches one network, then rebuilds every IP assignment.
    pub async fn refresh_network(&self, id: &str) -> Result<(), CacheError> {
        let network = self.runtime.inspect_network(id).await?;

        let mut state = self.state.write().await;
        state.networks.insert(network.id.clone(), network);
        state.rebuild_ips();
        Ok(())
    }

    /// Re-reads the veth table and overwrites only the entry for `id`.
    pub async fn refresh_veth(&self, id: &str) -> Result<(), CacheError> {
        let table = self.veths.veth_table().await?;
        let veth = table
            .get(id)
            .cloned()
            .ok_or_else(|| VethError::NotFound(id.to_string()))?;

        self.state.write().await.veths.insert(id.to_string(), veth);
        Ok(())
    }

    pub async fn remove_network(&self, id: &str) {
        let mut state = self.state.write().await;
        if state.networks.remove(id).is_some() {
            state.rebuild_ips();
        }
    }

    /// Drops every entry derived from the container, including its
    /// DB-presence flag.
    pub async fn purge_container(&self, id: &str) {
        let mut state = self.state.write().await;
        state.containers.remove(id);
        state.details.remove(id);
        state.ips.remove(id);
        state.veths.remove(id);
        state.in_graph.remove(id);
    }

    pub async fn ip_of(&self, id: &str) -> Option<Ipv4Addr> {
        self.state.read().await.ips.get(id).copied()
    }

    pub async fn veth_of(&self, id: &str) -> Option<String> {
        self.state.read().await.veths.get(id).cloned()
    }

    pub async fn details(&self, id: &str) -> Option<ContainerDetails> {
        self.state.read().await.details.get(id).cloned()
    }

    pub async fn container_by_ip(&self, ip: Ipv4Addr) -> Option<ContainerDetails> {
        let state = self.state.read().await;
        state
            .ips
            .iter()
            .find(|(_, assigned)| **assigned == ip)
            .and_then(|(id, _)| state.details.get(id).cloned())
    }

    pub async fn contains_container(&self, id: &str) -> bool {
        self.state.read().await.containers.contains_key(id)
    }

    pub async fn container_ids(&self) -> HashSet<ContainerId> {
        self.state.read().await.containers.keys().cloned().collect()
    }

    pub async fn network_ids(&self) -> HashSet<NetworkId> {
        self.state.read().await.networks.keys().cloned().collect()
    }

    /// Sets the DB-presence flag; returns `true` if it was not set before.
    pub async fn mark_in_graph(&self, id: &str) -> bool {
        self.state.write().await.in_graph.insert(id.to_string())
    }

    pub async fn is_in_graph(&self, id: &str) -> bool {
        self.state.read().await.in_graph.contains(id)
    }
}
