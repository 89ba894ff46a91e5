use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use neo4rs::{query, BoltBytes, BoltType, Graph, Query};

use super::{
    AppLayerContent, ContainerNode, Dependency, Endpoint, GraphSink, SinkError, NO_APP_LAYER,
};
use crate::types::ContainerStatus;

/// [`GraphSink`] writing to Neo4j over bolt.
///
/// Container nodes carry the `Container` label plus their status as a second
/// label; unknown addresses become `NonContainer` nodes keyed by ip.
pub struct Neo4jSink {
    graph: Graph,
}

impl Neo4jSink {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, SinkError> {
        let graph = Graph::new(uri, user, password)
            .await
            .map_err(SinkError::Connect)?;
        Ok(Self { graph })
    }

    async fn run(&self, op: &'static str, q: Query) -> Result<(), SinkError> {
        debug!("graph: {}", op);
        self.graph
            .run(q)
            .await
            .map_err(|source| SinkError::Query { op, source })
    }
}

/// `:created:running:...`, used to strip whatever status label a node has.
fn all_status_labels() -> String {
    ContainerStatus::ALL
        .iter()
        .map(|s| format!(":{}", s.as_label()))
        .collect()
}

/// Writes every property and swaps the status label of the node matched or
/// created by `head`.
fn container_cypher(head: &str, status: ContainerStatus) -> String {
    format!(
        "{head} \
         REMOVE n{old} \
         SET n:{status} \
         SET n.name = $name, n.ports = $ports, n.ip = $ip, n.hostname = $hostname",
        old = all_status_labels(),
        status = status.as_label()
    )
}

// MERGE so a retried insert cannot duplicate the node. A node left over from
// an earlier run still carries its old status label.
fn insert_cypher(status: ContainerStatus) -> String {
    container_cypher("MERGE (n:Container {id: $id})", status)
}

fn update_cypher(status: ContainerStatus) -> String {
    container_cypher("MATCH (n:Container {id: $id})", status)
}

/// Every container write is keyed by id; an empty one would match or create
/// a bogus node.
fn require_id(node: &ContainerNode) -> Result<(), SinkError> {
    if node.id.is_empty() {
        return Err(SinkError::Rejected(format!(
            "container node `{}` has no id",
            node.name
        )));
    }
    Ok(())
}

fn content_param(content: &AppLayerContent) -> BoltType {
    match content {
        AppLayerContent::Payload(bytes) => {
            BoltType::Bytes(BoltBytes::new(Bytes::copy_from_slice(bytes)))
        }
        AppLayerContent::Absent => BoltType::from(NO_APP_LAYER),
    }
}

fn with_container_props(q: Query, node: &ContainerNode) -> Query {
    q.param("id", node.id.as_str())
        .param("name", node.name.as_str())
        .param("ports", node.ports_property())
        .param("ip", node.ip_property())
        .param("hostname", node.hostname.as_str())
}

#[async_trait]
impl GraphSink for Neo4jSink {
    async fn insert_container(&self, node: &ContainerNode) -> Result<(), SinkError> {
        require_id(node)?;
        let cypher = insert_cypher(node.status);
        self.run("insert container", with_container_props(query(&cypher), node))
            .await
    }

    async fn update_container(&self, node: &ContainerNode) -> Result<(), SinkError> {
        require_id(node)?;
        let cypher = update_cypher(node.status);
        self.run("update container", with_container_props(query(&cypher), node))
            .await
    }

    async fn delete_container(&self, id: &str) -> Result<(), SinkError> {
        self.run(
            "delete container",
            query("MATCH (n {id: $id}) DETACH DELETE n").param("id", id),
        )
        .await
    }

    async fn insert_external(&self, ip: Ipv4Addr) -> Result<(), SinkError> {
        self.run(
            "insert non-container",
            query("MERGE (n:NonContainer {ip: $ip})").param("ip", ip.to_string()),
        )
        .await
    }

    async fn add_dependency(&self, dependency: &Dependency) -> Result<(), SinkError> {
        let content = content_param(&dependency.content);
        let q = match &dependency.target {
            Endpoint::Container(target) => query(
                "MATCH (a:Container {id: $source}), (b:Container {id: $target}) \
                 CREATE (a)-[:DEPENDS_ON {app_layer_content: $content}]->(b)",
            )
            .param("target", target.as_str()),
            // The node may still be in flight from the monitor that
            // registered it, so the edge query creates it if needed.
            Endpoint::External(ip) => query(
                "MATCH (a:Container {id: $source}) \
                 MERGE (b:NonContainer {ip: $ip}) \
                 CREATE (a)-[:DEPENDS_ON {app_layer_content: $content}]->(b)",
            )
            .param("ip", ip.to_string()),
        };
        self.run(
            "add dependency",
            q.param("source", dependency.source.as_str())
                .param("content", content),
        )
        .await
    }

    async fn drop_all(&self) -> Result<(), SinkError> {
        self.run("drop all", query("MATCH (n) DETACH DELETE n")).await
    }
}
