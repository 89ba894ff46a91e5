//! Container → host veth mapping.
//!
//! The mapping comes from a host utility (`dockervethmin` by default) that
//! prints whitespace separated `<container-id> <veth>` pairs and takes no
//! arguments.

use std::collections::HashMap;

use async_trait::async_trait;
use log::warn;
use tokio::process::Command;

use crate::types::ContainerId;

#[derive(Debug, thiserror::Error)]
pub enum VethError {
    #[error("failed to run veth tool `{tool}`: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("veth tool `{tool}` exited with {status}")]
    Failed {
        tool: String,
        status: std::process::ExitStatus,
    },
    #[error("no veth associated with container `{0}`")]
    NotFound(ContainerId),
}

#[async_trait]
pub trait VethResolver: Send + Sync {
    /// Returns the full container → veth table as currently seen on the host.
    async fn veth_table(&self) -> Result<HashMap<ContainerId, String>, VethError>;
}

/// Runs an external tool and parses its output.
pub struct CommandVethResolver {
    tool: String,
}

impl CommandVethResolver {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }
}

#[async_trait]
impl VethResolver for CommandVethResolver {
    async fn veth_table(&self) -> Result<HashMap<ContainerId, String>, VethError> {
        let output = Command::new(&self.tool)
            .output()
            .await
            .map_err(|source| VethError::Spawn {
                tool: self.tool.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(VethError::Failed {
                tool: self.tool.clone(),
                status: output.status,
            });
        }
        Ok(parse_veth_table(&String::from_utf8_lossy(&output.stdout)))
    }
}

pub fn parse_veth_table(output: &str) -> HashMap<ContainerId, String> {
    let fields: Vec<&str> = output.split_whitespace().collect();
    let mut chunks = fields.chunks_exact(2);
    let table = chunks
        .by_ref()
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect();
    if let [dangling] = chunks.remainder() {
        warn!("veth tool output has an unpaired field `{}`", dangling);
    }
    table
}
