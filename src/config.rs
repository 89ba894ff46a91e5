use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Extract(#[source] Box<figment::Error>),
    #[error("failed to read secret file `{path}`: {source}")]
    SecretFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    /// Host tool printing `<container-id> <veth>` pairs.
    pub veth_tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub capture_read_timeout_ms: u64,
    pub capture_buffer: usize,
    /// Size of the runtime's blocking pool. Every running monitor holds one
    /// of these threads, so this caps the number of monitored containers.
    pub max_blocking_threads: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub reconnect_delay_secs: u64,
    pub keep_monitor_on_disconnect: bool,
    pub drop_graph_on_exit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            neo4j_uri: "neo4j://localhost:7687".into(),
            neo4j_user: "neo4j".into(),
            neo4j_password: "s3cr3t".into(),
            veth_tool: "dockervethmin".into(),
            hostname: None,
            capture_read_timeout_ms: 250,
            capture_buffer: 256,
            max_blocking_threads: 512,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
            reconnect_delay_secs: 2,
            keep_monitor_on_disconnect: false,
            drop_graph_on_exit: true,
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("netdeps.toml"))
            .merge(Json::file("netdeps.json"))
            .merge(Env::prefixed("NETDEPS_"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Extract(Box::new(e)))?;

        // Support Docker-style secrets
        if let Some(secret_file) = std::env::var_os("NETDEPS_NEO4J_PASSWORD_FILE") {
            let path = PathBuf::from(secret_file);
            config.neo4j_password = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::SecretFile { path, source })?
                .trim()
                .to_string();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("capture_read_timeout_ms must be positive"));
        }
        if self.capture_buffer == 0 {
            return Err(ConfigError::Invalid("capture_buffer must be positive"));
        }
        if self.max_blocking_threads == 0 {
            return Err(ConfigError::Invalid("max_blocking_threads must be positive"));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be positive"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn capture_read_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_read_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// The configured hostname, else the host's own.
    pub fn resolve_hostname(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        std::fs::read_to_string("/etc/hostname")
            .or_else(|_| std::fs::read_to_string("/proc/sys/kernel/hostname"))
            .map(|h| h.trim().to_owned())
            .unwrap_or_else(|e| {
                warn!("Unable to determine hostname: {}", e);
                String::from("unknown")
            })
    }
}
