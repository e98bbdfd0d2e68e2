//! Client configuration: pool limits and backend address.
//!
//! `AutoConnectionConfig` is the resolved, immutable form handed to the
//! pool. `ClientConfigFile` is the TOML representation, where every field
//! is optional and absent fields fall back to the defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default hard cap on live backend connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;
/// Default idle timeout passed to every connection.
pub const DEFAULT_CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default admission ceiling for the pending task queue.
pub const DEFAULT_MAX_PENDING_TASKS: usize = 128;
/// Default backend host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default backend port.
pub const DEFAULT_PORT: u16 = 31017;

/// Resolved configuration for an `AutoConnection` pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoConnectionConfig {
    /// Maximum number of live connections (default: 32).
    pub max_connections: usize,
    /// Idle timeout handed to each connection (default: 60s).
    pub connection_idle_timeout: Duration,
    /// Maximum number of queued tasks awaiting a connection (default: 128).
    pub max_pending_tasks: usize,
    /// Backend host.
    pub host: String,
    /// Backend port.
    pub port: u16,
}

impl Default for AutoConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_idle_timeout: DEFAULT_CONNECTION_IDLE_TIMEOUT,
            max_pending_tasks: DEFAULT_MAX_PENDING_TASKS,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl AutoConnectionConfig {
    /// Builder method: set the connection cap.
    pub fn with_max_connections(self, max_connections: usize) -> Self {
        Self {
            max_connections,
            ..self
        }
    }

    /// Builder method: set the per-connection idle timeout.
    pub fn with_idle_timeout(self, connection_idle_timeout: Duration) -> Self {
        Self {
            connection_idle_timeout,
            ..self
        }
    }

    /// Builder method: set the pending queue ceiling.
    pub fn with_max_pending_tasks(self, max_pending_tasks: usize) -> Self {
        Self {
            max_pending_tasks,
            ..self
        }
    }

    /// Builder method: set the backend address.
    pub fn with_address(self, host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..self
        }
    }

    /// Options each new connection is constructed with.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.host.clone(),
            port: self.port,
            idle_timeout: self.connection_idle_timeout,
        }
    }
}

/// Construction parameters for a single backend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Close the connection after this long without any operation.
    pub idle_timeout: Duration,
}

/// `memdb.toml` representation of the client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfigFile {
    pub client: Option<ClientSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSection {
    pub max_connections: Option<usize>,
    pub connection_idle_timeout_ms: Option<u64>,
    pub max_pending_tasks: Option<usize>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ClientConfigFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve into a pool configuration. Absent fields take defaults;
    /// explicit zeros are kept as-is.
    pub fn into_config(self) -> AutoConnectionConfig {
        let section = self.client.unwrap_or_default();
        let defaults = AutoConnectionConfig::default();
        AutoConnectionConfig {
            max_connections: section.max_connections.unwrap_or(defaults.max_connections),
            connection_idle_timeout: section
                .connection_idle_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connection_idle_timeout),
            max_pending_tasks: section
                .max_pending_tasks
                .unwrap_or(defaults.max_pending_tasks),
            host: section.host.unwrap_or(defaults.host),
            port: section.port.unwrap_or(defaults.port),
        }
    }
}

impl From<&AutoConnectionConfig> for ClientConfigFile {
    fn from(config: &AutoConnectionConfig) -> Self {
        Self {
            client: Some(ClientSection {
                max_connections: Some(config.max_connections),
                connection_idle_timeout_ms: Some(
                    config.connection_idle_timeout.as_millis() as u64,
                ),
                max_pending_tasks: Some(config.max_pending_tasks),
                host: Some(config.host.clone()),
                port: Some(config.port),
            }),
        }
    }
}
