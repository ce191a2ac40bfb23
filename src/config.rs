//! Configuration loading.
//!
//! Every key is optional; the defaults match a single-node deployment with a
//! local store.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default port of the publish endpoint.
pub const DEFAULT_PUB_PORT: u16 = 7511;
/// Default port of the router (request/reply) endpoint.
pub const DEFAULT_ROUTER_PORT: u16 = 7510;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster size, self included, required before a node becomes ready.
    pub minimum_nodes: usize,
    /// Number of join attempts before giving up.
    pub retry_join: u32,
    pub bindings: BindingsConfig,
    pub timers: TimersConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            minimum_nodes: 1,
            retry_join: 30,
            bindings: BindingsConfig::default(),
            timers: TimersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingsConfig {
    #[serde(rename = "pub")]
    pub publish: String,
    pub router: String,
    /// Host announced to peers when an endpoint binds to `0.0.0.0`.
    pub advertise_host: String,
}

impl Default for BindingsConfig {
    fn default() -> Self {
        Self {
            publish: format!("tcp://0.0.0.0:{}", DEFAULT_PUB_PORT),
            router: format!("tcp://0.0.0.0:{}", DEFAULT_ROUTER_PORT),
            advertise_host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    pub discover_timeout_ms: u64,
    pub join_attempt_interval_ms: u64,
    pub heartbeat_ms: u64,
    pub rejoin_delay_ms: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            discover_timeout_ms: 3000,
            join_attempt_interval_ms: 2000,
            heartbeat_ms: 5000,
            rejoin_delay_ms: 500,
        }
    }
}

impl TimersConfig {
    pub fn discover_timeout(&self) -> Duration {
        Duration::from_millis(self.discover_timeout_ms)
    }

    pub fn join_attempt_interval(&self) -> Duration {
        Duration::from_millis(self.join_attempt_interval_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// A peer silent for this long is considered dead.
    pub fn heartbeat_expiry(&self) -> Duration {
        self.heartbeat() * 2
    }

    pub fn rejoin_delay(&self) -> Duration {
        Duration::from_millis(self.rejoin_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Embedded,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Embedded,
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        contents.parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.minimum_nodes == 0 {
            return Err(ClusterError::Config(
                "cluster.minimum_nodes must be at least 1".to_string(),
            ));
        }
        let timers = &self.cluster.timers;
        if timers.heartbeat_ms == 0
            || timers.discover_timeout_ms == 0
            || timers.join_attempt_interval_ms == 0
        {
            return Err(ClusterError::Config(
                "cluster.timers values must be greater than zero".to_string(),
            ));
        }
        resolve_endpoint(&self.cluster.bindings.publish, DEFAULT_PUB_PORT)?;
        resolve_endpoint(&self.cluster.bindings.router, DEFAULT_ROUTER_PORT)?;
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

/// Normalize a binding into `tcp://host:port`.
///
/// Accepts `tcp://host:port`, `tcp://host`, `host:port` and `host`.
pub fn resolve_endpoint(binding: &str, default_port: u16) -> Result<String> {
    let rest = match binding.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(ClusterError::Config(format!(
                "Unsupported endpoint scheme '{}' in {}",
                scheme, binding
            )))
        }
        None => binding,
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(ClusterError::Config(format!("Empty endpoint host: {}", binding)));
    }

    // Bracketed IPv6 hosts keep their colons.
    let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
        match stripped.split_once(']') {
            Some((host, tail)) => (format!("[{}]", host), tail.strip_prefix(':')),
            None => {
                return Err(ClusterError::Config(format!("Malformed IPv6 endpoint: {}", binding)))
            }
        }
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), Some(port)),
            None => (rest.to_string(), None),
        }
    };

    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| ClusterError::Config(format!("Invalid port in endpoint {}", binding)))?,
        None => default_port,
    };

    Ok(format!("tcp://{}:{}", host, port))
}

/// Socket address part of a `tcp://host:port` endpoint.
pub fn endpoint_addr(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

/// Endpoint peers should use to reach a locally bound socket.
pub fn advertised_endpoint(bound: &str, advertise_host: &str) -> String {
    let addr = endpoint_addr(bound);
    match addr.rsplit_once(':') {
        Some((host, port)) if host == "0.0.0.0" || host == "[::]" => {
            format!("tcp://{}:{}", advertise_host, port)
        }
        _ => format!("tcp://{}", addr),
    }
}
