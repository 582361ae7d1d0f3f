//! Cluster connection configuration
//!
//! Configuration can be loaded from environment variables or constructed
//! manually. The gateway processes pass the same node list and credentials to
//! every manager they create, so all instances see one cluster topology.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::ClusterError;
use crate::retry::RetryPolicy;

/// One entry point into the Redis Cluster topology.
///
/// Any subset of the cluster's nodes is enough to bootstrap; the client
/// discovers the rest of the topology after the first connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub host: String,
    pub port: u16,
}

impl ClusterNode {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Connection URL for this node, without credentials.
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }

    /// Parses a `host:port` pair.
    fn parse(s: &str) -> Result<Self, ClusterError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::Config(format!("invalid cluster node '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ClusterError::Config(format!("invalid port in cluster node '{}'", s)))?;
        if host.is_empty() {
            return Err(ClusterError::Config(format!(
                "empty host in cluster node '{}'",
                s
            )));
        }
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Health check tuning.
///
/// The manager pings the cluster on a fixed interval. `failure_threshold`
/// consecutive failures transition the connection to Degraded; a single
/// success restores Ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between health-check pings
    pub interval_secs: u64,

    /// Consecutive ping failures before the connection is considered degraded
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            failure_threshold: 3,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Cluster connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Seed nodes for topology discovery
    pub nodes: Vec<ClusterNode>,

    /// Cluster password, if authentication is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Connection establishment timeout in seconds
    pub connect_timeout_secs: u64,

    /// Per-command timeout in seconds
    pub command_timeout_secs: u64,

    /// Max MOVED/ASK redirections followed per command
    pub max_redirections: u32,

    /// When enabled, commands issued before the first successful connection
    /// suspend until the manager is Ready instead of failing fast
    pub offline_queue: bool,

    /// Reconnect backoff policy
    pub retry: RetryPolicy,

    /// Health check policy
    pub health: HealthConfig,
}

impl ClusterConfig {
    /// Creates a configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_CLUSTER_NODES`: comma-separated `host:port` list (required)
    /// - `REDIS_CLUSTER_PASSWORD`: cluster password (optional)
    /// - `REDIS_CONNECT_TIMEOUT_SECS`: connection timeout (default: 5)
    /// - `REDIS_COMMAND_TIMEOUT_SECS`: command timeout (default: 10)
    /// - `REDIS_MAX_REDIRECTIONS`: redirections per command (default: 16)
    /// - `REDIS_OFFLINE_QUEUE`: `true`/`false` (default: false)
    /// - `REDIS_HEALTH_INTERVAL_SECS`: ping interval (default: 10)
    /// - `REDIS_HEALTH_FAILURE_THRESHOLD`: degraded threshold (default: 3)
    ///
    /// # Errors
    ///
    /// Returns an error if `REDIS_CLUSTER_NODES` is unset or malformed.
    pub fn from_env() -> Result<Self, ClusterError> {
        // Load .env if present
        dotenvy::dotenv().ok();

        let nodes_raw = env::var("REDIS_CLUSTER_NODES").map_err(|_| {
            ClusterError::Config("REDIS_CLUSTER_NODES environment variable is required".to_string())
        })?;
        let nodes = nodes_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ClusterNode::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if nodes.is_empty() {
            return Err(ClusterError::Config(
                "REDIS_CLUSTER_NODES must contain at least one host:port entry".to_string(),
            ));
        }

        let password = env::var("REDIS_CLUSTER_PASSWORD")
            .ok()
            .filter(|p| !p.is_empty());

        let connect_timeout_secs = env_parse("REDIS_CONNECT_TIMEOUT_SECS", 5);
        let command_timeout_secs = env_parse("REDIS_COMMAND_TIMEOUT_SECS", 10);
        let max_redirections = env_parse("REDIS_MAX_REDIRECTIONS", 16);
        let offline_queue = env_parse("REDIS_OFFLINE_QUEUE", false);

        let health = HealthConfig {
            interval_secs: env_parse("REDIS_HEALTH_INTERVAL_SECS", 10),
            failure_threshold: env_parse("REDIS_HEALTH_FAILURE_THRESHOLD", 3),
        };

        Ok(Self {
            nodes,
            password,
            connect_timeout_secs,
            command_timeout_secs,
            max_redirections,
            offline_queue,
            retry: RetryPolicy::default(),
            health,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Node URLs for the cluster client builder, without credentials.
    pub fn node_urls(&self) -> Vec<String> {
        self.nodes.iter().map(ClusterNode::url).collect()
    }

    /// Node list for logging, credentials never included.
    pub fn describe_nodes(&self) -> String {
        self.nodes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Single-node localhost configuration for tests.
    pub fn default_for_test() -> Self {
        Self {
            nodes: vec![ClusterNode::new("127.0.0.1", 6379)],
            password: None,
            connect_timeout_secs: 5,
            command_timeout_secs: 10,
            max_redirections: 16,
            offline_queue: false,
            retry: RetryPolicy::default(),
            health: HealthConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_parse() {
        let node = ClusterNode::parse("redis-1.internal:7000").unwrap();
        assert_eq!(node.host, "redis-1.internal");
        assert_eq!(node.port, 7000);
        assert_eq!(node.url(), "redis://redis-1.internal:7000");
    }

    #[test]
    fn test_node_parse_rejects_garbage() {
        assert!(ClusterNode::parse("no-port").is_err());
        assert!(ClusterNode::parse(":7000").is_err());
        assert!(ClusterNode::parse("host:notaport").is_err());
    }

    #[test]
    fn test_describe_nodes_has_no_password() {
        let mut config = ClusterConfig::default_for_test();
        config.password = Some("hunter2".to_string());
        let described = config.describe_nodes();
        assert_eq!(described, "127.0.0.1:6379");
        assert!(!described.contains("hunter2"));
    }

    #[test]
    fn test_health_defaults() {
        let health = HealthConfig::default();
        assert_eq!(health.interval_secs, 10);
        assert_eq!(health.failure_threshold, 3);
    }
}
