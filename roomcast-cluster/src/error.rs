//! Error types for the cluster connection manager

use std::time::Duration;
use thiserror::Error;

/// Cluster connection and command errors
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Transient connection failure, retried internally per policy.
    /// Surfaces to callers only when the pre-connect retry budget is
    /// exhausted.
    #[error("cluster connection error: {0}")]
    Connection(String),

    /// Authentication rejected by the cluster. Fatal, never retried.
    #[error("cluster authentication failed: {0}")]
    Auth(String),

    /// `wait_for_ready` called before `init`
    #[error("cluster manager was never started")]
    NotStarted,

    /// Command issued before the first successful connection with offline
    /// queueing disabled
    #[error("cluster connection not ready")]
    NotReady,

    /// Connection has been shut down
    #[error("cluster connection closed")]
    NotConnected,

    /// Command deadline elapsed
    #[error("cluster command timed out after {0:?}")]
    Timeout(Duration),

    /// Single command failed; connection state is unaffected
    #[error("cluster command error: {0}")]
    Command(String),

    /// Payload encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("cluster configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// True for failures that must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::Auth(_) | ClusterError::Config(_))
    }
}

impl From<redis::RedisError> for ClusterError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::AuthenticationFailed => ClusterError::Auth(err.to_string()),
            redis::ErrorKind::IoError => ClusterError::Connection(err.to_string()),
            redis::ErrorKind::InvalidClientConfig => ClusterError::Config(err.to_string()),
            _ => ClusterError::Command(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_is_fatal() {
        assert!(ClusterError::Auth("WRONGPASS".into()).is_fatal());
        assert!(ClusterError::Config("bad node".into()).is_fatal());
        assert!(!ClusterError::Connection("refused".into()).is_fatal());
        assert!(!ClusterError::NotReady.is_fatal());
    }

    #[test]
    fn test_redis_error_classification() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(ClusterError::from(io), ClusterError::Connection(_)));

        let auth = redis::RedisError::from((
            redis::ErrorKind::AuthenticationFailed,
            "auth",
            "WRONGPASS invalid username-password pair".to_string(),
        ));
        assert!(matches!(ClusterError::from(auth), ClusterError::Auth(_)));
    }
}
