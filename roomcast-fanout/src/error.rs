//! Error types for the fanout adapter

use roomcast_cluster::ClusterError;
use thiserror::Error;

/// Fanout adapter errors
#[derive(Error, Debug)]
pub enum FanoutError {
    /// The adapter is not ready as a whole: the publisher connection is not
    /// Ready, the subscriber is down, or the adapter was shut down
    #[error("fanout adapter not connected")]
    NotConnected,

    /// Underlying cluster error from the publisher connection
    #[error("cluster error: {0}")]
    Cluster(ClusterError),

    /// Envelope encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ClusterError> for FanoutError {
    fn from(err: ClusterError) -> Self {
        match err {
            // Readiness races on the publisher surface as adapter-level
            // not-connected, matching the state checks callers already see
            ClusterError::NotReady | ClusterError::NotConnected => FanoutError::NotConnected,
            other => FanoutError::Cluster(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_errors_collapse_to_not_connected() {
        assert!(matches!(
            FanoutError::from(ClusterError::NotReady),
            FanoutError::NotConnected
        ));
        assert!(matches!(
            FanoutError::from(ClusterError::NotConnected),
            FanoutError::NotConnected
        ));
        assert!(matches!(
            FanoutError::from(ClusterError::Command("oops".into())),
            FanoutError::Cluster(_)
        ));
    }
}
