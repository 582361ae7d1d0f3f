//! # Roomcast Fanout
//!
//! Cross-instance pub/sub fanout for the Roomcast messaging backbone.
//! Gateway processes use the [`FanoutAdapter`] to broadcast room events to
//! every other instance sharing the Redis Cluster, and to run cluster-wide
//! aggregation queries over a correlated request/response pattern.
//!
//! Delivery is Redis pub/sub: at-most-once and ephemeral. The adapter does
//! not persist or replay messages.
//!
//! ## Module Organization
//!
//! - `adapter`: the fanout adapter (publish/subscribe/serve/request)
//! - `subscriber`: dedicated subscriber connection loop
//! - `envelope`: wire format and reply-channel naming
//! - `bus`: gateway-facing trait
//! - `error`: error taxonomy

pub mod adapter;
pub mod bus;
pub mod envelope;
pub mod error;
mod subscriber;

// Re-export common types for convenience
pub use adapter::{FanoutAdapter, MessageHandler, Responder, SubscribeOptions};
pub use bus::MessageBus;
pub use envelope::Envelope;
pub use error::FanoutError;

/// Current version of the roomcast fanout library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
