//! Gateway-facing message bus seam

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::adapter::{FanoutAdapter, MessageHandler};
use crate::error::FanoutError;

/// The fanout surface the gateway layer depends on.
///
/// Gateways broadcast room events with [`publish`](MessageBus::publish),
/// react to remote events with [`subscribe`](MessageBus::subscribe), and run
/// cluster-wide aggregation queries with [`request`](MessageBus::request).
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Broadcasts a payload to every instance subscribed to `channel`.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), FanoutError>;

    /// Registers a handler for broadcast messages on `channel`; the handler
    /// receives `(payload, origin instance id)`.
    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<(), FanoutError>;

    /// Publishes an aggregation request and collects responses until
    /// `timeout`; partial results are returned without error.
    async fn request(
        &self,
        channel: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Bytes>, FanoutError>;
}

#[async_trait]
impl MessageBus for FanoutAdapter {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), FanoutError> {
        FanoutAdapter::publish(self, channel, payload).await
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<(), FanoutError> {
        FanoutAdapter::subscribe(self, channel, handler)
    }

    async fn request(
        &self,
        channel: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Bytes>, FanoutError> {
        FanoutAdapter::request(self, channel, payload, timeout).await
    }
}
