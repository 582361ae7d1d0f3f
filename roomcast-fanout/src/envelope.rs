//! Wire envelope for cross-instance messages
//!
//! Every message published through the adapter is wrapped in a JSON envelope
//! carrying the origin instance id (for echo suppression) and, for
//! request/response traffic, a correlation id and private reply channel.
//!
//! Message kinds by field shape:
//!
//! - event:    no correlation id, no reply channel
//! - request:  correlation id + reply channel
//! - response: correlation id only, published point-to-point on the reply
//!   channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One pub/sub transport unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Instance that published the message
    pub origin: String,

    /// Links a request to its responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Private channel responders publish their answer to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Publish time at the origin
    pub sent_at: DateTime<Utc>,

    /// Opaque gateway payload
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Broadcast event envelope.
    pub fn event(origin: String, payload: Vec<u8>) -> Self {
        Self {
            origin,
            correlation_id: None,
            reply_to: None,
            sent_at: Utc::now(),
            payload,
        }
    }

    /// Aggregation request envelope.
    pub fn request(
        origin: String,
        correlation_id: String,
        reply_to: String,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            origin,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            sent_at: Utc::now(),
            payload,
        }
    }

    /// Point-to-point response envelope.
    pub fn response(origin: String, correlation_id: String, payload: Vec<u8>) -> Self {
        Self {
            origin,
            correlation_id: Some(correlation_id),
            reply_to: None,
            sent_at: Utc::now(),
            payload,
        }
    }

    pub fn is_request(&self) -> bool {
        self.correlation_id.is_some() && self.reply_to.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.correlation_id.is_some() && self.reply_to.is_none()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Private response channel for one request.
///
/// Unique per request and unambiguous to responders; only the requesting
/// instance subscribes to it.
pub fn response_channel(base: &str, correlation_id: &str) -> String {
    format!("{}:res:{}", base, correlation_id)
}
