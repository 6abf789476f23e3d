//! Application-level message envelope and its JSON codec.
//!
//! An [`Envelope`] carries identity and routing metadata next to an opaque
//! JSON payload. The client validates and encodes envelopes on send and
//! decodes them inside the consumption loops; payload content is never
//! interpreted.

use crate::error::MuxmqError;
use crate::transport::now_millis;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The message unit exchanged over the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id
    pub id: String,
    /// Application-defined message type
    pub message_type: String,
    /// Topic the receiver should answer on, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Producer-side timestamp in milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Opaque message content
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp
    pub fn new<T: Into<String>>(message_type: T, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            reply_to: None,
            timestamp: now_millis(),
            payload,
        }
    }

    /// Set the reply topic
    pub fn with_reply_to<T: Into<String>>(mut self, topic: T) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    /// Check the identity fields every envelope must carry
    pub fn validate(&self) -> Result<(), MuxmqError> {
        if self.id.is_empty() {
            return Err(MuxmqError::invalid_payload("envelope id is empty"));
        }
        if self.message_type.is_empty() {
            return Err(MuxmqError::invalid_payload("envelope message type is empty"));
        }
        Ok(())
    }

    /// Serialize to JSON bytes
    pub fn encode(&self) -> Result<Bytes, MuxmqError> {
        let data = serde_json::to_vec(self).map_err(|e| MuxmqError::encoding(e.to_string()))?;
        Ok(Bytes::from(data))
    }

    /// Deserialize from JSON bytes
    pub fn decode(data: &[u8]) -> Result<Self, MuxmqError> {
        serde_json::from_slice(data).map_err(|e| MuxmqError::decoding(e.to_string()))
    }
}
