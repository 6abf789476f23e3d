//! Error types for the muxmq client library

use crate::transport::TransportError;

/// Main error type for muxmq client operations
#[derive(Debug, thiserror::Error)]
pub enum MuxmqError {
    /// The broker cannot be reached or a broker-level handle could not be created
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An outbound value is not a well-formed envelope
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    /// Envelope serialization failed
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// Envelope deserialization failed
    #[error("Decoding error: {message}")]
    Decoding { message: String },

    /// No subscription is registered for the topic
    #[error("No subscription for topic '{topic}'")]
    TopicNotFound { topic: String },

    /// The operation requires a started client
    #[error("Client is not started")]
    NotStarted,

    /// Closing a broker-level consumer failed during teardown
    #[error("Close error: {message}")]
    Close { message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Error surfaced by the broker transport
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl MuxmqError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new invalid payload error
    pub fn invalid_payload<S: Into<String>>(message: S) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Create a new encoding error
    pub fn encoding<S: Into<String>>(message: S) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create a new decoding error
    pub fn decoding<S: Into<String>>(message: S) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    /// Create a new topic not found error
    pub fn topic_not_found<S: Into<String>>(topic: S) -> Self {
        Self::TopicNotFound {
            topic: topic.into(),
        }
    }

    /// Create a new close error
    pub fn close<S: Into<String>>(message: S) -> Self {
        Self::Close {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this error means the broker could not be reached
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Transport(TransportError::Connection { .. })
        )
    }

    /// Check if this error concerns a single message rather than the client
    pub fn is_payload_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPayload { .. } | Self::Encoding { .. } | Self::Decoding { .. }
        )
    }
}
