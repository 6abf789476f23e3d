//! # muxmq
//!
//! Topic-multiplexing pub/sub client for partitioned, commit-log style
//! message brokers.
//!
//! The client turns a small number of broker-level consumers into any number
//! of independent logical subscriptions: each subscribed topic gets one
//! consumer set (per-partition consumers or one consumer-group member,
//! depending on the configured strategy), and every envelope arriving on the
//! topic fans out to all of its subscribers. Outbound traffic funnels through
//! a single shared async producer.
//!
//! ## Features
//!
//! - **Subscription multiplexing**: N subscriptions share one broker-level
//!   consumer set per topic, each with its own delivery channel
//! - **Two consumption strategies**: per-partition consumers from a chosen
//!   offset, or broker-coordinated consumer groups with at-least-once
//!   offset marking
//! - **Non-blocking fan-out**: a slow subscriber loses messages instead of
//!   delaying the consumption loop or the other subscribers
//! - **Clean teardown**: broadcast shutdown observed by every consumption
//!   loop, close semantics tolerant of topics already gone broker-side
//! - **Pluggable transport**: broker access behind async traits, with a
//!   complete in-process broker included
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use muxmq::transport::inprocess::InProcessBroker;
//! use muxmq::{ClientConfig, Envelope, MuxmqClient};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> muxmq::Result<()> {
//!     let client = MuxmqClient::new(ClientConfig::default(), Arc::new(InProcessBroker::new()));
//!     client.start().await?;
//!
//!     client.create_topic("device.events", 3, 1).await?;
//!     let mut subscription = client.subscribe("device.events").await?;
//!
//!     let envelope = Envelope::new("device.event", json!({"serial": "OLT-1"}));
//!     client.send(&envelope, "device.events", Some("OLT-1")).await?;
//!
//!     if let Some(received) = subscription.recv().await {
//!         println!("received envelope {}", received.id);
//!     }
//!
//!     client.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
mod consumer;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod transport;

pub use client::*;
pub use config::*;
pub use envelope::*;
pub use error::*;
pub use metrics::*;
pub use registry::*;
pub use transport::{
    BrokerTransport, ConsumeRecord, GroupNotification, ProduceRecord, StartOffset, TopicName,
    TopicPartition, TransportError,
};

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, MuxmqError>;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
