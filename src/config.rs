//! Client configuration.
//!
//! [`ClientConfig`] carries every tunable with documented defaults. Use
//! [`ClientConfig::builder`] for chained construction, or
//! [`ClientConfig::from_env`] to overlay `MUXMQ_`-prefixed environment
//! variables onto the defaults.

use crate::error::MuxmqError;
use crate::transport::{ConsumerSettings, ProducerSettings};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How broker-level consumers are created for a subscribed topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerStrategy {
    /// One consumer per partition, reading from the newest offset
    Partition,
    /// One consumer-group member per topic; the broker assigns partitions
    Group,
}

impl Default for ConsumerStrategy {
    fn default() -> Self {
        Self::Partition
    }
}

impl fmt::Display for ConsumerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Partition => write!(f, "partition"),
            Self::Group => write!(f, "group"),
        }
    }
}

impl FromStr for ConsumerStrategy {
    type Err = MuxmqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partition" => Ok(Self::Partition),
            "group" => Ok(Self::Group),
            other => Err(MuxmqError::config(format!(
                "Unknown consumer strategy '{}'",
                other
            ))),
        }
    }
}

/// Configuration for [`MuxmqClient`](crate::client::MuxmqClient)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Consumption strategy for subscribed topics
    pub consumer_strategy: ConsumerStrategy,
    /// Consumer group id used by the group strategy
    pub group_id: String,
    /// How long producer records may sit before a flush, in milliseconds
    pub producer_flush_frequency_ms: u64,
    /// Record count that triggers a producer flush
    pub producer_flush_messages: usize,
    /// Upper bound of records buffered by the producer
    pub producer_flush_max_messages: usize,
    /// Send retries before a record is failed
    pub producer_retry_max: u32,
    /// Backoff between producer retries, in milliseconds
    pub producer_retry_backoff_ms: u64,
    /// Report per-record errors on the producer's error stream
    pub producer_return_errors: bool,
    /// Report per-record acknowledgments on the producer's success stream
    pub producer_return_successes: bool,
    /// Longest time the broker may hold a consumer fetch, in milliseconds
    pub consumer_max_wait_ms: u64,
    /// Longest a single record may take to process, in milliseconds
    pub max_processing_time_ms: u64,
    /// Partition count used when creating topics
    pub num_partitions: u32,
    /// Replication factor used when creating topics
    pub num_replicas: u16,
    /// Create missing topics on subscribe
    pub auto_create_topic: bool,
    /// Capacity of each subscriber channel
    pub subscriber_buffer: usize,
    /// Capacity of the stream between broker-level consumer and its loop
    pub consumer_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9092,
            consumer_strategy: ConsumerStrategy::Partition,
            group_id: "muxmq".to_string(),
            producer_flush_frequency_ms: 100,
            producer_flush_messages: 10,
            producer_flush_max_messages: 100,
            producer_retry_max: 3,
            producer_retry_backoff_ms: 100,
            producer_return_errors: true,
            producer_return_successes: false,
            consumer_max_wait_ms: 100,
            max_processing_time_ms: 100,
            num_partitions: 3,
            num_replicas: 1,
            auto_create_topic: false,
            subscriber_buffer: 128,
            consumer_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Create a builder over the defaults
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Load configuration from `MUXMQ_`-prefixed environment variables.
    ///
    /// Unset variables keep their defaults, so `MUXMQ_PORT=19092` alone is a
    /// valid environment.
    pub fn from_env() -> Result<Self, MuxmqError> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("MUXMQ").try_parsing(true))
            .build()
            .map_err(|e| MuxmqError::config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| MuxmqError::config(e.to_string()))
    }

    /// Broker address in `host:port` form
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Producer tunables in the transport's terms
    pub fn producer_settings(&self) -> ProducerSettings {
        ProducerSettings {
            flush_frequency: Duration::from_millis(self.producer_flush_frequency_ms),
            flush_messages: self.producer_flush_messages,
            flush_max_messages: self.producer_flush_max_messages,
            retry_max: self.producer_retry_max,
            retry_backoff: Duration::from_millis(self.producer_retry_backoff_ms),
            return_errors: self.producer_return_errors,
            return_successes: self.producer_return_successes,
        }
    }

    /// Consumer tunables in the transport's terms
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            max_wait: Duration::from_millis(self.consumer_max_wait_ms),
            max_processing_time: Duration::from_millis(self.max_processing_time_ms),
            buffer_size: self.consumer_buffer,
        }
    }

    /// Check the configuration for values the client cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be greater than 0".to_string());
        }
        if self.group_id.is_empty() {
            return Err("group_id must not be empty".to_string());
        }
        if self.num_partitions == 0 {
            return Err("num_partitions must be greater than 0".to_string());
        }
        if self.num_replicas == 0 {
            return Err("num_replicas must be greater than 0".to_string());
        }
        if self.producer_flush_messages == 0 {
            return Err("producer_flush_messages must be greater than 0".to_string());
        }
        if self.producer_flush_max_messages < self.producer_flush_messages {
            return Err(
                "producer_flush_max_messages must be at least producer_flush_messages".to_string(),
            );
        }
        if self.subscriber_buffer == 0 {
            return Err("subscriber_buffer must be greater than 0".to_string());
        }
        if self.consumer_buffer == 0 {
            return Err("consumer_buffer must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Set the broker host
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the broker port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the consumption strategy
    pub fn consumer_strategy(mut self, strategy: ConsumerStrategy) -> Self {
        self.config.consumer_strategy = strategy;
        self
    }

    /// Set the consumer group id
    pub fn group_id<S: Into<String>>(mut self, group_id: S) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    /// Set the producer flush frequency in milliseconds
    pub fn producer_flush_frequency_ms(mut self, millis: u64) -> Self {
        self.config.producer_flush_frequency_ms = millis;
        self
    }

    /// Set the record count that triggers a producer flush
    pub fn producer_flush_messages(mut self, count: usize) -> Self {
        self.config.producer_flush_messages = count;
        self
    }

    /// Set the upper bound of records buffered by the producer
    pub fn producer_flush_max_messages(mut self, count: usize) -> Self {
        self.config.producer_flush_max_messages = count;
        self
    }

    /// Set the number of send retries
    pub fn producer_retry_max(mut self, retries: u32) -> Self {
        self.config.producer_retry_max = retries;
        self
    }

    /// Set the backoff between send retries in milliseconds
    pub fn producer_retry_backoff_ms(mut self, millis: u64) -> Self {
        self.config.producer_retry_backoff_ms = millis;
        self
    }

    /// Report per-record errors on the producer's error stream
    pub fn producer_return_errors(mut self, enabled: bool) -> Self {
        self.config.producer_return_errors = enabled;
        self
    }

    /// Report per-record acknowledgments on the producer's success stream
    pub fn producer_return_successes(mut self, enabled: bool) -> Self {
        self.config.producer_return_successes = enabled;
        self
    }

    /// Set the longest time the broker may hold a consumer fetch
    pub fn consumer_max_wait_ms(mut self, millis: u64) -> Self {
        self.config.consumer_max_wait_ms = millis;
        self
    }

    /// Set the per-record processing allowance in milliseconds
    pub fn max_processing_time_ms(mut self, millis: u64) -> Self {
        self.config.max_processing_time_ms = millis;
        self
    }

    /// Set the partition count used when creating topics
    pub fn num_partitions(mut self, partitions: u32) -> Self {
        self.config.num_partitions = partitions;
        self
    }

    /// Set the replication factor used when creating topics
    pub fn num_replicas(mut self, replicas: u16) -> Self {
        self.config.num_replicas = replicas;
        self
    }

    /// Create missing topics on subscribe
    pub fn auto_create_topic(mut self, enabled: bool) -> Self {
        self.config.auto_create_topic = enabled;
        self
    }

    /// Set the capacity of each subscriber channel
    pub fn subscriber_buffer(mut self, capacity: usize) -> Self {
        self.config.subscriber_buffer = capacity;
        self
    }

    /// Set the capacity of the broker-level consumer stream
    pub fn consumer_buffer(mut self, capacity: usize) -> Self {
        self.config.consumer_buffer = capacity;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
