//! Broker transport contract.
//!
//! The client never speaks a wire protocol itself. Everything it needs from a
//! broker is expressed here as a small set of async traits: an admin handle for
//! topic management, a producer handle for the shared async send path, a
//! consumer handle that opens per-partition consumers, and a factory for group
//! consumers. A transport implementation connects these to a real broker; the
//! [`inprocess`] module ships one that runs entirely in memory.
//!
//! Broker-level consumers come in two pieces: a stream half (message, error and
//! notification channels, taken exactly once by the consumption loop that owns
//! them) and a control half (close, and offset marking for group consumers)
//! kept by the subscription registry.

pub mod inprocess;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub type TopicName = String;
pub type PartitionId = u32;
pub type Offset = u64;
pub type GroupId = String;

/// Errors reported by a broker transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The topic or partition is unknown to the broker
    #[error("Unknown topic or partition '{topic}'")]
    UnknownTopicOrPartition { topic: String },

    /// The topic already exists on the broker
    #[error("Topic '{topic}' already exists")]
    AlreadyExists { topic: String },

    /// The broker cannot be reached
    #[error("Connection failed: {message}")]
    Connection { message: String },

    /// The handle was closed and can no longer be used
    #[error("Handle is closed")]
    Closed,

    /// Any other broker-side failure
    #[error("{message}")]
    Other { message: String },
}

impl TransportError {
    /// Create an unknown topic or partition error
    pub fn unknown_topic<S: Into<String>>(topic: S) -> Self {
        Self::UnknownTopicOrPartition {
            topic: topic.into(),
        }
    }

    /// Create an already exists error
    pub fn already_exists<S: Into<String>>(topic: S) -> Self {
        Self::AlreadyExists {
            topic: topic.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a generic transport error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Check whether this is the tolerated "already gone" close outcome
    pub fn is_unknown_topic_or_partition(&self) -> bool {
        matches!(self, Self::UnknownTopicOrPartition { .. })
    }
}

/// Where a newly created partition consumer starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Only records appended after the consumer is created
    Newest,
    /// The beginning of the partition log
    Oldest,
    /// A specific offset
    At(Offset),
}

/// Outbound record handed to the shared producer
#[derive(Debug, Clone)]
pub struct ProduceRecord {
    pub topic: TopicName,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl ProduceRecord {
    /// Create a record with topic and value
    pub fn new<T: Into<TopicName>, V: Into<Bytes>>(topic: T, value: V) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
        }
    }

    /// Create a record with topic, routing key, and value
    pub fn with_key<T: Into<TopicName>, K: Into<Bytes>, V: Into<Bytes>>(
        topic: T,
        key: K,
        value: V,
    ) -> Self {
        Self {
            topic: topic.into(),
            key: Some(key.into()),
            value: value.into(),
        }
    }
}

/// Inbound record delivered by a broker-level consumer
#[derive(Debug, Clone)]
pub struct ConsumeRecord {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: u64,
}

/// A (topic, partition) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: TopicName,
    pub partition: PartitionId,
}

/// Group membership change reported by the broker
#[derive(Debug, Clone)]
pub enum GroupNotification {
    /// Partitions assigned to this group member
    Assigned(Vec<TopicPartition>),
    /// Partitions taken away from this group member
    Revoked(Vec<TopicPartition>),
}

/// Producer tunables handed to the transport at creation time
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// How long records may sit before a flush
    pub flush_frequency: Duration,
    /// Record count that triggers a flush
    pub flush_messages: usize,
    /// Upper bound of records buffered before enqueue blocks
    pub flush_max_messages: usize,
    /// Send retries before a record is failed
    pub retry_max: u32,
    /// Backoff between send retries
    pub retry_backoff: Duration,
    /// Report per-record errors on the producer's error stream
    pub return_errors: bool,
    /// Report per-record acknowledgments on the producer's success stream
    pub return_successes: bool,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            flush_frequency: Duration::from_millis(100),
            flush_messages: 10,
            flush_max_messages: 100,
            retry_max: 3,
            retry_backoff: Duration::from_millis(100),
            return_errors: true,
            return_successes: false,
        }
    }
}

/// Consumer tunables handed to the transport at creation time
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Longest time the broker may hold a fetch before answering
    pub max_wait: Duration,
    /// Longest a single record may take to process before the consumer is considered stalled
    pub max_processing_time: Duration,
    /// Capacity of the message stream between transport and consumption loop
    pub buffer_size: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(100),
            max_processing_time: Duration::from_millis(100),
            buffer_size: 256,
        }
    }
}

/// Stream half of a partition consumer, taken once by its consumption loop
#[derive(Debug)]
pub struct ConsumerStreams {
    pub messages: mpsc::Receiver<ConsumeRecord>,
    pub errors: mpsc::Receiver<TransportError>,
}

/// Stream half of a group consumer
#[derive(Debug)]
pub struct GroupStreams {
    pub messages: mpsc::Receiver<ConsumeRecord>,
    pub errors: mpsc::Receiver<TransportError>,
    pub notifications: mpsc::Receiver<GroupNotification>,
}

/// Close capability of a partition consumer.
///
/// Closing twice must succeed; closing after the broker already dropped the
/// topic reports [`TransportError::UnknownTopicOrPartition`], which callers
/// treat as success.
#[async_trait]
pub trait ConsumerControl: Send + Sync {
    async fn close(&self) -> Result<(), TransportError>;
}

/// Close and offset-marking capabilities of a group consumer
#[async_trait]
pub trait GroupControl: Send + Sync {
    async fn close(&self) -> Result<(), TransportError>;

    /// Mark `record` as consumed for the group. The next consumer joining with
    /// the same group id resumes after it.
    fn mark_offset(&self, record: &ConsumeRecord);
}

/// A broker-level consumer bound to one partition of one topic
pub struct PartitionConsumer {
    topic: TopicName,
    partition: PartitionId,
    streams: Option<ConsumerStreams>,
    control: Arc<dyn ConsumerControl>,
}

impl PartitionConsumer {
    pub fn new(
        topic: TopicName,
        partition: PartitionId,
        streams: ConsumerStreams,
        control: Arc<dyn ConsumerControl>,
    ) -> Self {
        Self {
            topic,
            partition,
            streams: Some(streams),
            control,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Take the stream half; returns `None` after the first call
    pub fn take_streams(&mut self) -> Option<ConsumerStreams> {
        self.streams.take()
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.control.close().await
    }
}

/// A broker-level consumer that is one member of a named group
pub struct GroupConsumer {
    group_id: GroupId,
    topics: Vec<TopicName>,
    streams: Option<GroupStreams>,
    control: Arc<dyn GroupControl>,
}

impl GroupConsumer {
    pub fn new(
        group_id: GroupId,
        topics: Vec<TopicName>,
        streams: GroupStreams,
        control: Arc<dyn GroupControl>,
    ) -> Self {
        Self {
            group_id,
            topics,
            streams: Some(streams),
            control,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topics(&self) -> &[TopicName] {
        &self.topics
    }

    /// Take the stream half; returns `None` after the first call
    pub fn take_streams(&mut self) -> Option<GroupStreams> {
        self.streams.take()
    }

    /// Control half shared with the consumption loop for offset marking
    pub fn control(&self) -> Arc<dyn GroupControl> {
        Arc::clone(&self.control)
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.control.close().await
    }
}

/// Topic management operations
#[async_trait]
pub trait AdminHandle: Send + Sync {
    async fn create_topic(
        &self,
        topic: &str,
        num_partitions: u32,
        replication_factor: u16,
    ) -> Result<(), TransportError>;

    async fn delete_topic(&self, topic: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// The shared async send path
#[async_trait]
pub trait ProducerHandle: Send + Sync {
    /// Enqueue one record. Returns once the record is accepted by the send
    /// path, not once the broker acknowledges it.
    async fn enqueue(&self, record: ProduceRecord) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Partition discovery and per-partition consumer creation
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    async fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>, TransportError>;

    async fn consume_partition(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: StartOffset,
    ) -> Result<PartitionConsumer, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory contract a broker transport implements
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn create_admin(&self, address: &str) -> Result<Box<dyn AdminHandle>, TransportError>;

    async fn create_producer(
        &self,
        address: &str,
        settings: &ProducerSettings,
    ) -> Result<Box<dyn ProducerHandle>, TransportError>;

    async fn create_consumer(
        &self,
        address: &str,
        settings: &ConsumerSettings,
    ) -> Result<Box<dyn ConsumerHandle>, TransportError>;

    async fn create_group_consumer(
        &self,
        address: &str,
        group_id: &str,
        topics: &[TopicName],
        settings: &ConsumerSettings,
    ) -> Result<GroupConsumer, TransportError>;
}

/// Milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_record_constructors() {
        let record = ProduceRecord::new("events", "payload");
        assert_eq!(record.topic, "events");
        assert!(record.key.is_none());

        let record = ProduceRecord::with_key("events", "user-1", "payload");
        assert_eq!(record.key, Some(Bytes::from("user-1")));
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::unknown_topic("events");
        assert_eq!(err.to_string(), "Unknown topic or partition 'events'");
        assert!(err.is_unknown_topic_or_partition());

        let err = TransportError::already_exists("events");
        assert_eq!(err.to_string(), "Topic 'events' already exists");
        assert!(!err.is_unknown_topic_or_partition());
    }

    #[test]
    fn test_default_settings() {
        let producer = ProducerSettings::default();
        assert_eq!(producer.flush_messages, 10);
        assert!(producer.return_errors);
        assert!(!producer.return_successes);

        let consumer = ConsumerSettings::default();
        assert_eq!(consumer.buffer_size, 256);
        assert_eq!(consumer.max_wait, Duration::from_millis(100));
    }

    #[test]
    fn test_now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}
