//! In-memory broker transport.
//!
//! A complete [`BrokerTransport`] implementation backed by per-partition
//! record logs held in process memory. Produced records are appended to a
//! partition and forwarded to every consumer tapped into it, so the full
//! client stack can run against it without a broker process. Group offsets
//! are kept per (group, topic, partition) and survive consumer close, which
//! is what gives group consumers their resume-after-restart behavior.

use super::{
    now_millis, AdminHandle, BrokerTransport, ConsumeRecord, ConsumerControl, ConsumerHandle,
    ConsumerSettings, ConsumerStreams, GroupConsumer, GroupControl, GroupId, GroupNotification,
    GroupStreams, Offset, PartitionConsumer, PartitionId, ProduceRecord, ProducerHandle,
    ProducerSettings, StartOffset, TopicName, TopicPartition, TransportError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

const ERROR_STREAM_CAPACITY: usize = 16;
const NOTIFICATION_CAPACITY: usize = 16;

/// An in-memory broker shared by every handle created from it.
///
/// Cloning is cheap and all clones operate on the same topics and offsets.
#[derive(Clone)]
pub struct InProcessBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    topics: DashMap<TopicName, TopicLog>,
    committed: DashMap<(GroupId, TopicName, PartitionId), Offset>,
    auto_create_on_produce: bool,
    default_partitions: u32,
    next_tap: AtomicU64,
}

struct TopicLog {
    partitions: Vec<Partition>,
    round_robin: AtomicUsize,
}

impl TopicLog {
    fn new(num_partitions: u32) -> Self {
        let partitions = (0..num_partitions.max(1))
            .map(|_| Partition {
                inner: Mutex::new(PartitionInner {
                    records: Vec::new(),
                    taps: Vec::new(),
                }),
            })
            .collect();
        Self {
            partitions,
            round_robin: AtomicUsize::new(0),
        }
    }
}

struct Partition {
    inner: Mutex<PartitionInner>,
}

struct PartitionInner {
    records: Vec<ConsumeRecord>,
    taps: Vec<Tap>,
}

/// One consumer's attachment to a partition
struct Tap {
    id: u64,
    messages: mpsc::Sender<ConsumeRecord>,
    errors: mpsc::Sender<TransportError>,
}

impl InProcessBroker {
    /// Create a broker that auto-creates single-partition topics on produce
    pub fn new() -> Self {
        Self::with_options(true, 1)
    }

    /// Create a broker with explicit produce-time auto-create behavior and
    /// partition count for auto-created topics
    pub fn with_options(auto_create_on_produce: bool, default_partitions: u32) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: DashMap::new(),
                committed: DashMap::new(),
                auto_create_on_produce,
                default_partitions: default_partitions.max(1),
                next_tap: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a topic exists on the broker
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state.topics.contains_key(topic)
    }

    /// Number of partitions of a topic, if it exists
    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.state.topics.get(topic).map(|log| log.partitions.len())
    }

    /// Total records stored across all partitions of a topic
    pub fn record_count(&self, topic: &str) -> usize {
        match self.state.topics.get(topic) {
            Some(log) => log
                .partitions
                .iter()
                .map(|p| p.inner.lock().records.len())
                .sum(),
            None => 0,
        }
    }

    /// Total consumer taps attached across all partitions of a topic
    pub fn tap_count(&self, topic: &str) -> usize {
        match self.state.topics.get(topic) {
            Some(log) => log
                .partitions
                .iter()
                .map(|p| p.inner.lock().taps.len())
                .sum(),
            None => 0,
        }
    }

    /// Committed offset for a group on one partition, if any was marked
    pub fn committed_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: PartitionId,
    ) -> Option<Offset> {
        self.state
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .map(|entry| *entry)
    }

    /// Push an error to every consumer tapped into a topic
    pub fn inject_error(&self, topic: &str, error: TransportError) {
        if let Some(log) = self.state.topics.get(topic) {
            for partition in &log.partitions {
                for tap in &partition.inner.lock().taps {
                    let _ = tap.errors.try_send(error.clone());
                }
            }
        }
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    fn create_topic(&self, topic: &str, num_partitions: u32) -> Result<(), TransportError> {
        if self.topics.contains_key(topic) {
            return Err(TransportError::already_exists(topic));
        }
        self.topics
            .insert(topic.to_string(), TopicLog::new(num_partitions));
        debug!("Created topic '{}' with {} partitions", topic, num_partitions);
        Ok(())
    }

    /// Dropping the topic log drops every tap sender attached to it, so
    /// consumer message streams end for anyone still reading.
    fn delete_topic(&self, topic: &str) -> Result<(), TransportError> {
        match self.topics.remove(topic) {
            Some(_) => {
                debug!("Deleted topic '{}'", topic);
                Ok(())
            }
            None => Err(TransportError::unknown_topic(topic)),
        }
    }

    fn append(&self, record: ProduceRecord) -> Result<(), TransportError> {
        if !self.topics.contains_key(&record.topic) {
            if !self.auto_create_on_produce {
                return Err(TransportError::unknown_topic(&record.topic));
            }
            // Racing producers may both attempt the insert; losing the race
            // to AlreadyExists is fine.
            let _ = self.create_topic(&record.topic, self.default_partitions);
        }
        let log = self
            .topics
            .get(&record.topic)
            .ok_or_else(|| TransportError::unknown_topic(&record.topic))?;

        let index = match &record.key {
            Some(key) => (fnv1a(key) % log.partitions.len() as u64) as usize,
            None => log.round_robin.fetch_add(1, Ordering::Relaxed) % log.partitions.len(),
        };

        let mut inner = log.partitions[index].inner.lock();
        let stored = ConsumeRecord {
            topic: record.topic.clone(),
            partition: index as PartitionId,
            offset: inner.records.len() as Offset,
            key: record.key,
            value: record.value,
            timestamp: now_millis(),
        };
        // Append and forward under the same lock so every tap observes
        // records in log order with no gap between replay and live delivery.
        inner.records.push(stored.clone());
        inner.taps.retain(|tap| match tap.messages.try_send(stored.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Consumer buffer full on topic '{}' partition {}, dropping record",
                    stored.topic, stored.partition
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    /// Attach a tap to one partition, replaying stored records from the
    /// resolved start offset into it first.
    fn attach_tap(
        &self,
        topic: &str,
        partition: PartitionId,
        start: StartOffset,
        buffer_size: usize,
    ) -> Result<(u64, ConsumerStreams), TransportError> {
        let log = self
            .topics
            .get(topic)
            .ok_or_else(|| TransportError::unknown_topic(topic))?;
        let slot = log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| TransportError::unknown_topic(topic))?;

        let (message_tx, message_rx) = mpsc::channel(buffer_size.max(1));
        let (error_tx, error_rx) = mpsc::channel(ERROR_STREAM_CAPACITY);
        let tap_id = self.next_tap.fetch_add(1, Ordering::Relaxed);

        let mut inner = slot.inner.lock();
        let begin = match start {
            StartOffset::Newest => inner.records.len(),
            StartOffset::Oldest => 0,
            StartOffset::At(offset) => (offset as usize).min(inner.records.len()),
        };
        let mut dropped = 0usize;
        for record in &inner.records[begin..] {
            if message_tx.try_send(record.clone()).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(
                "Replay overflowed consumer buffer on topic '{}' partition {}, dropped {} records",
                topic, partition, dropped
            );
        }
        inner.taps.push(Tap {
            id: tap_id,
            messages: message_tx,
            errors: error_tx,
        });

        Ok((
            tap_id,
            ConsumerStreams {
                messages: message_rx,
                errors: error_rx,
            },
        ))
    }

    /// Detach a tap. Reports the topic as unknown when it was deleted out
    /// from under the consumer.
    fn detach_tap(
        &self,
        topic: &str,
        partition: PartitionId,
        tap_id: u64,
    ) -> Result<(), TransportError> {
        let log = self
            .topics
            .get(topic)
            .ok_or_else(|| TransportError::unknown_topic(topic))?;
        if let Some(slot) = log.partitions.get(partition as usize) {
            slot.inner.lock().taps.retain(|tap| tap.id != tap_id);
        }
        Ok(())
    }
}

/// 64-bit FNV-1a over the routing key, reduced modulo the partition count
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

struct InProcessAdmin {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl AdminHandle for InProcessAdmin {
    async fn create_topic(
        &self,
        topic: &str,
        num_partitions: u32,
        _replication_factor: u16,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.state.create_topic(topic, num_partitions)
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.state.delete_topic(topic)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct InProcessProducer {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerHandle for InProcessProducer {
    async fn enqueue(&self, record: ProduceRecord) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.state.append(record)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct InProcessConsumer {
    state: Arc<BrokerState>,
    buffer_size: usize,
    closed: AtomicBool,
}

#[async_trait]
impl ConsumerHandle for InProcessConsumer {
    async fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let log = self
            .state
            .topics
            .get(topic)
            .ok_or_else(|| TransportError::unknown_topic(topic))?;
        Ok((0..log.partitions.len() as PartitionId).collect())
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: StartOffset,
    ) -> Result<PartitionConsumer, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let (tap_id, streams) = self
            .state
            .attach_tap(topic, partition, offset, self.buffer_size)?;
        let control = Arc::new(InProcessConsumerControl {
            state: Arc::clone(&self.state),
            topic: topic.to_string(),
            partition,
            tap_id,
            closed: AtomicBool::new(false),
        });
        Ok(PartitionConsumer::new(
            topic.to_string(),
            partition,
            streams,
            control,
        ))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct InProcessConsumerControl {
    state: Arc<BrokerState>,
    topic: TopicName,
    partition: PartitionId,
    tap_id: u64,
    closed: AtomicBool,
}

#[async_trait]
impl ConsumerControl for InProcessConsumerControl {
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state
            .detach_tap(&self.topic, self.partition, self.tap_id)
    }
}

struct InProcessGroupControl {
    state: Arc<BrokerState>,
    group_id: GroupId,
    taps: Vec<(TopicName, PartitionId, u64)>,
    closed: AtomicBool,
}

#[async_trait]
impl GroupControl for InProcessGroupControl {
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err = None;
        for (topic, partition, tap_id) in &self.taps {
            if let Err(err) = self.state.detach_tap(topic, *partition, *tap_id) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn mark_offset(&self, record: &ConsumeRecord) {
        self.state.committed.insert(
            (
                self.group_id.clone(),
                record.topic.clone(),
                record.partition,
            ),
            record.offset + 1,
        );
    }
}

#[async_trait]
impl BrokerTransport for InProcessBroker {
    async fn create_admin(&self, address: &str) -> Result<Box<dyn AdminHandle>, TransportError> {
        debug!("Creating in-process admin handle for {}", address);
        Ok(Box::new(InProcessAdmin {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_producer(
        &self,
        address: &str,
        _settings: &ProducerSettings,
    ) -> Result<Box<dyn ProducerHandle>, TransportError> {
        debug!("Creating in-process producer handle for {}", address);
        Ok(Box::new(InProcessProducer {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_consumer(
        &self,
        address: &str,
        settings: &ConsumerSettings,
    ) -> Result<Box<dyn ConsumerHandle>, TransportError> {
        debug!("Creating in-process consumer handle for {}", address);
        Ok(Box::new(InProcessConsumer {
            state: Arc::clone(&self.state),
            buffer_size: settings.buffer_size,
            closed: AtomicBool::new(false),
        }))
    }

    /// Group membership is trivial in process: the sole member is assigned
    /// every partition of every requested topic, starting from the group's
    /// committed offsets.
    async fn create_group_consumer(
        &self,
        _address: &str,
        group_id: &str,
        topics: &[TopicName],
        settings: &ConsumerSettings,
    ) -> Result<GroupConsumer, TransportError> {
        let (message_tx, message_rx) = mpsc::channel(settings.buffer_size.max(1));
        let (error_tx, error_rx) = mpsc::channel(ERROR_STREAM_CAPACITY);
        let (notification_tx, notification_rx) = mpsc::channel(NOTIFICATION_CAPACITY);

        let mut taps = Vec::new();
        let mut assignments = Vec::new();
        for topic in topics {
            let partition_count = {
                let log = self
                    .state
                    .topics
                    .get(topic)
                    .ok_or_else(|| TransportError::unknown_topic(topic))?;
                log.partitions.len() as PartitionId
            };
            for partition in 0..partition_count {
                let key = (group_id.to_string(), topic.clone(), partition);
                let start = match self.state.committed.get(&key) {
                    Some(offset) => StartOffset::At(*offset),
                    None => StartOffset::Newest,
                };
                let tap_id = self.state.next_tap.fetch_add(1, Ordering::Relaxed);
                let log = self
                    .state
                    .topics
                    .get(topic)
                    .ok_or_else(|| TransportError::unknown_topic(topic))?;
                let slot = log
                    .partitions
                    .get(partition as usize)
                    .ok_or_else(|| TransportError::unknown_topic(topic))?;
                let mut inner = slot.inner.lock();
                let begin = match start {
                    StartOffset::Newest => inner.records.len(),
                    StartOffset::Oldest => 0,
                    StartOffset::At(offset) => (offset as usize).min(inner.records.len()),
                };
                for record in &inner.records[begin..] {
                    let _ = message_tx.try_send(record.clone());
                }
                inner.taps.push(Tap {
                    id: tap_id,
                    messages: message_tx.clone(),
                    errors: error_tx.clone(),
                });
                taps.push((topic.clone(), partition, tap_id));
                assignments.push(TopicPartition {
                    topic: topic.clone(),
                    partition,
                });
            }
        }

        let _ = notification_tx.try_send(GroupNotification::Assigned(assignments));
        debug!(
            "Created in-process group consumer '{}' over {} partitions",
            group_id,
            taps.len()
        );

        let control = Arc::new(InProcessGroupControl {
            state: Arc::clone(&self.state),
            group_id: group_id.to_string(),
            taps,
            closed: AtomicBool::new(false),
        });
        Ok(GroupConsumer::new(
            group_id.to_string(),
            topics.to_vec(),
            GroupStreams {
                messages: message_rx,
                errors: error_rx,
                notifications: notification_rx,
            },
            control,
        ))
    }
}
