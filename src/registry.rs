//! Topic subscription registry.
//!
//! One read/write lock guards the topic map. Each entry pairs the broker-level
//! consumers feeding a topic with the subscriber channels fed by them, and the
//! two live and die together: an entry is installed only with live consumers,
//! and it is deleted in the same critical section that closes them. Holding
//! the write lock across consumer creation is what keeps two concurrent first
//! subscribes from building two consumer sets for one topic.
//!
//! Dispatch also lives here, since fanning an envelope out to a topic's
//! subscribers means iterating the entry under the read lock. Deliveries are
//! non-blocking bounded sends, so a slow subscriber costs itself messages but
//! never delays the consumption loop or its sibling subscribers.

use crate::envelope::Envelope;
use crate::error::MuxmqError;
use crate::metrics::ClientMetrics;
use crate::transport::{
    ConsumerStreams, GroupConsumer, GroupControl, GroupId, GroupStreams, PartitionConsumer,
    PartitionId, TopicName, TransportError,
};
use futures::Stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// A broker-level consumer of either strategy, closed uniformly
pub(crate) enum BrokerConsumer {
    Partition(PartitionConsumer),
    Group(GroupConsumer),
}

impl BrokerConsumer {
    /// Take what the consumption loop needs; `None` after the first call
    pub(crate) fn take_feed(&mut self) -> Option<ConsumerFeed> {
        match self {
            Self::Partition(consumer) => {
                let streams = consumer.take_streams()?;
                Some(ConsumerFeed::Partition {
                    topic: consumer.topic().to_string(),
                    partition: consumer.partition(),
                    streams,
                })
            }
            Self::Group(consumer) => {
                let streams = consumer.take_streams()?;
                Some(ConsumerFeed::Group {
                    topic: consumer.topics().first().cloned().unwrap_or_default(),
                    group_id: consumer.group_id().to_string(),
                    streams,
                    control: consumer.control(),
                })
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        match self {
            Self::Partition(consumer) => consumer.close().await,
            Self::Group(consumer) => consumer.close().await,
        }
    }

    /// Close, treating a broker that already dropped the topic as success
    pub(crate) async fn close_tolerant(&self) -> Result<(), TransportError> {
        match self.close().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_unknown_topic_or_partition() => {
                debug!("Consumer already gone on close: {}", err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for BrokerConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Partition(consumer) => f
                .debug_struct("Partition")
                .field("topic", &consumer.topic())
                .field("partition", &consumer.partition())
                .finish(),
            Self::Group(consumer) => f
                .debug_struct("Group")
                .field("group_id", &consumer.group_id())
                .field("topics", &consumer.topics())
                .finish(),
        }
    }
}

/// Stream half of one broker-level consumer, handed to its consumption loop
pub(crate) enum ConsumerFeed {
    Partition {
        topic: TopicName,
        partition: PartitionId,
        streams: ConsumerStreams,
    },
    Group {
        topic: TopicName,
        group_id: GroupId,
        streams: GroupStreams,
        control: Arc<dyn GroupControl>,
    },
}

struct SubscriberChannel {
    id: u64,
    sender: mpsc::Sender<Envelope>,
}

/// Registry entry: the consumers for a topic and the channels they feed
struct ConsumerChannels {
    consumers: Vec<BrokerConsumer>,
    channels: Vec<SubscriberChannel>,
}

/// The caller-held receive side of one subscriber channel.
///
/// Each `subscribe` call returns its own `Subscription`; envelopes arriving on
/// the topic fan out to every one of them independently. The channel closes
/// (`recv` returns `None`) when the subscription is unsubscribed, the topic is
/// deleted, or the client stops.
pub struct Subscription {
    id: u64,
    topic: TopicName,
    receiver: mpsc::Receiver<Envelope>,
}

impl Subscription {
    /// Identity used by `unsubscribe`
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next envelope, or `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Receive without waiting
    pub fn try_recv(&mut self) -> Result<Envelope, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

pub(crate) struct SubscriptionRegistry {
    topics: RwLock<HashMap<TopicName, ConsumerChannels>>,
    next_id: AtomicU64,
    buffer: usize,
    metrics: Arc<ClientMetrics>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(buffer: usize, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
            metrics,
        }
    }

    fn new_channel(&self, topic: &str) -> (Subscription, SubscriberChannel) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);
        (
            Subscription {
                id,
                topic: topic.to_string(),
                receiver,
            },
            SubscriberChannel { id, sender },
        )
    }

    /// Attach a subscriber to `topic`, creating the topic's consumer set via
    /// `create` if this is the first subscription.
    ///
    /// Returns the new subscription plus the consumer feeds to spawn loops
    /// for; the feed list is empty when the topic already had an entry. The
    /// write lock is held across `create`, so concurrent first subscribes to
    /// one topic build exactly one consumer set.
    pub(crate) async fn subscribe_with<F, Fut>(
        &self,
        topic: &str,
        create: F,
    ) -> Result<(Subscription, Vec<ConsumerFeed>), MuxmqError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<BrokerConsumer>, MuxmqError>>,
    {
        let mut topics = self.topics.write().await;
        if let Some(entry) = topics.get_mut(topic) {
            let (subscription, channel) = self.new_channel(topic);
            debug!(
                "Attached subscriber {} to existing entry for topic '{}'",
                channel.id, topic
            );
            entry.channels.push(channel);
            self.metrics.record_subscription_created();
            return Ok((subscription, Vec::new()));
        }

        let mut consumers = create().await?;
        let feeds: Vec<ConsumerFeed> = consumers
            .iter_mut()
            .filter_map(BrokerConsumer::take_feed)
            .collect();
        let (subscription, channel) = self.new_channel(topic);
        debug!(
            "Subscribed to topic '{}' with {} broker consumers",
            topic,
            consumers.len()
        );
        topics.insert(
            topic.to_string(),
            ConsumerChannels {
                consumers,
                channels: vec![channel],
            },
        );
        self.metrics.record_subscription_created();
        Ok((subscription, feeds))
    }

    /// Detach one subscriber. Removing a topic's last subscriber closes its
    /// broker-level consumers and deletes the entry before the lock is
    /// released.
    pub(crate) async fn unsubscribe(
        &self,
        topic: &str,
        subscription: &Subscription,
    ) -> Result<(), MuxmqError> {
        let mut topics = self.topics.write().await;
        let entry = topics
            .get_mut(topic)
            .ok_or_else(|| MuxmqError::topic_not_found(topic))?;

        let before = entry.channels.len();
        entry.channels.retain(|channel| channel.id != subscription.id);
        if entry.channels.len() < before {
            self.metrics.record_subscription_removed();
        }

        if entry.channels.is_empty() {
            // Removing the map entry drops the last senders once it goes out
            // of scope; consumers are closed while the lock is still held.
            let entry = match topics.remove(topic) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            debug!(
                "Last subscriber left topic '{}', closing {} consumers",
                topic,
                entry.consumers.len()
            );
            close_consumers(&entry.consumers).await?;
        }
        Ok(())
    }

    /// Remove a topic's entry outright, closing its channels and consumers.
    /// Used when the topic is deleted from the broker.
    pub(crate) async fn clear_topic(&self, topic: &str) -> Result<(), MuxmqError> {
        let mut topics = self.topics.write().await;
        if let Some(entry) = topics.remove(topic) {
            for _ in &entry.channels {
                self.metrics.record_subscription_removed();
            }
            debug!(
                "Cleared topic '{}': {} subscribers, {} consumers",
                topic,
                entry.channels.len(),
                entry.consumers.len()
            );
            close_consumers(&entry.consumers).await?;
        }
        Ok(())
    }

    /// Tear down every entry. Close failures are logged and do not stop the
    /// teardown.
    pub(crate) async fn clear_all(&self) {
        let mut topics = self.topics.write().await;
        for (topic, entry) in topics.drain() {
            for _ in &entry.channels {
                self.metrics.record_subscription_removed();
            }
            if let Err(err) = close_consumers(&entry.consumers).await {
                error!("Failed to close consumers for topic '{}': {}", topic, err);
            }
        }
    }

    /// Deliver one envelope to every subscriber of `topic`.
    ///
    /// Non-blocking: a full subscriber buffer drops the envelope for that
    /// subscriber only, a closed one is skipped.
    pub(crate) async fn dispatch(&self, topic: &str, envelope: &Envelope) {
        let topics = self.topics.read().await;
        let entry = match topics.get(topic) {
            Some(entry) => entry,
            None => {
                debug!("No subscribers for topic '{}', dropping envelope", topic);
                return;
            }
        };
        for channel in &entry.channels {
            match channel.sender.try_send(envelope.clone()) {
                Ok(()) => self.metrics.record_envelope_delivered(),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber {} buffer full on topic '{}', dropping envelope",
                        channel.id, topic
                    );
                    self.metrics.record_envelope_dropped();
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Topics with at least one active subscription
    pub(crate) async fn topics(&self) -> Vec<TopicName> {
        self.topics.read().await.keys().cloned().collect()
    }
}

async fn close_consumers(consumers: &[BrokerConsumer]) -> Result<(), MuxmqError> {
    let mut first_err = None;
    for consumer in consumers {
        if let Err(err) = consumer.close_tolerant().await {
            warn!("Broker consumer close failed: {}", err);
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(MuxmqError::close(err.to_string())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inprocess::InProcessBroker;
    use crate::transport::{BrokerTransport, ConsumerSettings, StartOffset};
    use serde_json::json;

    async fn partition_consumers(broker: &InProcessBroker, topic: &str) -> Vec<BrokerConsumer> {
        let handle = broker
            .create_consumer("local", &ConsumerSettings::default())
            .await
            .unwrap();
        let mut consumers = Vec::new();
        for partition in handle.partitions(topic).await.unwrap() {
            let consumer = handle
                .consume_partition(topic, partition, StartOffset::Newest)
                .await
                .unwrap();
            consumers.push(BrokerConsumer::Partition(consumer));
        }
        consumers
    }

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(8, Arc::new(ClientMetrics::new()))
    }

    #[tokio::test]
    async fn test_second_subscribe_reuses_consumer_set() {
        let broker = InProcessBroker::new();
        let admin = broker.create_admin("local").await.unwrap();
        admin.create_topic("events", 2, 1).await.unwrap();

        let registry = registry();
        let consumers = partition_consumers(&broker, "events").await;
        let (_first, feeds) = registry
            .subscribe_with("events", || async move { Ok::<_, MuxmqError>(consumers) })
            .await
            .unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(broker.tap_count("events"), 2);

        let (_second, feeds) = registry
            .subscribe_with("events", || async move {
                panic!("consumer set must not be rebuilt")
            })
            .await
            .unwrap();
        assert!(feeds.is_empty());
        assert_eq!(broker.tap_count("events"), 2);
        assert_eq!(registry.topics().await, vec!["events".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_last_closes_consumers() {
        let broker = InProcessBroker::new();
        let admin = broker.create_admin("local").await.unwrap();
        admin.create_topic("events", 1, 1).await.unwrap();

        let registry = registry();
        let consumers = partition_consumers(&broker, "events").await;
        let (first, _) = registry
            .subscribe_with("events", || async move { Ok::<_, MuxmqError>(consumers) })
            .await
            .unwrap();
        let (second, _) = registry
            .subscribe_with("events", || async move {
                panic!("consumer set must not be rebuilt")
            })
            .await
            .unwrap();

        registry.unsubscribe("events", &first).await.unwrap();
        assert_eq!(broker.tap_count("events"), 1);

        registry.unsubscribe("events", &second).await.unwrap();
        assert_eq!(broker.tap_count("events"), 0);
        assert!(registry.topics().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_topic() {
        let registry = registry();
        let broker = InProcessBroker::new();
        let admin = broker.create_admin("local").await.unwrap();
        admin.create_topic("events", 1, 1).await.unwrap();

        let consumers = partition_consumers(&broker, "events").await;
        let (subscription, _) = registry
            .subscribe_with("events", || async move { Ok::<_, MuxmqError>(consumers) })
            .await
            .unwrap();

        let err = registry
            .unsubscribe("missing", &subscription)
            .await
            .unwrap_err();
        assert!(matches!(err, MuxmqError::TopicNotFound { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_and_drops_on_full() {
        let broker = InProcessBroker::new();
        let admin = broker.create_admin("local").await.unwrap();
        admin.create_topic("events", 1, 1).await.unwrap();

        let metrics = Arc::new(ClientMetrics::new());
        let registry = SubscriptionRegistry::new(1, Arc::clone(&metrics));
        let consumers = partition_consumers(&broker, "events").await;
        let (mut first, _) = registry
            .subscribe_with("events", || async move { Ok::<_, MuxmqError>(consumers) })
            .await
            .unwrap();
        let (mut second, _) = registry
            .subscribe_with("events", || async move {
                panic!("consumer set must not be rebuilt")
            })
            .await
            .unwrap();

        let envelope = Envelope::new("device.event", json!({"id": 1}));
        registry.dispatch("events", &envelope).await;
        // Capacity is 1 and nothing was received yet, so the second dispatch
        // drops on both channels
        registry.dispatch("events", &envelope).await;

        assert_eq!(first.recv().await.unwrap(), envelope);
        assert_eq!(second.recv().await.unwrap(), envelope);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.envelopes_delivered, 2);
        assert_eq!(snapshot.envelopes_dropped, 2);
    }

    #[tokio::test]
    async fn test_clear_all_closes_everything() {
        let broker = InProcessBroker::new();
        let admin = broker.create_admin("local").await.unwrap();
        admin.create_topic("events", 2, 1).await.unwrap();

        let registry = registry();
        let consumers = partition_consumers(&broker, "events").await;
        let (mut subscription, _) = registry
            .subscribe_with("events", || async move { Ok::<_, MuxmqError>(consumers) })
            .await
            .unwrap();

        registry.clear_all().await;
        assert!(registry.topics().await.is_empty());
        assert_eq!(broker.tap_count("events"), 0);
        assert!(subscription.recv().await.is_none());
    }
}
