//! Consumption strategies and loops.
//!
//! A topic's first subscription creates its broker-level consumers according
//! to the configured strategy: one consumer per partition, or one member of
//! the configured consumer group. Each broker-level consumer then gets a
//! detached task that drains its streams and hands every decoded envelope to
//! registry dispatch. Loops terminate when the shutdown broadcast fires or
//! when their message stream closes, whichever happens first.

use crate::config::{ClientConfig, ConsumerStrategy};
use crate::envelope::Envelope;
use crate::error::MuxmqError;
use crate::metrics::ClientMetrics;
use crate::registry::{BrokerConsumer, ConsumerFeed, SubscriptionRegistry};
use crate::transport::{
    BrokerTransport, ConsumeRecord, ConsumerHandle, ConsumerStreams, GroupControl, GroupId,
    GroupNotification, GroupStreams, PartitionId, StartOffset, TopicName,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Create the broker-level consumers for one topic under the configured
/// strategy.
pub(crate) async fn build_consumers(
    config: &ClientConfig,
    transport: &dyn BrokerTransport,
    handle: &dyn ConsumerHandle,
    topic: &str,
    offset: StartOffset,
) -> Result<Vec<BrokerConsumer>, MuxmqError> {
    match config.consumer_strategy {
        ConsumerStrategy::Partition => build_partition_consumers(handle, topic, offset).await,
        ConsumerStrategy::Group => build_group_consumer(config, transport, topic).await,
    }
}

async fn build_partition_consumers(
    handle: &dyn ConsumerHandle,
    topic: &str,
    offset: StartOffset,
) -> Result<Vec<BrokerConsumer>, MuxmqError> {
    let partitions = handle.partitions(topic).await?;
    let mut consumers = Vec::with_capacity(partitions.len());
    for partition in partitions {
        match handle.consume_partition(topic, partition, offset).await {
            Ok(consumer) => consumers.push(BrokerConsumer::Partition(consumer)),
            Err(err) => {
                // Partial creation: close what was already opened
                for consumer in &consumers {
                    if let Err(close_err) = consumer.close_tolerant().await {
                        warn!(
                            "Failed to close partially created consumer for topic '{}': {}",
                            topic, close_err
                        );
                    }
                }
                return Err(err.into());
            }
        }
    }
    debug!(
        "Opened {} partition consumers for topic '{}'",
        consumers.len(),
        topic
    );
    Ok(consumers)
}

async fn build_group_consumer(
    config: &ClientConfig,
    transport: &dyn BrokerTransport,
    topic: &str,
) -> Result<Vec<BrokerConsumer>, MuxmqError> {
    let consumer = transport
        .create_group_consumer(
            &config.address(),
            &config.group_id,
            &[topic.to_string()],
            &config.consumer_settings(),
        )
        .await?;
    debug!("Joined group '{}' for topic '{}'", config.group_id, topic);
    Ok(vec![BrokerConsumer::Group(consumer)])
}

/// Spawn the detached consumption-loop task for one consumer feed
pub(crate) fn spawn_feed(
    feed: ConsumerFeed,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<ClientMetrics>,
    shutdown: broadcast::Receiver<()>,
) {
    match feed {
        ConsumerFeed::Partition {
            topic,
            partition,
            streams,
        } => {
            tokio::spawn(run_partition_loop(
                topic, partition, streams, registry, metrics, shutdown,
            ));
        }
        ConsumerFeed::Group {
            topic,
            group_id,
            streams,
            control,
        } => {
            tokio::spawn(run_group_loop(
                topic, group_id, streams, control, registry, metrics, shutdown,
            ));
        }
    }
}

async fn run_partition_loop(
    topic: TopicName,
    partition: PartitionId,
    mut streams: ConsumerStreams,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<ClientMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    metrics.record_loop_started();
    debug!(
        "Consumption loop started for topic '{}' partition {}",
        topic, partition
    );
    let mut errors_open = true;
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(
                    "Shutdown received, stopping loop for topic '{}' partition {}",
                    topic, partition
                );
                break;
            }
            error = streams.errors.recv(), if errors_open => {
                match error {
                    Some(err) => {
                        warn!(
                            "Consumer error on topic '{}' partition {}: {}",
                            topic, partition, err
                        );
                        metrics.record_consumer_error();
                    }
                    None => errors_open = false,
                }
            }
            record = streams.messages.recv() => {
                match record {
                    Some(record) => {
                        decode_and_dispatch(&registry, &metrics, &record).await;
                    }
                    None => {
                        debug!(
                            "Message stream closed for topic '{}' partition {}",
                            topic, partition
                        );
                        break;
                    }
                }
            }
        }
    }
    metrics.record_loop_stopped();
}

async fn run_group_loop(
    topic: TopicName,
    group_id: GroupId,
    mut streams: GroupStreams,
    control: Arc<dyn GroupControl>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<ClientMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    metrics.record_loop_started();
    debug!(
        "Group consumption loop started for topic '{}' in group '{}'",
        topic, group_id
    );
    let mut errors_open = true;
    let mut notifications_open = true;
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(
                    "Shutdown received, stopping group loop for topic '{}'",
                    topic
                );
                break;
            }
            error = streams.errors.recv(), if errors_open => {
                match error {
                    Some(err) => {
                        warn!("Consumer error on topic '{}' in group '{}': {}", topic, group_id, err);
                        metrics.record_consumer_error();
                    }
                    None => errors_open = false,
                }
            }
            notification = streams.notifications.recv(), if notifications_open => {
                match notification {
                    Some(GroupNotification::Assigned(partitions)) => {
                        info!(
                            "Group '{}' assigned {} partitions on topic '{}'",
                            group_id,
                            partitions.len(),
                            topic
                        );
                    }
                    Some(GroupNotification::Revoked(partitions)) => {
                        info!(
                            "Group '{}' revoked {} partitions on topic '{}'",
                            group_id,
                            partitions.len(),
                            topic
                        );
                    }
                    None => notifications_open = false,
                }
            }
            record = streams.messages.recv() => {
                match record {
                    Some(record) => {
                        // At-least-once: the offset is marked once dispatch is
                        // initiated, not once subscribers finish processing
                        if decode_and_dispatch(&registry, &metrics, &record).await {
                            control.mark_offset(&record);
                            metrics.record_offset_marked();
                        }
                    }
                    None => {
                        debug!("Message stream closed for topic '{}' in group '{}'", topic, group_id);
                        break;
                    }
                }
            }
        }
    }
    metrics.record_loop_stopped();
}

/// Decode one record and fan it out. Returns whether dispatch was initiated.
async fn decode_and_dispatch(
    registry: &SubscriptionRegistry,
    metrics: &ClientMetrics,
    record: &ConsumeRecord,
) -> bool {
    match Envelope::decode(&record.value) {
        Ok(envelope) => {
            registry.dispatch(&record.topic, &envelope).await;
            true
        }
        Err(err) => {
            warn!(
                "Dropping undecodable record at offset {} on topic '{}' partition {}: {}",
                record.offset, record.topic, record.partition, err
            );
            metrics.record_decode_error();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inprocess::InProcessBroker;

    #[tokio::test]
    async fn test_partition_strategy_opens_one_consumer_per_partition() {
        let broker = InProcessBroker::new();
        let admin = broker.create_admin("local").await.unwrap();
        admin.create_topic("events", 3, 1).await.unwrap();

        let config = ClientConfig::default();
        let handle = broker
            .create_consumer(&config.address(), &config.consumer_settings())
            .await
            .unwrap();
        let mut consumers = build_consumers(
            &config,
            &broker,
            handle.as_ref(),
            "events",
            StartOffset::Newest,
        )
        .await
        .unwrap();

        assert_eq!(consumers.len(), 3);
        assert_eq!(broker.tap_count("events"), 3);
        for consumer in &mut consumers {
            assert!(consumer.take_feed().is_some());
            assert!(consumer.take_feed().is_none());
        }
    }

    #[tokio::test]
    async fn test_group_strategy_opens_single_member() {
        let broker = InProcessBroker::new();
        let admin = broker.create_admin("local").await.unwrap();
        admin.create_topic("events", 3, 1).await.unwrap();

        let config = ClientConfig::builder()
            .consumer_strategy(ConsumerStrategy::Group)
            .group_id("workers")
            .build();
        let handle = broker
            .create_consumer(&config.address(), &config.consumer_settings())
            .await
            .unwrap();
        let mut consumers = build_consumers(
            &config,
            &broker,
            handle.as_ref(),
            "events",
            StartOffset::Newest,
        )
        .await
        .unwrap();

        assert_eq!(consumers.len(), 1);
        // The sole member taps every partition
        assert_eq!(broker.tap_count("events"), 3);
        match consumers[0].take_feed() {
            Some(ConsumerFeed::Group { group_id, .. }) => assert_eq!(group_id, "workers"),
            _ => panic!("expected a group feed"),
        }
    }

    #[tokio::test]
    async fn test_missing_topic_fails_without_auto_create() {
        let broker = InProcessBroker::with_options(false, 1);
        let config = ClientConfig::default();
        let handle = broker
            .create_consumer(&config.address(), &config.consumer_settings())
            .await
            .unwrap();
        let err = build_consumers(
            &config,
            &broker,
            handle.as_ref(),
            "missing",
            StartOffset::Newest,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            MuxmqError::Transport(ref inner) if inner.is_unknown_topic_or_partition()
        ));
    }
}
