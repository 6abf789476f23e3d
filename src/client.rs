//! The multiplexing pub/sub client.
//!
//! [`MuxmqClient`] multiplexes any number of logical subscriptions over a
//! small set of broker-level consumers (one set per subscribed topic) and
//! funnels all outbound envelopes through one shared async producer. Broker
//! handles live in a lock-protected state struct so `start` and `stop` work
//! through `&self`, and `subscribe` holds that lock shared for its whole
//! duration: a concurrent `stop` serializes against it, so consumption loops
//! are never spawned after the shutdown signal they listen on has fired.

use crate::config::ClientConfig;
use crate::consumer::{build_consumers, spawn_feed};
use crate::envelope::Envelope;
use crate::error::MuxmqError;
use crate::metrics::ClientMetrics;
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::transport::{
    AdminHandle, BrokerTransport, ConsumerHandle, ProduceRecord, ProducerHandle, StartOffset,
    TopicName, TransportError,
};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

const SHUTDOWN_CAPACITY: usize = 16;

/// Broker handles created by `start` and released by `stop`
#[derive(Default)]
struct ClientState {
    admin: Option<Arc<dyn AdminHandle>>,
    producer: Option<Arc<dyn ProducerHandle>>,
    consumer: Option<Arc<dyn ConsumerHandle>>,
    shutdown: Option<broadcast::Sender<()>>,
}

/// Pub/sub client for a partitioned commit-log broker
pub struct MuxmqClient {
    config: ClientConfig,
    transport: Arc<dyn BrokerTransport>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<ClientMetrics>,
    state: RwLock<ClientState>,
}

impl MuxmqClient {
    /// Create a client. Performs no broker activity until [`start`](Self::start).
    pub fn new(config: ClientConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        let metrics = Arc::new(ClientMetrics::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            config.subscriber_buffer,
            Arc::clone(&metrics),
        ));
        Self {
            config,
            transport,
            registry,
            metrics,
            state: RwLock::new(ClientState::default()),
        }
    }

    /// Validate the configuration and bring up the broker handles.
    ///
    /// Admin comes up first so topic auto-creation can precede consumption.
    /// On failure the first error is returned and already-created handles
    /// stay in place for a later `stop` to close. Starting a started client
    /// is a no-op.
    pub async fn start(&self) -> Result<(), MuxmqError> {
        self.config.validate().map_err(MuxmqError::config)?;

        let mut state = self.state.write().await;
        if state.shutdown.is_some() {
            debug!("Client already started");
            return Ok(());
        }
        let address = self.config.address();
        info!("Starting client against {}", address);

        let admin = self
            .transport
            .create_admin(&address)
            .await
            .map_err(|e| MuxmqError::connection(e.to_string()))?;
        state.admin = Some(Arc::from(admin));

        let producer = self
            .transport
            .create_producer(&address, &self.config.producer_settings())
            .await
            .map_err(|e| MuxmqError::connection(e.to_string()))?;
        state.producer = Some(Arc::from(producer));

        let consumer = self
            .transport
            .create_consumer(&address, &self.config.consumer_settings())
            .await
            .map_err(|e| MuxmqError::connection(e.to_string()))?;
        state.consumer = Some(Arc::from(consumer));

        let (shutdown, _) = broadcast::channel(SHUTDOWN_CAPACITY);
        state.shutdown = Some(shutdown);
        info!("Client started");
        Ok(())
    }

    /// Shut the client down: signal every consumption loop, close the broker
    /// handles, and tear down all subscriptions. Stopping a stopped client is
    /// a no-op.
    ///
    /// # Panics
    ///
    /// Panics when the producer, consumer, or admin handle fails to close;
    /// the broker connection is in an unknown state at that point. Close
    /// failures during subscription teardown are logged instead.
    pub async fn stop(&self) {
        let (admin, producer, consumer, shutdown) = {
            let mut state = self.state.write().await;
            (
                state.admin.take(),
                state.producer.take(),
                state.consumer.take(),
                state.shutdown.take(),
            )
        };

        match shutdown {
            Some(shutdown) => {
                info!("Stopping client");
                // Err just means no loop is currently listening
                let _ = shutdown.send(());
            }
            None => debug!("Client already stopped"),
        }

        if let Some(producer) = producer {
            if let Err(err) = producer.close().await {
                error!("Failed to close producer: {}", err);
                panic!("Failed to close producer: {}", err);
            }
        }
        if let Some(consumer) = consumer {
            if let Err(err) = consumer.close().await {
                error!("Failed to close consumer: {}", err);
                panic!("Failed to close consumer: {}", err);
            }
        }
        if let Some(admin) = admin {
            if let Err(err) = admin.close().await {
                error!("Failed to close admin handle: {}", err);
                panic!("Failed to close admin handle: {}", err);
            }
        }

        self.registry.clear_all().await;
        info!("Client stopped");
    }

    /// Create a topic on the broker. A topic that already exists is success.
    pub async fn create_topic(
        &self,
        topic: &str,
        num_partitions: u32,
        replication_factor: u16,
    ) -> Result<(), MuxmqError> {
        let admin = self.admin_handle().await?;
        match admin
            .create_topic(topic, num_partitions, replication_factor)
            .await
        {
            Ok(()) => {
                info!("Created topic '{}' with {} partitions", topic, num_partitions);
                Ok(())
            }
            Err(TransportError::AlreadyExists { .. }) => {
                debug!("Topic '{}' already exists", topic);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a topic from the broker and drop every local subscription to
    /// it. A topic that does not exist is success.
    pub async fn delete_topic(&self, topic: &str) -> Result<(), MuxmqError> {
        let admin = self.admin_handle().await?;
        match admin.delete_topic(topic).await {
            Ok(()) => info!("Deleted topic '{}'", topic),
            Err(err) if err.is_unknown_topic_or_partition() => {
                debug!("Topic '{}' does not exist", topic);
            }
            Err(err) => return Err(err.into()),
        }
        self.registry.clear_topic(topic).await
    }

    /// Subscribe to a topic from the newest offset.
    ///
    /// Every call returns an independent [`Subscription`]; broker-level
    /// consumers are created only for a topic's first subscription.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, MuxmqError> {
        self.subscribe_from(topic, StartOffset::Newest).await
    }

    /// Subscribe to a topic with an explicit start offset for newly created
    /// partition consumers. The offset is ignored when the topic already has
    /// a consumer set, and the group strategy always resumes from the group's
    /// committed offsets.
    pub async fn subscribe_from(
        &self,
        topic: &str,
        offset: StartOffset,
    ) -> Result<Subscription, MuxmqError> {
        let state = self.state.read().await;
        let admin = state.admin.clone().ok_or(MuxmqError::NotStarted)?;
        let consumer = state.consumer.clone().ok_or(MuxmqError::NotStarted)?;
        let shutdown = state.shutdown.clone().ok_or(MuxmqError::NotStarted)?;

        let (subscription, feeds) = self
            .registry
            .subscribe_with(topic, || async move {
                if self.config.auto_create_topic {
                    match admin
                        .create_topic(topic, self.config.num_partitions, self.config.num_replicas)
                        .await
                    {
                        Ok(()) => info!("Auto-created topic '{}'", topic),
                        Err(TransportError::AlreadyExists { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                build_consumers(
                    &self.config,
                    self.transport.as_ref(),
                    consumer.as_ref(),
                    topic,
                    offset,
                )
                .await
            })
            .await?;

        for feed in feeds {
            spawn_feed(
                feed,
                Arc::clone(&self.registry),
                Arc::clone(&self.metrics),
                shutdown.subscribe(),
            );
        }
        Ok(subscription)
    }

    /// Remove one subscription. Removing a topic's last subscription closes
    /// its broker-level consumers.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        subscription: &Subscription,
    ) -> Result<(), MuxmqError> {
        self.registry.unsubscribe(topic, subscription).await
    }

    /// Validate, encode, and enqueue one envelope on the shared producer.
    ///
    /// Returns once the producer accepts the record; broker acknowledgment is
    /// not awaited. The key, when present, pins the envelope to a partition.
    pub async fn send(
        &self,
        envelope: &Envelope,
        topic: &str,
        key: Option<&str>,
    ) -> Result<(), MuxmqError> {
        envelope.validate()?;
        let producer = self.producer_handle().await?;
        let value = envelope.encode()?;
        let record = match key {
            Some(key) => ProduceRecord::with_key(topic, key.as_bytes().to_vec(), value),
            None => ProduceRecord::new(topic, value),
        };
        match producer.enqueue(record).await {
            Ok(()) => {
                self.metrics.record_envelope_sent();
                debug!("Enqueued envelope {} on topic '{}'", envelope.id, topic);
                Ok(())
            }
            Err(err) => {
                self.metrics.record_send_error();
                Err(err.into())
            }
        }
    }

    /// Topics with at least one active subscription
    pub async fn subscribed_topics(&self) -> Vec<TopicName> {
        self.registry.topics().await
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn admin_handle(&self) -> Result<Arc<dyn AdminHandle>, MuxmqError> {
        self.state
            .read()
            .await
            .admin
            .clone()
            .ok_or(MuxmqError::NotStarted)
    }

    async fn producer_handle(&self) -> Result<Arc<dyn ProducerHandle>, MuxmqError> {
        self.state
            .read()
            .await
            .producer
            .clone()
            .ok_or(MuxmqError::NotStarted)
    }
}
