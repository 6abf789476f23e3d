//! Tests that exercise the client from many tasks at once.

use muxmq::transport::inprocess::InProcessBroker;
use muxmq::{ClientConfig, Envelope, MuxmqClient};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_subscribe_builds_one_consumer_set() {
    init_tracing();
    let broker = InProcessBroker::new();
    let client = Arc::new(MuxmqClient::new(
        ClientConfig::default(),
        Arc::new(broker.clone()),
    ));
    client.start().await.unwrap();
    client.create_topic("events", 3, 1).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move { client.subscribe("events").await }));
    }
    let mut subscriptions = Vec::new();
    for handle in handles {
        subscriptions.push(handle.await.unwrap().unwrap());
    }

    // All eight raced the first subscribe, but the broker saw one consumer
    // per partition exactly once
    assert_eq!(broker.tap_count("events"), 3);
    assert_eq!(client.subscribed_topics().await, vec!["events".to_string()]);
    assert_eq!(client.metrics().snapshot().subscriptions_created, 8);

    let envelope = Envelope::new("event", json!({"broadcast": true}));
    client.send(&envelope, "events", None).await.unwrap();
    for subscription in &mut subscriptions {
        let received = timeout(RECV_TIMEOUT, subscription.recv())
            .await
            .expect("timed out waiting for fan-out")
            .expect("subscriber channel closed");
        assert_eq!(received, envelope);
    }
    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_all_delivered() {
    init_tracing();
    let broker = InProcessBroker::new();
    let client = Arc::new(MuxmqClient::new(
        ClientConfig::default(),
        Arc::new(broker.clone()),
    ));
    client.start().await.unwrap();
    client.create_topic("load", 3, 1).await.unwrap();
    let mut subscription = client.subscribe("load").await.unwrap();

    let mut senders = Vec::new();
    for task in 0..4u64 {
        let client = Arc::clone(&client);
        senders.push(tokio::spawn(async move {
            for i in 0..25u64 {
                let envelope = Envelope::new("load.test", json!({"seq": task * 25 + i}));
                client.send(&envelope, "load", None).await.unwrap();
            }
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..100 {
        let envelope = timeout(RECV_TIMEOUT, subscription.recv())
            .await
            .expect("timed out draining the subscription")
            .expect("subscriber channel closed");
        seen.insert(envelope.payload["seq"].as_u64().unwrap());
    }
    assert_eq!(seen.len(), 100);
    assert_eq!(client.metrics().snapshot().envelopes_sent, 100);
    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_races_inflight_sends() {
    init_tracing();
    let broker = InProcessBroker::new();
    let client = Arc::new(MuxmqClient::new(
        ClientConfig::default(),
        Arc::new(broker.clone()),
    ));
    client.start().await.unwrap();
    client.create_topic("events", 1, 1).await.unwrap();
    let _subscription = client.subscribe("events").await.unwrap();

    let sender = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let mut sent = 0u64;
            loop {
                let envelope = Envelope::new("event", json!({"n": sent}));
                // The producer going away mid-loop is the expected exit
                if client.send(&envelope, "events", None).await.is_err() {
                    break;
                }
                sent += 1;
                tokio::task::yield_now().await;
            }
            sent
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    client.stop().await;

    let sent = sender.await.unwrap();
    assert!(sent > 0);
    assert!(client.subscribed_topics().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscribe_unsubscribe_churn() {
    init_tracing();
    let broker = InProcessBroker::new();
    let client = Arc::new(MuxmqClient::new(
        ClientConfig::default(),
        Arc::new(broker.clone()),
    ));
    client.start().await.unwrap();
    client.create_topic("churn", 2, 1).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let subscription = client.subscribe("churn").await.unwrap();
                tokio::task::yield_now().await;
                client.unsubscribe("churn", &subscription).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(client.subscribed_topics().await.is_empty());
    assert_eq!(broker.tap_count("churn"), 0);
    let snapshot = client.metrics().snapshot();
    assert_eq!(snapshot.subscriptions_created, 40);
    assert_eq!(snapshot.subscriptions_removed, 40);
    client.stop().await;
}
