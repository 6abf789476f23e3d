//! Simple publish/subscribe example against the in-process broker

use muxmq::transport::inprocess::InProcessBroker;
use muxmq::*;
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 muxmq - Simple Pub/Sub Example");
    println!("=================================");

    // Create a client over the in-process broker
    let config = ClientConfig::builder().num_partitions(3).build();
    let client = MuxmqClient::new(config, Arc::new(InProcessBroker::new()));
    client.start().await?;
    println!("✅ Client started");

    client.create_topic("device.events", 3, 1).await?;
    println!("✅ Created topic 'device.events' with 3 partitions");

    // Two independent subscriptions share one broker-level consumer set
    let mut alerts = client.subscribe("device.events").await?;
    let mut audit = client.subscribe("device.events").await?;
    println!("✅ Opened 2 subscriptions");

    // Example 1: keyed send pins related envelopes to one partition
    let envelope = Envelope::new("device.event", json!({"serial": "OLT-1", "port": 3}));
    client
        .send(&envelope, "device.events", Some("OLT-1"))
        .await?;
    println!("✅ Sent keyed envelope {}", envelope.id);

    // Example 2: unkeyed send round-robins across partitions
    let envelope = Envelope::new("device.event", json!({"serial": "OLT-2", "port": 1}));
    client.send(&envelope, "device.events", None).await?;
    println!("✅ Sent unkeyed envelope {}", envelope.id);

    // Both subscriptions receive both envelopes
    for _ in 0..2 {
        let received = alerts.recv().await.expect("alerts channel closed");
        println!(
            "📥 alerts received {} ({})",
            received.id, received.message_type
        );
        let received = audit.recv().await.expect("audit channel closed");
        println!(
            "📥 audit received {} ({})",
            received.id, received.message_type
        );
    }

    let snapshot = client.metrics().snapshot();
    println!(
        "📊 sent={} delivered={} dropped={}",
        snapshot.envelopes_sent, snapshot.envelopes_delivered, snapshot.envelopes_dropped
    );

    client.stop().await;
    println!("✅ Client stopped");

    println!("\n🎉 Pub/sub example completed successfully!");
    println!("💡 Try the consumer-group example next:");
    println!("   cargo run --example group_worker");

    Ok(())
}
