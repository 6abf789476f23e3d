//! Consumer-group example: workers resume from committed offsets

use muxmq::transport::inprocess::InProcessBroker;
use muxmq::*;
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 muxmq - Consumer Group Example");
    println!("=================================");

    let broker = InProcessBroker::new();
    let config = ClientConfig::builder()
        .consumer_strategy(ConsumerStrategy::Group)
        .group_id("task-workers")
        .build();

    // First worker: consume a task, mark its offset, shut down
    let worker = MuxmqClient::new(config.clone(), Arc::new(broker.clone()));
    worker.start().await?;
    worker.create_topic("tasks", 1, 1).await?;
    let mut subscription = worker.subscribe("tasks").await?;
    println!("✅ Worker 1 joined group 'task-workers'");

    let task = Envelope::new("task.created", json!({"job": 1}));
    worker.send(&task, "tasks", None).await?;
    let received = subscription.recv().await.expect("task channel closed");
    println!("📥 Worker 1 processed {} ({})", received.id, received.message_type);

    // The offset was marked once dispatch was initiated; give the loop a tick
    while worker.metrics().snapshot().offsets_marked == 0 {
        tokio::task::yield_now().await;
    }
    worker.stop().await;
    println!("✅ Worker 1 stopped; offset committed for the group");

    // Published while no worker is running
    let pending = MuxmqClient::new(config.clone(), Arc::new(broker.clone()));
    pending.start().await?;
    let task = Envelope::new("task.created", json!({"job": 2}));
    pending.send(&task, "tasks", None).await?;
    pending.stop().await;
    println!("✉️  Published job 2 while the group was offline");

    // Second worker: resumes after the committed offset, sees only job 2
    let worker = MuxmqClient::new(config, Arc::new(broker.clone()));
    worker.start().await?;
    let mut subscription = worker.subscribe("tasks").await?;
    println!("✅ Worker 2 joined group 'task-workers'");

    let received = subscription.recv().await.expect("task channel closed");
    println!(
        "📥 Worker 2 resumed with {} (payload {})",
        received.id, received.payload
    );

    worker.stop().await;
    println!("\n🎉 Consumer group example completed successfully!");

    Ok(())
}
