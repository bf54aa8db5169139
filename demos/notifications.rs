//! Notification service backed by a JetStream queue.
//!
//! Connects to `NATS_URL` (default `nats://localhost:4222`), creates the
//! `notification-stream` stream, registers a durable consumer and publishes
//! one notification. Everything shuts down after 30 seconds or on Ctrl-C.
//!
//! ```sh
//! RUST_LOG=natstream=debug cargo run --example notifications
//! ```

use std::time::Duration;

use async_trait::async_trait;
use natstream::{
    cancellation, AckPolicy, ConsumerConfig, Handler, HandlerError, Message, Queue, QueueConfig,
    StorageType,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STREAM: &str = "notification-stream";
const SUBJECTS: [&str; 3] = ["subject.one", "subject.two", "subject.three"];
const DURABLE: &str = "notifications.consumer";

#[derive(Debug, Serialize, Deserialize)]
struct Notification {
    recipient: String,
    body: String,
}

/// Delivers notifications received from the queue.
struct Notifications;

impl Notifications {
    fn notify(&self, subject: &str, notification: &Notification) {
        info!(subject, recipient = %notification.recipient, body = %notification.body, "notify");
    }
}

#[async_trait]
impl Handler for Notifications {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let notification: Notification = message.json()?;
        self.notify(message.subject(), &notification);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
    let client = async_nats::connect(url.as_str()).await?;
    info!(%url, "connected");

    let (canceller, token) = cancellation();
    canceller.cancel_after(Duration::from_secs(30));

    let queue = Queue::new(
        &client,
        QueueConfig::new(STREAM)
            .subjects(SUBJECTS)
            .storage(StorageType::Memory),
        &token,
    )
    .await?;

    let consumer = queue
        .register_consumer(
            &token,
            ConsumerConfig::new(DURABLE).ack_policy(AckPolicy::All),
            Notifications,
        )
        .await?;

    let notification = Notification {
        recipient: "ops@example.com".to_string(),
        body: "deployment finished".to_string(),
    };
    let ack = queue.publish_json(&token, SUBJECTS[0], &notification).await?;
    info!(stream = %ack.stream, sequence = ack.sequence, "notification published");

    tokio::select! {
        _ = token.cancelled() => info!("deadline reached"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            canceller.cancel();
        }
    }
    consumer.stopped().await;

    if let Err(err) = queue.close().await {
        warn!(error = %err, "close failed");
    }
    Ok(())
}
