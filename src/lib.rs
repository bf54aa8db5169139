//! natstream
//!
//! A thin convenience layer over a JetStream broker client: create or update
//! a stream, publish to it, and register durable consumers whose delivery
//! loop runs until a cancellation token fires.
//!
//! Persistence, ordering, redelivery and acknowledgment semantics all belong
//! to the broker. This crate validates configuration, fills defaults, wraps
//! broker errors with the operation that failed, logs through `tracing`, and
//! isolates handler failures so one bad message cannot stop a consumer.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use natstream::{
//!     cancellation, AckPolicy, ConsumerConfig, HandlerError, Message, Queue, QueueConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = async_nats::connect("nats://localhost:4222").await?;
//!     let (canceller, token) = cancellation();
//!
//!     let queue = Queue::new(
//!         &client,
//!         QueueConfig::new("orders").subjects(["orders.created", "orders.shipped"]),
//!         &token,
//!     )
//!     .await?;
//!
//!     let consumer = queue
//!         .register_consumer(
//!             &token,
//!             ConsumerConfig::new("orders.consumer")
//!                 .ack_policy(AckPolicy::Explicit)
//!                 .max_deliver(5),
//!             |msg: Message| async move {
//!                 println!("{}: {} bytes", msg.subject(), msg.payload().len());
//!                 Ok::<(), HandlerError>(())
//!             },
//!         )
//!         .await?;
//!
//!     queue.publish(&token, "orders.created", r#"{"id":1}"#).await?;
//!
//!     canceller.cancel();
//!     consumer.stopped().await;
//!     queue.close().await?;
//!     Ok(())
//! }
//! ```

mod broker;
mod cancel;
mod consumer;
mod error;
mod guard;
pub mod memory;
mod message;
#[cfg(feature = "nats")]
mod nats;
mod queue;
mod types;

pub use broker::{Broker, Connection, ConsumerSettings, Deliveries, StreamSettings};
pub use cancel::{cancellation, CancelToken, Canceller};
pub use consumer::{ConsumerConfig, ConsumerHandle, Handler};
pub use error::{BrokerError, HandlerError, QueueError};
pub use memory::MemoryBroker;
pub use message::{Acker, Message};
#[cfg(feature = "nats")]
pub use nats::NatsBroker;
pub use queue::{Queue, QueueConfig};
pub use types::{
    subject_matches, subjects_overlap, AckPolicy, DeliverPolicy, PublishAck, StorageType,
};
