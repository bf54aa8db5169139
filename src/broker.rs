//! The broker client operations this crate is built on.
//!
//! A [`Connection`] is the caller-owned transport; [`Connection::broker`]
//! builds the [`Broker`] client that every queue operation goes through.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::BrokerError;
use crate::message::Message;
use crate::types::{AckPolicy, DeliverPolicy, PublishAck, StorageType};

/// Messages delivered to a consumer, in broker dispatch order.
///
/// Dropping the stream stops delivery.
pub type Deliveries = BoxStream<'static, Result<Message, BrokerError>>;

/// Resolved stream configuration handed to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageType,
}

/// Resolved durable consumer configuration handed to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub durable_name: String,
    pub ack_policy: AckPolicy,
    pub deliver_policy: DeliverPolicy,
    /// `None` means unbounded redelivery.
    pub max_deliver: Option<u32>,
    /// `None` means every subject of the stream.
    pub filter_subject: Option<String>,
}

/// A caller-owned connection from which a broker client can be built.
pub trait Connection {
    type Broker: Broker;

    fn broker(&self) -> Result<Self::Broker, BrokerError>;
}

/// Broker client operations.
///
/// Every method is a single attempt; implementations must not retry.
#[async_trait]
pub trait Broker: Clone + Send + Sync + 'static {
    /// Broker handle to a created stream.
    type Stream: Send + Sync + 'static;
    /// Broker handle to a created durable consumer.
    type Consumer: Send + 'static;

    /// Create the stream, or update it if one with the same name exists.
    async fn create_or_update_stream(
        &self,
        settings: &StreamSettings,
    ) -> Result<Self::Stream, BrokerError>;

    /// Publish and wait for the broker acknowledgment.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PublishAck, BrokerError>;

    /// Create the durable consumer, or update the one with the same name.
    async fn create_or_update_consumer(
        &self,
        stream: &Self::Stream,
        settings: &ConsumerSettings,
    ) -> Result<Self::Consumer, BrokerError>;

    /// Start delivering the consumer's messages.
    async fn consume(&self, consumer: Self::Consumer) -> Result<Deliveries, BrokerError>;

    /// Release the connection.
    async fn close(&self) -> Result<(), BrokerError>;
}
