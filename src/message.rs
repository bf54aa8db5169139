//! Delivered messages and their acknowledgment controls.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::BrokerError;

/// Broker-side acknowledgment controls for one delivered message.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    /// Confirm the message was processed.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Report the message was not processed; the broker may redeliver it.
    async fn nak(&self) -> Result<(), BrokerError>;

    /// Stop redelivering the message.
    async fn term(&self) -> Result<(), BrokerError>;
}

/// A message delivered to a consumer.
///
/// Clones share acknowledgment state: settling one clone settles them all.
#[derive(Clone)]
pub struct Message {
    subject: String,
    payload: Bytes,
    delivered: u64,
    acker: Arc<dyn Acker>,
    settled: Arc<AtomicBool>,
}

impl Message {
    /// Build a message for a broker backend.
    pub fn new(
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        delivered: u64,
        acker: impl Acker,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            delivered,
            acker: Arc::new(acker),
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// How many times the broker has delivered this message, starting at 1.
    pub fn delivery_count(&self) -> u64 {
        self.delivered
    }

    /// Whether the message was acked, naked or terminated.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Decode the payload as JSON.
    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.settled.store(true, Ordering::Release);
        self.acker.ack().await
    }

    pub async fn nak(&self) -> Result<(), BrokerError> {
        self.settled.store(true, Ordering::Release);
        self.acker.nak().await
    }

    pub async fn term(&self) -> Result<(), BrokerError> {
        self.settled.store(true, Ordering::Release);
        self.acker.term().await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivered", &self.delivered)
            .field("settled", &self.is_settled())
            .finish()
    }
}
