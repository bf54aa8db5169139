//! Queue handle and operations.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::{Broker, Connection, StreamSettings};
use crate::cancel::CancelToken;
use crate::consumer::{spawn_consumer, ConsumerConfig, ConsumerHandle, Handler};
use crate::error::QueueError;
use crate::types::{PublishAck, StorageType};

/// Configuration for the stream backing a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct QueueConfig {
    pub stream_name: String,
    pub subjects: Vec<String>,
    /// Defaults to [`StorageType::Memory`].
    pub storage: Option<StorageType>,
}

impl QueueConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Self::default()
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.push(subject.into());
        self
    }

    pub fn subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects.extend(subjects.into_iter().map(Into::into));
        self
    }

    pub fn storage(mut self, storage: StorageType) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validate and fill defaults.
    pub(crate) fn resolve(self) -> Result<StreamSettings, QueueError> {
        if self.stream_name.trim().is_empty() {
            return Err(QueueError::invalid("stream name cannot be empty"));
        }
        if self.subjects.is_empty() {
            return Err(QueueError::invalid("at least one subject is required"));
        }
        if self.subjects.iter().any(|s| s.trim().is_empty()) {
            return Err(QueueError::invalid("subjects cannot be empty"));
        }

        Ok(StreamSettings {
            name: self.stream_name,
            subjects: self.subjects,
            storage: self.storage.unwrap_or_default(),
        })
    }
}

/// A stream bound to its subjects, ready for publishing and consumers.
///
/// Cloning is cheap; clones share the broker client and the closed state.
pub struct Queue<B: Broker> {
    inner: Arc<QueueInner<B>>,
}

struct QueueInner<B: Broker> {
    broker: B,
    stream: B::Stream,
    settings: StreamSettings,
    closed: AtomicBool,
}

impl<B: Broker> Clone for Queue<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Broker> std::fmt::Debug for Queue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("stream", &self.inner.settings.name)
            .field("subjects", &self.inner.settings.subjects)
            .field("storage", &self.inner.settings.storage)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<B: Broker> Queue<B> {
    /// Create or update the stream described by `config` and return a queue
    /// bound to it.
    ///
    /// Configuration is validated before any broker call. A single attempt
    /// is made; retrying is up to the caller.
    pub async fn new<C>(
        connection: &C,
        config: QueueConfig,
        cancel: &CancelToken,
    ) -> Result<Self, QueueError>
    where
        C: Connection<Broker = B>,
    {
        let settings = config.resolve()?;
        let broker = connection.broker().map_err(QueueError::Connection)?;

        let stream = cancel
            .guard(broker.create_or_update_stream(&settings))
            .await?
            .map_err(|source| QueueError::StreamCreation {
                stream: settings.name.clone(),
                source,
            })?;

        info!(
            stream = %settings.name,
            subjects = ?settings.subjects,
            storage = %settings.storage,
            "stream ready"
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                broker,
                stream,
                settings,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn subjects(&self) -> &[String] {
        &self.inner.settings.subjects
    }

    pub fn storage(&self) -> StorageType {
        self.inner.settings.storage
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The broker client, for operations this crate does not wrap.
    pub fn broker(&self) -> &B {
        &self.inner.broker
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Publish a message and wait for the broker acknowledgment.
    pub async fn publish(
        &self,
        cancel: &CancelToken,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PublishAck, QueueError> {
        self.ensure_open()?;
        if subject.trim().is_empty() {
            return Err(QueueError::invalid("subject cannot be empty"));
        }

        let ack = cancel
            .guard(self.inner.broker.publish(subject, payload.into()))
            .await?
            .map_err(|source| QueueError::Publish {
                subject: subject.to_string(),
                source,
            })?;

        debug!(stream = %ack.stream, subject, sequence = ack.sequence, "published message");
        Ok(ack)
    }

    /// Serialize `value` as JSON and publish it.
    #[cfg(feature = "json")]
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        cancel: &CancelToken,
        subject: &str,
        value: &T,
    ) -> Result<PublishAck, QueueError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(cancel, subject, payload).await
    }

    /// Create or update a durable consumer and start delivering its messages
    /// to `handler`.
    ///
    /// Returns once delivery has started. The consumer runs until `cancel`
    /// fires or the returned handle is stopped; `cancel` also bounds the
    /// broker calls made here.
    pub async fn register_consumer<H>(
        &self,
        cancel: &CancelToken,
        config: ConsumerConfig,
        handler: H,
    ) -> Result<ConsumerHandle, QueueError>
    where
        H: Handler,
    {
        self.ensure_open()?;
        let settings = config.resolve()?;
        let broker = &self.inner.broker;

        let consumer = cancel
            .guard(broker.create_or_update_consumer(&self.inner.stream, &settings))
            .await?
            .map_err(|source| QueueError::ConsumerCreation {
                durable: settings.durable_name.clone(),
                source,
            })?;

        info!(
            stream = %self.inner.settings.name,
            durable = %settings.durable_name,
            ack_policy = %settings.ack_policy,
            "consumer created"
        );

        let deliveries = cancel
            .guard(broker.consume(consumer))
            .await?
            .map_err(|source| QueueError::ConsumeStart {
                durable: settings.durable_name.clone(),
                source,
            })?;

        let handle = spawn_consumer(&settings, deliveries, Arc::new(handler), cancel.clone());
        info!(
            stream = %self.inner.settings.name,
            durable = %settings.durable_name,
            "consumer started"
        );
        Ok(handle)
    }

    /// Release the broker connection.
    ///
    /// Consumers are not stopped here; cancel their tokens first. Closing an
    /// already closed queue does nothing.
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(stream = %self.inner.settings.name, "closing broker connection");
        self.inner.broker.close().await.map_err(QueueError::Close)
    }
}
