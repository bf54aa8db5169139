//! NATS JetStream backend.
//!
//! `async_nats::Client` is the caller-owned [`Connection`]; [`NatsBroker`]
//! drives the JetStream API on top of it.

use async_nats::jetstream::{self, consumer::pull, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::broker::{Broker, Connection, ConsumerSettings, Deliveries, StreamSettings};
use crate::error::BrokerError;
use crate::message::{Acker, Message};
use crate::types::{AckPolicy, DeliverPolicy, PublishAck, StorageType};

/// JetStream client built from a NATS connection.
#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl std::fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroker")
            .field("connection_state", &self.client.connection_state())
            .finish()
    }
}

impl NatsBroker {
    pub fn new(client: async_nats::Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }
}

impl Connection for async_nats::Client {
    type Broker = NatsBroker;

    fn broker(&self) -> Result<Self::Broker, BrokerError> {
        Ok(NatsBroker::new(self.clone()))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    type Stream = jetstream::stream::Stream;
    type Consumer = jetstream::consumer::Consumer<pull::Config>;

    async fn create_or_update_stream(
        &self,
        settings: &StreamSettings,
    ) -> Result<Self::Stream, BrokerError> {
        let config = jetstream::stream::Config {
            name: settings.name.clone(),
            subjects: settings.subjects.clone(),
            storage: storage_type(settings.storage),
            ..Default::default()
        };

        let mut stream = self.jetstream.get_or_create_stream(config.clone()).await?;

        let current = &stream.cached_info().config;
        if current.subjects != config.subjects || current.storage != config.storage {
            self.jetstream.update_stream(config.clone()).await?;
            stream = self.jetstream.get_stream(&config.name).await?;
        }

        Ok(stream)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PublishAck, BrokerError> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await?
            .await?;

        Ok(PublishAck::new(ack.stream, ack.sequence, ack.duplicate))
    }

    async fn create_or_update_consumer(
        &self,
        stream: &Self::Stream,
        settings: &ConsumerSettings,
    ) -> Result<Self::Consumer, BrokerError> {
        let mut config = pull::Config {
            durable_name: Some(settings.durable_name.clone()),
            ack_policy: ack_policy(settings.ack_policy),
            deliver_policy: deliver_policy(settings.deliver_policy),
            ..Default::default()
        };

        if let Some(max) = settings.max_deliver {
            config.max_deliver = i64::from(max);
        }

        if let Some(filter) = &settings.filter_subject {
            config.filter_subject = filter.clone();
        }

        Ok(stream.create_consumer(config).await?)
    }

    async fn consume(&self, consumer: Self::Consumer) -> Result<Deliveries, BrokerError> {
        let messages = consumer.messages().await?;

        Ok(messages
            .map(|delivery| -> Result<Message, BrokerError> {
                let message = delivery?;
                let delivered = message
                    .info()
                    .map(|info| info.delivered.max(1) as u64)
                    .unwrap_or(1);
                let subject = message.subject.to_string();
                let payload = message.payload.clone();
                Ok(Message::new(subject, payload, delivered, NatsAcker(message)))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Drains subscriptions and pending publishes, then closes the socket
        // for every clone of the client.
        self.client.drain().await?;
        Ok(())
    }
}

struct NatsAcker(jetstream::Message);

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack().await
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        self.0.ack_with(AckKind::Nak(None)).await
    }

    async fn term(&self) -> Result<(), BrokerError> {
        self.0.ack_with(AckKind::Term).await
    }
}

fn storage_type(storage: StorageType) -> jetstream::stream::StorageType {
    match storage {
        StorageType::Memory => jetstream::stream::StorageType::Memory,
        StorageType::File => jetstream::stream::StorageType::File,
    }
}

fn ack_policy(policy: AckPolicy) -> jetstream::consumer::AckPolicy {
    match policy {
        AckPolicy::Explicit => jetstream::consumer::AckPolicy::Explicit,
        AckPolicy::All => jetstream::consumer::AckPolicy::All,
        AckPolicy::None => jetstream::consumer::AckPolicy::None,
    }
}

fn deliver_policy(policy: DeliverPolicy) -> jetstream::consumer::DeliverPolicy {
    match policy {
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        DeliverPolicy::Last => jetstream::consumer::DeliverPolicy::Last,
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::LastPerSubject => jetstream::consumer::DeliverPolicy::LastPerSubject,
    }
}
