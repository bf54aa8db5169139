//! Durable consumers: configuration, handlers and the delivery loop.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{ConsumerSettings, Deliveries};
use crate::cancel::CancelToken;
use crate::error::{HandlerError, QueueError};
use crate::guard::{run_guarded, GuardOutcome};
use crate::message::Message;
use crate::types::{AckPolicy, DeliverPolicy};

/// Configuration for a durable consumer.
///
/// The durable name identifies the consumer's state in the broker across
/// restarts; registering the same name again updates its policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ConsumerConfig {
    pub durable_name: String,
    /// Defaults to [`AckPolicy::Explicit`].
    pub ack_policy: Option<AckPolicy>,
    /// `None` or `0` means unbounded redelivery.
    pub max_deliver: Option<u32>,
    /// `None` or empty means every subject of the stream.
    pub filter_subject: Option<String>,
    /// Defaults to [`DeliverPolicy::All`].
    pub deliver_policy: Option<DeliverPolicy>,
}

impl ConsumerConfig {
    pub fn new(durable_name: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            ..Self::default()
        }
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = Some(policy);
        self
    }

    pub fn max_deliver(mut self, max: u32) -> Self {
        self.max_deliver = Some(max);
        self
    }

    pub fn filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    pub fn deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = Some(policy);
        self
    }

    /// Validate and fill defaults.
    pub(crate) fn resolve(self) -> Result<ConsumerSettings, QueueError> {
        if self.durable_name.trim().is_empty() {
            return Err(QueueError::invalid("durable name cannot be empty"));
        }

        Ok(ConsumerSettings {
            durable_name: self.durable_name,
            ack_policy: self.ack_policy.unwrap_or_default(),
            deliver_policy: self.deliver_policy.unwrap_or_default(),
            max_deliver: self.max_deliver.filter(|max| *max > 0),
            filter_subject: self.filter_subject.filter(|subject| !subject.is_empty()),
        })
    }
}

/// Processes messages delivered to a consumer.
///
/// Returning `Ok` acknowledges the message and returning `Err` (or panicking)
/// negatively acknowledges it, unless the handler settled the message itself
/// or the consumer uses [`AckPolicy::None`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Handle to a running consumer.
///
/// Dropping the handle leaves the consumer running; it stops when its
/// cancellation token fires or [`stop`](Self::stop) is called.
#[derive(Debug)]
pub struct ConsumerHandle {
    durable_name: String,
    stop: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn durable_name(&self) -> &str {
        &self.durable_name
    }

    /// Ask the delivery loop to stop after the message in progress.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Whether the delivery loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the delivery loop has exited.
    pub async fn stopped(self) {
        if let Err(err) = self.task.await {
            error!(durable = %self.durable_name, error = %err, "delivery loop task failed");
        }
    }
}

/// Spawn the delivery loop and the watcher that stops it on cancellation.
pub(crate) fn spawn_consumer(
    settings: &ConsumerSettings,
    deliveries: Deliveries,
    handler: Arc<dyn Handler>,
    cancel: CancelToken,
) -> ConsumerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let durable = settings.durable_name.clone();
    let ack_policy = settings.ack_policy;

    let watcher_stop = stop_tx.clone();
    let watcher_durable = durable.clone();
    let mut loop_stopped = stop_rx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(durable = %watcher_durable, "stopping consumer");
                watcher_stop.send_replace(true);
            }
            _ = stop_requested(&mut loop_stopped) => {}
        }
    });

    let loop_stop = stop_tx.clone();
    let loop_durable = durable.clone();
    let task = tokio::spawn(async move {
        delivery_loop(&loop_durable, ack_policy, deliveries, handler, stop_rx).await;
        // Releases the watcher when the loop ends on its own.
        loop_stop.send_replace(true);
    });

    ConsumerHandle {
        durable_name: durable,
        stop: stop_tx,
        task,
    }
}

async fn delivery_loop(
    durable: &str,
    ack_policy: AckPolicy,
    mut deliveries: Deliveries,
    handler: Arc<dyn Handler>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(message)) => dispatch(durable, ack_policy, handler.as_ref(), message).await,
            Some(Err(err)) => warn!(durable, error = %err, "delivery error"),
            None => {
                debug!(durable, "delivery stream ended");
                break;
            }
        }
    }

    drop(deliveries);
    info!(durable, "consumer stopped");
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn dispatch(
    durable: &str,
    ack_policy: AckPolicy,
    handler: &dyn Handler,
    message: Message,
) {
    debug!(
        durable,
        subject = message.subject(),
        delivered = message.delivery_count(),
        "received message"
    );

    let settle_ok = match run_guarded(handler.handle(message.clone())).await {
        GuardOutcome::Completed(Ok(())) => true,
        GuardOutcome::Completed(Err(err)) => {
            warn!(
                durable,
                subject = message.subject(),
                error = %err,
                "message handler failed"
            );
            false
        }
        GuardOutcome::Panicked(panic_msg) => {
            error!(
                durable,
                subject = message.subject(),
                panic = %panic_msg,
                "panic in message handler"
            );
            false
        }
    };

    if !ack_policy.requires_ack() || message.is_settled() {
        return;
    }

    let result = if settle_ok {
        message.ack().await
    } else {
        message.nak().await
    };
    if let Err(err) = result {
        warn!(durable, subject = message.subject(), error = %err, "failed to settle message");
    }
}
