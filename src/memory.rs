//! In-process broker.
//!
//! [`MemoryBroker`] implements both [`Connection`] and [`Broker`] without a
//! server. It keeps streams, durable consumers and their cursors in memory.
//! Delivery is pull-driven: a message leaves the stream only when a reader
//! asks for the next one, and a message handed out but not yet settled goes
//! back to the consumer if its reader is dropped. Naked messages are
//! redelivered up to the consumer's max-deliver, and every call and
//! settlement is recorded so tests can assert on what reached the broker.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use crate::broker::{Broker, Connection, ConsumerSettings, Deliveries, StreamSettings};
use crate::error::BrokerError;
use crate::message::{Acker, Message};
use crate::types::{subject_matches, subjects_overlap, AckPolicy, DeliverPolicy, PublishAck};

/// Broker operations, for call counting and failure injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    CreateStream,
    Publish,
    CreateConsumer,
    Consume,
    Close,
}

/// Number of calls per operation that reached the broker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub create_stream: usize,
    pub publish: usize,
    pub create_consumer: usize,
    pub consume: usize,
    pub close: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.connect
            + self.create_stream
            + self.publish
            + self.create_consumer
            + self.consume
            + self.close
    }

    fn bump(&mut self, op: Operation) {
        match op {
            Operation::Connect => self.connect += 1,
            Operation::CreateStream => self.create_stream += 1,
            Operation::Publish => self.publish += 1,
            Operation::CreateConsumer => self.create_consumer += 1,
            Operation::Consume => self.consume += 1,
            Operation::Close => self.close += 1,
        }
    }
}

/// How a delivered message was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettleKind {
    Ack,
    Nak,
    Term,
}

/// A settlement recorded by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub stream: String,
    pub durable: String,
    pub sequence: u64,
    pub subject: String,
    pub delivered: u64,
    pub kind: SettleKind,
}

/// A message stored in a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub sequence: u64,
    pub subject: String,
    pub payload: Bytes,
}

/// Broker handle to a durable consumer of a [`MemoryBroker`].
#[derive(Clone, Debug)]
pub struct MemoryConsumer {
    stream: String,
    durable: String,
}

#[derive(Default)]
struct State {
    closed: bool,
    calls: CallCounts,
    failures: HashMap<Operation, String>,
    streams: HashMap<String, StreamState>,
    settlements: Vec<Settlement>,
    next_reader: u64,
}

struct StreamState {
    settings: StreamSettings,
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
}

/// A message handed to a reader and not settled yet.
struct InFlight {
    sequence: u64,
    delivered: u64,
    reader: u64,
}

struct ConsumerState {
    settings: ConsumerSettings,
    /// Next stream sequence to dispatch.
    cursor: u64,
    /// Backlog sequences a last-per-subject consumer may see.
    backlog: Option<HashSet<u64>>,
    /// Messages waiting for redelivery, with their next delivery count.
    redeliver: VecDeque<(u64, u64)>,
    in_flight: Vec<InFlight>,
    /// Readers parked until a message becomes available.
    wakers: HashMap<u64, Waker>,
}

/// In-process broker with recording.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("closed", &state.closed)
            .field("streams", &state.streams.len())
            .field("calls", &state.calls)
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls that reached the broker so far.
    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Make the next call of `op` fail with `message`.
    pub fn fail_next(&self, op: Operation, message: impl Into<String>) {
        self.state.lock().failures.insert(op, message.into());
    }

    /// All streams, sorted by name.
    pub fn streams(&self) -> Vec<StreamSettings> {
        let state = self.state.lock();
        let mut streams: Vec<_> = state.streams.values().map(|s| s.settings.clone()).collect();
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        streams
    }

    pub fn stream(&self, name: &str) -> Option<StreamSettings> {
        self.state.lock().streams.get(name).map(|s| s.settings.clone())
    }

    /// Durable consumers of a stream, sorted by durable name.
    pub fn consumers(&self, stream: &str) -> Vec<ConsumerSettings> {
        let state = self.state.lock();
        let mut consumers: Vec<_> = state
            .streams
            .get(stream)
            .map(|s| s.consumers.values().map(|c| c.settings.clone()).collect())
            .unwrap_or_default();
        consumers.sort_by(|a, b| a.durable_name.cmp(&b.durable_name));
        consumers
    }

    pub fn consumer(&self, stream: &str, durable: &str) -> Option<ConsumerSettings> {
        self.state
            .lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map(|c| c.settings.clone())
    }

    /// Messages stored in a stream, in sequence order.
    pub fn messages(&self, stream: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .streams
            .get(stream)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Every ack, nak and term received, in order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.state.lock().settlements.clone()
    }

    /// Messages the consumer has yet to hand out, redeliveries included.
    pub fn pending(&self, stream: &str, durable: &str) -> usize {
        let state = self.state.lock();
        let Some(stream_state) = state.streams.get(stream) else {
            return 0;
        };
        let Some(consumer) = stream_state.consumers.get(durable) else {
            return 0;
        };
        let undispatched = stream_state
            .messages
            .iter()
            .filter(|m| m.sequence >= consumer.cursor && consumer.wants(m))
            .count();
        undispatched + consumer.redeliver.len()
    }

    /// Messages handed out to the consumer's readers and not settled yet.
    pub fn in_flight(&self, stream: &str, durable: &str) -> usize {
        self.state
            .lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map_or(0, |c| c.in_flight.len())
    }

    /// Count the call, then fail if closed or a failure was injected.
    fn enter(state: &mut State, op: Operation) -> Result<(), BrokerError> {
        state.calls.bump(op);
        if state.closed {
            return Err("connection closed".into());
        }
        if let Some(message) = state.failures.remove(&op) {
            return Err(message.into());
        }
        Ok(())
    }
}

impl Connection for MemoryBroker {
    type Broker = MemoryBroker;

    fn broker(&self) -> Result<Self::Broker, BrokerError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, Operation::Connect)?;
        Ok(self.clone())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Stream = String;
    type Consumer = MemoryConsumer;

    async fn create_or_update_stream(
        &self,
        settings: &StreamSettings,
    ) -> Result<Self::Stream, BrokerError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, Operation::CreateStream)?;

        let overlapping = state.streams.values().any(|other| {
            other.settings.name != settings.name
                && other.settings.subjects.iter().any(|theirs| {
                    settings.subjects.iter().any(|ours| subjects_overlap(ours, theirs))
                })
        });
        if overlapping {
            return Err("subjects overlap with an existing stream".into());
        }

        match state.streams.get_mut(&settings.name) {
            Some(existing) => {
                if existing.settings.storage != settings.storage {
                    return Err("stream configuration update can not change storage type".into());
                }
                existing.settings = settings.clone();
            }
            None => {
                state.streams.insert(
                    settings.name.clone(),
                    StreamState {
                        settings: settings.clone(),
                        messages: Vec::new(),
                        consumers: HashMap::new(),
                    },
                );
            }
        }

        Ok(settings.name.clone())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PublishAck, BrokerError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, Operation::Publish)?;

        let stream = state
            .streams
            .values_mut()
            .find(|s| s.settings.subjects.iter().any(|p| subject_matches(p, subject)))
            .ok_or("no responders available for request")?;

        let sequence = stream.messages.len() as u64 + 1;
        stream.messages.push(StoredMessage {
            sequence,
            subject: subject.to_string(),
            payload,
        });
        stream.consumers.values_mut().for_each(ConsumerState::wake);

        Ok(PublishAck::new(stream.settings.name.clone(), sequence, false))
    }

    async fn create_or_update_consumer(
        &self,
        stream: &Self::Stream,
        settings: &ConsumerSettings,
    ) -> Result<Self::Consumer, BrokerError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, Operation::CreateConsumer)?;

        let stream_state = state.streams.get_mut(stream).ok_or("stream not found")?;

        if let Some(filter) = &settings.filter_subject {
            let within = stream_state
                .settings
                .subjects
                .iter()
                .any(|s| subjects_overlap(s, filter));
            if !within {
                return Err(
                    "consumer filter subject is not a valid subset of the interest subjects".into(),
                );
            }
        }

        match stream_state.consumers.get_mut(&settings.durable_name) {
            Some(existing) => {
                existing.settings = settings.clone();
                existing.wake();
            }
            None => {
                let consumer = ConsumerState::new(settings.clone(), &stream_state.messages);
                stream_state
                    .consumers
                    .insert(settings.durable_name.clone(), consumer);
            }
        }

        Ok(MemoryConsumer {
            stream: stream.clone(),
            durable: settings.durable_name.clone(),
        })
    }

    async fn consume(&self, consumer: Self::Consumer) -> Result<Deliveries, BrokerError> {
        let mut state = self.state.lock();
        Self::enter(&mut state, Operation::Consume)?;

        let exists = state
            .streams
            .get(&consumer.stream)
            .is_some_and(|s| s.consumers.contains_key(&consumer.durable));
        if !exists {
            return Err("consumer not found".into());
        }

        state.next_reader += 1;
        Ok(Reader {
            state: Arc::downgrade(&self.state),
            stream: consumer.stream,
            durable: consumer.durable,
            id: state.next_reader,
        }
        .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.calls.bump(Operation::Close);
        state.closed = true;
        // Ends every reader, as a dropped connection would.
        for stream in state.streams.values_mut() {
            stream.consumers.values_mut().for_each(ConsumerState::wake);
        }
        Ok(())
    }
}

impl ConsumerState {
    fn new(settings: ConsumerSettings, messages: &[StoredMessage]) -> Self {
        let last = messages.len() as u64;
        let (cursor, backlog) = match settings.deliver_policy {
            DeliverPolicy::All => (1, None),
            DeliverPolicy::New => (last + 1, None),
            DeliverPolicy::Last => (last.max(1), None),
            DeliverPolicy::LastPerSubject => {
                let mut last_per_subject: HashMap<&str, u64> = HashMap::new();
                for message in messages {
                    last_per_subject.insert(&message.subject, message.sequence);
                }
                (1, Some(last_per_subject.into_values().collect::<HashSet<u64>>()))
            }
        };

        Self {
            settings,
            cursor,
            backlog,
            redeliver: VecDeque::new(),
            in_flight: Vec::new(),
            wakers: HashMap::new(),
        }
    }

    fn wants(&self, message: &StoredMessage) -> bool {
        if let Some(filter) = &self.settings.filter_subject {
            if !subject_matches(filter, &message.subject) {
                return false;
            }
        }
        match &self.backlog {
            Some(backlog) => {
                let backlog_end = backlog.iter().copied().max().unwrap_or(0);
                message.sequence > backlog_end || backlog.contains(&message.sequence)
            }
            None => true,
        }
    }

    fn exhausted(&self, delivered: u64) -> bool {
        self.settings
            .max_deliver
            .is_some_and(|max| delivered >= u64::from(max))
    }

    /// Take the next message to hand out: redeliveries first, then the
    /// stream from the cursor. Returns the message index and delivery count.
    fn next_delivery(&mut self, messages: &[StoredMessage]) -> Option<(usize, u64)> {
        if let Some((sequence, delivered)) = self.redeliver.pop_front() {
            return Some(((sequence - 1) as usize, delivered));
        }
        while let Some(stored) = messages.get((self.cursor - 1) as usize) {
            self.cursor += 1;
            if self.wants(stored) {
                return Some(((stored.sequence - 1) as usize, 1));
            }
        }
        None
    }

    /// Put a departed reader's unsettled messages back in front of the queue.
    fn release(&mut self, reader: u64) {
        let (mut returned, kept): (Vec<InFlight>, Vec<InFlight>) =
            std::mem::take(&mut self.in_flight)
                .into_iter()
                .partition(|f| f.reader == reader);
        self.in_flight = kept;
        returned.sort_by_key(|f| f.sequence);

        for f in returned.into_iter().rev() {
            if !self.exhausted(f.delivered) {
                self.redeliver.push_front((f.sequence, f.delivered + 1));
            }
        }
        self.wake();
    }

    fn wake(&mut self) {
        for (_, waker) in self.wakers.drain() {
            waker.wake();
        }
    }
}

/// Pull-driven delivery stream of one durable consumer.
///
/// Dropping it returns its unsettled messages to the consumer.
struct Reader {
    state: Weak<Mutex<State>>,
    stream: String,
    durable: String,
    id: u64,
}

impl futures::Stream for Reader {
    type Item = Result<Message, BrokerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(state_arc) = this.state.upgrade() else {
            return Poll::Ready(None);
        };
        let mut state = state_arc.lock();
        if state.closed {
            return Poll::Ready(None);
        }
        let Some(stream_state) = state.streams.get_mut(&this.stream) else {
            return Poll::Ready(None);
        };
        let StreamState {
            messages,
            consumers,
            ..
        } = stream_state;
        let Some(consumer) = consumers.get_mut(&this.durable) else {
            return Poll::Ready(None);
        };

        let Some((index, delivered)) = consumer.next_delivery(messages) else {
            consumer.wakers.insert(this.id, cx.waker().clone());
            return Poll::Pending;
        };

        let stored = &messages[index];
        consumer.wakers.remove(&this.id);
        if consumer.settings.ack_policy.requires_ack() {
            consumer.in_flight.push(InFlight {
                sequence: stored.sequence,
                delivered,
                reader: this.id,
            });
        }

        let message = Message::new(
            stored.subject.clone(),
            stored.payload.clone(),
            delivered,
            MemoryAcker {
                state: this.state.clone(),
                stream: this.stream.clone(),
                durable: this.durable.clone(),
                sequence: stored.sequence,
                subject: stored.subject.clone(),
                delivered,
            },
        );
        Poll::Ready(Some(Ok(message)))
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let Some(state_arc) = self.state.upgrade() else {
            return;
        };
        let mut state = state_arc.lock();
        if let Some(consumer) = state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.durable))
        {
            consumer.wakers.remove(&self.id);
            consumer.release(self.id);
        }
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    stream: String,
    durable: String,
    sequence: u64,
    subject: String,
    delivered: u64,
}

impl MemoryAcker {
    fn settle(&self, kind: SettleKind) -> Result<(), BrokerError> {
        let state_arc = self.state.upgrade().ok_or("connection closed")?;
        let mut state = state_arc.lock();
        if state.closed {
            return Err("connection closed".into());
        }

        state.settlements.push(Settlement {
            stream: self.stream.clone(),
            durable: self.durable.clone(),
            sequence: self.sequence,
            subject: self.subject.clone(),
            delivered: self.delivered,
            kind,
        });

        let Some(consumer) = state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.durable))
        else {
            return Ok(());
        };

        let sequence = self.sequence;
        match kind {
            // Ack-all settles everything up to this sequence.
            SettleKind::Ack if consumer.settings.ack_policy == AckPolicy::All => {
                consumer.in_flight.retain(|f| f.sequence > sequence);
            }
            _ => consumer.in_flight.retain(|f| f.sequence != sequence),
        }

        if kind == SettleKind::Nak && !consumer.exhausted(self.delivered) {
            consumer.redeliver.push_back((sequence, self.delivered + 1));
            consumer.wake();
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(SettleKind::Ack)
    }

    async fn nak(&self) -> Result<(), BrokerError> {
        self.settle(SettleKind::Nak)
    }

    async fn term(&self) -> Result<(), BrokerError> {
        self.settle(SettleKind::Term)
    }
}
