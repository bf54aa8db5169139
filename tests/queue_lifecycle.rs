//! End-to-end behavior of queues and durable consumers against the
//! in-process broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use natstream::memory::{Operation, SettleKind};
use natstream::{
    cancellation, AckPolicy, CancelToken, ConsumerConfig, HandlerError, MemoryBroker, Message,
    Queue, QueueConfig, QueueError, StorageType,
};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

fn orders() -> QueueConfig {
    QueueConfig::new("orders").subjects(["orders.created", "orders.shipped"])
}

async fn open(broker: &MemoryBroker) -> Queue<MemoryBroker> {
    Queue::new(broker, orders(), &CancelToken::never())
        .await
        .expect("queue should open")
}

fn noop(_msg: Message) -> std::future::Ready<Result<(), HandlerError>> {
    std::future::ready(Ok(()))
}

/// Handler forwarding every delivery to a channel.
fn forwarding() -> (
    impl Fn(Message) -> std::future::Ready<Result<(), HandlerError>> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |msg: Message| {
        tx.send(msg).ok();
        std::future::ready(Ok(()))
    };
    (handler, rx)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_invalid_queue_config_makes_no_broker_calls() {
    let broker = MemoryBroker::new();
    let cancel = CancelToken::never();

    let configs = [
        QueueConfig::new("").subject("orders.created"),
        QueueConfig::new("orders"),
        QueueConfig::new("orders").subjects(["orders.created", ""]),
    ];
    for config in configs {
        let err = Queue::new(&broker, config, &cancel).await.unwrap_err();
        assert!(err.is_invalid_argument(), "unexpected error: {err}");
    }

    assert_eq!(broker.calls().total(), 0);
}

#[tokio::test]
async fn test_invalid_consumer_config_makes_no_broker_calls() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let before = broker.calls();

    let err = queue
        .register_consumer(&CancelToken::never(), ConsumerConfig::new(""), noop)
        .await
        .unwrap_err();

    assert!(err.is_invalid_argument());
    assert_eq!(broker.calls(), before);
}

#[tokio::test]
async fn test_stream_creation_is_idempotent() {
    let broker = MemoryBroker::new();
    let first = open(&broker).await;
    let second = open(&broker).await;

    assert_eq!(broker.streams().len(), 1);
    assert_eq!(broker.calls().create_stream, 2);
    assert_eq!(first.stream_name(), second.stream_name());
}

#[tokio::test]
async fn test_stream_update_changes_subjects() {
    let broker = MemoryBroker::new();
    open(&broker).await;

    let cancel = CancelToken::never();
    let updated = orders().subject("orders.cancelled");
    Queue::new(&broker, updated, &cancel).await.unwrap();

    let stream = broker.stream("orders").unwrap();
    assert_eq!(
        stream.subjects,
        vec!["orders.created", "orders.shipped", "orders.cancelled"]
    );
}

#[tokio::test]
async fn test_consumer_registration_is_idempotent() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let (canceller, cancel) = cancellation();

    queue
        .register_consumer(
            &cancel,
            ConsumerConfig::new("orders.consumer").max_deliver(3),
            noop,
        )
        .await
        .unwrap();
    queue
        .register_consumer(
            &cancel,
            ConsumerConfig::new("orders.consumer")
                .max_deliver(5)
                .filter_subject("orders.created"),
            noop,
        )
        .await
        .unwrap();

    let consumers = broker.consumers("orders");
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].max_deliver, Some(5));
    assert_eq!(consumers[0].filter_subject.as_deref(), Some("orders.created"));

    canceller.cancel();
}

#[tokio::test]
async fn test_defaults_reach_the_broker() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;

    let handle = queue
        .register_consumer(&CancelToken::never(), ConsumerConfig::new("audit"), noop)
        .await
        .unwrap();

    assert_eq!(broker.stream("orders").unwrap().storage, StorageType::Memory);
    assert_eq!(queue.storage(), StorageType::Memory);

    let consumer = broker.consumer("orders", "audit").unwrap();
    assert_eq!(consumer.ack_policy, AckPolicy::Explicit);
    assert_eq!(consumer.max_deliver, None);
    assert_eq!(consumer.filter_subject, None);

    handle.stop();
    handle.stopped().await;
}

#[tokio::test]
async fn test_broker_failures_are_wrapped_by_operation() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let cancel = CancelToken::never();

    let err = Queue::new(
        &broker,
        QueueConfig::new("audit").subject("orders.*"),
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, QueueError::StreamCreation { ref stream, .. } if stream == "audit"));
    assert!(err.to_string().starts_with("error creating stream audit: "));

    let err = queue
        .register_consumer(
            &cancel,
            ConsumerConfig::new("payments").filter_subject("payments.created"),
            noop,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::ConsumerCreation { .. }));

    broker.fail_next(Operation::Consume, "consumer deleted");
    let err = queue
        .register_consumer(&cancel, ConsumerConfig::new("orders.consumer"), noop)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::ConsumeStart { ref durable, .. } if durable == "orders.consumer"
    ));
    assert_eq!(
        err.broker_error().map(|e| e.to_string()).as_deref(),
        Some("consumer deleted")
    );

    let err = queue
        .publish(&cancel, "payments.created", "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Publish { .. }));
    assert_eq!(err.to_error_code(), "PUBLISH_ERROR");
}

#[tokio::test]
async fn test_closed_connection_is_a_connection_error() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    queue.close().await.unwrap();

    let err = Queue::new(&broker, orders(), &CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Connection(_)));
}

#[tokio::test]
async fn test_cancellation_stops_handler_invocations() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let (canceller, cancel) = cancellation();
    let invocations = Arc::new(AtomicUsize::new(0));

    let counter = invocations.clone();
    let handler = move |_msg: Message| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok::<(), HandlerError>(()))
    };
    let handle = queue
        .register_consumer(&cancel, ConsumerConfig::new("orders.consumer"), handler)
        .await
        .unwrap();

    let publisher = CancelToken::never();
    queue
        .publish(&publisher, "orders.created", "1")
        .await
        .unwrap();
    queue
        .publish(&publisher, "orders.created", "2")
        .await
        .unwrap();
    eventually(|| invocations.load(Ordering::SeqCst) == 2).await;

    canceller.cancel();
    tokio::time::timeout(WAIT, handle.stopped())
        .await
        .expect("consumer should stop after cancellation");

    for i in 3..6 {
        queue
            .publish(&publisher, "orders.created", i.to_string())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(broker.pending("orders", "orders.consumer"), 3);
}

#[tokio::test]
async fn test_in_flight_handler_finishes_before_stop() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let (canceller, cancel) = cancellation();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    let handler = move |_msg: Message| {
        let started_tx = started_tx.clone();
        let mut release_rx = release_rx.clone();
        async move {
            started_tx.send(()).ok();
            release_rx.wait_for(|released| *released).await.ok();
            Ok::<(), HandlerError>(())
        }
    };
    let handle = queue
        .register_consumer(&cancel, ConsumerConfig::new("slow"), handler)
        .await
        .unwrap();

    queue
        .publish(&CancelToken::never(), "orders.created", "1")
        .await
        .unwrap();
    tokio::time::timeout(WAIT, started_rx.recv()).await.unwrap();

    canceller.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_stopped());

    release_tx.send_replace(true);
    tokio::time::timeout(WAIT, handle.stopped()).await.unwrap();

    let kinds: Vec<_> = broker.settlements().iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![SettleKind::Ack]);
}

#[tokio::test]
async fn test_handler_failure_is_isolated() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let (canceller, cancel) = cancellation();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = move |msg: Message| {
        let tx = tx.clone();
        async move {
            let payload = String::from_utf8_lossy(msg.payload()).to_string();
            tx.send(payload.clone()).ok();
            if payload == "A" {
                panic!("cannot process {payload}");
            }
            Ok::<(), HandlerError>(())
        }
    };
    queue
        .register_consumer(
            &cancel,
            ConsumerConfig::new("orders.consumer").max_deliver(1),
            handler,
        )
        .await
        .unwrap();

    let publisher = CancelToken::never();
    queue
        .publish(&publisher, "orders.created", "A")
        .await
        .unwrap();
    queue
        .publish(&publisher, "orders.created", "B")
        .await
        .unwrap();

    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().as_deref(), Some("A"));
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().as_deref(), Some("B"));
    eventually(|| broker.settlements().len() == 2).await;

    let settlements = broker.settlements();
    let naks: Vec<_> = settlements
        .iter()
        .filter(|s| s.kind == SettleKind::Nak)
        .map(|s| s.sequence)
        .collect();
    assert_eq!(naks, vec![1]);
    assert_eq!(settlements[1].kind, SettleKind::Ack);
    assert_eq!(settlements[1].sequence, 2);

    canceller.cancel();
}

#[tokio::test]
async fn test_orders_end_to_end() {
    let broker = MemoryBroker::new();
    let (canceller, cancel) = cancellation();
    let queue = Queue::new(&broker, orders(), &cancel).await.unwrap();

    let observer = broker.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |msg: Message| {
        let tx = tx.clone();
        let observer = observer.clone();
        async move {
            let settled_before = observer.settlements().len();
            tx.send((msg.subject().to_string(), msg.payload().clone(), settled_before))
                .ok();
            Ok::<(), HandlerError>(())
        }
    };
    let handle = queue
        .register_consumer(
            &cancel,
            ConsumerConfig::new("orders.consumer")
                .ack_policy(AckPolicy::Explicit)
                .max_deliver(5),
            handler,
        )
        .await
        .unwrap();

    let ack = queue
        .publish(&cancel, "orders.created", r#"{"id":1}"#)
        .await
        .unwrap();
    assert_eq!(ack.stream, "orders");
    assert_eq!(ack.sequence, 1);

    let (subject, payload, settled_before) = tokio::time::timeout(WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subject, "orders.created");
    assert_eq!(payload.as_ref(), br#"{"id":1}"#);
    assert_eq!(settled_before, 0);

    eventually(|| !broker.settlements().is_empty()).await;
    let settlement = &broker.settlements()[0];
    assert_eq!(settlement.kind, SettleKind::Ack);
    assert_eq!(settlement.durable, "orders.consumer");
    assert_eq!(settlement.subject, "orders.created");

    canceller.cancel();
    handle.stopped().await;
    queue.close().await.unwrap();
    assert!(broker.is_closed());
}

#[tokio::test]
async fn test_close_ends_delivery_and_is_idempotent() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let (handler, _rx) = forwarding();

    let handle = queue
        .register_consumer(&CancelToken::never(), ConsumerConfig::new("orders.consumer"), handler)
        .await
        .unwrap();

    queue.close().await.unwrap();
    queue.close().await.unwrap();
    assert_eq!(broker.calls().close, 1);

    tokio::time::timeout(WAIT, handle.stopped())
        .await
        .expect("closing the connection ends delivery");
}

#[tokio::test]
async fn test_consumers_receive_independently() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let (canceller, cancel) = cancellation();

    let (created, mut created_rx) = forwarding();
    let (everything, mut everything_rx) = forwarding();
    queue
        .register_consumer(
            &cancel,
            ConsumerConfig::new("created").filter_subject("orders.created"),
            created,
        )
        .await
        .unwrap();
    queue
        .register_consumer(&cancel, ConsumerConfig::new("everything"), everything)
        .await
        .unwrap();

    let publisher = CancelToken::never();
    queue
        .publish(&publisher, "orders.shipped", "1")
        .await
        .unwrap();
    queue
        .publish(&publisher, "orders.created", "2")
        .await
        .unwrap();

    let first = tokio::time::timeout(WAIT, created_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.subject(), "orders.created");

    let subjects = [
        tokio::time::timeout(WAIT, everything_rx.recv()).await.unwrap().unwrap(),
        tokio::time::timeout(WAIT, everything_rx.recv()).await.unwrap().unwrap(),
    ]
    .map(|m| m.subject().to_string());
    assert_eq!(subjects, ["orders.shipped", "orders.created"]);

    canceller.cancel();
}

#[tokio::test]
async fn test_stopped_consumer_leaves_unhandled_messages_queued() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let (canceller, cancel) = cancellation();
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = handled.clone();
    let slow = move |_msg: Message| {
        let counter = counter.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }
    };
    let handle = queue
        .register_consumer(&cancel, ConsumerConfig::new("worker"), slow)
        .await
        .unwrap();

    let publisher = CancelToken::never();
    for payload in ["1", "2", "3"] {
        queue
            .publish(&publisher, "orders.created", payload)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    canceller.cancel();
    tokio::time::timeout(WAIT, handle.stopped()).await.unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(broker.settlements().len(), 1);
    assert_eq!(broker.pending("orders", "worker"), 2);

    let (handler, mut rx) = forwarding();
    let (restart, restarted) = cancellation();
    queue
        .register_consumer(&restarted, ConsumerConfig::new("worker"), handler)
        .await
        .unwrap();

    let mut payloads = Vec::new();
    for _ in 0..2 {
        let msg = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        payloads.push(String::from_utf8_lossy(msg.payload()).to_string());
    }
    assert_eq!(payloads, ["2", "3"]);

    restart.cancel();
}

#[tokio::test]
async fn test_cancelled_token_aborts_queue_creation() {
    let broker = MemoryBroker::new();
    let (canceller, cancel) = cancellation();
    canceller.cancel();

    let err = Queue::new(&broker, orders(), &cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(broker.calls().create_stream, 0);
    assert!(broker.streams().is_empty());
}

#[tokio::test]
async fn test_cancelled_token_aborts_consumer_registration() {
    let broker = MemoryBroker::new();
    let queue = open(&broker).await;
    let (canceller, cancel) = cancellation();
    canceller.cancel();

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let handler = move |_msg: Message| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok::<(), HandlerError>(()))
    };
    let err = queue
        .register_consumer(&cancel, ConsumerConfig::new("orders.consumer"), handler)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    queue
        .publish(&CancelToken::never(), "orders.created", "1")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(broker.calls().create_consumer, 0);
    assert_eq!(broker.calls().consume, 0);
    assert!(broker.consumers("orders").is_empty());
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}
