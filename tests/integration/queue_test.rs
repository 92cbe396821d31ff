use serde_json::json;

use rabbit_hutch::config::JSON_CONTENT_TYPE;
use rabbit_hutch::{
    ConnectionManager, ConsumeOptions, Exchange, ExchangeOptions, HeaderValue, HutchConfig, HutchError,
    MemoryBroker, NackOptions, Payload, PublishOptions, Queue, QueueEvent, QueueOptions, QueueState,
};

use crate::common::{collector, memory_manager, next_message, wait_for, within, SETTLE};

async fn bound_queue(exchange: &Exchange, options: QueueOptions) -> Queue {
    let queue = exchange.queue(options).unwrap();
    let mut events = queue.subscribe();
    wait_for(&mut events, |e| *e == QueueEvent::Bound).await;
    queue
}

#[tokio::test]
async fn test_cancel_without_consumer_is_a_noop() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.direct(Some("tasks"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("tasks.q")).await;

    queue.cancel().await.unwrap();
    assert_eq!(queue.state(), QueueState::Ready);
}

#[tokio::test]
async fn test_cancelled_consumer_gets_nothing_more() {
    let (broker, manager) = memory_manager();
    let exchange = manager.direct(Some("tasks"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("tasks.q")).await;
    let mut events = queue.subscribe();

    let (handler, mut messages) = collector();
    let tag = queue.consume(handler, ConsumeOptions::default()).await.unwrap();
    assert!(tag.starts_with("consumer-"));
    assert_eq!(queue.state(), QueueState::Consuming);
    assert_eq!(events.recv().await.unwrap(), QueueEvent::Consuming);

    exchange
        .publish(json!({ "task": 1 }), PublishOptions::routed("tasks.q"))
        .await
        .unwrap();
    next_message(&mut messages).await.ack(None).await.unwrap();

    queue.cancel().await.unwrap();
    assert_eq!(queue.state(), QueueState::Ready);
    assert_eq!(broker.consumer_count("tasks.q"), Some(0));

    exchange
        .publish(json!({ "task": 2 }), PublishOptions::routed("tasks.q"))
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;
    assert!(messages.try_recv().is_err());
    assert_eq!(broker.queue_depth("tasks.q"), Some(1));
}

#[tokio::test]
async fn test_one_consumer_per_queue() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.direct(Some("tasks"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("tasks.q")).await;

    let (first, _first_messages) = collector();
    let tag = queue.consume(first, ConsumeOptions::default()).await.unwrap();

    let (second, _second_messages) = collector();
    let err = queue.consume(second, ConsumeOptions::default()).await.unwrap_err();
    assert_eq!(err, HutchError::AlreadyConsuming(tag));
}

#[tokio::test]
async fn test_purge_counts_waiting_messages() {
    let (broker, manager) = memory_manager();
    let exchange = manager.direct(Some("reports"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("reports.q")).await;

    for n in 0..4 {
        exchange
            .publish(json!(n), PublishOptions::routed("reports.q"))
            .await
            .unwrap();
    }
    assert_eq!(broker.queue_depth("reports.q"), Some(4));

    let purged = queue.purge().await.unwrap().unwrap();
    assert!(purged >= 4);
    assert_eq!(broker.queue_depth("reports.q"), Some(0));
}

#[tokio::test]
async fn test_malformed_json_is_rejected_and_consumption_continues() {
    let (broker, manager) = memory_manager();
    let exchange = manager.direct(Some("ingest"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("ingest.q")).await;
    let mut events = queue.subscribe();

    let (handler, mut messages) = collector();
    queue.consume(handler, ConsumeOptions::default()).await.unwrap();

    exchange
        .publish(
            Payload::Bytes(b"{not json".to_vec()),
            PublishOptions::routed("ingest.q").with_content_type(JSON_CONTENT_TYPE),
        )
        .await
        .unwrap();
    exchange
        .publish(json!({ "ok": true }), PublishOptions::routed("ingest.q"))
        .await
        .unwrap();

    let event = wait_for(&mut events, |e| matches!(e, QueueEvent::Error(_))).await;
    assert!(matches!(
        event,
        QueueEvent::Error(HutchError::DeserializationError(_))
    ));

    let message = next_message(&mut messages).await;
    assert_eq!(message.payload(), &Payload::Json(json!({ "ok": true })));
    message.ack(None).await.unwrap();

    tokio::time::sleep(SETTLE).await;
    assert_eq!(broker.queue_depth("ingest.q"), Some(0));
    assert_eq!(queue.state(), QueueState::Consuming);
}

#[tokio::test]
async fn test_raw_content_is_delivered_as_bytes() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.direct(Some("files"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("files.q")).await;

    let (handler, mut messages) = collector();
    queue.consume(handler, ConsumeOptions::default()).await.unwrap();

    let options = PublishOptions::routed("files.q")
        .with_content_type("text/csv")
        .with_header("rows", 2i64);
    exchange.publish("a,b\n1,2\n", options).await.unwrap();

    let message = next_message(&mut messages).await;
    assert_eq!(message.payload().as_bytes(), Some(&b"a,b\n1,2\n"[..]));
    assert_eq!(message.properties().content_type.as_deref(), Some("text/csv"));
    assert_eq!(message.properties().headers["rows"], HeaderValue::Int(2));
    assert_eq!(message.routing_key(), "files.q");
    assert_eq!(message.exchange(), "files");
    message.ack(None).await.unwrap();
}

#[tokio::test]
async fn test_nack_requeues_for_redelivery() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.direct(Some("retry"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("retry.q")).await;

    let (handler, mut messages) = collector();
    queue.consume(handler, ConsumeOptions::default()).await.unwrap();
    exchange
        .publish(json!({ "attempt": 1 }), PublishOptions::routed("retry.q"))
        .await
        .unwrap();

    let first = next_message(&mut messages).await;
    assert!(!first.redelivered());
    first.nack(NackOptions::default()).await.unwrap();

    let again = next_message(&mut messages).await;
    assert!(again.redelivered());
    assert_eq!(again.payload(), &Payload::Json(json!({ "attempt": 1 })));
    again.ack(None).await.unwrap();
}

#[tokio::test]
async fn test_consume_waits_for_ready() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.direct(Some("early"), ExchangeOptions::default()).unwrap();
    let queue = exchange.queue(QueueOptions::named("early.q")).unwrap();
    assert_eq!(queue.state(), QueueState::Unconnected);

    let (handler, _messages) = collector();
    within(queue.consume(handler, ConsumeOptions::default()))
        .await
        .unwrap();
    assert_eq!(queue.state(), QueueState::Consuming);
    assert!(queue.internals().consumer_tag.is_some());
}

#[tokio::test]
async fn test_close_queue_only() {
    let (broker, manager) = memory_manager();
    let exchange = manager.direct(Some("tasks"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("tasks.q")).await;
    let mut events = queue.subscribe();

    queue.close().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), QueueEvent::Close(None));
    assert_eq!(queue.state(), QueueState::Closed);
    assert_eq!(within(queue.closed()).await, None);

    tokio::time::sleep(SETTLE).await;
    assert!(within(exchange.ready()).await.is_ok());
    // the durable queue outlives its channel
    assert!(broker.has_queue("tasks.q"));
}

#[tokio::test]
async fn test_failed_cancel_keeps_the_consumer() {
    let (broker, manager) = memory_manager();
    let exchange = manager.direct(Some("tasks"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("tasks.q")).await;
    let (handler, _messages) = collector();
    let tag = queue.consume(handler, ConsumeOptions::default()).await.unwrap();

    broker.fail_cancels(true);
    assert!(matches!(queue.cancel().await, Err(HutchError::ChannelError(_))));
    assert_eq!(queue.internals().consumer_tag, Some(tag));
    assert_eq!(queue.state(), QueueState::Consuming);
    assert_eq!(broker.consumer_count("tasks.q"), Some(1));

    broker.fail_cancels(false);
    queue.cancel().await.unwrap();
    assert_eq!(queue.internals().consumer_tag, None);
    assert_eq!(queue.state(), QueueState::Ready);
    assert_eq!(broker.consumer_count("tasks.q"), Some(0));
}

#[tokio::test]
async fn test_close_during_connect_releases_the_channel() {
    let (broker, manager) = memory_manager();
    let connection = within(manager.connected()).await.unwrap();
    let before = broker.open_channels();

    broker.hold_declares(true);
    let queue = Queue::new(QueueOptions::named("held.q"));
    let connecting = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.connect(&connection).await })
    };
    tokio::time::sleep(SETTLE).await;
    assert_eq!(queue.state(), QueueState::ChannelOpen);
    assert_eq!(broker.open_channels(), before + 1);

    queue.close().await.unwrap();
    broker.hold_declares(false);
    let connected = within(connecting).await.unwrap();
    assert!(matches!(connected, Err(HutchError::Closed(_))));
    assert_eq!(broker.open_channels(), before);
    assert_eq!(queue.internals().channel, None);
}

#[tokio::test]
async fn test_configured_prefetch_reaches_queues() {
    let broker = MemoryBroker::new();
    let config = HutchConfig::from_vars(|key| match key {
        "AMQP_ADDR" => Some("memory://hutch".to_string()),
        "RABBITMQ_PREFETCH_COUNT" => Some("2".to_string()),
        _ => None,
    })
    .unwrap();
    let manager = ConnectionManager::from_config_with_connector(&config, broker.connector()).unwrap();
    assert_eq!(manager.internals().prefetch, 2);

    let exchange = manager.direct(Some("batch"), ExchangeOptions::default()).unwrap();
    let queue = bound_queue(&exchange, QueueOptions::named("batch.q")).await;
    assert_eq!(queue.options().prefetch, Some(2));

    let (handler, mut messages) = collector();
    queue.consume(handler, ConsumeOptions::default()).await.unwrap();
    for n in 0..3 {
        exchange
            .publish(json!({ "n": n }), PublishOptions::routed("batch.q"))
            .await
            .unwrap();
    }

    // two unacked deliveries fill the window
    let first = next_message(&mut messages).await;
    let _second = next_message(&mut messages).await;
    tokio::time::sleep(SETTLE).await;
    assert!(messages.try_recv().is_err());
    assert_eq!(broker.queue_depth("batch.q"), Some(1));

    first.ack(None).await.unwrap();
    let third = next_message(&mut messages).await;
    assert_eq!(third.payload(), &Payload::Json(json!({ "n": 2 })));
}
