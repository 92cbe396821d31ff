use futures::future::join_all;
use futures::FutureExt;
use serde_json::json;

use rabbit_hutch::{
    ConsumeOptions, ExchangeEvent, ExchangeOptions, ExchangeState, ExchangeType, HutchError,
    Payload, PublishOptions, Queue, QueueEvent, QueueOptions,
};

use crate::common::{collector, drain_events, memory_manager, next_message, wait_for, within, SETTLE};

#[tokio::test]
async fn test_factories_resolve_names() {
    let (broker, manager) = memory_manager();
    let options = ExchangeOptions::without_replies;

    let direct = manager.direct(None, options()).unwrap();
    let fanout = manager.fanout(None, options()).unwrap();
    let topic = manager.topic(None, options()).unwrap();
    let named = manager.topic(Some("audit"), options()).unwrap();
    let nameless = manager.default(options()).unwrap();

    assert_eq!(direct.name(), "amq.direct");
    assert_eq!(fanout.name(), "amq.fanout");
    assert_eq!(topic.name(), "amq.topic");
    assert_eq!(named.name(), "audit");
    assert_eq!(nameless.name(), "");
    assert_eq!(named.kind(), ExchangeType::Topic);

    for exchange in [&direct, &fanout, &topic, &named, &nameless] {
        within(exchange.ready()).await.unwrap();
    }
    assert!(broker.has_exchange("audit"));
}

#[tokio::test]
async fn test_missing_type_fails_before_any_io() {
    let (broker, manager) = memory_manager();
    broker.refuse_connections(true);

    let err = manager
        .exchange(None, Some("jobs"), ExchangeOptions::default())
        .err();
    assert_eq!(err, Some(HutchError::MissingExchangeType));
    assert_eq!(manager.internals().exchanges_created, 0);
}

#[tokio::test]
async fn test_publishes_before_ready_arrive_once_in_order() {
    let (broker, manager) = memory_manager();
    let setup = manager.direct(Some("orders"), ExchangeOptions::default()).unwrap();
    let queue = setup.queue(QueueOptions::named("orders.created")).unwrap();
    let mut queue_events = queue.subscribe();
    wait_for(&mut queue_events, |e| *e == QueueEvent::Bound).await;

    let exchange = manager.direct(Some("orders"), ExchangeOptions::default()).unwrap();
    assert_eq!(exchange.state(), ExchangeState::Unconnected);

    let sends = (0..5).map(|n| {
        exchange.publish(json!({ "n": n }), PublishOptions::routed("orders.created"))
    });
    for result in join_all(sends).await {
        result.unwrap();
    }
    assert_eq!(exchange.state(), ExchangeState::Ready);

    let (handler, mut messages) = collector();
    queue.consume(handler, ConsumeOptions::default()).await.unwrap();
    for n in 0..5 {
        let message = next_message(&mut messages).await;
        assert_eq!(message.payload(), &Payload::Json(json!({ "n": n })));
        assert!(!message.redelivered());
        message.ack(None).await.unwrap();
    }

    tokio::time::sleep(SETTLE).await;
    assert!(messages.try_recv().is_err());
    assert_eq!(broker.queue_depth("orders.created"), Some(0));
}

#[tokio::test]
async fn test_bound_fires_once_after_every_key() {
    let (broker, manager) = memory_manager();
    let exchange = manager.topic(Some("metrics"), ExchangeOptions::default()).unwrap();
    let queue = exchange
        .queue(QueueOptions::named("metrics.all").with_keys(["cpu.*", "disk.#", "net.rx"]))
        .unwrap();
    let mut events = queue.subscribe();

    wait_for(&mut events, |e| *e == QueueEvent::Bound).await;
    let mut bindings = broker.bindings("metrics");
    bindings.sort();
    assert_eq!(
        bindings,
        vec![
            ("metrics.all".to_string(), "cpu.*".to_string()),
            ("metrics.all".to_string(), "disk.#".to_string()),
            ("metrics.all".to_string(), "net.rx".to_string()),
        ]
    );

    exchange
        .publish(json!({ "bytes": 42 }), PublishOptions::routed("net.rx"))
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(broker.queue_depth("metrics.all"), Some(1));
    assert!(!drain_events(&mut events).contains(&QueueEvent::Bound));
}

#[tokio::test]
async fn test_queue_without_keys_binds_its_name() {
    let (broker, manager) = memory_manager();
    let exchange = manager.direct(None, ExchangeOptions::default()).unwrap();
    let queue = exchange.queue(QueueOptions::default()).unwrap();
    let mut events = queue.subscribe();

    wait_for(&mut events, |e| *e == QueueEvent::Bound).await;
    let name = queue.name();
    assert!(name.starts_with("amq.gen-"));
    assert!(broker.bindings("amq.direct").contains(&(name.clone(), name)));
}

#[tokio::test]
async fn test_nameless_exchange_routes_by_queue_name() {
    let (broker, manager) = memory_manager();
    let exchange = manager.default(ExchangeOptions::without_replies()).unwrap();
    let queue = exchange.queue(QueueOptions::named("inbox")).unwrap();
    within(queue.ready()).await.unwrap();

    exchange
        .publish("hello", PublishOptions::routed("inbox"))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("inbox"), Some(1));
    assert!(broker.bindings("").is_empty());
}

#[tokio::test]
async fn test_binding_failure_closes_exchange() {
    let (broker, manager) = memory_manager();
    broker.fail_bindings_for("bad.key");
    let exchange = manager.direct(Some("jobs"), ExchangeOptions::default()).unwrap();
    let mut events = exchange.subscribe();
    let queue = exchange
        .queue(QueueOptions::named("jobs.q").with_keys(["good.key", "bad.key"]))
        .unwrap();
    let mut queue_events = queue.subscribe();

    let cause = within(exchange.closed()).await;
    assert!(matches!(cause, Some(HutchError::BindError { ref key, .. }) if key == "bad.key"));
    assert!(matches!(
        wait_for(&mut events, |e| matches!(e, ExchangeEvent::Close(_))).await,
        ExchangeEvent::Close(Some(_))
    ));
    assert!(!drain_events(&mut queue_events).contains(&QueueEvent::Bound));

    let err = exchange
        .publish("late", PublishOptions::routed("good.key"))
        .await
        .unwrap_err();
    assert!(matches!(err, HutchError::Closed(_)));
}

#[tokio::test]
async fn test_dropped_channel_closes_only_its_owner() {
    let (broker, manager) = memory_manager();
    let exchange = manager.direct(Some("jobs"), ExchangeOptions::default()).unwrap();
    within(exchange.ready()).await.unwrap();

    let connection = within(manager.connected()).await.unwrap();
    let queue = Queue::new(QueueOptions::named("standalone"));
    queue.connect(&connection).await.unwrap();

    let channel = exchange.internals().channel.unwrap();
    assert!(broker.drop_channel(&channel, "PRECONDITION_FAILED - test"));

    assert!(matches!(
        within(exchange.closed()).await,
        Some(HutchError::ChannelError(_))
    ));
    tokio::time::sleep(SETTLE).await;
    assert!(within(queue.ready()).await.is_ok());
    assert_eq!(queue.purge().await.unwrap(), Some(0));
    assert!(manager.is_connected());

    let queue_channel = queue.internals().channel.unwrap();
    assert!(broker.drop_channel(&queue_channel, "gone"));
    assert!(within(queue.closed()).await.is_some());
    assert_eq!(queue.name(), "standalone");
    assert_eq!(queue.purge().await.unwrap(), None);
}

#[tokio::test]
async fn test_drain_after_in_flight_publishes() {
    let (broker, manager) = memory_manager();
    let exchange = manager.fanout(None, ExchangeOptions::without_replies()).unwrap();
    within(exchange.ready()).await.unwrap();
    let mut events = exchange.subscribe();

    broker.set_saturated(true);
    exchange.publish("first", PublishOptions::default()).await.unwrap();
    exchange.publish("second", PublishOptions::default()).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    assert!(drain_events(&mut events).is_empty());
    assert_eq!(exchange.internals().in_flight, 2);

    broker.set_saturated(false);
    assert_eq!(
        wait_for(&mut events, |e| *e == ExchangeEvent::Drain).await,
        ExchangeEvent::Drain
    );
    tokio::time::sleep(SETTLE).await;
    assert!(drain_events(&mut events).is_empty());
    assert_eq!(exchange.internals().in_flight, 0);
}

#[tokio::test]
async fn test_abandoned_publish_still_settles_in_flight() {
    let (broker, manager) = memory_manager();
    let setup = manager.direct(Some("orders"), ExchangeOptions::default()).unwrap();
    let queue = setup.queue(QueueOptions::named("orders.created")).unwrap();
    let mut queue_events = queue.subscribe();
    wait_for(&mut queue_events, |e| *e == QueueEvent::Bound).await;

    let exchange = manager.direct(Some("orders"), ExchangeOptions::without_replies()).unwrap();
    assert_eq!(exchange.state(), ExchangeState::Unconnected);
    let mut events = exchange.subscribe();

    // the caller gives up while the send is still held
    let send = exchange.publish(json!({ "n": 1 }), PublishOptions::routed("orders.created"));
    assert!(send.now_or_never().is_none());
    assert_eq!(exchange.internals().in_flight, 1);

    within(exchange.ready()).await.unwrap();
    wait_for(&mut events, |e| *e == ExchangeEvent::Drain).await;
    assert_eq!(exchange.internals().in_flight, 0);
    assert_eq!(broker.queue_depth("orders.created"), Some(1));

    exchange
        .publish(json!({ "n": 2 }), PublishOptions::routed("orders.created"))
        .await
        .unwrap();
    assert_eq!(exchange.internals().in_flight, 0);
    assert_eq!(broker.queue_depth("orders.created"), Some(2));
}

#[tokio::test]
async fn test_sends_discarded_on_close_leave_nothing_in_flight() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.fanout(None, ExchangeOptions::without_replies()).unwrap();
    assert_eq!(exchange.state(), ExchangeState::Unconnected);
    let mut events = exchange.subscribe();

    let send = exchange.publish("held", PublishOptions::default());
    assert!(send.now_or_never().is_none());
    assert_eq!(exchange.internals().in_flight, 1);

    exchange.close().await.unwrap();
    assert_eq!(exchange.internals().in_flight, 0);
    tokio::time::sleep(SETTLE).await;
    assert_eq!(drain_events(&mut events), vec![ExchangeEvent::Close(None)]);
}

#[tokio::test]
async fn test_close_is_terminal() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.direct(Some("jobs"), ExchangeOptions::default()).unwrap();
    within(exchange.ready()).await.unwrap();
    assert!(exchange.internals().reply_queue.is_some());
    let mut events = exchange.subscribe();

    exchange.close().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), ExchangeEvent::Close(None));
    assert_eq!(exchange.state(), ExchangeState::Closed);
    assert_eq!(exchange.internals().channel, None);
    assert!(exchange.ready().await.is_err());
    assert!(exchange.queue(QueueOptions::default()).is_err());
    assert!(manager.is_connected());
}
