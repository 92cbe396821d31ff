use std::time::Duration;

use futures::future::join;
use futures::FutureExt;
use serde_json::{json, Value};

use rabbit_hutch::{
    ConsumeOptions, Exchange, ExchangeOptions, HutchError, Message, Payload, PublishOptions,
    QueueEvent, QueueOptions,
};

use crate::common::{memory_manager, wait_for, within, SETTLE};

async fn echo(message: Message) {
    let reply = match message.payload() {
        Payload::Json(body) => Payload::Json(json!({ "echo": body })),
        Payload::Bytes(bytes) => Payload::Bytes(bytes.iter().rev().copied().collect()),
    };
    message.ack(Some(reply)).await.unwrap();
}

async fn serve(exchange: &Exchange, name: &str) {
    let queue = exchange.queue(QueueOptions::named(name)).unwrap();
    let mut events = queue.subscribe();
    queue.consume(echo, ConsumeOptions::default()).await.unwrap();
    wait_for(&mut events, |e| *e == QueueEvent::Bound).await;
}

#[tokio::test]
async fn test_reply_reaches_the_requester() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.direct(Some("rpc"), ExchangeOptions::default()).unwrap();
    serve(&exchange, "rpc.echo").await;

    let reply = exchange
        .request(json!({ "q": "ping" }), PublishOptions::routed("rpc.echo"))
        .await
        .unwrap();
    assert!(!reply.correlation_id().is_empty());

    let answer = within(reply).await.unwrap();
    assert_eq!(answer, Payload::Json(json!({ "echo": { "q": "ping" } })));
    assert_eq!(exchange.internals().pending_replies, 0);
}

#[tokio::test]
async fn test_concurrent_requests_do_not_cross() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.direct(Some("rpc"), ExchangeOptions::default()).unwrap();
    serve(&exchange, "rpc.echo").await;

    let (first, second) = join(
        exchange.request(json!("first"), PublishOptions::routed("rpc.echo")),
        exchange.request(json!("second"), PublishOptions::routed("rpc.echo")),
    )
    .await;
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.correlation_id(), second.correlation_id());

    let (first, second) = within(join(first, second)).await;
    assert_eq!(first.unwrap(), Payload::Json(json!({ "echo": "first" })));
    assert_eq!(second.unwrap(), Payload::Json(json!({ "echo": "second" })));
}

#[tokio::test]
async fn test_requests_before_ready_are_answered() {
    let (_broker, manager) = memory_manager();
    let server = manager.direct(Some("rpc"), ExchangeOptions::default()).unwrap();
    serve(&server, "rpc.echo").await;

    let client = manager.direct(Some("rpc"), ExchangeOptions::default()).unwrap();
    let reply = client
        .request(json!([1, 2, 3]), PublishOptions::routed("rpc.echo"))
        .await
        .unwrap();
    let answer = within(reply).await.unwrap();
    assert_eq!(answer.parse::<Value>().unwrap(), json!({ "echo": [1, 2, 3] }));
}

#[tokio::test]
async fn test_binary_replies() {
    let (_broker, manager) = memory_manager();
    let exchange = manager.direct(Some("rpc"), ExchangeOptions::default()).unwrap();
    serve(&exchange, "rpc.echo").await;

    let options = PublishOptions::routed("rpc.echo").with_content_type("application/octet-stream");
    let reply = exchange
        .request(Payload::Bytes(vec![1, 2, 3]), options)
        .await
        .unwrap();
    assert_eq!(within(reply).await.unwrap(), Payload::Bytes(vec![3, 2, 1]));
}

#[tokio::test]
async fn test_requests_need_a_reply_queue() {
    let (_broker, manager) = memory_manager();
    let exchange = manager
        .direct(Some("rpc"), ExchangeOptions::without_replies())
        .unwrap();

    let err = exchange
        .request(json!("ping"), PublishOptions::routed("rpc.echo"))
        .await
        .unwrap_err();
    assert_eq!(err, HutchError::RepliesDisabled("rpc".to_string()));

    within(exchange.ready()).await.unwrap();
    assert_eq!(exchange.internals().reply_queue, None);
}

#[tokio::test]
async fn test_closing_fails_pending_replies() {
    let (broker, manager) = memory_manager();
    let exchange = manager.direct(Some("rpc"), ExchangeOptions::default()).unwrap();
    let queue = exchange.queue(QueueOptions::named("rpc.slow")).unwrap();
    let mut events = queue.subscribe();
    wait_for(&mut events, |e| *e == QueueEvent::Bound).await;

    let reply = exchange
        .request(json!("anyone?"), PublishOptions::routed("rpc.slow"))
        .await
        .unwrap();
    assert_eq!(exchange.internals().pending_replies, 1);
    assert_eq!(broker.queue_depth("rpc.slow"), Some(1));

    let reply_queue = exchange.internals().reply_queue.unwrap();
    exchange.close().await.unwrap();
    assert_eq!(within(reply).await.unwrap_err(), HutchError::ReplyDropped);

    // the exclusive auto-delete reply queue does not outlive its exchange
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!broker.has_queue(&reply_queue));
}

#[tokio::test]
async fn test_abandoned_request_is_forgotten_and_never_sent() {
    let (broker, manager) = memory_manager();
    let server = manager.direct(Some("rpc"), ExchangeOptions::default()).unwrap();
    let queue = server.queue(QueueOptions::named("rpc.slow")).unwrap();
    let mut events = queue.subscribe();
    wait_for(&mut events, |e| *e == QueueEvent::Bound).await;

    let client = manager.direct(Some("rpc"), ExchangeOptions::default()).unwrap();
    let request = client.request(json!("anyone?"), PublishOptions::routed("rpc.slow"));
    assert!(request.now_or_never().is_none());
    assert_eq!(client.internals().pending_replies, 0);

    within(client.ready()).await.unwrap();
    tokio::time::sleep(SETTLE).await;
    let internals = client.internals();
    assert_eq!(internals.pending_replies, 0);
    assert_eq!(internals.in_flight, 0);
    assert_eq!(broker.queue_depth("rpc.slow"), Some(0));

    // a request that is awaited still goes out
    let _reply = client
        .request(json!("still there?"), PublishOptions::routed("rpc.slow"))
        .await
        .unwrap();
    assert_eq!(client.internals().pending_replies, 1);
    assert_eq!(broker.queue_depth("rpc.slow"), Some(1));
}
