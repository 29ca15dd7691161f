use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use super::{MetricsBuilder, settlement};
use crate::broker::{BrokerConfig, InMemoryBroker};
use crate::message::{Message, Scope};
use crate::pubsub::{Publisher, Subscriber};
use crate::router::{Router, RouterConfig, handler_func};
use crate::utils::error::Error;

#[test]
fn test_metric_name_skips_empty_parts() {
    assert_eq!(
        MetricsBuilder::new("courier", "orders").metric_name("publish_time_seconds"),
        "courier_orders_publish_time_seconds"
    );
    assert_eq!(
        MetricsBuilder::new("", "orders").metric_name("x"),
        "orders_x"
    );
    assert_eq!(MetricsBuilder::default().metric_name("x"), "x");
}

#[tokio::test]
async fn test_publisher_decorator_keeps_name_and_delivery() {
    let broker = InMemoryBroker::default();
    let mut subscription = broker.subscribe(Scope::new(), "t").await.unwrap();

    let inner: Arc<dyn Publisher> = Arc::new(broker.clone());
    let publisher = MetricsBuilder::default().decorate_publisher()(inner).unwrap();
    assert_eq!(publisher.name(), "InMemoryBroker");

    publisher
        .publish("t", vec![Message::new("1", "")])
        .await
        .unwrap();
    let msg = timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.uuid, "1");
    msg.ack();
}

#[tokio::test]
async fn test_subscriber_decorator_does_not_settle_messages() {
    let broker = InMemoryBroker::new(BrokerConfig {
        block_publish_until_ack: true,
        ..Default::default()
    });
    let inner: Arc<dyn Subscriber> = Arc::new(broker.clone());
    let subscriber = MetricsBuilder::default().decorate_subscriber()(inner).unwrap();
    let mut subscription = subscriber.subscribe(Scope::new(), "t").await.unwrap();

    let publishing = tokio::spawn({
        let broker = broker.clone();
        async move { broker.publish("t", vec![Message::new("1", "")]).await }
    });

    let first = timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    first.nack();
    let second = timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    second.ack();
    timeout(Duration::from_secs(1), publishing)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_settlement_reports_ack_outcome() {
    let msg = Message::new("1", "");
    let settled = tokio::spawn(settlement(&msg));
    msg.nack();
    let outcome = timeout(Duration::from_secs(1), settled)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Some("nacked"));
}

#[tokio::test]
async fn test_settlement_ends_when_delivery_is_abandoned() {
    let mut msg = Message::new("1", "");
    let scope = Scope::new().child();
    msg.set_scope(scope.clone());
    let settled = tokio::spawn(settlement(&msg));
    drop(msg);
    scope.cancel();

    let outcome = timeout(Duration::from_secs(1), settled)
        .await
        .expect("an abandoned delivery must not keep the task alive")
        .unwrap();
    assert_eq!(outcome, None);
}

#[tokio::test]
async fn test_handler_middleware_passes_results_through() {
    let middleware = MetricsBuilder::new("test", "").handler_middleware();

    let ok = middleware(handler_func(|msg: Message| async move { Ok(vec![msg]) }));
    let produced = ok(Message::new("1", "")).await.unwrap();
    assert_eq!(produced.len(), 1);

    let failing = middleware(handler_func(|_msg: Message| async {
        Err(Error::handler("nope"))
    }));
    assert!(failing(Message::new("2", "")).await.is_err());
}

#[tokio::test]
async fn test_router_with_metrics_still_routes() {
    let broker = InMemoryBroker::default();
    let router = Router::new(RouterConfig::default()).unwrap();
    MetricsBuilder::new("courier", "test").add_metrics_router_decorator(&router);
    router
        .add_handler(
            "forward",
            "in",
            Arc::new(broker.clone()),
            "out",
            Arc::new(broker.clone()),
            handler_func(|msg: Message| async move { Ok(vec![Message::new("fwd", msg.payload.clone())]) }),
        )
        .unwrap();
    let mut out = broker.subscribe(Scope::new(), "out").await.unwrap();

    let run = tokio::spawn({
        let router = router.clone();
        async move { router.run(Scope::new()).await }
    });
    timeout(Duration::from_secs(1), router.running()).await.unwrap();

    broker
        .publish("in", vec![Message::new("1", "body")])
        .await
        .unwrap();
    let produced = timeout(Duration::from_secs(1), out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(produced.uuid, "fwd");
    produced.ack();

    router.close().await.unwrap();
    timeout(Duration::from_secs(1), run).await.unwrap().unwrap().unwrap();
}
