use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use super::topic::{Topic, TopicSubscriber};
use super::{BrokerConfig, InMemoryBroker};
use crate::message::{Message, Scope};
use crate::pubsub::{Publisher, Subscriber, Subscription};
use crate::utils::error::Error;

async fn recv(subscription: &mut Subscription) -> Message {
    timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("subscription closed unexpectedly")
}

async fn assert_closed(subscription: &mut Subscription) {
    let next = timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("timed out waiting for the subscription to close");
    assert!(next.is_none(), "expected a closed subscription");
}

fn messages(count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| Message::new(format!("uuid-{i}"), format!("payload-{i}")))
        .collect()
}

#[test]
fn test_topic_new() {
    let topic = Topic::new("test_topic");
    assert_eq!(topic.name, "test_topic");
    assert!(topic.is_empty());
}

#[tokio::test]
async fn test_topic_subscribe_and_unsubscribe() {
    let (tx, _rx) = tokio::sync::mpsc::channel(1);
    let subscriber = Arc::new(TopicSubscriber::new("test_topic", &Scope::new(), tx));
    let id = subscriber.id.clone();

    let mut topic = Topic::new("test_topic");
    topic.subscribe(Arc::clone(&subscriber));
    topic.subscribe(subscriber);
    assert!(topic.contains(&id));
    assert_eq!(topic.len(), 1);

    topic.unsubscribe(&id);
    assert!(!topic.contains(&id));
}

#[tokio::test]
async fn test_every_subscriber_receives_every_message() {
    let broker = InMemoryBroker::default();
    let mut subscriptions = Vec::new();
    for _ in 0..3 {
        subscriptions.push(broker.subscribe(Scope::new(), "orders").await.unwrap());
    }
    assert_eq!(broker.subscriber_count("orders").await, 3);

    let published = messages(10);
    let expected: HashSet<String> = published.iter().map(|m| m.uuid.clone()).collect();
    broker.publish("orders", published.clone()).await.unwrap();

    for subscription in &mut subscriptions {
        let mut received = HashSet::new();
        for _ in 0..published.len() {
            let msg = recv(subscription).await;
            let original = published
                .iter()
                .find(|m| m.uuid == msg.uuid)
                .expect("unknown message received");
            assert_eq!(&msg, original);
            assert!(msg.ack());
            received.insert(msg.uuid.clone());
        }
        assert_eq!(received, expected);
    }
}

#[tokio::test]
async fn test_publish_without_subscribers_is_a_no_op() {
    let broker = InMemoryBroker::new(BrokerConfig {
        block_publish_until_ack: true,
        ..Default::default()
    });
    timeout(
        Duration::from_millis(200),
        broker.publish("nobody", messages(2)),
    )
    .await
    .expect("publish should not block without subscribers")
    .unwrap();
}

#[tokio::test]
async fn test_publisher_keeps_its_own_copy() {
    let broker = InMemoryBroker::default();
    let mut subscription = broker.subscribe(Scope::new(), "t").await.unwrap();

    let original = Message::new("1", "body");
    broker.publish("t", vec![original.clone()]).await.unwrap();

    let delivered = recv(&mut subscription).await;
    delivered.ack();
    assert_eq!(delivered, original);
    assert_eq!(original.ack_state(), crate::message::AckState::Pending);
}

#[tokio::test]
async fn test_block_until_ack_redelivers_on_nack() {
    let broker = InMemoryBroker::new(BrokerConfig {
        block_publish_until_ack: true,
        ..Default::default()
    });
    let mut subscription = broker.subscribe(Scope::new(), "jobs").await.unwrap();

    let publishing = tokio::spawn({
        let broker = broker.clone();
        async move { broker.publish("jobs", messages(1)).await }
    });

    let first = recv(&mut subscription).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!publishing.is_finished(), "publish returned before the ack");

    assert!(first.nack());
    let second = recv(&mut subscription).await;
    assert_eq!(second.uuid, first.uuid);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!publishing.is_finished(), "a nack must keep publish blocked");

    assert!(second.ack());
    timeout(Duration::from_secs(1), publishing)
        .await
        .expect("publish should return after the ack")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unacked_subscriber_does_not_stall_others() {
    let broker = InMemoryBroker::default();
    let mut stalled = broker.subscribe(Scope::new(), "t").await.unwrap();
    let mut healthy = broker.subscribe(Scope::new(), "t").await.unwrap();

    broker.publish("t", messages(2)).await.unwrap();

    let _held = recv(&mut stalled).await;
    for _ in 0..2 {
        recv(&mut healthy).await.ack();
    }
    assert!(
        timeout(Duration::from_millis(50), stalled.recv())
            .await
            .is_err(),
        "a subscriber receives one message at a time"
    );
}

#[tokio::test]
async fn test_persistent_broker_replays_history() {
    let broker = InMemoryBroker::new(BrokerConfig {
        persistent: true,
        ..Default::default()
    });
    let published = messages(3);
    broker.publish("events", published.clone()).await.unwrap();
    assert_eq!(broker.persisted_count("events"), 3);

    let mut late = broker.subscribe(Scope::new(), "events").await.unwrap();
    let mut replayed = Vec::new();
    for _ in 0..3 {
        let msg = recv(&mut late).await;
        msg.ack();
        replayed.push(msg.uuid.clone());
    }
    assert_eq!(replayed, vec!["uuid-0", "uuid-1", "uuid-2"]);

    timeout(Duration::from_secs(1), async {
        while broker.subscriber_count("events").await == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("subscriber should join the live registry");

    broker
        .publish("events", vec![Message::new("live", "")])
        .await
        .unwrap();
    assert_eq!(recv(&mut late).await.uuid, "live");
}

#[tokio::test]
async fn test_cancelled_scope_closes_subscription() {
    let broker = InMemoryBroker::default();
    let scope = Scope::new().child();
    let mut subscription = broker.subscribe(scope.clone(), "t").await.unwrap();
    assert_eq!(broker.subscriber_count("t").await, 1);

    scope.cancel();
    assert_closed(&mut subscription).await;

    timeout(Duration::from_secs(1), async {
        while broker.subscriber_count("t").await > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("cancelled subscriber should be removed");
}

#[tokio::test]
async fn test_dropped_subscription_is_unregistered_on_next_delivery() {
    let broker = InMemoryBroker::default();
    let dropped = broker.subscribe(Scope::new(), "t").await.unwrap();
    let mut kept = broker.subscribe(Scope::new(), "t").await.unwrap();
    assert_eq!(broker.subscriber_count("t").await, 2);

    drop(dropped);
    broker.publish("t", messages(1)).await.unwrap();
    recv(&mut kept).await.ack();

    timeout(Duration::from_secs(1), async {
        while broker.subscriber_count("t").await > 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("subscriber with a dropped subscription should be removed");

    broker.publish("t", messages(1)).await.unwrap();
    recv(&mut kept).await.ack();
    assert_eq!(broker.subscriber_count("t").await, 1);
}

#[tokio::test]
async fn test_cancelling_scope_unblocks_pending_delivery() {
    let broker = InMemoryBroker::new(BrokerConfig {
        block_publish_until_ack: true,
        ..Default::default()
    });
    let scope = Scope::new().child();
    let mut subscription = broker.subscribe(scope.clone(), "t").await.unwrap();

    let publishing = tokio::spawn({
        let broker = broker.clone();
        async move { broker.publish("t", messages(1)).await }
    });
    let _unacked = recv(&mut subscription).await;

    scope.cancel();
    timeout(Duration::from_secs(1), publishing)
        .await
        .expect("cancelling the subscriber should release the publisher")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_close_closes_subscriptions_and_is_idempotent() {
    let broker = InMemoryBroker::default();
    let mut first = broker.subscribe(Scope::new(), "a").await.unwrap();
    let mut second = broker.subscribe(Scope::new(), "b").await.unwrap();

    timeout(Duration::from_secs(1), Publisher::close(&broker))
        .await
        .expect("close should not hang")
        .unwrap();
    assert!(broker.is_closed());
    assert_closed(&mut first).await;
    assert_closed(&mut second).await;

    Subscriber::close(&broker).await.unwrap();
}

#[tokio::test]
async fn test_closed_broker_rejects_operations() {
    let broker = InMemoryBroker::default();
    Publisher::close(&broker).await.unwrap();

    let err = broker.publish("t", messages(1)).await.unwrap_err();
    assert!(matches!(err, Error::Closed));
    let err = broker.subscribe(Scope::new(), "t").await.unwrap_err();
    assert!(matches!(err, Error::Closed));
}

#[tokio::test]
async fn test_close_releases_blocked_publisher() {
    let broker = InMemoryBroker::new(BrokerConfig {
        block_publish_until_ack: true,
        ..Default::default()
    });
    let mut subscription = broker.subscribe(Scope::new(), "t").await.unwrap();

    let publishing = tokio::spawn({
        let broker = broker.clone();
        async move { broker.publish("t", messages(1)).await }
    });
    let _unacked = recv(&mut subscription).await;

    timeout(Duration::from_secs(1), Publisher::close(&broker))
        .await
        .expect("close should not wait for the ack")
        .unwrap();
    timeout(Duration::from_secs(1), publishing)
        .await
        .expect("blocked publish should return on close")
        .unwrap()
        .unwrap();
}

#[test]
fn test_broker_name() {
    let broker = InMemoryBroker::default();
    assert_eq!(Publisher::name(&broker), "InMemoryBroker");
    assert_eq!(Subscriber::name(&broker), "InMemoryBroker");
}
