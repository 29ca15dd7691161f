use std::time::Duration;

use tokio::time::timeout;

use super::{AckState, Message, Metadata, Scope, message_uuids};

fn sample() -> Message {
    let mut msg = Message::new("uuid-1", "payload");
    msg.metadata.set("name", "OrderPlaced");
    msg
}

#[test]
fn test_new_message_is_pending_without_metadata() {
    let msg = Message::new("id", "body");
    assert_eq!(msg.uuid, "id");
    assert_eq!(&msg.payload[..], b"body");
    assert!(msg.metadata.is_empty());
    assert_eq!(msg.ack_state(), AckState::Pending);
    assert!(msg.scope().value("handler_name").is_none());
}

#[test]
fn test_ack_is_idempotent_and_excludes_nack() {
    let msg = sample();
    assert!(msg.ack());
    assert!(msg.ack());
    assert!(!msg.nack());
    assert_eq!(msg.ack_state(), AckState::Acked);
}

#[test]
fn test_nack_is_idempotent_and_excludes_ack() {
    let msg = sample();
    assert!(msg.nack());
    assert!(msg.nack());
    assert!(!msg.ack());
    assert_eq!(msg.ack_state(), AckState::Nacked);
}

#[test]
fn test_clone_shares_the_delivery() {
    let msg = sample();
    let handle = msg.clone();
    assert!(handle.ack());
    assert_eq!(msg.ack_state(), AckState::Acked);
}

#[test]
fn test_copy_is_equal_but_independent() {
    let mut msg = sample();
    msg.set_scope(Scope::new().with_value("handler_name", "h"));

    let copied = msg.copy();
    assert_eq!(copied, msg);
    assert!(copied.scope().value("handler_name").is_none());

    assert!(copied.ack());
    assert_eq!(msg.ack_state(), AckState::Pending);
    assert!(msg.nack());
    assert_eq!(copied.ack_state(), AckState::Acked);
}

#[test]
fn test_equality_ignores_ack_state_and_metadata_order() {
    let mut a = Message::new("x", "p");
    a.metadata = Metadata::from_iter([("a", "1"), ("b", "2")]);
    let mut b = Message::new("x", "p");
    b.metadata.set("b", "2");
    b.metadata.set("a", "1");
    a.ack();
    b.nack();
    assert_eq!(a, b);

    b.metadata.set("c", "3");
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_acked_signal_reaches_every_waiter() {
    let msg = sample();
    let first = tokio::spawn(msg.acked());
    let second = tokio::spawn(msg.acked());

    tokio::time::sleep(Duration::from_millis(5)).await;
    msg.ack();

    timeout(Duration::from_secs(1), first)
        .await
        .expect("first waiter timed out")
        .unwrap();
    timeout(Duration::from_secs(1), second)
        .await
        .expect("second waiter timed out")
        .unwrap();
}

#[tokio::test]
async fn test_acked_signal_after_the_fact() {
    let msg = sample();
    msg.nack();
    timeout(Duration::from_millis(100), msg.nacked())
        .await
        .expect("nacked should resolve immediately");
    assert!(
        timeout(Duration::from_millis(20), msg.acked()).await.is_err(),
        "acked must never resolve after a nack"
    );
}

#[tokio::test]
async fn test_signal_outlives_message_handles() {
    let msg = sample();
    let waiter = msg.acked();
    drop(msg);
    assert!(timeout(Duration::from_millis(20), waiter).await.is_err());
}

#[test]
fn test_message_uuids_keeps_order() {
    let msgs = vec![Message::new("a", ""), Message::new("b", "")];
    assert_eq!(message_uuids(&msgs), vec!["a", "b"]);
}

#[tokio::test]
async fn test_child_scope_observes_parent_cancellation() {
    let root = Scope::new().with_value("k", "v");
    let parent = root.child();
    let child = parent.child().with_value("k2", "v2");

    assert_eq!(child.value("k"), Some("v"));
    assert_eq!(child.value("k2"), Some("v2"));
    assert!(!child.is_cancelled());

    parent.cancel();
    assert!(child.is_cancelled());
    timeout(Duration::from_millis(100), child.cancelled())
        .await
        .expect("child should observe the cancellation");
}

#[tokio::test]
async fn test_cancelling_child_leaves_parent_running() {
    let parent = Scope::new().child();
    let child = parent.child();
    child.cancel();
    assert!(child.is_cancelled());
    assert!(!parent.is_cancelled());
    assert!(
        timeout(Duration::from_millis(20), parent.cancelled())
            .await
            .is_err()
    );
}

#[test]
fn test_root_scope_cannot_be_cancelled() {
    let root = Scope::new();
    root.cancel();
    assert!(!root.is_cancelled());
}
