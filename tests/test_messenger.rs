//! Messenger facade tests against the in-memory session

use mqtt_messenger::testing::MockSession;
use mqtt_messenger::{
    Message, MessagingError, Messenger, PublishSubscriber, Publisher, QoS, SessionClient,
    Subscriber, SubscriptionFilters, TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn recording_callback() -> (Arc<Mutex<Vec<String>>>, Arc<dyn Fn(Message) + Send + Sync>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback = Arc::new(move |message: Message| {
        sink.lock().unwrap().push(message.topic().to_string());
    });
    (seen, callback)
}

#[tokio::test]
async fn test_empty_topic_never_reaches_session() {
    let session = Arc::new(MockSession::new("publisher"));
    let messenger = Messenger::new(session.clone());

    let result = messenger.publish("", b"x", QoS::AtMostOnce, false).await;

    assert!(matches!(result, Err(MessagingError::InvalidArgument { .. })));
    assert_eq!(session.publish_calls(), 0);
}

#[tokio::test]
async fn test_ack_failure_is_returned_to_caller() {
    let failure = TransportError::AckTimeout {
        topic: "a/b".to_string(),
        timeout: Duration::from_secs(5),
    };
    let session = Arc::new(MockSession::new("publisher").with_ack_failure(failure.clone()));
    let messenger = Messenger::new(session.clone());

    let result = messenger.publish("a/b", b"x", QoS::ExactlyOnce, false).await;

    match result {
        Err(MessagingError::Transport(error)) => assert_eq!(error, failure),
        other => panic!("expected transport error, got {other:?}"),
    }
    // No retries
    assert_eq!(session.publish_calls(), 1);
}

#[tokio::test]
async fn test_subscribe_multiple_delivers_once() {
    let session = Arc::new(MockSession::new("subscriber"));
    let messenger = Messenger::new(session.clone());
    let (seen, callback) = recording_callback();

    let filters: SubscriptionFilters = [
        ("a/1".to_string(), QoS::AtMostOnce),
        ("a/2".to_string(), QoS::AtLeastOnce),
    ]
    .into_iter()
    .collect();
    messenger.subscribe_multiple(filters, callback);

    assert_eq!(session.subscription_calls(), 1);
    assert_eq!(session.deliver("a/1", "hello"), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["a/1".to_string()]);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let session = Arc::new(MockSession::new("subscriber"));
    let messenger = Messenger::new(session.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    messenger.subscribe(
        "a/#",
        QoS::AtMostOnce,
        Arc::new(move |_: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    session.deliver("a/b", "1");
    messenger.unsubscribe(&["a/#"]);
    session.deliver("a/b", "2");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.unsubscribed(), vec!["a/#".to_string()]);
}

#[tokio::test]
async fn test_messenger_is_usable_through_capability_traits() {
    async fn announce(publisher: &dyn Publisher) -> Result<(), MessagingError> {
        publisher
            .publish("hello", b"world", QoS::AtMostOnce, false)
            .await
    }

    fn both<T: PublishSubscriber>(_: &T) {}

    let session = Arc::new(MockSession::new("facade"));
    let messenger = Messenger::new(session.clone());
    both(&messenger);

    announce(&messenger).await.unwrap();
    assert_eq!(session.publish_calls(), 1);
    assert_eq!(messenger.client().client_id(), "facade");
}
