//! Real `MqttSession` against an in-process broker
//!
//! Covers the publish acknowledgement path, packet size limits, the
//! configured connect timeout and subscription resumption after the broker
//! forgets the session.

mod fake_broker;

use fake_broker::{Behaviour, FakeBroker, Received};
use futures::future::join_all;
use mqtt_messenger::config::BrokerAddress;
use mqtt_messenger::session::build_session_options;
use mqtt_messenger::transport::mqtt::SessionCallbacks;
use mqtt_messenger::{
    new_persistent_session, ClientConfig, Message, MessagingError, Messenger, MqttSession,
    Publisher, QoS, SessionClient, SessionSettings, Subscriber, SubscriptionFilters,
    TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);
/// Above the 10 KiB the MQTT client library allows by default
const LARGE_PAYLOAD: usize = 20 * 1024;

fn settings_for(broker: &FakeBroker) -> SessionSettings {
    SessionSettings {
        address: BrokerAddress::new("127.0.0.1", Some(broker.port())),
        connection_timeout: Duration::from_secs(2),
        max_reconnect_interval: Duration::from_millis(100),
        write_timeout: Duration::from_secs(3),
        ..Default::default()
    }
}

async fn connected(broker: &FakeBroker, config: ClientConfig) -> Messenger<MqttSession> {
    let session = new_persistent_session(config, &settings_for(broker)).unwrap();
    session.connect().await.unwrap();
    Messenger::new(Arc::new(session))
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn published(log: &[Received], wanted_topic: &str) -> Vec<(u8, Vec<u8>)> {
    log.iter()
        .filter_map(|packet| match packet {
            Received::Publish {
                topic, qos, payload, ..
            } if topic == wanted_topic => Some((*qos, payload.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_qos0_publish_reaches_broker() {
    let broker = FakeBroker::start().await;
    let messenger = connected(&broker, ClientConfig::new("qos0-publisher")).await;

    messenger
        .publish("sensors/1/temp", b"21.5", QoS::AtMostOnce, false)
        .await
        .unwrap();

    assert!(
        broker
            .wait_until(WAIT, |log| published(log, "sensors/1/temp") == [(0, b"21.5".to_vec())])
            .await
    );
    messenger.client().disconnect().await.unwrap();
}

#[tokio::test]
async fn test_qos1_and_qos2_publish_wait_for_broker_acknowledgement() {
    let broker = FakeBroker::start().await;
    let messenger = connected(&broker, ClientConfig::new("acked-publisher")).await;

    messenger
        .publish("orders/1", b"created", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    messenger
        .publish("orders/2", b"created", QoS::ExactlyOnce, false)
        .await
        .unwrap();

    let log = broker.received();
    assert_eq!(published(&log, "orders/1"), [(1, b"created".to_vec())]);
    assert_eq!(published(&log, "orders/2"), [(2, b"created".to_vec())]);
    // Exactly-once completes only after the PUBREC/PUBREL/PUBCOMP exchange
    assert!(log
        .iter()
        .any(|packet| matches!(packet, Received::PubRel { .. })));
    messenger.client().disconnect().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_publishers_receive_their_own_acknowledgements() {
    const PUBLISHERS: usize = 8;
    let broker = FakeBroker::with_behaviour(Behaviour {
        batch_acks: PUBLISHERS,
        ..Default::default()
    })
    .await;
    let messenger = connected(&broker, ClientConfig::new("concurrent-publisher")).await;

    // The broker answers only once all are in flight, newest first
    let results = join_all((0..PUBLISHERS).map(|n| {
        let messenger = messenger.clone();
        async move {
            let payload = format!("reading-{n}");
            messenger
                .publish("meters/batch", payload.as_bytes(), QoS::AtLeastOnce, false)
                .await
        }
    }))
    .await;

    for result in &results {
        assert!(result.is_ok(), "publish failed: {result:?}");
    }
    let mut payloads: Vec<Vec<u8>> = published(&broker.received(), "meters/batch")
        .into_iter()
        .map(|(_, payload)| payload)
        .collect();
    payloads.sort();
    payloads.dedup();
    assert_eq!(payloads.len(), PUBLISHERS);
    messenger.client().disconnect().await.unwrap();
}

#[tokio::test]
async fn test_large_publish_keeps_connection_and_later_acks_line_up() {
    let broker = FakeBroker::start().await;
    let lost = counter();
    let lost_hook = lost.clone();
    let config = ClientConfig::new("large-publisher").on_connection_lost(move |_| {
        lost_hook.fetch_add(1, Ordering::SeqCst);
    });
    let messenger = connected(&broker, config).await;

    messenger
        .publish("bulk/upload", &vec![0xab; LARGE_PAYLOAD], QoS::AtLeastOnce, false)
        .await
        .unwrap();
    messenger
        .publish("bulk/small", b"1", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    messenger
        .publish("bulk/small", b"2", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let log = broker.received();
    let uploads = published(&log, "bulk/upload");
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].1.len(), LARGE_PAYLOAD);
    assert_eq!(published(&log, "bulk/small").len(), 2);
    assert_eq!(broker.connections(), 1);
    assert_eq!(lost.load(Ordering::SeqCst), 0);
    messenger.client().disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_over_configured_limit_fails_without_dropping_connection() {
    let broker = FakeBroker::start().await;
    let mut options =
        build_session_options(&ClientConfig::new("limited"), &settings_for(&broker)).unwrap();
    options.max_packet_size = 1024;
    let session = MqttSession::new(options, SessionCallbacks::default()).unwrap();
    session.connect().await.unwrap();
    let messenger = Messenger::new(Arc::new(session));

    let result = messenger
        .publish("bulk/upload", &[0u8; 4096], QoS::AtLeastOnce, false)
        .await;
    assert!(matches!(
        result,
        Err(MessagingError::Transport(TransportError::PayloadTooLarge { max: 1024, .. }))
    ));

    messenger
        .publish("bulk/small", b"ok", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let log = broker.received();
    assert!(published(&log, "bulk/upload").is_empty());
    assert_eq!(published(&log, "bulk/small").len(), 1);
    assert_eq!(broker.connections(), 1);
    messenger.client().disconnect().await.unwrap();
}

#[tokio::test]
async fn test_large_inbound_message_is_delivered() {
    let broker = FakeBroker::start().await;
    let messenger = connected(&broker, ClientConfig::new("large-subscriber")).await;

    let received = Arc::new(Mutex::new(Vec::<Message>::new()));
    let sink = received.clone();
    messenger.subscribe(
        "bulk/#",
        QoS::AtMostOnce,
        Arc::new(move |message: Message| sink.lock().unwrap().push(message)),
    );
    assert!(
        broker
            .wait_until(WAIT, |log| log
                .iter()
                .any(|packet| matches!(packet, Received::Subscribe { .. })))
            .await
    );

    broker.deliver("bulk/download", vec![0x5a; LARGE_PAYLOAD]);

    for _ in 0..200 {
        if !received.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let messages = received.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic(), "bulk/download");
    assert_eq!(messages[0].payload().len(), LARGE_PAYLOAD);
    assert_eq!(broker.connections(), 1);
    messenger.client().disconnect().await.unwrap();
}

#[tokio::test]
async fn test_subscriptions_resume_after_reconnect_without_stored_session() {
    let broker = FakeBroker::start().await;
    let connects = counter();
    let lost = counter();
    let (connect_hook, lost_hook) = (connects.clone(), lost.clone());
    let config = ClientConfig::new("resuming-subscriber")
        .on_connect(move || {
            connect_hook.fetch_add(1, Ordering::SeqCst);
        })
        .on_connection_lost(move |_| {
            lost_hook.fetch_add(1, Ordering::SeqCst);
        });
    let messenger = connected(&broker, config).await;

    messenger.subscribe("alerts/+", QoS::AtLeastOnce, Arc::new(|_: Message| {}));
    let filters: SubscriptionFilters = [
        ("metrics/#".to_string(), QoS::AtMostOnce),
        ("status/device-1".to_string(), QoS::ExactlyOnce),
    ]
    .into_iter()
    .collect();
    messenger.subscribe_multiple(filters, Arc::new(|_: Message| {}));

    let mut expected = vec![
        ("alerts/+".to_string(), 1u8),
        ("metrics/#".to_string(), 0),
        ("status/device-1".to_string(), 2),
    ];
    expected.sort();
    assert!(
        broker
            .wait_until(WAIT, |log| subscribed_since_last_connect(log) == expected)
            .await
    );

    broker.drop_connections();

    // The broker answers the reconnect with session_present = 0
    assert!(
        broker
            .wait_until(WAIT, |log| {
                connect_count(log) == 2 && subscribed_since_last_connect(log) == expected
            })
            .await,
        "filters were not re-sent: {:?}",
        broker.received()
    );
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(lost.load(Ordering::SeqCst), 1);
    messenger.client().disconnect().await.unwrap();
}

fn connect_count(log: &[Received]) -> usize {
    log.iter()
        .filter(|packet| matches!(packet, Received::Connect { .. }))
        .count()
}

fn subscribed_since_last_connect(log: &[Received]) -> Vec<(String, u8)> {
    let start = log
        .iter()
        .rposition(|packet| matches!(packet, Received::Connect { .. }))
        .map_or(0, |index| index + 1);
    let mut filters: Vec<(String, u8)> = log[start..]
        .iter()
        .filter_map(|packet| match packet {
            Received::Subscribe { filters, .. } => Some(filters.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    filters.sort();
    filters
}

#[tokio::test]
async fn test_connect_timeout_above_transport_default_is_honoured() {
    let broker = FakeBroker::with_behaviour(Behaviour {
        silent: true,
        ..Default::default()
    })
    .await;
    let settings = SessionSettings {
        connection_timeout: Duration::from_secs(7),
        ..settings_for(&broker)
    };
    let session = new_persistent_session(ClientConfig::new("patient"), &settings).unwrap();

    // Past the 5s transport default but inside the configured 7s
    let outcome = tokio::time::timeout(Duration::from_secs(6), session.connect()).await;
    assert!(outcome.is_err(), "connect finished early: {outcome:?}");
    assert_eq!(broker.connections(), 1);

    session.disconnect().await.unwrap();
}
