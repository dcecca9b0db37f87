mod common;

use common::{client, test_broker, test_endpoint};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;
use worldsync_sync::{
    ChannelEvent, ChannelFactory, ChannelState, ConnectOptions, LastWill, MemoryBroker,
    MemoryChannel, MemoryNetwork, MessageChannel, QoS, SyncError, DEFAULT_LOG_CAPACITY,
};
use worldsync_types::{Endpoint, TransportKind};

fn options(name: &str) -> ConnectOptions {
    ConnectOptions {
        endpoint: test_endpoint(),
        transport: TransportKind::Tcp,
        tls: false,
        client_id: client(name),
        client_token: None,
        keep_alive_secs: 30,
        last_will: None,
    }
}

async fn connected(broker: &MemoryBroker, name: &str) -> (MemoryChannel, UnboundedReceiver<ChannelEvent>) {
    let channel = broker.channel();
    let events = channel.take_events().unwrap();
    channel.connect(options(name)).await.unwrap();
    (channel, events)
}

/// Drains queued events, keeping only delivered messages.
fn messages(events: &mut UnboundedReceiver<ChannelEvent>) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ChannelEvent::Message { topic, payload } = event {
            out.push((topic, payload));
        }
    }
    out
}

fn states(events: &mut UnboundedReceiver<ChannelEvent>) -> Vec<ChannelState> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ChannelEvent::StateChanged { new, .. } = event {
            out.push(new);
        }
    }
    out
}

// ── Connection ──────────────────────────────────────────────────

#[tokio::test]
async fn connect_reports_state_transitions() {
    let broker = test_broker();
    let channel = broker.channel();
    let mut events = channel.take_events().unwrap();
    assert!(channel.take_events().is_none());
    assert_eq!(channel.state(), ChannelState::Disconnected);

    channel.connect(options("alice")).await.unwrap();
    assert!(channel.is_connected());
    channel.disconnect().await.unwrap();
    channel.disconnect().await.unwrap();
    assert_eq!(
        states(&mut events),
        vec![
            ChannelState::Connecting,
            ChannelState::Connected,
            ChannelState::Disconnecting,
            ChannelState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn unsupported_transport_is_refused() {
    let broker = test_broker().with_transports(&[TransportKind::Tcp]);
    let channel = broker.channel();
    let mut ws = options("alice");
    ws.transport = TransportKind::WebSocket;
    let result = channel.connect(ws).await;
    assert!(matches!(result, Err(SyncError::UnsupportedTransport(TransportKind::WebSocket))));
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn credentials_are_checked() {
    let broker = test_broker().with_credentials("alice", "secret");
    let channel = broker.channel();
    assert!(matches!(
        channel.connect(options("alice")).await,
        Err(SyncError::Network(_))
    ));

    let mut authed = options("alice");
    authed.client_token = Some("secret".into());
    channel.connect(authed).await.unwrap();
    assert_eq!(broker.connected_clients(), vec![client("alice")]);
}

#[tokio::test]
async fn network_without_broker_refuses_connection() {
    let network = MemoryNetwork::new();
    network.add_broker(Endpoint::new("up", 1883));
    let down = network
        .create_channel(&Endpoint::new("down", 1883), TransportKind::Tcp, false)
        .unwrap();
    assert!(matches!(
        down.connect(options("alice")).await,
        Err(SyncError::Network(_))
    ));
    let up = network
        .create_channel(&Endpoint::new("up", 1883), TransportKind::Tcp, false)
        .unwrap();
    up.connect(options("alice")).await.unwrap();
}

#[tokio::test]
async fn operations_need_a_connection() {
    let broker = test_broker();
    let channel = broker.channel();
    assert!(matches!(
        channel.publish("a/b", b"x".to_vec(), QoS::AtLeastOnce, false).await,
        Err(SyncError::NotConnected)
    ));
    assert!(matches!(channel.subscribe("a/#").await, Err(SyncError::NotConnected)));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn reconnecting_client_takes_over() {
    let broker = test_broker();
    let (first, mut first_events) = connected(&broker, "alice").await;
    let (_second, _) = connected(&broker, "alice").await;

    assert!(!first.is_connected());
    assert!(states(&mut first_events).contains(&ChannelState::Disconnected));
    assert_eq!(broker.connected_clients(), vec![client("alice")]);
}

// ── Routing ─────────────────────────────────────────────────────

#[tokio::test]
async fn wildcard_subscriptions_route_messages() {
    let broker = test_broker();
    let (alice, _) = connected(&broker, "alice").await;
    let (bob, mut bob_events) = connected(&broker, "bob").await;
    bob.subscribe("worlds/+/control").await.unwrap();
    bob.subscribe("worlds/s1/msg/#").await.unwrap();

    for topic in ["worlds/s1/control", "worlds/s1/msg/chat/room", "worlds/s1/entities"] {
        alice
            .publish(topic, topic.as_bytes().to_vec(), QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }

    let topics: Vec<String> = messages(&mut bob_events).into_iter().map(|(t, _)| t).collect();
    assert_eq!(topics, vec!["worlds/s1/control", "worlds/s1/msg/chat/room"]);
    assert_eq!(broker.published().len(), 3);
    assert_eq!(broker.published()[0].publisher, client("alice"));
    assert_eq!(broker.published_matching("worlds/s1/msg/#").len(), 1);
}

#[tokio::test]
async fn publishers_receive_their_own_messages() {
    let broker = test_broker();
    let (alice, mut events) = connected(&broker, "alice").await;
    alice.subscribe("t").await.unwrap();
    alice.publish("t", b"1".to_vec(), QoS::AtMostOnce, false).await.unwrap();
    assert_eq!(messages(&mut events), vec![("t".to_string(), b"1".to_vec())]);
}

#[tokio::test]
async fn wildcard_publish_is_rejected() {
    let broker = test_broker();
    let (alice, _) = connected(&broker, "alice").await;
    assert!(matches!(
        alice.publish("a/#", Vec::new(), QoS::AtLeastOnce, false).await,
        Err(SyncError::Protocol(_))
    ));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let broker = test_broker();
    let (alice, _) = connected(&broker, "alice").await;
    let (bob, mut bob_events) = connected(&broker, "bob").await;
    bob.subscribe("t").await.unwrap();
    bob.subscribe("t").await.unwrap();
    assert_eq!(broker.subscriber_count("t"), 1);

    bob.unsubscribe("t").await.unwrap();
    alice.publish("t", b"x".to_vec(), QoS::AtLeastOnce, false).await.unwrap();
    assert!(messages(&mut bob_events).is_empty());
    assert_eq!(broker.subscriber_count("t"), 0);
}

#[tokio::test]
async fn per_subscriber_order_is_kept() {
    let broker = test_broker();
    let (alice, _) = connected(&broker, "alice").await;
    let (bob, mut bob_events) = connected(&broker, "bob").await;
    bob.subscribe("t").await.unwrap();
    for i in 0..20u8 {
        alice.publish("t", vec![i], QoS::AtLeastOnce, false).await.unwrap();
    }
    let payloads: Vec<u8> = messages(&mut bob_events).into_iter().map(|(_, p)| p[0]).collect();
    assert_eq!(payloads, (0..20).collect::<Vec<u8>>());
}

#[tokio::test]
async fn denied_topics_refuse_publishes() {
    let broker = test_broker();
    let (alice, _) = connected(&broker, "alice").await;
    let (bob, mut bob_events) = connected(&broker, "bob").await;
    bob.subscribe("worlds/#").await.unwrap();

    broker.deny_publish("worlds/+/entities");
    assert!(matches!(
        alice.publish("worlds/s1/entities", b"x".to_vec(), QoS::AtLeastOnce, false).await,
        Err(SyncError::Network(_))
    ));
    alice
        .publish("worlds/s1/control", b"y".to_vec(), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    assert!(alice.is_connected());

    broker.allow_publish("worlds/+/entities");
    alice
        .publish("worlds/s1/entities", b"z".to_vec(), QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let topics: Vec<String> = messages(&mut bob_events).into_iter().map(|(t, _)| t).collect();
    assert_eq!(topics, vec!["worlds/s1/control", "worlds/s1/entities"]);
}

// ── Publish log ─────────────────────────────────────────────────

#[tokio::test]
async fn log_keeps_the_most_recent_publishes() {
    let broker = test_broker().with_log_capacity(3);
    let (alice, _) = connected(&broker, "alice").await;
    for i in 0..10u8 {
        alice.publish("t", vec![i], QoS::AtLeastOnce, false).await.unwrap();
    }
    let payloads: Vec<u8> = broker.published().iter().map(|m| m.payload[0]).collect();
    assert_eq!(payloads, vec![7, 8, 9]);
}

#[tokio::test]
async fn log_is_bounded_by_default() {
    let broker = test_broker();
    let (alice, _) = connected(&broker, "alice").await;
    for _ in 0..DEFAULT_LOG_CAPACITY + 10 {
        alice.publish("t", b"x".to_vec(), QoS::AtMostOnce, false).await.unwrap();
    }
    assert_eq!(broker.published().len(), DEFAULT_LOG_CAPACITY);
}

#[tokio::test]
async fn zero_capacity_disables_the_log() {
    let broker = test_broker().with_log_capacity(0);
    let (alice, _) = connected(&broker, "alice").await;
    let (bob, mut bob_events) = connected(&broker, "bob").await;
    bob.subscribe("t").await.unwrap();
    alice.publish("t", b"x".to_vec(), QoS::AtLeastOnce, false).await.unwrap();
    assert!(broker.published().is_empty());
    assert_eq!(messages(&mut bob_events).len(), 1);
}

// ── Retained messages ───────────────────────────────────────────

#[tokio::test]
async fn retained_messages_reach_late_subscribers() {
    let broker = test_broker();
    let (alice, _) = connected(&broker, "alice").await;
    alice
        .publish("worlds/s1/info", b"meta".to_vec(), QoS::AtLeastOnce, true)
        .await
        .unwrap();
    assert_eq!(broker.retained("worlds/s1/info"), Some(b"meta".to_vec()));

    let (bob, mut bob_events) = connected(&broker, "bob").await;
    bob.subscribe("worlds/+/info").await.unwrap();
    assert_eq!(
        messages(&mut bob_events),
        vec![("worlds/s1/info".to_string(), b"meta".to_vec())]
    );
}

#[tokio::test]
async fn empty_retained_payload_clears() {
    let broker = test_broker();
    let (alice, _) = connected(&broker, "alice").await;
    alice.publish("info", b"meta".to_vec(), QoS::AtLeastOnce, true).await.unwrap();
    alice.publish("info", Vec::new(), QoS::AtLeastOnce, true).await.unwrap();
    assert_eq!(broker.retained("info"), None);

    let (bob, mut bob_events) = connected(&broker, "bob").await;
    bob.subscribe("info").await.unwrap();
    assert!(messages(&mut bob_events).is_empty());
}

// ── Last will ───────────────────────────────────────────────────

fn with_will(name: &str) -> ConnectOptions {
    ConnectOptions {
        last_will: Some(LastWill {
            topic: "worlds/s1/control".into(),
            payload: format!("{name} gone").into_bytes(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }),
        ..options(name)
    }
}

#[tokio::test]
async fn lost_connection_publishes_last_will() {
    let broker = test_broker();
    let (watcher, mut events) = connected(&broker, "watcher").await;
    watcher.subscribe("worlds/s1/control").await.unwrap();

    let alice = broker.channel();
    let mut alice_events = alice.take_events().unwrap();
    alice.connect(with_will("alice")).await.unwrap();
    alice.drop_connection();

    assert_eq!(
        messages(&mut events),
        vec![("worlds/s1/control".to_string(), b"alice gone".to_vec())]
    );
    assert_eq!(alice.state(), ChannelState::Disconnected);
    assert!(states(&mut alice_events).contains(&ChannelState::Disconnected));
    assert_eq!(broker.published().last().unwrap().publisher, client("alice"));
}

#[tokio::test]
async fn graceful_disconnect_skips_last_will() {
    let broker = test_broker();
    let (watcher, mut events) = connected(&broker, "watcher").await;
    watcher.subscribe("worlds/s1/control").await.unwrap();

    let alice = broker.channel();
    alice.connect(with_will("alice")).await.unwrap();
    alice.disconnect().await.unwrap();
    assert!(messages(&mut events).is_empty());
}

#[tokio::test]
async fn broker_side_disconnect_can_fire_last_will() {
    let broker = test_broker();
    let (watcher, mut events) = connected(&broker, "watcher").await;
    watcher.subscribe("worlds/s1/control").await.unwrap();

    let alice = broker.channel();
    let mut alice_events = alice.take_events().unwrap();
    alice.connect(with_will("alice")).await.unwrap();

    assert!(broker.disconnect_client(&client("alice"), true));
    assert!(!broker.disconnect_client(&client("alice"), true));
    assert_eq!(messages(&mut events).len(), 1);
    assert!(!alice.is_connected());

    let mut errors = 0;
    while let Ok(event) = alice_events.try_recv() {
        if matches!(event, ChannelEvent::Error(_)) {
            errors += 1;
        }
    }
    assert_eq!(errors, 1);
}
