#[macro_use]
mod common;

use common::{SESSION, init_tracing, test_broker};
use std::sync::{Arc, Mutex};
use worldsync_sync::entity_model::memory::MemoryEntityModel;
use worldsync_sync::{MemoryBroker, SessionRequest, SynchronizationManager, WorldSync};
use worldsync_types::{EntityId, Transform, Vector3};

struct App {
    api: WorldSync,
    model: Arc<MemoryEntityModel>,
}

fn app(broker: &MemoryBroker) -> App {
    let model = Arc::new(MemoryEntityModel::new());
    let manager = SynchronizationManager::new(Arc::new(broker.clone()), model.clone());
    App {
        api: WorldSync::new(manager),
        model,
    }
}

fn request(name: &str) -> SessionRequest {
    SessionRequest {
        host: "test".into(),
        port: 1883,
        transport: "tcp".into(),
        session_id: SESSION.into(),
        session_tag: "lobby".into(),
        user_tag: format!("{name} tag"),
        client_id: Some(name.into()),
        ..Default::default()
    }
}

async fn joined(app: &App, name: &str) -> String {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let client_id = app
        .api
        .join_session(&request(name), move |joined| {
            let _ = tx.send(joined);
        })
        .await
        .unwrap();
    assert!(rx.await.unwrap().is_some());
    client_id
}

// ── Input validation ────────────────────────────────────────────

#[tokio::test]
async fn malformed_ids_are_rejected() {
    init_tracing();
    let broker = test_broker();
    let alice = app(&broker);

    let mut bad = request("alice");
    bad.session_id = "not-a-uuid".into();
    assert_eq!(alice.api.create_session(&bad).await, None);
    assert!(alice.api.manager().is_empty());

    assert!(!alice.api.destroy_session("not-a-uuid").await);
    assert!(!alice.api.exit_session("").await);
    assert!(!alice.api.is_session_established("xyz").await);
    assert!(!alice.api.send_message("xyz", "chat", "hi").await);
    assert!(alice.api.add_message_listener("xyz", |_, _, _| {}).is_none());
}

#[tokio::test]
async fn unknown_transport_is_rejected() {
    let broker = test_broker();
    let alice = app(&broker);
    let mut bad = request("alice");
    bad.transport = "carrier-pigeon".into();
    assert_eq!(alice.api.create_session(&bad).await, None);
    assert_eq!(alice.api.join_session(&bad, |_| {}).await, None);
    assert!(broker.connected_clients().is_empty());
}

#[tokio::test]
async fn transport_names_are_case_insensitive() {
    let broker = test_broker();
    let alice = app(&broker);
    let mut req = request("alice");
    req.transport = "WebSocket".into();
    assert_eq!(alice.api.create_session(&req).await.as_deref(), Some(SESSION));
}

#[tokio::test]
async fn unknown_session_operations_fail() {
    let broker = test_broker();
    let alice = app(&broker);
    assert!(!alice.api.destroy_session(SESSION).await);
    assert!(!alice.api.exit_session(SESSION).await);
    assert!(!alice.api.is_session_established(SESSION).await);
    assert_eq!(alice.api.get_user_tag(SESSION, "bob").await, None);
}

// ── Sessions ────────────────────────────────────────────────────

#[tokio::test]
async fn create_then_destroy() {
    let broker = test_broker();
    let alice = app(&broker);
    assert_eq!(
        alice.api.create_session(&request("alice")).await.as_deref(),
        Some(SESSION)
    );
    assert!(alice.api.is_session_established(SESSION).await);
    assert_eq!(alice.api.create_session(&request("alice")).await, None);

    assert!(alice.api.destroy_session(SESSION).await);
    assert!(!alice.api.is_session_established(SESSION).await);
    assert!(!alice.api.destroy_session(SESSION).await);
}

#[tokio::test]
async fn join_reports_client_id_and_tags() {
    let broker = test_broker();
    let alice = app(&broker);
    let bob = app(&broker);
    alice.api.create_session(&request("alice")).await.unwrap();

    assert_eq!(joined(&bob, "bob").await, "bob");
    assert_eq!(
        bob.api.get_user_tag(SESSION, "alice").await.as_deref(),
        Some("alice tag")
    );
    assert_eq!(bob.api.get_user_tag(SESSION, "carol").await, None);
    assert_eq!(bob.api.get_user_tag(SESSION, "bad id").await, None);
}

#[tokio::test]
async fn failed_join_reports_none() {
    let broker = test_broker().with_credentials("bob", "secret");
    let bob = app(&broker);
    let mut req = request("bob");
    req.client_token = Some("wrong".into());
    assert_eq!(bob.api.join_session(&req, |_| {}).await, None);
    assert!(bob.api.manager().is_empty());
}

#[tokio::test]
async fn disconnect_closes_endpoint_sessions() {
    let broker = test_broker();
    let alice = app(&broker);
    alice.api.create_session(&request("alice")).await.unwrap();
    assert_eq!(alice.api.disconnect("test", 1883).await, 1);
    assert!(!alice.api.is_session_established(SESSION).await);
    assert_eq!(alice.api.disconnect("test", 1883).await, 0);
}

// ── Entities ────────────────────────────────────────────────────

#[tokio::test]
async fn entity_lifecycle_through_text_ids() {
    let broker = test_broker();
    let alice = app(&broker);
    let bob = app(&broker);
    alice.api.create_session(&request("alice")).await.unwrap();
    joined(&bob, "bob").await;

    let id = EntityId::new();
    alice
        .model
        .spawn(id, Transform::at(Vector3::new(1.0, 0.0, 0.0)));
    let text = id.to_string();
    assert!(
        alice
            .api
            .start_synchronizing_entity(
                SESSION,
                &text,
                true,
                Some("models/chair.glb".into()),
                None
            )
            .await
    );
    assert!(eventually!(bob.model.contains(&id)));
    assert_eq!(
        bob.model.get(&id).unwrap().manifest.unwrap().file_path,
        "models/chair.glb"
    );

    alice
        .model
        .set_transform(&id, Transform::at(Vector3::new(2.0, 0.0, 0.0)));
    assert!(alice.api.update_entity(SESSION, &text).await);
    assert!(eventually!(
        bob.model.get(&id).unwrap().transform.position == Vector3::new(2.0, 0.0, 0.0)
    ));

    assert!(!bob.api.stop_synchronizing_entity(SESSION, &text).await);
    assert!(alice.api.stop_synchronizing_entity(SESSION, &text).await);
    assert!(eventually!(!bob.model.contains(&id)));
    assert!(!alice.api.stop_synchronizing_entity(SESSION, &text).await);
}

#[tokio::test]
async fn malformed_entity_ids_are_rejected() {
    let broker = test_broker();
    let alice = app(&broker);
    alice.api.create_session(&request("alice")).await.unwrap();
    assert!(
        !alice
            .api
            .start_synchronizing_entity(SESSION, "nope", true, None, None)
            .await
    );
    assert!(!alice.api.update_entity(SESSION, "nope").await);
    assert!(!alice.api.stop_synchronizing_entity(SESSION, "nope").await);
}

// ── Messaging ───────────────────────────────────────────────────

#[tokio::test]
async fn messages_reach_listeners() {
    let broker = test_broker();
    let alice = app(&broker);
    let bob = app(&broker);
    alice.api.create_session(&request("alice")).await.unwrap();
    joined(&bob, "bob").await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let listener = bob
        .api
        .add_message_listener(SESSION, move |topic, sender, message| {
            sink.lock()
                .unwrap()
                .push((topic.to_string(), sender.to_string(), message.to_string()));
        })
        .unwrap();

    assert!(alice.api.send_message(SESSION, "chat/room", "hello").await);
    assert!(eventually!(received.lock().unwrap().len() == 1));
    assert_eq!(
        received.lock().unwrap()[0],
        ("chat/room".into(), "alice".into(), "hello".into())
    );

    assert!(bob.api.remove_message_listener(SESSION, listener));
    assert!(!bob.api.remove_message_listener(SESSION, listener));
}

#[tokio::test]
async fn send_after_exit_fails() {
    let broker = test_broker();
    let alice = app(&broker);
    alice.api.create_session(&request("alice")).await.unwrap();
    assert!(alice.api.exit_session(SESSION).await);
    assert!(!alice.api.send_message(SESSION, "chat", "hello").await);
}
