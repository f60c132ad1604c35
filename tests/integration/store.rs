//! Encrypted key/value store tests.

use crate::support::{seeded_entry, MockRelay, MockRelayConfig, TestSigner};
use nostr_engine::{Engine, EngineConfig, EngineError, EventTemplate, Signer};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn test_engine(signer: Arc<dyn Signer>) -> Engine {
    let mut config = EngineConfig::default();
    config.coordinator.per_relay_timeout = Duration::from_millis(700);
    Engine::new(signer, config)
}

#[tokio::test]
async fn test_put_then_get_round_trips() {
    let relay = MockRelay::start(MockRelayConfig::default()).await;
    let engine = test_engine(Arc::new(TestSigner::new("alice")));
    let relays = vec![relay.url.clone()];

    let value = json!({"theme": "dark", "fontSize": 14});
    let confirmed = engine
        .app_data()
        .put("settings", &value, &relays)
        .await
        .unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].origin, format!("{}/", relay.url));

    let entry = engine
        .app_data()
        .get("settings", &relays)
        .await
        .unwrap()
        .expect("entry should resolve");
    assert_eq!(entry.value, value);
    assert_eq!(entry.event.kind, 30078);
    assert_eq!(entry.found_on, vec![format!("{}/", relay.url)]);

    // The relay only ever saw ciphertext.
    let stored = relay.stored();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].content.starts_with("v1:"));
    assert!(!stored[0].content.contains("dark"));
}

#[tokio::test]
async fn test_get_resolves_newest_version_across_relays() {
    let signer = TestSigner::new("alice");
    let older = seeded_entry(&signer, "profile", &json!({"v": 1}), 100).await;
    let newer = seeded_entry(&signer, "profile", &json!({"v": 2}), 200).await;

    let relay_a = MockRelay::start(MockRelayConfig {
        seeded: vec![older],
        ..Default::default()
    })
    .await;
    let relay_b = MockRelay::start(MockRelayConfig {
        seeded: vec![newer.clone()],
        ..Default::default()
    })
    .await;

    let engine = test_engine(Arc::new(TestSigner::new("alice")));
    let relays = vec![relay_a.url.clone(), relay_b.url.clone()];
    let entry = engine
        .app_data()
        .get("profile", &relays)
        .await
        .unwrap()
        .expect("entry should resolve");

    assert_eq!(entry.value, json!({"v": 2}));
    assert_eq!(entry.event.id, newer.id);
    assert_eq!(entry.found_on, vec![format!("{}/", relay_b.url)]);
}

#[tokio::test]
async fn test_delete_hides_the_entry() {
    let relay = MockRelay::start(MockRelayConfig::default()).await;
    let engine = test_engine(Arc::new(TestSigner::new("alice")));
    let relays = vec![relay.url.clone()];

    engine
        .app_data()
        .put("scratch", &json!("temp"), &relays)
        .await
        .unwrap();
    assert!(engine
        .app_data()
        .get("scratch", &relays)
        .await
        .unwrap()
        .is_some());

    let confirmed = engine.app_data().delete("scratch", &relays).await.unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].event.kind, 5);

    let entry = engine.app_data().get("scratch", &relays).await.unwrap();
    assert!(entry.is_none());
}

#[tokio::test]
async fn test_entries_are_scoped_by_name() {
    let relay = MockRelay::start(MockRelayConfig::default()).await;
    let engine = test_engine(Arc::new(TestSigner::new("alice")));
    let relays = vec![relay.url.clone()];

    engine
        .app_data()
        .put("one", &json!(1), &relays)
        .await
        .unwrap();
    engine
        .app_data()
        .put("two", &json!(2), &relays)
        .await
        .unwrap();

    let one = engine.app_data().get("one", &relays).await.unwrap().unwrap();
    let two = engine.app_data().get("two", &relays).await.unwrap().unwrap();
    assert_eq!(one.value, json!(1));
    assert_eq!(two.value, json!(2));
    assert!(engine
        .app_data()
        .get("three", &relays)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_get_with_no_relays_is_none() {
    let engine = test_engine(Arc::new(TestSigner::new("alice")));
    assert!(engine.app_data().get("anything", &[]).await.unwrap().is_none());
    let confirmed = engine
        .app_data()
        .put("anything", &json!(true), &[])
        .await
        .unwrap();
    assert!(confirmed.is_empty());
}

#[tokio::test]
async fn test_unreadable_payload_is_a_decryption_failure() {
    let signer = TestSigner::new("alice");
    let garbled = signer
        .sign(EventTemplate {
            created_at: 100,
            kind: 30078,
            tags: vec![vec!["d".to_string(), "settings".to_string()]],
            content: "not-a-versioned-payload".to_string(),
        })
        .await
        .unwrap();

    let relay = MockRelay::start(MockRelayConfig {
        seeded: vec![garbled],
        ..Default::default()
    })
    .await;

    let engine = test_engine(Arc::new(TestSigner::new("alice")));
    let result = engine.app_data().get("settings", &[relay.url.clone()]).await;
    assert!(matches!(result, Err(EngineError::Decryption(_))));
}
