//! Reconnection supervision tests.

use crate::support::{next_test_port, test_relay_url, MockRelay, MockRelayConfig, TestSigner};
use nostr_engine::{Engine, EngineConfig, HealthStatus};
use std::sync::Arc;
use std::time::Duration;

fn supervised_engine() -> Engine {
    let mut config = EngineConfig::default();
    config.supervisor.short_interval = Duration::from_millis(100);
    config.relay.dial_timeout = Duration::from_millis(500);
    config.coordinator.per_relay_timeout = Duration::from_millis(700);
    Engine::new(Arc::new(TestSigner::new("alice")), config)
}

#[tokio::test]
async fn test_supervisor_recovers_when_relay_comes_back() {
    let port = next_test_port();
    let url = test_relay_url(port);
    let engine = supervised_engine();

    // Nothing is listening yet; supervision starts failing immediately.
    let (tx, rx) = tokio::sync::oneshot::channel();
    engine
        .ensure_healthy(&url, move || {
            let _ = tx.send(());
        })
        .await
        .unwrap();

    let health = engine.health(&url).await.unwrap();
    assert_eq!(health.status, HealthStatus::Reconnecting);

    tokio::time::sleep(Duration::from_millis(350)).await;
    let health = engine.health(&url).await.unwrap();
    assert_eq!(health.status, HealthStatus::Reconnecting);
    assert!(health.consecutive_failed_attempts >= 1);

    // Bring the relay up on the exact port; the next tick should find it.
    let _relay = MockRelay::start_on(port, MockRelayConfig::default()).await;
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("recovery callback should fire")
        .unwrap();

    let health = engine.health(&url).await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.consecutive_failed_attempts, 0);
    assert!(health.last_recovered_at.is_some());
}

#[tokio::test]
async fn test_callback_fires_immediately_when_already_open() {
    let relay = MockRelay::start(MockRelayConfig::default()).await;
    let engine = supervised_engine();
    engine.connect(&relay.url).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    engine
        .ensure_healthy(&relay.url, move || {
            let _ = tx.send(());
        })
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_millis(100), rx)
        .await
        .expect("callback should fire without a retry cycle")
        .unwrap();

    let health = engine.health(&relay.url).await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_waiters_accumulate_until_recovery() {
    let port = next_test_port();
    let url = test_relay_url(port);
    let engine = supervised_engine();

    let (tx_a, rx_a) = tokio::sync::oneshot::channel();
    let (tx_b, rx_b) = tokio::sync::oneshot::channel();
    engine
        .ensure_healthy(&url, move || {
            let _ = tx_a.send(());
        })
        .await
        .unwrap();
    engine
        .ensure_healthy(&url, move || {
            let _ = tx_b.send(());
        })
        .await
        .unwrap();

    let _relay = MockRelay::start_on(port, MockRelayConfig::default()).await;
    tokio::time::timeout(Duration::from_secs(5), rx_a)
        .await
        .expect("first waiter")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx_b)
        .await
        .expect("second waiter")
        .unwrap();
}
