//! Fan-out query, publish and auth tests against mock relays.

use crate::support::{MockRelay, MockRelayConfig, TestSigner};
use nostr_engine::{Engine, EngineConfig, EngineError, EventTemplate, Filter, Signer};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_engine(signer: Arc<dyn Signer>, window: Duration) -> Engine {
    let mut config = EngineConfig::default();
    config.coordinator.per_relay_timeout = window;
    Engine::new(signer, config)
}

async fn note(signer: &TestSigner, content: &str, created_at: u64) -> nostr_engine::Event {
    signer
        .sign(EventTemplate {
            created_at,
            kind: 1,
            tags: vec![],
            content: content.to_string(),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_query_fans_in_across_relays_with_one_silent() {
    let signer = TestSigner::new("alice");
    let e1 = note(&signer, "from relay a", 100).await;
    let e2 = note(&signer, "from relay b", 200).await;

    let relay_a = MockRelay::start(MockRelayConfig {
        seeded: vec![e1.clone()],
        ..Default::default()
    })
    .await;
    let relay_b = MockRelay::start(MockRelayConfig {
        seeded: vec![e2.clone()],
        ..Default::default()
    })
    .await;
    let silent = MockRelay::start(MockRelayConfig {
        silent: true,
        ..Default::default()
    })
    .await;

    let window = Duration::from_millis(700);
    let engine = test_engine(Arc::new(TestSigner::new("alice")), window);
    let relays = vec![relay_a.url.clone(), relay_b.url.clone(), silent.url.clone()];

    let started = Instant::now();
    let mut stream = engine.query(vec![Filter::new().kinds(vec![1])], &relays);

    let mut collected = Vec::new();
    let mut saw_end = false;
    while let Some(update) = stream.next().await {
        if update.end_of_stream {
            assert!(update.events.is_empty());
            saw_end = true;
            break;
        }
        collected.extend(update.events);
    }
    let elapsed = started.elapsed();

    assert!(saw_end);
    let mut ids: Vec<&str> = collected.iter().map(|re| re.event.id.as_str()).collect();
    ids.sort_unstable();
    let mut expected = [e1.id.as_str(), e2.id.as_str()];
    expected.sort_unstable();
    assert_eq!(ids, expected);

    // The silent relay holds the barrier for its full window, no longer.
    assert!(elapsed >= window);
    assert!(elapsed < window + Duration::from_secs(2));

    // Everything observed landed in the shared cache with provenance.
    let sources = engine.cache().sources_for(&e1.id);
    assert_eq!(sources, vec![format!("{}/", relay_a.url)]);
}

#[tokio::test]
async fn test_publish_confirms_only_on_accepting_relays() {
    let signer = TestSigner::new("alice");
    let event = note(&signer, "hello relays", 100).await;

    let accepting = MockRelay::start(MockRelayConfig::default()).await;
    let dropping = MockRelay::start(MockRelayConfig {
        drop_publishes: true,
        ..Default::default()
    })
    .await;

    let engine = test_engine(
        Arc::new(TestSigner::new("alice")),
        Duration::from_millis(700),
    );
    let relays = vec![accepting.url.clone(), dropping.url.clone()];
    let confirmed = engine.publish(&event, &relays).await;

    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].origin, format!("{}/", accepting.url));
    assert_eq!(confirmed[0].event.id, event.id);

    assert!(accepting.stored().iter().any(|e| e.id == event.id));
    assert!(dropping.stored().is_empty());
}

#[tokio::test]
async fn test_auth_handshake_runs_on_auth_required_relay() {
    let relay = MockRelay::start(MockRelayConfig {
        auth_required: true,
        send_challenge: true,
        ..Default::default()
    })
    .await;

    let signer = Arc::new(TestSigner::new("alice"));
    let pubkey = signer.pubkey();
    let engine = test_engine(signer, Duration::from_secs(2));
    engine.connect(&relay.url).await.unwrap();

    let auth_events = relay.auth_events();
    assert_eq!(auth_events.len(), 1);
    let auth = &auth_events[0];
    assert_eq!(auth.kind, 22242);
    assert_eq!(auth.pubkey, pubkey);
    assert_eq!(auth.tag_value("challenge"), Some(relay.challenge()));
    assert_eq!(auth.tag_value("relay"), Some(format!("{}/", relay.url).as_str()));
}

#[tokio::test]
async fn test_auth_handshake_runs_once_per_session() {
    let relay = MockRelay::start(MockRelayConfig {
        auth_required: true,
        send_challenge: true,
        ..Default::default()
    })
    .await;

    let engine = test_engine(Arc::new(TestSigner::new("alice")), Duration::from_secs(2));
    engine.connect(&relay.url).await.unwrap();

    // Every request re-enters connect/ensure_ready; none of them may
    // trigger another signature and AUTH round-trip.
    let relays = vec![relay.url.clone()];
    for _ in 0..2 {
        let mut stream = engine.query(vec![Filter::new().kinds(vec![1])], &relays);
        while let Some(update) = stream.next().await {
            if update.end_of_stream {
                break;
            }
        }
    }

    assert_eq!(relay.auth_events().len(), 1);
}

#[tokio::test]
async fn test_auth_required_without_challenge_times_out() {
    let relay = MockRelay::start(MockRelayConfig {
        auth_required: true,
        send_challenge: false,
        ..Default::default()
    })
    .await;

    let mut config = EngineConfig::default();
    config.negotiator.auth_timeout = Duration::from_millis(300);
    let engine = Engine::new(Arc::new(TestSigner::new("alice")), config);

    let result = engine.connect(&relay.url).await;
    assert!(matches!(result, Err(EngineError::AuthTimeout(_))));
}

#[tokio::test]
async fn test_closing_the_stream_cancels_the_request() {
    let silent = MockRelay::start(MockRelayConfig {
        silent: true,
        ..Default::default()
    })
    .await;

    let engine = test_engine(Arc::new(TestSigner::new("alice")), Duration::from_secs(10));
    let mut stream = engine.query(
        vec![Filter::new().kinds(vec![1])],
        &[silent.url.clone()],
    );
    stream.close();

    // Delivery stops well before the relay's window would have expired.
    let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("cancelled stream should end promptly");
    assert!(next.is_none());
}

#[tokio::test]
async fn test_resolve_replaceable_picks_newest_across_relays() {
    let signer = TestSigner::new("alice");
    let pubkey = signer.pubkey();
    let older = signer
        .sign(EventTemplate {
            created_at: 100,
            kind: 10002,
            tags: vec![],
            content: "old relay list".to_string(),
        })
        .await
        .unwrap();
    let newer = signer
        .sign(EventTemplate {
            created_at: 200,
            kind: 10002,
            tags: vec![],
            content: "new relay list".to_string(),
        })
        .await
        .unwrap();

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

    let engine = test_engine(
        Arc::new(TestSigner::new("alice")),
        Duration::from_millis(700),
    );
    let relays = vec![relay_a.url.clone(), relay_b.url.clone()];
    let winner = engine
        .resolve_replaceable(10002, &pubkey, &relays)
        .await
        .unwrap();
    assert_eq!(winner, Some(newer));
}

#[tokio::test]
async fn test_resolve_parameterized_matches_events_without_d_tag() {
    // A missing d tag means the empty discriminator; the relay-side filter
    // must not exclude such events when resolving d = "".
    let signer = TestSigner::new("alice");
    let pubkey = signer.pubkey();
    let bare = signer
        .sign(EventTemplate {
            created_at: 100,
            kind: 30078,
            tags: vec![],
            content: "untagged".to_string(),
        })
        .await
        .unwrap();

    let relay = MockRelay::start(MockRelayConfig {
        seeded: vec![bare.clone()],
        ..Default::default()
    })
    .await;

    let engine = test_engine(
        Arc::new(TestSigner::new("alice")),
        Duration::from_millis(700),
    );
    let winner = engine
        .resolve_parameterized(30078, &pubkey, "", &[relay.url.clone()])
        .await
        .unwrap();
    assert_eq!(winner, Some(bare));
}
