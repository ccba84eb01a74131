use async_trait::async_trait;
use orrery::envelope::{CreateOptions, EnvelopeFactory, EnvelopeType};
use orrery::observability::{
    EventListener, FabricEvent, ObservabilitySink, RecordedEvent, RoutePath,
};
use orrery::registry::{AgentCard, AgentRegistry, Capability};
use orrery::router::{ReceiveHandler, Router};
use orrery::tier::Tier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn counting_handler(counter: Arc<AtomicUsize>) -> ReceiveHandler {
    Arc::new(move |_envelope| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    })
}

async fn populate(registry: &AgentRegistry, agents: &[(&str, Tier)]) {
    for (id, tier) in agents {
        registry
            .register(AgentCard::new(*id, id.to_uppercase(), *tier))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn direct_send_from_sun_to_mercury() {
    let registry = Arc::new(AgentRegistry::new());
    let sink = Arc::new(ObservabilitySink::new());
    let router = Router::new(registry.clone(), sink.clone());
    populate(&registry, &[("sun", Tier::L0), ("mercury", Tier::L1)]).await;

    let invocations = Arc::new(AtomicUsize::new(0));
    router
        .on_receive("mercury", counting_handler(invocations.clone()))
        .await;

    let envelope =
        EnvelopeFactory::new("sun").create_request("mercury", serde_json::json!({"op": "ping"}));
    let result = router.send(envelope).await;

    assert!(result.delivered);
    assert_eq!(result.path, RoutePath::Local);
    assert_eq!(result.target_id, "mercury");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(sink.metrics().await.messages_sent, 1);
}

#[tokio::test]
async fn io_cannot_reach_mercury() {
    let registry = Arc::new(AgentRegistry::new());
    let sink = Arc::new(ObservabilitySink::new());
    let router = Router::new(registry.clone(), sink.clone());
    populate(&registry, &[("io", Tier::L3), ("mercury", Tier::L1)]).await;

    let invocations = Arc::new(AtomicUsize::new(0));
    router
        .on_receive("mercury", counting_handler(invocations.clone()))
        .await;

    let envelope = EnvelopeFactory::new("io").create_request("mercury", serde_json::json!({}));
    let result = router.send(envelope).await;

    assert!(!result.delivered);
    assert_eq!(result.error.as_ref().unwrap().kind(), "tier-violation");
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let registry = Arc::new(AgentRegistry::new());
    let sink = Arc::new(ObservabilitySink::new());
    let router = Router::new(registry.clone(), sink.clone());
    populate(
        &registry,
        &[("sun", Tier::L0), ("mercury", Tier::L1), ("mars", Tier::L2)],
    )
    .await;

    let sun_seen = Arc::new(AtomicUsize::new(0));
    let mercury_seen = Arc::new(AtomicUsize::new(0));
    let mars_seen = Arc::new(AtomicUsize::new(0));
    router.on_receive("sun", counting_handler(sun_seen.clone())).await;
    router
        .on_receive("mercury", counting_handler(mercury_seen.clone()))
        .await;
    router.on_receive("mars", counting_handler(mars_seen.clone())).await;

    let envelope =
        EnvelopeFactory::new("sun").create_notification(serde_json::json!({"alert": "flare"}));
    let result = router.send(envelope).await;

    assert!(result.delivered);
    assert_eq!(result.path, RoutePath::Broadcast);
    assert_eq!(mercury_seen.load(Ordering::SeqCst), 1);
    assert_eq!(mars_seen.load(Ordering::SeqCst), 1);
    assert_eq!(sun_seen.load(Ordering::SeqCst), 0);
}

/// The full default-policy routing matrix: delivery happens iff the tier
/// rule allows the pair, with the L2 escalation gate and the hard L3
/// denial on top.
#[tokio::test]
async fn tier_matrix_matches_the_default_rules() {
    let agents = [
        ("sun", Tier::L0),
        ("mercury", Tier::L1),
        ("mars", Tier::L2),
        ("io", Tier::L3),
    ];
    let expectations = [
        // (src, tgt, plain send delivers, escalated send delivers)
        ("sun", "mercury", true, true),
        ("sun", "io", true, true),
        ("mercury", "sun", true, true),
        ("mercury", "mars", false, false),
        ("mercury", "io", false, false),
        ("mars", "sun", false, true),
        ("mars", "mercury", false, true),
        ("mars", "io", false, false),
        ("io", "sun", false, false),
        ("io", "mercury", false, false),
        ("io", "mars", true, true),
    ];

    for (src, tgt, plain_ok, escalated_ok) in expectations.iter() {
        let registry = Arc::new(AgentRegistry::new());
        let sink = Arc::new(ObservabilitySink::new());
        let router = Router::new(registry.clone(), sink);
        populate(&registry, &agents).await;
        let seen = Arc::new(AtomicUsize::new(0));
        router.on_receive(*tgt, counting_handler(seen.clone())).await;

        let factory = EnvelopeFactory::new(*src);
        let plain = router
            .send(factory.create_request(*tgt, serde_json::json!({})))
            .await;
        assert_eq!(
            plain.delivered, *plain_ok,
            "plain {} -> {} expected delivered={}",
            src, tgt, plain_ok
        );

        let escalated = router
            .send(factory.create_envelope(
                EnvelopeType::Request,
                *tgt,
                serde_json::json!({}),
                CreateOptions {
                    escalation: Some("operational anomaly".to_string()),
                    ..Default::default()
                },
            ))
            .await;
        assert_eq!(
            escalated.delivered, *escalated_ok,
            "escalated {} -> {} expected delivered={}",
            src, tgt, escalated_ok
        );
    }
}

#[tokio::test]
async fn broadcast_respects_sandbox_boundaries() {
    let registry = Arc::new(AgentRegistry::new());
    let sink = Arc::new(ObservabilitySink::new());
    let router = Router::new(registry.clone(), sink);
    registry
        .register(AgentCard::new("venus", "Venus", Tier::L2).with_sandbox("greenhouse"))
        .await
        .unwrap();
    registry
        .register(AgentCard::new("mars", "Mars", Tier::L2).with_sandbox("redlab"))
        .await
        .unwrap();
    registry
        .register(AgentCard::new("pluto", "Pluto", Tier::L2).with_sandbox("greenhouse"))
        .await
        .unwrap();

    let mars_seen = Arc::new(AtomicUsize::new(0));
    let pluto_seen = Arc::new(AtomicUsize::new(0));
    router.on_receive("mars", counting_handler(mars_seen.clone())).await;
    router
        .on_receive("pluto", counting_handler(pluto_seen.clone()))
        .await;

    let envelope = EnvelopeFactory::new("venus").create_notification(serde_json::json!({}));
    let result = router.send(envelope).await;

    // Same-sandbox pluto is reached, cross-sandbox mars is not.
    assert!(result.delivered);
    assert_eq!(pluto_seen.load(Ordering::SeqCst), 1);
    assert_eq!(mars_seen.load(Ordering::SeqCst), 0);

    // Granting the exception brings mars into the next fan-out.
    router.allow_cross_sandbox("greenhouse", "mars").await;
    let envelope = EnvelopeFactory::new("venus").create_notification(serde_json::json!({}));
    router.send(envelope).await;
    assert_eq!(mars_seen.load(Ordering::SeqCst), 1);
}

struct FailureCollector {
    kinds: Mutex<Vec<String>>,
}

#[async_trait]
impl EventListener for FailureCollector {
    async fn on_event(&self, event: &RecordedEvent) {
        if let FabricEvent::RoutingFailed { kind, .. } = &event.event {
            self.kinds.lock().unwrap().push(kind.clone());
        }
    }
}

#[tokio::test]
async fn failures_surface_as_structured_events() {
    let registry = Arc::new(AgentRegistry::new());
    let sink = Arc::new(ObservabilitySink::new());
    let router = Router::new(registry.clone(), sink.clone());
    populate(&registry, &[("io", Tier::L3), ("sun", Tier::L0)]).await;

    let collector = Arc::new(FailureCollector {
        kinds: Mutex::new(Vec::new()),
    });
    sink.subscribe(collector.clone()).await;

    let factory = EnvelopeFactory::new("io");
    router
        .send(factory.create_request("nemesis", serde_json::json!({})))
        .await;
    router
        .send(factory.create_request("sun", serde_json::json!({})))
        .await;

    assert_eq!(
        *collector.kinds.lock().unwrap(),
        vec!["not-found", "tier-violation"]
    );
    assert_eq!(sink.metrics().await.messages_failed, 2);
}

#[tokio::test]
async fn capability_routing_delivers_to_first_provider() {
    let registry = Arc::new(AgentRegistry::new());
    let sink = Arc::new(ObservabilitySink::new());
    let router = Router::new(registry.clone(), sink);
    populate(&registry, &[("sun", Tier::L0)]).await;
    registry
        .register(
            AgentCard::new("saturn", "Saturn", Tier::L2)
                .with_capability(Capability::new("imaging").with_description("ring imaging")),
        )
        .await
        .unwrap();
    registry
        .register(
            AgentCard::new("titan", "Titan", Tier::L2)
                .with_capability(Capability::new("imaging")),
        )
        .await
        .unwrap();

    let saturn_seen = Arc::new(AtomicUsize::new(0));
    router
        .on_receive("saturn", counting_handler(saturn_seen.clone()))
        .await;

    let envelope = EnvelopeFactory::new("sun").create_request("any", serde_json::json!({}));
    let result = router.route_by_capability(envelope, "imaging").await;

    assert!(result.delivered);
    assert_eq!(result.target_id, "saturn");
    assert_eq!(saturn_seen.load(Ordering::SeqCst), 1);

    let envelope = EnvelopeFactory::new("sun").create_request("any", serde_json::json!({}));
    let missing = router.route_by_capability(envelope, "terraforming").await;
    assert!(!missing.delivered);
    assert_eq!(missing.error.as_ref().unwrap().kind(), "not-found");
}

#[tokio::test]
async fn remote_cards_resolve_with_remote_path() {
    let registry = Arc::new(AgentRegistry::new());
    let sink = Arc::new(ObservabilitySink::new());
    let router = Router::new(registry.clone(), sink);
    populate(&registry, &[("sun", Tier::L0)]).await;
    registry
        .merge_remote_card(AgentCard::new("neptune", "Neptune", Tier::L3))
        .await
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    router.on_receive("neptune", counting_handler(seen.clone())).await;

    let envelope = EnvelopeFactory::new("sun").create_request("neptune", serde_json::json!({}));
    let result = router.send(envelope).await;
    assert!(result.delivered);
    assert_eq!(result.path, RoutePath::Remote);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
