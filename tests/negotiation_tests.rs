use orrery::envelope::{Envelope, EnvelopeFactory, EnvelopeType};
use orrery::negotiation::{
    NegotiationRecord, ProposalStatus, TaskComplexity, TaskNegotiator, TaskProposal,
};
use orrery::observability::ObservabilitySink;
use orrery::registry::{AgentCard, AgentRegistry};
use orrery::router::Router;
use orrery::tier::Tier;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Fabric {
    router: Arc<Router>,
    sink: Arc<ObservabilitySink>,
}

async fn fabric(agents: &[(&str, Tier)]) -> Fabric {
    let registry = Arc::new(AgentRegistry::new());
    for (id, tier) in agents {
        registry
            .register(AgentCard::new(*id, id.to_uppercase(), *tier))
            .await
            .unwrap();
    }
    let sink = Arc::new(ObservabilitySink::new());
    let router = Arc::new(Router::new(registry, sink.clone()));
    Fabric { router, sink }
}

fn negotiator(agent: &str, fabric: &Fabric) -> Arc<TaskNegotiator> {
    Arc::new(TaskNegotiator::new(
        EnvelopeFactory::new(agent),
        fabric.router.clone(),
        fabric.sink.clone(),
    ))
}

/// Wire an agent's negotiator into the router so proposals and answers
/// reaching that agent are ingested automatically.
async fn wire_negotiator(fabric: &Fabric, agent: &str, negotiator: Arc<TaskNegotiator>) {
    fabric
        .router
        .on_receive(agent, Arc::new(move |envelope: Envelope| {
            let negotiator = negotiator.clone();
            Box::pin(async move {
                match envelope.message_type {
                    EnvelopeType::TaskProposal => {
                        negotiator.handle_incoming_proposal(&envelope).await.ok();
                    }
                    EnvelopeType::TaskAccept | EnvelopeType::TaskReject => {
                        negotiator.handle_incoming_response(&envelope).await.ok();
                    }
                    _ => {}
                }
            })
        }))
        .await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_proposal_times_out_and_notifies_the_proposer() {
    let fabric = fabric(&[("sun", Tier::L0), ("mars", Tier::L2)]).await;
    let sun = negotiator("sun", &fabric);

    let notified = Arc::new(Mutex::new(Vec::new()));
    {
        let notified = notified.clone();
        sun.on_timeout(Arc::new(move |record: &NegotiationRecord| {
            notified.lock().unwrap().push(record.status);
        }))
        .await;
    }

    let record = sun
        .propose(
            "mars",
            TaskProposal::new("map dust storms", TaskComplexity::Medium),
            100,
        )
        .await
        .unwrap();
    assert_eq!(record.status, ProposalStatus::Pending);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let stored = sun.get_proposal(&record.proposal_id).await.unwrap();
    assert_eq!(stored.status, ProposalStatus::TimedOut);
    assert_eq!(*notified.lock().unwrap(), vec![ProposalStatus::TimedOut]);
}

#[tokio::test]
async fn proposal_flows_through_the_router_and_accept_answers_the_thread() {
    let fabric = fabric(&[("sun", Tier::L0), ("mars", Tier::L2)]).await;
    let sun = negotiator("sun", &fabric);
    let mars = negotiator("mars", &fabric);
    wire_negotiator(&fabric, "mars", mars.clone()).await;
    wire_negotiator(&fabric, "sun", sun.clone()).await;

    // Collect everything addressed back to sun.
    let replies = Arc::new(Mutex::new(Vec::<Envelope>::new()));
    {
        let replies = replies.clone();
        fabric
            .router
            .on_receive("sun", Arc::new(move |envelope: Envelope| {
                let replies = replies.clone();
                Box::pin(async move {
                    replies.lock().unwrap().push(envelope);
                })
            }))
            .await;
    }

    let sent = sun
        .propose(
            "mars",
            TaskProposal::new("calibrate relay", TaskComplexity::Simple)
                .with_capability("relay-ops"),
            60_000,
        )
        .await
        .unwrap();

    // The router already handed the proposal to mars' negotiator.
    let incoming = mars.get_proposal(&sent.proposal_id).await.unwrap();
    assert_eq!(incoming.status, ProposalStatus::Pending);
    assert_eq!(incoming.proposer, "sun");
    assert_eq!(incoming.correlation_id, sent.correlation_id);

    let accepted = mars.accept(&sent.proposal_id, 5_000).await.unwrap();
    assert_eq!(accepted.status, ProposalStatus::Accepted);
    assert_eq!(accepted.estimated_completion_ms, Some(5_000));

    // The answer travelled back and resolved the proposer's record too.
    let mine = sun.get_proposal(&sent.proposal_id).await.unwrap();
    assert_eq!(mine.status, ProposalStatus::Accepted);
    assert_eq!(mine.accepted_by.as_deref(), Some("mars"));

    // The task-accept envelope reused the proposal's correlation id.
    let replies = replies.lock().unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message_type, EnvelopeType::TaskAccept);
    assert_eq!(
        replies[0].correlation_id.as_deref(),
        Some(sent.correlation_id.as_str())
    );
    assert_eq!(replies[0].payload["proposalId"], sent.proposal_id.as_str());
}

#[tokio::test]
async fn reject_carries_reason_and_alternative() {
    let fabric = fabric(&[("sun", Tier::L0), ("mars", Tier::L2)]).await;
    let sun = negotiator("sun", &fabric);
    let mars = negotiator("mars", &fabric);
    wire_negotiator(&fabric, "mars", mars.clone()).await;
    wire_negotiator(&fabric, "sun", sun.clone()).await;

    let replies = Arc::new(Mutex::new(Vec::<Envelope>::new()));
    {
        let replies = replies.clone();
        fabric
            .router
            .on_receive("sun", Arc::new(move |envelope: Envelope| {
                let replies = replies.clone();
                Box::pin(async move {
                    replies.lock().unwrap().push(envelope);
                })
            }))
            .await;
    }

    let sent = sun
        .propose(
            "mars",
            TaskProposal::new("drill core sample", TaskComplexity::Complex),
            60_000,
        )
        .await
        .unwrap();

    let rejected = mars
        .reject(
            &sent.proposal_id,
            "drill head worn out",
            Some("ask venus".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(rejected.status, ProposalStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("drill head worn out"));
    assert_eq!(rejected.alternative_suggestion.as_deref(), Some("ask venus"));

    let replies = replies.lock().unwrap();
    assert_eq!(replies[0].message_type, EnvelopeType::TaskReject);
    assert_eq!(replies[0].payload["alternativeSuggestion"], "ask venus");

    let mine = sun.get_proposal(&sent.proposal_id).await.unwrap();
    assert_eq!(mine.status, ProposalStatus::Rejected);
    assert_eq!(mine.rejection_reason.as_deref(), Some("drill head worn out"));

    // Absorbing: the timed-out path can no longer fire, nor a second
    // resolution.
    let err = mars.accept(&sent.proposal_id, 1).await.unwrap_err();
    assert_eq!(err.kind(), "state-violation");
}

#[tokio::test]
async fn threads_group_records_by_correlation_id() {
    let fabric = fabric(&[("sun", Tier::L0), ("mars", Tier::L2), ("venus", Tier::L2)]).await;
    let sun = negotiator("sun", &fabric);

    let first = sun
        .propose("mars", TaskProposal::new("a", TaskComplexity::Simple), 60_000)
        .await
        .unwrap();
    let second = sun
        .propose("venus", TaskProposal::new("b", TaskComplexity::Simple), 60_000)
        .await
        .unwrap();

    assert_ne!(first.correlation_id, second.correlation_id);
    assert_eq!(sun.get_thread(&first.correlation_id).await.len(), 1);
    assert_eq!(sun.list_pending().await.len(), 2);
    assert_eq!(
        sun.get_thread(&second.correlation_id).await[0].target,
        "venus"
    );
}
