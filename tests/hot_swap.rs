use agent_orchestrator::blackboard::{agent_key, AGENT_INDEX_KEY};
use agent_orchestrator::swap::coordinator::{STEP_FINALIZE, STEP_VERIFY_NEW_AGENT};
use agent_orchestrator::{
    AgentRegistration, AgentRuntime, AgentState, AgentStatus, AgentTask, AppConfig, Blackboard,
    HotSwapCoordinator, InMemoryBus, InMemoryStore, MessageBus, OpContext, OrchestratorError,
    StepStatus, SwapStatus,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    bus: Arc<dyn MessageBus>,
    board: Blackboard,
    coordinator: HotSwapCoordinator,
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.swap.ping_timeout_ms = 200;
    config
}

fn harness() -> Harness {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::with_defaults());
    let board = Blackboard::with_defaults(Arc::new(InMemoryStore::new()));
    let coordinator = HotSwapCoordinator::new(bus.clone(), Some(board.clone()), &config());
    Harness {
        bus,
        board,
        coordinator,
    }
}

fn v1_state() -> AgentState {
    AgentState::new()
        .with_memory("last_price", json!(50000.0))
        .with_pending_task(AgentTask::new("task-1", "analyze", 1))
}

async fn register_v1(h: &Harness) {
    assert_ok!(
        h.coordinator
            .register_agent(
                &OpContext::new(),
                AgentRegistration::new("agent-v1", "technical")
                    .with_version("1.0.0")
                    .with_state(v1_state()),
            )
            .await
    );
}

fn improved() -> HashMap<String, serde_json::Value> {
    let mut config = HashMap::new();
    config.insert("improved_algorithm".to_string(), json!(true));
    config
}

/// The replacement inherits memory and pending work; the old agent disappears.
#[tokio::test]
async fn swap_with_live_replacement_transfers_state() {
    let h = harness();
    let old_runtime = assert_ok!(AgentRuntime::start(h.bus.clone(), "agent-v1").await);
    let new_runtime = assert_ok!(AgentRuntime::start(h.bus.clone(), "agent-v2").await);
    register_v1(&h).await;

    let session = assert_ok!(
        h.coordinator
            .swap_agent(&OpContext::new(), "agent-v1", "agent-v2", improved())
            .await
    );

    assert_eq!(session.status, SwapStatus::Completed);
    assert!(session.error.is_none());
    assert!(session.completed_at.is_some());
    assert!(session.duration.unwrap() > Duration::ZERO);
    assert_eq!(session.steps.len(), 6, "steps: {:?}", session.steps);
    for step in &session.steps {
        assert_eq!(step.status, StepStatus::Completed, "step {}", step.name);
        assert!(step.completed_at.unwrap() >= step.started_at);
    }
    let snapshot = session.state_snapshot.as_ref().unwrap();
    assert_eq!(snapshot.memory, v1_state().memory);

    let v2 = assert_ok!(h.coordinator.get_agent("agent-v2").await);
    assert_eq!(v2.status, AgentStatus::Active);
    assert_eq!(v2.state.memory, v1_state().memory);
    assert_eq!(v2.state.pending_tasks.len(), 1);
    assert_eq!(v2.state.pending_tasks[0].id, "task-1");
    assert_eq!(v2.state.configuration["improved_algorithm"], json!(true));

    let err = assert_err!(h.coordinator.get_agent("agent-v1").await);
    assert!(err.is_not_found());

    assert_eq!(new_runtime.pings_answered(), 1);
    // The old runtime was paused and never resumed.
    for _ in 0..100 {
        if old_runtime.is_paused() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(old_runtime.is_paused());
}

/// Nobody listens for agent-v2: the swap rolls back and agent-v1 keeps running.
#[tokio::test]
async fn swap_with_dead_replacement_rolls_back() {
    let h = harness();
    let _old_runtime = assert_ok!(AgentRuntime::start(h.bus.clone(), "agent-v1").await);
    register_v1(&h).await;

    let err = assert_err!(
        h.coordinator
            .swap_agent(&OpContext::new(), "agent-v1", "agent-v2", improved())
            .await
    );
    assert!(err.source.is_communication(), "got {}", err.source);

    let session = err.session.expect("rolled back swaps keep their session");
    assert_eq!(session.status, SwapStatus::RolledBack);
    assert!(!session.error.as_deref().unwrap_or_default().is_empty());
    assert_eq!(
        session.step(STEP_VERIFY_NEW_AGENT).map(|s| s.status),
        Some(StepStatus::Failed)
    );
    assert!(session.step(STEP_FINALIZE).is_none());

    let v1 = assert_ok!(h.coordinator.get_agent("agent-v1").await);
    assert_eq!(v1.status, AgentStatus::Active);
    assert_eq!(v1.state.memory, v1_state().memory);
    assert!(assert_err!(h.coordinator.get_agent("agent-v2").await).is_not_found());
}

/// Swapping an unknown agent yields no session at all.
#[tokio::test]
async fn swap_of_unknown_agent_is_rejected() {
    let h = harness();
    let err = assert_err!(
        h.coordinator
            .swap_agent(&OpContext::new(), "nonexistent", "agent-v2", HashMap::new())
            .await
    );
    assert!(err.to_string().contains("old agent not found"), "got {}", err);
    assert!(err.session.is_none());
    assert!(h.coordinator.list_swap_sessions().await.is_empty());
}

/// A context that expires during verification rolls the swap back.
#[tokio::test]
async fn expired_deadline_during_verification_rolls_back() {
    let h = harness();
    // Subscribed but mute, so the ping waits until the deadline.
    let _mute = assert_ok!(
        h.bus
            .subscribe(
                "agent-v2",
                "control",
                agent_orchestrator::bus::handler_fn(|_msg| async {}),
            )
            .await
    );

    let mut slow = config();
    slow.swap.ping_timeout_ms = 10_000;
    let coordinator = HotSwapCoordinator::new(h.bus.clone(), None, &slow);
    assert_ok!(
        coordinator
            .register_agent(
                &OpContext::new(),
                AgentRegistration::new("agent-v1", "technical").with_state(v1_state()),
            )
            .await
    );

    let ctx = OpContext::with_timeout(Duration::from_millis(50));
    let err = assert_err!(
        coordinator
            .swap_agent(&ctx, "agent-v1", "agent-v2", HashMap::new())
            .await
    );
    assert!(
        matches!(err.source, OrchestratorError::Timeout { .. }),
        "got {}",
        err.source
    );
    assert_eq!(err.session.unwrap().status, SwapStatus::RolledBack);
    assert_eq!(
        assert_ok!(coordinator.get_agent("agent-v1").await).status,
        AgentStatus::Active
    );
}

/// Sessions are retrievable by id and listed in start order.
#[tokio::test]
async fn sessions_are_queryable_after_the_fact() {
    let h = harness();
    let _v2 = assert_ok!(AgentRuntime::start(h.bus.clone(), "agent-v2").await);
    let _v3 = assert_ok!(AgentRuntime::start(h.bus.clone(), "agent-v3").await);
    register_v1(&h).await;

    let first = assert_ok!(
        h.coordinator
            .swap_agent(&OpContext::new(), "agent-v1", "agent-v2", HashMap::new())
            .await
    );
    let second = assert_ok!(
        h.coordinator
            .swap_agent(&OpContext::new(), "agent-v2", "agent-v3", HashMap::new())
            .await
    );

    let listed = h.coordinator.list_swap_sessions().await;
    let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
    assert_eq!(
        assert_ok!(h.coordinator.get_swap_session(&second.id).await),
        second
    );

    // State survives two hops.
    let v3 = assert_ok!(h.coordinator.get_agent("agent-v3").await);
    assert_eq!(v3.state.memory, v1_state().memory);
}

/// Registry and sessions are mirrored to the blackboard and recoverable.
#[tokio::test]
async fn blackboard_mirror_supports_recovery() {
    let h = harness();
    let _v2 = assert_ok!(AgentRuntime::start(h.bus.clone(), "agent-v2").await);
    register_v1(&h).await;
    let session = assert_ok!(
        h.coordinator
            .swap_agent(&OpContext::new(), "agent-v1", "agent-v2", improved())
            .await
    );
    h.coordinator.flush_mirror().await;

    let names: Vec<String> = assert_ok!(h.board.get_json(AGENT_INDEX_KEY).await).unwrap();
    assert_eq!(names, vec!["agent-v2".to_string()]);
    assert!(assert_ok!(h.board.get(&agent_key("agent-v1")).await).is_none());
    let stored: agent_orchestrator::SwapSession =
        assert_ok!(h.board.get_json(&format!("swaps/{}", session.id)).await).unwrap();
    assert_eq!(stored.status, SwapStatus::Completed);

    let restarted = HotSwapCoordinator::new(h.bus.clone(), Some(h.board.clone()), &config());
    assert_eq!(assert_ok!(restarted.recover_from_blackboard().await), 1);
    let v2 = assert_ok!(restarted.get_agent("agent-v2").await);
    assert_eq!(v2.state.memory, v1_state().memory);
}

/// Swaps on unrelated agent pairs run side by side without interfering.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_swaps_on_different_pairs_both_complete() {
    let h = harness();
    let _a2 = assert_ok!(AgentRuntime::start(h.bus.clone(), "alpha-v2").await);
    let _b2 = assert_ok!(AgentRuntime::start(h.bus.clone(), "beta-v2").await);
    let ctx = OpContext::new();
    for (name, price) in [("alpha-v1", 100.0), ("beta-v1", 200.0)] {
        assert_ok!(
            h.coordinator
                .register_agent(
                    &ctx,
                    AgentRegistration::new(name, "technical")
                        .with_state(AgentState::new().with_memory("last_price", json!(price))),
                )
                .await
        );
    }

    let alpha_ctx = OpContext::new();
    let beta_ctx = OpContext::new();
    let (alpha, beta) = tokio::join!(
        h.coordinator
            .swap_agent(&alpha_ctx, "alpha-v1", "alpha-v2", HashMap::new()),
        h.coordinator
            .swap_agent(&beta_ctx, "beta-v1", "beta-v2", HashMap::new()),
    );
    let alpha = assert_ok!(alpha);
    let beta = assert_ok!(beta);
    assert_eq!(alpha.status, SwapStatus::Completed);
    assert_eq!(beta.status, SwapStatus::Completed);
    assert_ne!(alpha.id, beta.id);

    let alpha_v2 = assert_ok!(h.coordinator.get_agent("alpha-v2").await);
    let beta_v2 = assert_ok!(h.coordinator.get_agent("beta-v2").await);
    assert_eq!(alpha_v2.state.memory["last_price"], json!(100.0));
    assert_eq!(beta_v2.state.memory["last_price"], json!(200.0));
    assert!(h.coordinator.get_agent("alpha-v1").await.is_err());
    assert!(h.coordinator.get_agent("beta-v1").await.is_err());
    assert_eq!(h.coordinator.list_swap_sessions().await.len(), 2);
}

/// A swap racing state writes captures one whole written state, never a mix.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capture_racing_state_updates_sees_a_whole_state() {
    let h = Arc::new(harness());
    let _v2 = assert_ok!(AgentRuntime::start(h.bus.clone(), "agent-v2").await);
    let coherent = |n: i64| {
        AgentState::new()
            .with_memory("generation", json!(n))
            .with_memory("generation_copy", json!(n))
    };
    assert_ok!(
        h.coordinator
            .register_agent(
                &OpContext::new(),
                AgentRegistration::new("agent-v1", "technical").with_state(coherent(0)),
            )
            .await
    );

    let writer = {
        let h = h.clone();
        tokio::spawn(async move {
            // Stops being accepted once the swap removes agent-v1.
            for n in 1..=200 {
                if h.coordinator
                    .update_agent_state("agent-v1", coherent(n))
                    .await
                    .is_err()
                {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
    };
    tokio::task::yield_now().await;

    let session = assert_ok!(
        h.coordinator
            .swap_agent(&OpContext::new(), "agent-v1", "agent-v2", HashMap::new())
            .await
    );
    writer.await.unwrap();

    let snapshot = session.state_snapshot.expect("completed swaps carry a snapshot");
    let generation = snapshot.memory["generation"].as_i64().unwrap();
    assert!((0..=200).contains(&generation));
    assert_eq!(snapshot.memory["generation_copy"], json!(generation));

    let v2 = assert_ok!(h.coordinator.get_agent("agent-v2").await);
    assert_eq!(v2.state.memory["generation"], v2.state.memory["generation_copy"]);
}
