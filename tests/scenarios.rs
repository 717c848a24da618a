use std::collections::BTreeMap;
use std::time::Duration;

use marketdag::dag::AgentRegistry;
use marketdag::engine::RunController;
use marketdag::errors::MarketdagError;
use marketdag::run::{ErrorKind, RunState, RunStatus};
use marketdag_test_utils::builders::registry;
use marketdag_test_utils::init_tracing;
use marketdag_test_utils::scripted::{Behaviour, EntryKind, Gate, Journal, ScriptedAgent};
use marketdag_test_utils::with_timeout;
use serde_json::{json, Value};

fn market_agents(journal: &Journal) -> Vec<ScriptedAgent> {
    vec![
        ScriptedAgent::new("product", journal),
        ScriptedAgent::new("place", journal).after(&["product"]),
        ScriptedAgent::new("price", journal).after(&["product", "place"]),
    ]
}

#[tokio::test]
async fn scenario_a_runs_agents_in_dependency_order() {
    init_tracing();
    let journal = Journal::new();
    let controller = RunController::new(registry(market_agents(&journal), &[]));

    let run_id = controller.start(json!({ "restaurant_name": "Chez Nous" })).unwrap();
    let state = with_timeout(controller.wait(&run_id)).await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(journal.started(), vec!["product", "place", "price"]);
    assert_eq!(state.results().len(), 3);
    assert_eq!(state.completion_order(), ["product", "place", "price"]);
    assert_eq!(state.progress(), 100);
    assert_eq!(state.current_agent(), None);
    assert_eq!(state.payload("place"), Some(&json!({ "agent": "place" })));
}

#[tokio::test]
async fn scenario_b_critical_agent_exhausts_retries() {
    init_tracing();
    let journal = Journal::new();
    let agents = vec![
        ScriptedAgent::new("product", &journal),
        ScriptedAgent::new("place", &journal)
            .after(&["product"])
            .with_retry_limit(2)
            .behaviour(Behaviour::AlwaysFail),
        ScriptedAgent::new("price", &journal).after(&["product", "place"]),
    ];
    let controller = RunController::new(registry(agents, &[]));

    let run_id = controller.start(json!({})).unwrap();
    let state = with_timeout(controller.wait(&run_id)).await.unwrap();

    assert_eq!(state.status(), RunStatus::Error);
    assert_eq!(journal.attempts_of("place"), 3);
    assert_eq!(journal.attempts_of("price"), 0);
    assert_eq!(state.results().keys().collect::<Vec<_>>(), vec!["product"]);
    assert_eq!(state.retry_count("place"), 2);
    assert_eq!(state.failures_of("place"), 3);
    assert!(
        state
            .errors()
            .iter()
            .any(|e| e.kind == ErrorKind::RetryExhausted && e.agent.as_deref() == Some("place"))
    );
    assert!(state.terminal_reason().unwrap().contains("'place' exhausted 2 retries"));

    let err = controller.report(&run_id).unwrap_err();
    assert!(matches!(
        err,
        MarketdagError::RunNotCompleted {
            status: RunStatus::Error,
            ..
        }
    ));
}

#[test]
fn scenario_c_cycle_is_rejected_at_registration() {
    let journal = Journal::new();
    let err = AgentRegistry::builder()
        .register(ScriptedAgent::new("A", &journal))
        .register(ScriptedAgent::new("B", &journal).after(&["C"]))
        .register(ScriptedAgent::new("C", &journal).after(&["B"]))
        .build()
        .unwrap_err();

    assert!(matches!(err, MarketdagError::DagCycle(_)));
    assert!(journal.entries().is_empty());
}

#[tokio::test]
async fn scenario_d_non_critical_agent_is_tombstoned() {
    init_tracing();
    let journal = Journal::new();
    let agents = vec![
        ScriptedAgent::new("product", &journal),
        ScriptedAgent::new("place", &journal)
            .after(&["product"])
            .with_retry_limit(1)
            .behaviour(Behaviour::AlwaysFail),
        ScriptedAgent::new("footfall", &journal).after(&["place"]),
    ];
    let controller = RunController::new(registry(agents, &["place"]));

    let run_id = controller.start(json!({})).unwrap();
    let state = with_timeout(controller.wait(&run_id)).await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(journal.attempts_of("place"), 2);
    let place = state.result("place").unwrap();
    assert!(place.is_skipped());
    assert_eq!(state.payload("place"), None);

    // The dependent ran and saw the tombstone as present.
    let footfall = journal
        .entries()
        .into_iter()
        .find(|e| e.agent == "footfall" && e.kind == EntryKind::Started)
        .unwrap();
    assert!(footfall.seen_results.contains(&"place".to_string()));

    let report = controller.report(&run_id).unwrap();
    assert!(report.degraded);
    assert_eq!(report.skipped, vec!["place"]);
}

#[tokio::test]
async fn scenario_e_pause_waits_for_executing_agent() {
    init_tracing();
    let journal = Journal::new();
    let gate = Gate::new();
    let agents = vec![
        ScriptedAgent::new("A", &journal),
        ScriptedAgent::new("B", &journal).after(&["A"]).gated(&gate),
        ScriptedAgent::new("C", &journal).after(&["B"]),
    ];
    let controller = RunController::new(registry(agents, &[]));
    let run_id = controller.start(json!({})).unwrap();

    with_timeout(gate.wait_started()).await;
    controller.pause(&run_id).unwrap();
    gate.release();

    let mut snapshots = controller.watch(&run_id).unwrap();
    let paused = with_timeout(snapshots.wait_for(|s| s.status() == RunStatus::Paused))
        .await
        .unwrap()
        .clone();

    assert_eq!(paused.current_agent(), Some("B"));
    assert!(paused.has_result("B"));
    assert!(!paused.has_result("C"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(journal.attempts_of("C"), 0);
    let still_paused = controller.snapshot(&run_id).unwrap();
    assert_eq!(still_paused.status(), RunStatus::Paused);
    assert_eq!(still_paused.current_agent(), Some("B"));

    controller.resume(&run_id).unwrap();
    let state = with_timeout(controller.wait(&run_id)).await.unwrap();
    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(journal.started(), vec!["A", "B", "C"]);
}

type Outcome = (
    Vec<String>,
    BTreeMap<String, u32>,
    Vec<(String, Option<Value>, u32, bool)>,
    Vec<(Option<String>, ErrorKind, u32, String)>,
);

/// Everything about a finished run except wall-clock timestamps.
fn outcome(state: &RunState) -> Outcome {
    (
        state.completion_order().to_vec(),
        state.retry_counts().clone(),
        state
            .results()
            .iter()
            .map(|(name, r)| (name.clone(), r.payload().cloned(), r.attempts(), r.is_skipped()))
            .collect(),
        state
            .errors()
            .iter()
            .map(|e| (e.agent.clone(), e.kind, e.attempt, e.message.clone()))
            .collect(),
    )
}

fn retrying_agents(journal: &Journal, gate: Option<&Gate>) -> Vec<ScriptedAgent> {
    let product = ScriptedAgent::new("product", journal);
    vec![
        match gate {
            Some(gate) => product.gated(gate),
            None => product,
        },
        ScriptedAgent::new("place", journal)
            .after(&["product"])
            .behaviour(Behaviour::FailFirst(1))
            .with_retry_limit(1),
        ScriptedAgent::new("promotion", journal)
            .after(&["product"])
            .behaviour(Behaviour::AlwaysFail),
        ScriptedAgent::new("price", journal).after(&["place", "promotion"]),
    ]
}

#[tokio::test]
async fn pause_and_resume_do_not_change_the_outcome() {
    init_tracing();
    let plain_journal = Journal::new();
    let plain = RunController::new(registry(retrying_agents(&plain_journal, None), &["promotion"]));
    let run_id = plain.start(json!({})).unwrap();
    let uninterrupted = with_timeout(plain.wait(&run_id)).await.unwrap();

    let journal = Journal::new();
    let gate = Gate::new();
    let controller =
        RunController::new(registry(retrying_agents(&journal, Some(&gate)), &["promotion"]));
    let run_id = controller.start(json!({})).unwrap();
    with_timeout(gate.wait_started()).await;
    controller.pause(&run_id).unwrap();
    gate.release();

    let mut snapshots = controller.watch(&run_id).unwrap();
    with_timeout(snapshots.wait_for(|s| s.status() == RunStatus::Paused))
        .await
        .unwrap();
    controller.resume(&run_id).unwrap();
    let resumed = with_timeout(controller.wait(&run_id)).await.unwrap();

    assert_eq!(uninterrupted.status(), RunStatus::Completed);
    assert_eq!(resumed.status(), RunStatus::Completed);
    assert_eq!(outcome(&resumed), outcome(&uninterrupted));
    assert_eq!(resumed.retry_count("place"), 1);
    assert!(resumed.result("promotion").unwrap().is_skipped());
    assert_eq!(journal.started(), plain_journal.started());
}

#[tokio::test]
async fn dependencies_finish_before_dependents_start() {
    init_tracing();
    let journal = Journal::new();
    let controller = RunController::new(registry(retrying_agents(&journal, None), &["promotion"]));
    let run_id = controller.start(json!({})).unwrap();
    let state = with_timeout(controller.wait(&run_id)).await.unwrap();
    assert_eq!(state.status(), RunStatus::Completed);

    let registry = controller.registry();
    let starts: Vec<_> = journal
        .entries()
        .into_iter()
        .filter(|e| e.kind == EntryKind::Started)
        .collect();
    assert_eq!(starts.len(), 5);
    for entry in &starts {
        for dep in registry.get(&entry.agent).unwrap().dependencies() {
            let finished_at = state.result(dep).unwrap().finished_at();
            assert!(
                finished_at <= entry.at,
                "{} attempt {} started at {} before {dep} finished at {finished_at}",
                entry.agent,
                entry.attempt,
                entry.at
            );
        }
    }
}

#[tokio::test]
async fn agents_only_see_results_of_their_dependencies_finished_first() {
    init_tracing();
    let journal = Journal::new();
    let agents = vec![
        ScriptedAgent::new("product", &journal),
        ScriptedAgent::new("promotion", &journal).after(&["product"]),
        ScriptedAgent::new("place", &journal)
            .after(&["product"])
            .behaviour(Behaviour::FailFirst(1))
            .with_retry_limit(1),
        ScriptedAgent::new("price", &journal).after(&["product", "place"]),
    ];
    let controller = RunController::new(registry(agents, &[]));
    let run_id = controller.start(json!({})).unwrap();
    let state = with_timeout(controller.wait(&run_id)).await.unwrap();
    assert_eq!(state.status(), RunStatus::Completed);

    let deps = |agent: &str| -> Vec<&str> {
        match agent {
            "promotion" | "place" => vec!["product"],
            "price" => vec!["product", "place"],
            _ => vec![],
        }
    };
    for entry in journal.entries().iter().filter(|e| e.kind == EntryKind::Started) {
        for dep in deps(&entry.agent) {
            assert!(
                entry.seen_results.iter().any(|r| r == dep),
                "{} attempt {} started before {dep}",
                entry.agent,
                entry.attempt
            );
        }
    }
    assert_eq!(
        journal.started(),
        vec!["product", "promotion", "place", "place", "price"]
    );
    assert_eq!(state.last_error(), None);
}

#[tokio::test]
async fn panicking_agent_is_retried_like_a_failure() {
    init_tracing();
    let journal = Journal::new();
    let agents = vec![
        ScriptedAgent::new("product", &journal)
            .behaviour(Behaviour::Panic)
            .with_retry_limit(1),
    ];
    let controller = RunController::new(registry(agents, &[]));
    let run_id = controller.start(json!({})).unwrap();
    let state = with_timeout(controller.wait(&run_id)).await.unwrap();

    assert_eq!(state.status(), RunStatus::Error);
    assert_eq!(journal.attempts_of("product"), 2);
    assert!(state.errors()[0].message.contains("scripted panic in product"));
}

#[tokio::test]
async fn concurrent_runs_do_not_share_state() {
    init_tracing();
    let journal = Journal::new();
    let controller = RunController::new(registry(market_agents(&journal), &[]));

    let first = controller.start(json!({ "restaurant_name": "One" })).unwrap();
    let second = controller.start(json!({ "restaurant_name": "Two" })).unwrap();
    assert_ne!(first, second);

    let a = with_timeout(controller.wait(&first)).await.unwrap();
    let b = with_timeout(controller.wait(&second)).await.unwrap();

    assert_eq!(a.status(), RunStatus::Completed);
    assert_eq!(b.status(), RunStatus::Completed);
    assert_eq!(a.parameters()["restaurant_name"], "One");
    assert_eq!(b.parameters()["restaurant_name"], "Two");
    assert_eq!(journal.attempts_of("product"), 2);
    assert_eq!(controller.runs().len(), 2);
}
