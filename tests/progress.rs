use std::sync::{Arc, Mutex};

use marketdag::engine::{ProgressBroadcaster, RunController, Scope};
use marketdag::run::{Phase, ProgressEvent, RunId, RunStatus};
use marketdag_test_utils::builders::registry;
use marketdag_test_utils::scripted::{Behaviour, Journal, ScriptedAgent};
use marketdag_test_utils::{collect_events, init_tracing, with_timeout};
use serde_json::json;

fn agents(journal: &Journal) -> Vec<ScriptedAgent> {
    vec![
        ScriptedAgent::new("product", journal).progress_steps(&[25, 50, 100]),
        ScriptedAgent::new("place", journal)
            .after(&["product"])
            .with_retry_limit(1)
            .behaviour(Behaviour::FailFirst(1)),
        ScriptedAgent::new("price", journal)
            .after(&["place"])
            .progress_steps(&[10, 90]),
        ScriptedAgent::new("promotion", journal).after(&["price"]),
    ]
}

#[tokio::test]
async fn events_are_ordered_and_progress_is_monotonic() {
    init_tracing();
    let journal = Journal::new();
    let controller = RunController::new(registry(agents(&journal), &[]));

    let run_id = RunId::from("progress-run");
    let stream = controller.subscribe(&run_id);
    controller.start_with_id(run_id.clone(), json!({})).unwrap();
    let events = collect_events(stream).await;

    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=events.len() as u64).collect();
    assert_eq!(sequences, expected);

    let first = events.first().unwrap();
    assert!(first.is_run_level());
    assert_eq!(first.phase, Phase::Started);

    let last = events.last().unwrap();
    assert!(last.is_run_level());
    assert_eq!(last.phase, Phase::Completed);
    assert_eq!(last.percent, 100);

    for pair in events.windows(2) {
        assert!(
            pair[0].percent <= pair[1].percent,
            "progress went backwards: {} then {}",
            pair[0],
            pair[1]
        );
    }
    assert!(events.iter().rev().skip(2).all(|e| e.percent < 100));

    let place_failures = events
        .iter()
        .filter(|e| e.agent_name.as_deref() == Some("place") && e.phase == Phase::Failed)
        .count();
    assert_eq!(place_failures, 1);

    let product_progress: Vec<u8> = events
        .iter()
        .filter(|e| e.agent_name.as_deref() == Some("product") && e.phase == Phase::Progress)
        .map(|e| e.percent)
        .collect();
    assert_eq!(product_progress, vec![6, 13, 24]);

    let state = controller.snapshot(&run_id).unwrap();
    assert_eq!(state.status(), RunStatus::Completed);
}

#[tokio::test]
async fn pause_and_resume_are_reported_as_run_events() {
    init_tracing();
    let journal = Journal::new();
    let controller = RunController::new(registry(
        vec![ScriptedAgent::new("product", &journal)],
        &[],
    ));
    let run_id = RunId::from("paused-run");
    let stream = controller.subscribe(&run_id);
    controller.start_with_id(run_id.clone(), json!({})).unwrap();
    controller.pause(&run_id).unwrap();

    let mut snapshots = controller.watch(&run_id).unwrap();
    with_timeout(snapshots.wait_for(|s| s.status() == RunStatus::Paused))
        .await
        .unwrap();
    controller.resume(&run_id).unwrap();

    let phases: Vec<(Option<String>, Phase)> = collect_events(stream)
        .await
        .into_iter()
        .map(|e| (e.agent_name, e.phase))
        .collect();
    assert_eq!(
        phases,
        vec![
            (None, Phase::Started),
            (None, Phase::Paused),
            (None, Phase::Resumed),
            (Some("product".to_string()), Phase::Started),
            (Some("product".to_string()), Phase::Completed),
            (None, Phase::Completed),
        ]
    );
}

#[tokio::test]
async fn broken_sink_does_not_disturb_the_run() {
    init_tracing();
    let journal = Journal::new();
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let seen: Arc<Mutex<Vec<u64>>> = Arc::default();

    broadcaster.add_sink(
        Scope::All,
        "websocket",
        Arc::new(|_: &ProgressEvent| -> anyhow::Result<()> {
            anyhow::bail!("connection reset by peer")
        }),
    );
    let recorder = seen.clone();
    broadcaster.add_sink(
        Scope::All,
        "recorder",
        Arc::new(move |e: &ProgressEvent| -> anyhow::Result<()> {
            recorder.lock().unwrap().push(e.sequence);
            Ok(())
        }),
    );

    let controller =
        RunController::with_broadcaster(registry(agents(&journal), &[]), broadcaster.clone());
    let run_id = controller.start(json!({})).unwrap();
    let state = with_timeout(controller.wait(&run_id)).await.unwrap();
    assert_eq!(state.status(), RunStatus::Completed);

    // The terminal snapshot and the final events go out in one publish.
    let all = collect_events(controller.subscribe(&run_id)).await;
    assert!(all.is_empty());
    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert_eq!(seen, (1..=seen.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn subscribe_all_sees_every_run() {
    init_tracing();
    let journal = Journal::new();
    let controller = RunController::new(registry(
        vec![ScriptedAgent::new("product", &journal)],
        &[],
    ));
    let mut all = controller.subscribe_all();

    let a = controller.start(json!({})).unwrap();
    let b = controller.start(json!({})).unwrap();
    with_timeout(controller.wait(&a)).await.unwrap();
    with_timeout(controller.wait(&b)).await.unwrap();

    let mut completed = Vec::new();
    while completed.len() < 2 {
        let event = with_timeout(all.recv()).await.unwrap();
        if event.is_run_level() && event.phase == Phase::Completed {
            completed.push(event.run_id);
        }
    }
    completed.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(completed, expected);
}
