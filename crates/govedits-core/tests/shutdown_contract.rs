//! Contract Test: Run Lifecycle
//!
//! Cancellation persists the cursor and ends the run cleanly, a backfill run
//! ends on its own once its window is consumed, and only fetch failures are
//! survivable.

mod common;

use common::*;
use govedits_core::traits::FeedMode;
use govedits_core::{EngineEvent, Error, MemoryCursorStore, Orchestrator, RunOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn cancellation_persists_the_cursor() {
    let factory = ScriptedFactory::new().script(
        FeedMode::Stream,
        vec![Step::Batch(vec![
            edit(1001, 1, "203.0.113.5"),
            named_edit(1002, 4),
        ])],
    );
    let store = MemoryCursorStore::new();

    let (orchestrator, rx) = Orchestrator::new(
        &config(FeedMode::Stream),
        matcher(),
        Arc::new(factory),
        Arc::new(store.clone()),
        collaborators(&RecordingSink::new(), &RecordingPublisher::new(), None),
        clock(10),
    )
    .unwrap();
    let (outcome, events, _) = run_batches(orchestrator, rx, 1).await;

    assert_eq!(outcome, RunOutcome::Shutdown);
    assert_eq!(
        events.last(),
        Some(&EngineEvent::Stopped {
            reason: "Shutdown signal".to_string()
        })
    );

    // unmatched edits still move the cursor
    let document = store.document(FeedMode::Stream).await.unwrap();
    assert_eq!(document.cursor.watermark().timestamp, Some(at(4)));
    assert_eq!(document.dedup.len(), 1);
}

#[tokio::test]
async fn backfill_run_ends_when_the_window_is_consumed() {
    let factory = ScriptedFactory::new().script(
        FeedMode::Backfill,
        vec![Step::Batch(vec![edit(1001, -100, "203.0.113.5")])],
    );
    let store = MemoryCursorStore::new();
    let sink = RecordingSink::new();

    let (mut orchestrator, mut rx) = Orchestrator::new(
        &config(FeedMode::Backfill),
        matcher(),
        Arc::new(factory),
        Arc::new(store.clone()),
        collaborators(&sink, &RecordingPublisher::new(), None),
        clock(10),
    )
    .unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(CancellationToken::new()),
    )
    .await
    .expect("backfill run ends by itself")
    .unwrap();
    assert_eq!(outcome, RunOutcome::Exhausted);
    assert_eq!(sink.ids(), vec!["rev:1001"]);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.contains(&EngineEvent::BackfillCompleted {
        window_start: at(-86_400),
        window_end: at(0)
    }));

    let document = store.document(FeedMode::Backfill).await.unwrap();
    assert!(document.cursor.plan().unwrap().is_complete());
}

#[tokio::test]
async fn fetch_failures_are_reported_and_retried() {
    let factory = ScriptedFactory::new().script(
        FeedMode::Poll,
        vec![
            Step::Fail(Error::transient("HTTP 503")),
            Step::Fail(Error::malformed("truncated JSON")),
            Step::Batch(vec![edit(1001, 1, "203.0.113.5")]),
        ],
    );
    let sink = RecordingSink::new();

    let (orchestrator, rx) = Orchestrator::new(
        &config(FeedMode::Poll),
        matcher(),
        Arc::new(factory),
        Arc::new(MemoryCursorStore::new()),
        collaborators(&sink, &RecordingPublisher::new(), None),
        clock(10),
    )
    .unwrap();
    let (outcome, events, _) = run_batches(orchestrator, rx, 1).await;

    assert_eq!(outcome, RunOutcome::Shutdown);
    let failures = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::FetchFailed { mode: FeedMode::Poll, .. }))
        .count();
    assert_eq!(failures, 2);
    assert_eq!(sink.ids(), vec!["rev:1001"]);
}

#[tokio::test]
async fn other_source_errors_end_the_run() {
    let factory = ScriptedFactory::new().script(
        FeedMode::Poll,
        vec![Step::Fail(Error::state_store("read-only file system"))],
    );

    let (mut orchestrator, _rx) = Orchestrator::new(
        &config(FeedMode::Poll),
        matcher(),
        Arc::new(factory),
        Arc::new(MemoryCursorStore::new()),
        collaborators(&RecordingSink::new(), &RecordingPublisher::new(), None),
        clock(10),
    )
    .unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(CancellationToken::new()),
    )
    .await
    .expect("run ends on a fatal error");
    assert!(matches!(result, Err(Error::StateStore(_))));
}
