//! Test doubles and common utilities for contract tests
//!
//! Sources replay a fixed script of steps; collaborators record what they
//! were handed so tests can assert on exactly what was dispatched.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use govedits_core::clock::FixedClock;
use govedits_core::engine::Collaborators;
use govedits_core::error::{Error, Result};
use govedits_core::event::{EditEvent, EventId, Watermark};
use govedits_core::ranges::{Matcher, RangeTable};
use govedits_core::traits::{
    BackfillPlan, DiffCapture, FeedBatch, FeedMode, FeedSource, MatchRecord, Post, Publisher,
    RecordSink, ResumptionCursor, SensitiveClassifier, SensitivityReport, SourceFactory,
};
use govedits_core::{MatchResult, WatchConfig};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Range table used by every contract test
pub const RANGES: &str = "\
start_ip,end_ip,organization,is_federal
203.0.113.0,203.0.113.255,Example Gov,yes
198.51.100.0,198.51.100.255,Exampleton City Council,no
192.0.2.0,192.0.2.255,U.S. House of Representatives,yes
";

pub fn matcher() -> Matcher {
    Matcher::new(Arc::new(RangeTable::load(RANGES.as_bytes()).unwrap()))
}

/// 2024-05-01 12:00:00 UTC plus `secs`
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

/// Anonymous edit from `address`
pub fn edit(rev: u64, secs: i64, address: &str) -> EditEvent {
    EditEvent {
        title: format!("Page {}", rev),
        timestamp: at(secs),
        editor_address: Some(address.to_string()),
        comment: "copyedit".to_string(),
        revision_id: Some(rev),
        parent_revision_id: Some(rev - 1),
        change_id: Some(rev + 50_000),
        wiki_domain: "en.wikipedia.org".to_string(),
        old_len: Some(1000),
        new_len: Some(1010),
    }
}

/// Edit by a named account
pub fn named_edit(rev: u64, secs: i64) -> EditEvent {
    EditEvent {
        editor_address: None,
        ..edit(rev, secs, "0.0.0.0")
    }
}

/// Config with instant retries and every mode default
pub fn config(mode: FeedMode) -> WatchConfig {
    let mut config = WatchConfig::new("ranges.csv");
    config.mode = mode;
    config.tier = govedits_core::Tier::All;
    config.engine.retry_delay_ms = 0;
    config.engine.max_backoff_ms = 0;
    config.dispatch.capture_timeout_secs = 1;
    config.dispatch.publish_timeout_secs = 1;
    config.dispatch.record_timeout_secs = 1;
    config
}

/// One scripted step of a source
#[derive(Debug)]
pub enum Step {
    /// Yield these events as one batch
    Batch(Vec<EditEvent>),
    /// Fail with this error
    Fail(Error),
    /// Report a feed gap measured at `now`
    Gap(DateTime<Utc>),
    /// Block until the run is cancelled
    Idle,
}

/// Source that replays a script, then idles (or ends, for backfill)
pub struct ScriptedSource {
    mode: FeedMode,
    cursor: ResumptionCursor,
    steps: VecDeque<Step>,
    advanced: Arc<Mutex<Vec<ResumptionCursor>>>,
}

#[async_trait]
impl FeedSource for ScriptedSource {
    fn mode(&self) -> FeedMode {
        self.mode
    }

    async fn produce_batch(&mut self) -> Result<Option<FeedBatch>> {
        match self.steps.pop_front() {
            Some(Step::Batch(events)) => {
                let mut cursor = self.cursor.clone();
                for event in &events {
                    cursor.watermark_mut().observe(event);
                }
                Ok(Some(FeedBatch::new(events, cursor)))
            }
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Gap(now)) => Err(Error::GapExceeded {
                since: self.cursor.watermark().timestamp.unwrap_or(now),
                now,
            }),
            Some(Step::Idle) => {
                std::future::pending::<()>().await;
                Ok(None)
            }
            None if self.mode == FeedMode::Backfill => {
                if let ResumptionCursor::Backfill { plan, .. } = &mut self.cursor {
                    plan.pending.clear();
                    plan.continuation = None;
                }
                Ok(None)
            }
            None => {
                std::future::pending::<()>().await;
                Ok(None)
            }
        }
    }

    fn current_cursor(&self) -> ResumptionCursor {
        self.cursor.clone()
    }

    fn advance_cursor(&mut self, batch: &FeedBatch) {
        self.cursor = batch.cursor.clone();
        self.advanced.lock().unwrap().push(batch.cursor.clone());
    }
}

/// What the factory was asked to build
#[derive(Debug, Clone, PartialEq)]
pub enum Created {
    Resumed(FeedMode, Option<ResumptionCursor>),
    Window(DateTime<Utc>, DateTime<Utc>),
}

/// Factory handing out one script per created source, in order, per mode
#[derive(Default, Clone)]
pub struct ScriptedFactory {
    scripts: Arc<Mutex<HashMap<FeedMode, VecDeque<Vec<Step>>>>>,
    created: Arc<Mutex<Vec<Created>>>,
    advanced: Arc<Mutex<Vec<ResumptionCursor>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next source of `mode`
    pub fn script(self, mode: FeedMode, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(mode)
            .or_default()
            .push_back(steps);
        self
    }

    pub fn created(&self) -> Vec<Created> {
        self.created.lock().unwrap().clone()
    }

    pub fn advanced(&self) -> Vec<ResumptionCursor> {
        self.advanced.lock().unwrap().clone()
    }

    fn next_steps(&self, mode: FeedMode) -> VecDeque<Step> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&mode)
            .and_then(|queue| queue.pop_front())
            .map(VecDeque::from)
            .unwrap_or_default()
    }

    fn source(&self, cursor: ResumptionCursor) -> Box<dyn FeedSource> {
        let mode = cursor.mode();
        Box::new(ScriptedSource {
            mode,
            cursor,
            steps: self.next_steps(mode),
            advanced: Arc::clone(&self.advanced),
        })
    }
}

impl SourceFactory for ScriptedFactory {
    fn create(
        &self,
        mode: FeedMode,
        cursor: Option<ResumptionCursor>,
    ) -> Result<Box<dyn FeedSource>> {
        self.created
            .lock()
            .unwrap()
            .push(Created::Resumed(mode, cursor.clone()));

        let cursor = match cursor {
            Some(cursor) => cursor,
            None => ResumptionCursor::empty(mode).unwrap_or_else(|| ResumptionCursor::Backfill {
                watermark: Watermark::default(),
                plan: BackfillPlan::new(at(-86_400), at(0)),
            }),
        };
        Ok(self.source(cursor))
    }

    fn create_backfill(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Box<dyn FeedSource>> {
        self.created
            .lock()
            .unwrap()
            .push(Created::Window(window_start, window_end));
        Ok(self.source(ResumptionCursor::Backfill {
            watermark: Watermark::default(),
            plan: BackfillPlan::new(window_start, window_end),
        }))
    }
}

/// Record sink that keeps rows in memory and can fail or stall on demand
#[derive(Default, Clone)]
pub struct RecordingSink {
    rows: Arc<Mutex<Vec<MatchRecord>>>,
    failures: Arc<Mutex<HashMap<EventId, usize>>>,
    stalls: Arc<Mutex<HashMap<EventId, std::time::Duration>>>,
    seed: Arc<Mutex<Vec<EventId>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` appends of `id`
    pub fn fail(&self, id: EventId, times: usize) {
        self.failures.lock().unwrap().insert(id, times);
    }

    /// Hang for `delay` after the next write of `id` has landed
    pub fn stall(&self, id: EventId, delay: std::time::Duration) {
        self.stalls.lock().unwrap().insert(id, delay);
    }

    /// Ids reported by `recent_ids`
    pub fn seed(&self, ids: Vec<EventId>) {
        *self.seed.lock().unwrap() = ids;
    }

    pub fn rows(&self) -> Vec<MatchRecord> {
        self.rows.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.rows().into_iter().map(|r| r.id.0).collect()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    fn name(&self) -> &str {
        "recording-sink"
    }

    async fn append(&self, record: &MatchRecord) -> Result<()> {
        if let Some(left) = self.failures.lock().unwrap().get_mut(&record.id) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
        }
        self.rows.lock().unwrap().push(record.clone());
        let stall = self.stalls.lock().unwrap().remove(&record.id);
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn recent_ids(&self, limit: usize) -> Result<Vec<EventId>> {
        let seed = self.seed.lock().unwrap();
        Ok(seed.iter().rev().take(limit).rev().cloned().collect())
    }
}

/// Publisher that remembers posts; optionally always fails
#[derive(Default, Clone)]
pub struct RecordingPublisher {
    posts: Arc<Mutex<Vec<Post>>>,
    failing: bool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn posts(&self) -> Vec<Post> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    fn name(&self) -> &str {
        "recording-publisher"
    }

    async fn publish(&self, post: &Post) -> Result<String> {
        if self.failing {
            return Err(Error::dispatch("recording-publisher", "rate limited"));
        }
        let mut posts = self.posts.lock().unwrap();
        posts.push(post.clone());
        Ok(format!("post-{}", posts.len()))
    }
}

/// Capture that answers with a fixed path, or fails
pub struct StaticCapture {
    result: Option<PathBuf>,
}

impl StaticCapture {
    pub fn ok(path: &str) -> Self {
        Self {
            result: Some(PathBuf::from(path)),
        }
    }

    pub fn failing() -> Self {
        Self { result: None }
    }
}

#[async_trait]
impl DiffCapture for StaticCapture {
    fn name(&self) -> &str {
        "static-capture"
    }

    async fn capture(&self, _result: &MatchResult) -> Result<PathBuf> {
        self.result
            .clone()
            .ok_or_else(|| Error::dispatch("static-capture", "browser crashed"))
    }
}

/// Classifier that never flags anything
pub struct QuietClassifier;

impl SensitiveClassifier for QuietClassifier {
    fn classify(&self, _text: &str, _excluded: &[String]) -> SensitivityReport {
        SensitivityReport::default()
    }
}

/// Collaborators wired to the given doubles
pub fn collaborators(
    sink: &RecordingSink,
    publisher: &RecordingPublisher,
    capture: Option<StaticCapture>,
) -> Collaborators {
    Collaborators {
        classifier: Arc::new(QuietClassifier),
        capture: capture.map(|c| Arc::new(c) as Arc<dyn DiffCapture>),
        publisher: Some(Arc::new(publisher.clone())),
        records: Arc::new(sink.clone()),
    }
}

/// Clock pinned to `at(secs)`
pub fn clock(secs: i64) -> Arc<FixedClock> {
    Arc::new(FixedClock::new(at(secs)))
}

/// Run until `batches` batches were applied, then cancel
///
/// Returns the outcome, every engine event seen and the orchestrator.
pub async fn run_batches(
    mut orchestrator: govedits_core::Orchestrator,
    mut rx: tokio::sync::mpsc::Receiver<govedits_core::EngineEvent>,
    batches: usize,
) -> (
    govedits_core::RunOutcome,
    Vec<govedits_core::EngineEvent>,
    govedits_core::Orchestrator,
) {
    let token = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move {
            let outcome = orchestrator.run(token).await;
            (outcome, orchestrator)
        }
    });

    let mut seen = Vec::new();
    let mut applied = 0;
    while applied < batches {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("engine event within timeout")
            .expect("event channel open");
        if matches!(event, govedits_core::EngineEvent::BatchApplied { .. }) {
            applied += 1;
        }
        seen.push(event);
    }

    token.cancel();
    let (outcome, orchestrator) = handle.await.unwrap();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    (outcome.unwrap(), seen, orchestrator)
}
