//! Scheduler tests against in-memory fakes of the store and the model.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use nwnbridge_domain::{RowChange, TriggerCatalog, WriteTarget};

use super::*;
use crate::infrastructure::ports::{InferenceError, InferenceRequest};

const GREET: &str = r#"[{"name":"greet","table":"npc_events","match":{"type":"approach"},
    "prompt_template":"Greet {tag}","write_target":"npc_events.response"}]"#;

fn m(value: i64) -> SequenceMarker {
    SequenceMarker::new(value)
}

fn approach(tag: &str, marker: i64) -> RowChange {
    RowChange::new(tag, "npc_events", m(marker)).with_field("type", "approach")
}

// =============================================================================
// Fake store
// =============================================================================

#[derive(Default)]
struct StoreState {
    events: Vec<RowChange>,
    /// tag -> column -> value
    targets: HashMap<String, HashMap<String, String>>,
    consumed: HashSet<String>,
    resume: SequenceMarker,
    scans: u32,
    fail_scans: bool,
    fail_persist: bool,
    hang_commits: bool,
    commit_errors: VecDeque<StoreError>,
}

#[derive(Default)]
struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    fn with<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn add_target(&self, tag: &str) {
        self.with(|s| s.targets.insert(tag.to_string(), HashMap::new()));
    }

    fn push_event(&self, change: RowChange) {
        self.with(|s| s.events.push(change));
    }

    fn value(&self, tag: &str, column: &str) -> Option<String> {
        self.with(|s| s.targets.get(tag).and_then(|t| t.get(column).cloned()))
    }

    fn response(&self, tag: &str) -> Option<String> {
        self.value(tag, "response")
    }

    fn resume(&self) -> SequenceMarker {
        self.with(|s| s.resume)
    }
}

#[async_trait]
impl StateSourcePort for FakeStore {
    async fn scan(&self, since: SequenceMarker, limit: usize) -> Result<Vec<RowChange>, StoreError> {
        self.with(|s| {
            s.scans += 1;
            if s.fail_scans {
                return Err(StoreError::busy("scan", "database is locked"));
            }
            let mut changes: Vec<RowChange> = s
                .events
                .iter()
                .filter(|c| c.marker > since)
                .cloned()
                .collect();
            changes.sort_by_key(|c| c.marker);
            changes.truncate(limit);
            Ok(changes)
        })
    }

    async fn commit(&self, target: &WriteTarget, tag: &str, value: &str) -> Result<(), StoreError> {
        if self.with(|s| s.hang_commits) {
            std::future::pending::<()>().await;
        }
        self.with(|s| {
            if let Some(e) = s.commit_errors.pop_front() {
                return Err(e);
            }
            if s.consumed.contains(tag) {
                return Err(StoreError::write_conflict(target, tag, "consumed"));
            }
            let Some(row) = s.targets.get_mut(tag) else {
                return Err(StoreError::write_conflict(target, tag, "no such row"));
            };
            row.insert(target.column.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn read_field(
        &self,
        target: &WriteTarget,
        tag: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.value(tag, target.column.as_str()))
    }

    async fn current_marker(&self) -> Result<SequenceMarker, StoreError> {
        Ok(self.resume())
    }

    async fn persist_marker(&self, marker: SequenceMarker) -> Result<(), StoreError> {
        self.with(|s| {
            if s.fail_persist {
                return Err(StoreError::database("persist_marker", "disk full"));
            }
            s.resume = marker;
            Ok(())
        })
    }
}

// =============================================================================
// Fake model
// =============================================================================

enum Step {
    Reply(&'static str),
    Fail(InferenceError),
}

#[derive(Default)]
struct ModelState {
    script: VecDeque<Step>,
    calls: Vec<InferenceRequest>,
    active: usize,
    max_active: usize,
}

#[derive(Default)]
struct FakeModel {
    state: Mutex<ModelState>,
    /// How long each call takes
    latency: Duration,
}

impl FakeModel {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn script(&self, steps: Vec<Step>) {
        self.state.lock().unwrap().script.extend(steps);
    }

    fn calls(&self) -> Vec<InferenceRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.prompt).collect()
    }

    fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }
}

#[async_trait]
impl InferencePort for FakeModel {
    async fn generate(&self, request: InferenceRequest) -> Result<String, InferenceError> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(request.clone());
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            state.script.pop_front()
        };

        tokio::time::sleep(self.latency).await;
        let result = match step {
            Some(Step::Reply(text)) => Ok(text.to_string()),
            Some(Step::Fail(e)) => Err(e),
            None => Ok(format!("re: {}", request.prompt)),
        };
        self.state.lock().unwrap().active -= 1;
        result
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        Ok(vec!["gemma3:latest".to_string()])
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    store: Arc<FakeStore>,
    model: Arc<FakeModel>,
    catalog: CatalogHandle,
    status: watch::Sender<BackendStatus>,
    config: DispatchConfig,
}

impl Harness {
    fn new(triggers: &str) -> Self {
        Self::with_model(triggers, FakeModel::default())
    }

    fn with_model(triggers: &str, model: FakeModel) -> Self {
        let config = DispatchConfig {
            poll_interval: Duration::from_millis(50),
            retry_backoff: Backoff::new(100, 1000).without_jitter(),
            inference_timeout: Duration::from_secs(5),
            commit_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(100),
            ..DispatchConfig::new("gemma3")
        };
        Self {
            store: Arc::new(FakeStore::default()),
            model: Arc::new(model),
            catalog: CatalogHandle::new(TriggerCatalog::parse(triggers).unwrap()),
            status: watch::channel(BackendStatus::Available).0,
            config,
        }
    }

    fn scheduler(&self) -> DispatchScheduler {
        self.scheduler_on(self.status.subscribe())
    }

    fn scheduler_on(&self, backend: watch::Receiver<BackendStatus>) -> DispatchScheduler {
        DispatchScheduler::new(
            self.store.clone(),
            self.model.clone(),
            self.catalog.clone(),
            backend,
            self.config.clone(),
        )
    }

    fn start(&self) -> (CancellationToken, tokio::task::JoinHandle<Result<RunSummary, DispatchError>>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.scheduler().run(cancel.clone()));
        (cancel, handle)
    }

    /// Run until `done` holds, then shut down cleanly.
    async fn run_until(&self, done: impl Fn(&Harness) -> bool) -> RunSummary {
        let (cancel, handle) = self.start();
        wait_for(|| done(self)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap()
    }
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn matching_change_is_generated_and_written_back() {
    let h = Harness::new(GREET);
    h.store.add_target("npc_42");
    h.store.push_event(approach("npc_42", 7));
    h.model.script(vec![Step::Reply("Well met, stranger.")]);

    let summary = h.run_until(|h| h.store.resume() == m(7)).await;

    let calls = h.model.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].prompt, "Greet npc_42");
    assert_eq!(calls[0].model, "gemma3");
    assert_eq!(h.store.response("npc_42").as_deref(), Some("Well met, stranger."));
    assert_eq!(summary.jobs_created, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.resume_marker, m(7));
}

#[tokio::test(start_paused = true)]
async fn unmatched_changes_only_advance_resume_marker() {
    let h = Harness::new(GREET);
    h.store.push_event(RowChange::new("npc_1", "npc_events", m(3)).with_field("type", "leave"));
    h.store.push_event(RowChange::new("door_1", "door_events", m(4)));

    let summary = h.run_until(|h| h.store.resume() == m(4)).await;

    assert!(h.model.calls().is_empty());
    assert_eq!(summary.changes_scanned, 2);
    assert_eq!(summary.jobs_created, 0);
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_retried_within_attempt_limit() {
    let h = Harness::new(GREET);
    h.store.add_target("npc_42");
    h.store.push_event(approach("npc_42", 7));
    h.model.script(vec![
        Step::Fail(InferenceError::Timeout(Duration::from_secs(5))),
        Step::Fail(InferenceError::Timeout(Duration::from_secs(5))),
        Step::Reply("Third time lucky"),
    ]);

    let summary = h.run_until(|h| h.store.resume() == m(7)).await;

    assert_eq!(h.model.calls().len(), 3);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(h.store.response("npc_42").as_deref(), Some("Third time lucky"));
}

#[tokio::test(start_paused = true)]
async fn job_is_abandoned_after_attempt_limit_and_marker_advances() {
    let mut h = Harness::new(GREET);
    h.config.max_attempts = 2;
    h.store.add_target("npc_42");
    h.store.push_event(approach("npc_42", 7));
    h.model.script(vec![
        Step::Fail(InferenceError::Timeout(Duration::from_secs(5))),
        Step::Fail(InferenceError::Timeout(Duration::from_secs(5))),
        Step::Reply("never used"),
    ]);

    let summary = h.run_until(|h| h.store.resume() == m(7)).await;

    assert_eq!(h.model.calls().len(), 2);
    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(h.store.response("npc_42"), None);
}

#[tokio::test(start_paused = true)]
async fn same_key_jobs_run_one_at_a_time_in_marker_order() {
    let mut h = Harness::with_model(GREET, FakeModel::with_latency(Duration::from_millis(200)));
    h.config.max_in_flight = 4;
    h.store.add_target("npc_1");
    h.store.add_target("npc_2");
    h.store.push_event(approach("npc_1", 1));
    h.store.push_event(approach("npc_2", 2));

    let summary = h.run_until(|h| h.store.resume() == m(2)).await;

    assert_eq!(h.model.prompts(), vec!["Greet npc_1", "Greet npc_2"]);
    assert_eq!(h.model.max_active(), 1);
    assert_eq!(summary.succeeded, 2);
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_run_concurrently() {
    let triggers = r#"[{"name":"greet","table":"npc_events","prompt_template":"Greet {tag}",
        "write_target":"npc_events.response","concurrency_key":"greet:{tag}"}]"#;
    let mut h = Harness::with_model(triggers, FakeModel::with_latency(Duration::from_millis(200)));
    h.config.max_in_flight = 4;
    for (i, tag) in ["npc_1", "npc_2", "npc_3"].iter().enumerate() {
        h.store.add_target(tag);
        h.store.push_event(approach(tag, i as i64 + 1));
    }

    h.run_until(|h| h.store.resume() == m(3)).await;

    assert_eq!(h.model.max_active(), 3);
}

#[tokio::test(start_paused = true)]
async fn global_budget_caps_concurrency() {
    let triggers = r#"[{"name":"greet","table":"npc_events","prompt_template":"Greet {tag}",
        "write_target":"npc_events.response","concurrency_key":"{tag}"}]"#;
    let mut h = Harness::with_model(triggers, FakeModel::with_latency(Duration::from_millis(200)));
    h.config.max_in_flight = 2;
    for marker in 1..=5 {
        let tag = format!("npc_{marker}");
        h.store.add_target(&tag);
        h.store.push_event(approach(&tag, marker));
    }

    let summary = h.run_until(|h| h.store.resume() == m(5)).await;

    assert_eq!(h.model.max_active(), 2);
    assert_eq!(summary.succeeded, 5);
}

#[tokio::test(start_paused = true)]
async fn each_matching_trigger_gets_its_own_job() {
    let triggers = r#"[
        {"name":"greet","table":"npc_events","prompt_template":"Greet {tag}",
         "write_target":"npc_events.response"},
        {"name":"emote","table":"npc_events","prompt_template":"Emote for {tag}",
         "model":"llama3.2","write_target":"npc_events.emote"}]"#;
    let h = Harness::new(triggers);
    h.store.add_target("npc_42");
    h.store.push_event(approach("npc_42", 7));

    let summary = h.run_until(|h| h.store.resume() == m(7)).await;

    assert_eq!(summary.jobs_created, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(h.store.response("npc_42").as_deref(), Some("re: Greet npc_42"));
    assert_eq!(h.store.value("npc_42", "emote").as_deref(), Some("re: Emote for npc_42"));
    let emote = h
        .model
        .calls()
        .into_iter()
        .find(|c| c.prompt.starts_with("Emote"))
        .unwrap();
    assert_eq!(emote.model, "llama3.2");
}

#[tokio::test(start_paused = true)]
async fn unknown_placeholders_are_sent_verbatim() {
    let triggers = r#"[{"name":"greet","table":"npc_events",
        "prompt_template":"Greet {tag} about the {weather}","write_target":"npc_events.response"}]"#;
    let h = Harness::new(triggers);
    h.store.add_target("npc_42");
    h.store.push_event(approach("npc_42", 7));

    h.run_until(|h| h.store.resume() == m(7)).await;

    assert_eq!(h.model.prompts(), vec!["Greet npc_42 about the {weather}"]);
}

#[tokio::test(start_paused = true)]
async fn interrupted_commit_is_redelivered_after_restart() {
    let h = Harness::new(GREET);
    h.store.add_target("npc_42");
    h.store.push_event(approach("npc_42", 7));
    h.store.with(|s| s.hang_commits = true);

    // Generation succeeds, then the process stops before the commit lands.
    let (cancel, handle) = h.start();
    wait_for(|| h.model.calls().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();

    assert_eq!(summary.interrupted, 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.resume_marker, SequenceMarker::ORIGIN);
    assert_eq!(h.store.resume(), SequenceMarker::ORIGIN);
    assert_eq!(h.store.response("npc_42"), None);

    // Restart: the same change is delivered again and completes.
    h.store.with(|s| s.hang_commits = false);
    let summary = h.run_until(|h| h.store.resume() == m(7)).await;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.model.calls().len(), 2);
    assert_eq!(h.store.response("npc_42").as_deref(), Some("re: Greet npc_42"));
}

#[tokio::test(start_paused = true)]
async fn replay_against_consumed_target_is_write_conflict() {
    let h = Harness::new(GREET);
    h.store.add_target("npc_42");
    h.store.push_event(approach("npc_42", 7));
    h.model.script(vec![Step::Reply("first"), Step::Reply("second")]);

    h.run_until(|h| h.store.resume() == m(7)).await;
    assert_eq!(h.store.response("npc_42").as_deref(), Some("first"));

    // The game consumes the row; the resume marker is lost and the change replays.
    h.store.with(|s| {
        s.consumed.insert("npc_42".to_string());
        s.resume = SequenceMarker::ORIGIN;
    });
    let summary = h.run_until(|h| h.store.resume() == m(7)).await;

    assert_eq!(summary.conflicts, 1);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(h.store.response("npc_42").as_deref(), Some("first"));
}

#[tokio::test(start_paused = true)]
async fn write_conflict_is_not_retried() {
    let h = Harness::new(GREET);
    // No target row for the tag.
    h.store.push_event(approach("npc_404", 7));

    let summary = h.run_until(|h| h.store.resume() == m(7)).await;

    assert_eq!(h.model.calls().len(), 1);
    assert_eq!(summary.conflicts, 1);
}

#[tokio::test(start_paused = true)]
async fn other_commit_errors_are_retried() {
    let h = Harness::new(GREET);
    h.store.add_target("npc_42");
    h.store.push_event(approach("npc_42", 7));
    h.store.with(|s| {
        s.commit_errors
            .push_back(StoreError::database("commit", "disk I/O error"))
    });

    let summary = h.run_until(|h| h.store.resume() == m(7)).await;

    assert_eq!(h.model.calls().len(), 2);
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn unavailable_backend_pauses_scanning_and_admission() {
    let h = Harness::new(GREET);
    h.status.send_replace(BackendStatus::Unavailable);
    h.store.add_target("npc_42");
    h.store.push_event(approach("npc_42", 7));

    let (cancel, handle) = h.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.store.with(|s| s.scans), 0);
    assert!(h.model.calls().is_empty());

    h.status.send_replace(BackendStatus::Available);
    wait_for(|| h.store.resume() == m(7)).await;
    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_backend_stops_the_loop() {
    let h = Harness::new(GREET);
    let (_cancel, handle) = h.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.status.send_replace(BackendStatus::Failed);
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(DispatchError::BackendFailed)));
}

#[tokio::test(start_paused = true)]
async fn status_channel_closing_while_unavailable_is_fatal() {
    let h = Harness::new(GREET);
    let (status, backend) = watch::channel(BackendStatus::Unavailable);
    let handle = tokio::spawn(h.scheduler_on(backend).run(CancellationToken::new()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    drop(status);
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(DispatchError::BackendFailed)));
}

#[tokio::test(start_paused = true)]
async fn status_channel_closing_while_available_keeps_dispatching() {
    let h = Harness::new(GREET);
    h.store.add_target("npc_42");
    let (status, backend) = watch::channel(BackendStatus::Available);
    drop(status);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(h.scheduler_on(backend).run(cancel.clone()));
    h.store.push_event(approach("npc_42", 3));
    wait_for(|| h.store.resume() == m(3)).await;

    cancel.cancel();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_scan_failures_are_fatal() {
    let h = Harness::new(GREET);
    h.store.with(|s| s.fail_scans = true);

    let (_cancel, handle) = h.start();
    let result = handle.await.unwrap();

    assert!(matches!(
        result,
        Err(DispatchError::ScanFailed { failures: 3, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn persist_failures_do_not_stop_dispatch() {
    let h = Harness::new(GREET);
    h.store.add_target("npc_1");
    h.store.add_target("npc_2");
    h.store.push_event(approach("npc_1", 1));
    h.store.with(|s| s.fail_persist = true);

    let (cancel, handle) = h.start();
    wait_for(|| h.store.response("npc_1").is_some()).await;
    assert_eq!(h.store.resume(), SequenceMarker::ORIGIN);

    h.store.push_event(approach("npc_2", 2));
    wait_for(|| h.store.response("npc_2").is_some()).await;

    h.store.with(|s| s.fail_persist = false);
    wait_for(|| h.store.resume() == m(2)).await;
    cancel.cancel();
    assert_eq!(handle.await.unwrap().unwrap().succeeded, 2);
}

#[tokio::test(start_paused = true)]
async fn resumes_after_persisted_marker() {
    let h = Harness::new(GREET);
    h.store.add_target("npc_1");
    h.store.add_target("npc_2");
    h.store.push_event(approach("npc_1", 1));
    h.store.push_event(approach("npc_2", 2));
    h.store.with(|s| s.resume = m(1));

    h.run_until(|h| h.store.resume() == m(2)).await;

    assert_eq!(h.model.prompts(), vec!["Greet npc_2"]);
    assert_eq!(h.store.response("npc_1"), None);
}

#[tokio::test(start_paused = true)]
async fn reloaded_catalog_applies_to_later_scans() {
    let h = Harness::new(GREET);
    h.store.add_target("npc_1");
    h.store.add_target("npc_2");
    h.store.push_event(approach("npc_1", 1));
    let (cancel, handle) = h.start();
    wait_for(|| h.store.resume() == m(1)).await;

    h.catalog.replace(
        TriggerCatalog::parse(
            r#"[{"name":"greet","table":"npc_events","prompt_template":"Salute {tag}",
                "write_target":"npc_events.response"}]"#,
        )
        .unwrap(),
    );
    h.store.push_event(approach("npc_2", 2));
    wait_for(|| h.store.resume() == m(2)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(h.model.prompts(), vec!["Greet npc_1", "Salute npc_2"]);
}
