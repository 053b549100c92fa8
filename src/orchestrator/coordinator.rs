//! Lifecycle coordinator: drives one detection run from `start` to a terminal
//! status and owns the session's [`RunState`].
//!
//! The event stream and the submission acknowledgement travel independently,
//! so a run can finish before its task id is known. A [`RunToken`] shared by
//! the event handlers and the submission path reconciles the two: handlers
//! settle it the moment a terminal event is dispatched, and a late
//! acknowledgement is only recorded while the token is still open.

use super::connection::{ConnectPhase, ConnectionManager};
use super::submitter::{submit_job, JobSubmitter};
use crate::backend::{Backend, TaskAck};
use crate::error::{DetectError, Result};
use crate::listeners::{ListenerSet, RunHandlers};
use crate::model::{
    CompletedEvent, FailedEvent, InputAsset, Mode, ProgressEvent, ResultItem, RunConfig, RunEvent,
    RunState, RunStatus,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedSender};

#[derive(Debug, Default)]
struct TokenState {
    settled: bool,
    task_id: Option<String>,
}

/// Run-scoped reconciliation token.
#[derive(Debug, Clone)]
pub struct RunToken {
    run: u64,
    state: Arc<Mutex<TokenState>>,
    /// Task ids of earlier runs abandoned while still in flight.
    abandoned: Arc<HashSet<String>>,
}

impl RunToken {
    fn new(run: u64, abandoned: Arc<HashSet<String>>) -> Self {
        Self {
            run,
            state: Arc::new(Mutex::new(TokenState::default())),
            abandoned,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn run_id(&self) -> u64 {
        self.run
    }

    /// Record the acknowledged task id. Returns false when the run already
    /// settled, in which case the id must be discarded.
    pub fn claim(&self, task_id: &str) -> bool {
        let mut st = self.lock();
        if st.settled {
            return false;
        }
        st.task_id = Some(task_id.to_string());
        true
    }

    /// Whether an event for `task_id` belongs to this run. Before the id is
    /// known every event except those of abandoned tasks is accepted.
    pub fn accepts(&self, task_id: &str) -> bool {
        if self.abandoned.contains(task_id) {
            return false;
        }
        self.lock().task_id.as_deref().map_or(true, |t| t == task_id)
    }

    /// Mark the run as finished by a terminal event for `task_id`.
    fn settle_for(&self, task_id: &str) -> bool {
        if self.abandoned.contains(task_id) {
            return false;
        }
        let mut st = self.lock();
        if st.task_id.as_deref().is_some_and(|t| t != task_id) {
            return false;
        }
        st.settled = true;
        true
    }

    /// Close the token without an event (reset or local failure).
    pub fn settle(&self) {
        self.lock().settled = true;
    }

    pub fn is_settled(&self) -> bool {
        self.lock().settled
    }

    fn claimed(&self) -> Option<String> {
        self.lock().task_id.clone()
    }
}

#[derive(Debug)]
enum RunSignal {
    Progress(ProgressEvent),
    Completed(CompletedEvent),
    Failed(FailedEvent),
}

fn run_handlers(token: RunToken, tx: UnboundedSender<RunSignal>) -> RunHandlers {
    let (t1, t2) = (tx.clone(), tx.clone());
    let (k1, k2) = (token.clone(), token);
    RunHandlers {
        on_progress: Arc::new(move |ev: ProgressEvent| {
            let _ = t1.send(RunSignal::Progress(ev));
        }),
        on_completed: Arc::new(move |ev: CompletedEvent| {
            if k1.settle_for(&ev.task_id) {
                tracing::debug!(run = k1.run_id(), task_id = %ev.task_id, "run settled by completion");
            }
            let _ = t2.send(RunSignal::Completed(ev));
        }),
        on_failed: Arc::new(move |ev: FailedEvent| {
            if k2.settle_for(&ev.task_id) {
                tracing::debug!(run = k2.run_id(), task_id = %ev.task_id, "run settled by failure");
            }
            let _ = tx.send(RunSignal::Failed(ev));
        }),
    }
}

pub struct Coordinator<B: Backend> {
    backend: Arc<B>,
    connection: ConnectionManager<B>,
    submitter: JobSubmitter<B>,
    listeners: ListenerSet,
    api_key: String,
    state: RunState,
    token: Option<RunToken>,
    abandoned: HashSet<String>,
    next_run: u64,
    processed_high_water: u32,
    event_tx: Option<UnboundedSender<RunEvent>>,
}

impl<B: Backend> Coordinator<B> {
    pub fn new(backend: Arc<B>, cfg: &RunConfig) -> Self {
        let connection = ConnectionManager::new(backend.clone(), cfg.connect_timeout);
        let submitter = JobSubmitter::new(backend.clone(), cfg.max_file_size_mb, cfg.submit_timeout);
        let listeners = ListenerSet::new(backend.hub());
        Self {
            backend,
            connection,
            submitter,
            listeners,
            api_key: cfg.api_key.clone(),
            state: RunState::default(),
            token: None,
            abandoned: HashSet::new(),
            next_run: 0,
            processed_high_water: 0,
            event_tx: None,
        }
    }

    /// Forward state changes to a presentation layer.
    pub fn with_events(mut self, tx: UnboundedSender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    fn emit(&self, ev: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn set_status(&mut self, status: RunStatus) {
        if self.state.run_status != status {
            tracing::debug!(from = ?self.state.run_status, to = ?status, "run status");
            self.state.run_status = status;
            self.emit(RunEvent::StatusChanged { status });
        }
    }

    fn sync_connection(&mut self) {
        let status = self.connection.status();
        self.state.is_connected = status.is_connected;
        self.state.connection_id = status.connection_id;
    }

    fn clear_run_fields(&mut self) {
        self.state.active_task_id = None;
        self.state.progress_percent = 0;
        self.state.accumulated_results.clear();
        self.state.error = None;
        self.state.total_items = None;
        self.processed_high_water = 0;
    }

    /// Drive one run to a terminal status.
    ///
    /// Returns `Err` only when the run cannot start (a run is in progress or
    /// the previous one was not reset). Every other failure ends in
    /// `RunStatus::Error` with the message in `state().error`.
    pub async fn start(&mut self, inputs: &[InputAsset], mode: Mode) -> Result<RunStatus> {
        match self.state.run_status {
            RunStatus::Idle => {}
            s if s.is_busy() => {
                return Err(DetectError::InvalidState(
                    "a detection run is already in progress".into(),
                ))
            }
            _ => {
                return Err(DetectError::InvalidState(
                    "reset is required before starting a new run".into(),
                ))
            }
        }

        self.clear_run_fields();
        self.sync_connection();
        self.next_run += 1;
        let token = RunToken::new(self.next_run, Arc::new(self.abandoned.clone()));
        self.token = Some(token.clone());
        tracing::info!(run = token.run_id(), mode = mode.as_str(), inputs = inputs.len(), "run started");

        if self.state.is_connected {
            self.set_status(RunStatus::Detecting);
        } else {
            self.set_status(RunStatus::Connecting);
        }

        if let Err(e) = self.execute(&token, inputs, mode).await {
            self.fail(&token, e);
        }
        Ok(self.state.run_status)
    }

    async fn execute(&mut self, token: &RunToken, inputs: &[InputAsset], mode: Mode) -> Result<()> {
        let job = self.submitter.prepare(inputs, mode).await?;
        let connection_id = self.connection.ensure_connected(&self.api_key).await?;
        self.sync_connection();
        self.state.total_items = Some(job.len() as u32);

        let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
        self.listeners.arm(run_handlers(token.clone(), sig_tx));

        let backend = self.backend.clone();
        let api_key = self.api_key.clone();
        let timeout = self.submitter.submit_timeout();
        let submission =
            async move { submit_job(backend.as_ref(), &job, &connection_id, &api_key, timeout).await };
        tokio::pin!(submission);

        let mut conn_rx = self.connection.subscribe();
        let mut submitted = false;
        while !(submitted && self.state.run_status.is_terminal()) {
            tokio::select! {
                ack = &mut submission, if !submitted => {
                    submitted = true;
                    match ack {
                        Ok(ack) => self.accept_ack(token, ack),
                        Err(e) if self.state.run_status.is_terminal() => {
                            tracing::warn!(error = %e, "submission failed after the run finished");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Some(sig) = sig_rx.recv() => self.apply_signal(token, sig),
                changed = conn_rx.changed() => {
                    let lost = changed.is_err()
                        || matches!(*conn_rx.borrow(), ConnectPhase::Disconnected);
                    if lost {
                        self.sync_connection();
                        if !self.state.run_status.is_terminal() {
                            return Err(DetectError::Transport(
                                "connection to the detection service was lost".into(),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn accept_ack(&mut self, token: &RunToken, ack: TaskAck) {
        if self.state.run_status.is_terminal() || !token.claim(&ack.task_id) {
            tracing::debug!(task_id = %ack.task_id, "discarding late task id, run already settled");
            return;
        }
        tracing::info!(task_id = %ack.task_id, message = %ack.message, "task accepted");
        self.state.active_task_id = Some(ack.task_id);
        self.mark_submitted();
    }

    fn apply_signal(&mut self, token: &RunToken, sig: RunSignal) {
        if self.state.run_status.is_terminal() {
            tracing::debug!(?sig, "ignoring event after terminal status");
            return;
        }
        let task_id = match &sig {
            RunSignal::Progress(ev) => &ev.task_id,
            RunSignal::Completed(ev) => &ev.task_id,
            RunSignal::Failed(ev) => &ev.task_id,
        };
        if !token.accepts(task_id) {
            tracing::debug!(%task_id, "ignoring event for another task");
            if !matches!(sig, RunSignal::Progress(_)) && self.abandoned.remove(task_id.as_str()) {
                tracing::debug!(%task_id, "abandoned task reached its end");
            }
            return;
        }
        self.mark_submitted();
        match sig {
            RunSignal::Progress(ev) => self.fold_progress(ev),
            RunSignal::Completed(ev) => {
                tracing::info!(task_id = %ev.task_id, status = ?ev.status, "task completed");
                self.state.progress_percent = 100;
                self.finish(token, RunStatus::Success);
            }
            RunSignal::Failed(ev) => {
                let msg = ev
                    .message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "detection task failed".to_string());
                self.fail(token, DetectError::BackendTask(msg));
            }
        }
    }

    /// Connecting -> Detecting once the backend has the job: on the ack or
    /// on the first event for it, whichever comes first.
    fn mark_submitted(&mut self) {
        if self.state.run_status == RunStatus::Connecting {
            self.set_status(RunStatus::Detecting);
        }
    }

    fn fold_progress(&mut self, ev: ProgressEvent) {
        if let (Some(processed), Some(total)) = (ev.processed, ev.total) {
            if total > 0 && processed >= self.processed_high_water {
                self.processed_high_water = processed;
                self.state.total_items = Some(total);
                let pct = (processed as f64 / total as f64 * 100.0).round().clamp(0.0, 100.0) as u8;
                if pct > self.state.progress_percent {
                    self.state.progress_percent = pct;
                }
                self.emit(RunEvent::Progress {
                    percent: self.state.progress_percent,
                    processed,
                    total,
                });
            } else if total > 0 {
                tracing::debug!(processed, high_water = self.processed_high_water, "stale progress");
            }
        }
        if let Some(msg) = ev.message.as_deref().filter(|m| !m.is_empty()) {
            self.emit(RunEvent::Info(msg.to_string()));
        }
        if let Some(r) = ev.result {
            let item = ResultItem {
                id: format!("{}-{}", ev.task_id, self.state.accumulated_results.len()),
                outcome: r.outcome,
                confidence: r.confidence,
                elapsed_ms: r.elapsed_ms,
                probabilities: r.probabilities,
                error_detail: r.error_detail,
                input_index: r.input_index,
            };
            self.state.accumulated_results.push(item.clone());
            self.emit(RunEvent::ResultAppended { item });
        }
    }

    fn finish(&mut self, token: &RunToken, status: RunStatus) {
        token.settle();
        self.listeners.teardown();
        self.state.active_task_id = None;
        self.sync_connection();
        self.set_status(status);
        tracing::info!(
            run = token.run_id(),
            ?status,
            results = self.state.accumulated_results.len(),
            "run finished"
        );
        self.emit(RunEvent::Finished {
            state: Box::new(self.state.clone()),
        });
    }

    fn fail(&mut self, token: &RunToken, err: DetectError) {
        if self.state.run_status.is_terminal() {
            return;
        }
        if err.is_validation() {
            tracing::warn!(error = %err, "run rejected");
        } else {
            tracing::error!(error = %err, "run failed");
        }
        self.state.error = Some(err.to_string());
        self.finish(token, RunStatus::Error);
    }

    /// Detach from the current run and return to `Idle`. The connection is
    /// kept. The backend is not asked to stop an in-flight task. Its id is
    /// remembered so its late events are refused by later runs until its
    /// terminal event arrives.
    pub fn reset(&mut self) {
        self.listeners.teardown();
        if let Some(token) = self.token.take() {
            if !token.is_settled() {
                tracing::info!(run = token.run_id(), "abandoning in-flight run");
                if let Some(task_id) = token.claimed() {
                    self.abandoned.insert(task_id);
                }
            }
            token.settle();
        }
        self.clear_run_fields();
        self.sync_connection();
        self.set_status(RunStatus::Idle);
    }

    /// End the session.
    pub async fn shutdown(&mut self) {
        self.reset();
        self.connection.close().await;
        self.sync_connection();
        tracing::info!("session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FusionModeRequest, SingleModeRequest};
    use crate::listeners::EventHub;
    use crate::model::{BackendEvent, Outcome, ResultPayload};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// What one submission does.
    #[derive(Default)]
    struct Script {
        /// Dispatched before the ack is returned.
        before_ack: Vec<BackendEvent>,
        ack: Option<Result<TaskAck>>,
        /// Dispatched from a spawned task shortly after the ack.
        after_ack: Vec<BackendEvent>,
    }

    struct ScriptedBackend {
        hub: Arc<EventHub>,
        connects: AtomicUsize,
        submits: AtomicUsize,
        confirm: bool,
        scripts: Mutex<VecDeque<Script>>,
    }

    impl ScriptedBackend {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                hub: EventHub::new(),
                connects: AtomicUsize::new(0),
                submits: AtomicUsize::new(0),
                confirm: true,
                scripts: Mutex::new(scripts.into()),
            })
        }

        fn unconfirmed() -> Arc<Self> {
            Arc::new(Self {
                hub: EventHub::new(),
                connects: AtomicUsize::new(0),
                submits: AtomicUsize::new(0),
                confirm: false,
                scripts: Mutex::new(VecDeque::new()),
            })
        }

        async fn run_script(&self) -> Result<TaskAck> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            for ev in script.before_ack {
                self.hub.dispatch(ev);
            }
            if !script.after_ack.is_empty() {
                let hub = self.hub.clone();
                let events = script.after_ack;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    for ev in events {
                        hub.dispatch(ev);
                    }
                });
            }
            script.ack.unwrap_or_else(|| Ok(ack("t1")))
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn hub(&self) -> Arc<EventHub> {
            self.hub.clone()
        }

        async fn connect(&self, _api_key: &str) -> Result<()> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if self.confirm {
                self.hub.dispatch(BackendEvent::Connected {
                    connection_id: format!("client-{n}"),
                });
            }
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn supported_formats(&self) -> Result<Vec<String>> {
            Ok(vec!["jpg".into(), "jpeg".into(), "png".into()])
        }

        async fn submit_single(&self, _: &SingleModeRequest, _: &str, _: &str) -> Result<TaskAck> {
            self.run_script().await
        }

        async fn submit_fusion(&self, _: &FusionModeRequest, _: &str, _: &str) -> Result<TaskAck> {
            self.run_script().await
        }
    }

    fn cfg() -> RunConfig {
        RunConfig {
            base_url: "http://localhost:8000".into(),
            api_key: "key".into(),
            connect_timeout: Duration::from_millis(100),
            submit_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            supported_formats: vec![],
            max_file_size_mb: 10,
            user_agent: "test".into(),
        }
    }

    fn ack(task: &str) -> TaskAck {
        TaskAck {
            task_id: task.into(),
            message: "queued".into(),
        }
    }

    fn images(names: &[&str]) -> Vec<InputAsset> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| InputAsset::new(i.to_string(), *n, vec![1, 2, 3]))
            .collect()
    }

    fn progress(task: &str, processed: u32, total: u32, outcome: Option<Outcome>) -> BackendEvent {
        BackendEvent::Progress(ProgressEvent {
            task_id: task.into(),
            processed: Some(processed),
            total: Some(total),
            result: outcome.map(|outcome| ResultPayload {
                outcome,
                confidence: 0.9,
                probabilities: vec![0.1, 0.9],
                elapsed_ms: 40,
                error_detail: None,
                input_index: Some(processed as usize - 1),
            }),
            message: None,
        })
    }

    fn completed(task: &str) -> BackendEvent {
        BackendEvent::TaskCompleted(CompletedEvent {
            task_id: task.into(),
            status: Some("completed".into()),
            message: None,
        })
    }

    fn failed(task: &str, msg: &str) -> BackendEvent {
        BackendEvent::TaskFailed(FailedEvent {
            task_id: task.into(),
            message: Some(msg.into()),
        })
    }

    #[tokio::test]
    async fn three_images_reach_success_with_three_results() {
        let backend = ScriptedBackend::new(vec![Script {
            after_ack: vec![
                progress("t1", 1, 3, Some(Outcome::Real)),
                progress("t1", 2, 3, Some(Outcome::Fake)),
                progress("t1", 3, 3, Some(Outcome::Real)),
                completed("t1"),
            ],
            ..Default::default()
        }]);
        let mut c = Coordinator::new(backend.clone(), &cfg());

        let status = c
            .start(&images(&["a.jpg", "b.png", "c.jpeg"]), Mode::Single)
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Success);
        let st = c.state();
        assert_eq!(st.accumulated_results.len(), 3);
        assert_eq!(st.progress_percent, 100);
        assert_eq!(st.active_task_id, None);
        assert!(st.is_connected);
        assert_eq!(st.connection_id.as_deref(), Some("client-1"));
        assert_eq!(st.accumulated_results[1].outcome, Outcome::Fake);
        assert_eq!(st.accumulated_results[2].input_index, Some(2));
        assert_eq!(backend.hub.armed_runs(), 0);
    }

    #[tokio::test]
    async fn completion_before_ack_leaves_task_id_unset() {
        let backend = ScriptedBackend::new(vec![Script {
            before_ack: vec![progress("t1", 1, 1, Some(Outcome::Real)), completed("t1")],
            ack: Some(Ok(ack("t1"))),
            ..Default::default()
        }]);
        let mut c = Coordinator::new(backend, &cfg());

        let status = c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap();

        assert_eq!(status, RunStatus::Success);
        assert_eq!(c.state().active_task_id, None);
        assert_eq!(c.state().accumulated_results.len(), 1);
    }

    #[tokio::test]
    async fn unsupported_format_fails_before_any_network_call() {
        let backend = ScriptedBackend::new(vec![]);
        let mut c = Coordinator::new(backend.clone(), &cfg());

        let status = c
            .start(&images(&["a.jpg", "b.gif", "c.png"]), Mode::Single)
            .await
            .unwrap();

        assert_eq!(status, RunStatus::Error);
        let msg = c.state().error.clone().unwrap();
        assert!(msg.contains("b.gif"));
        assert!(!msg.contains("a.jpg"));
        assert!(!msg.contains("c.png"));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 0);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn progress_is_folded_monotonically() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = ScriptedBackend::new(vec![Script {
            after_ack: vec![
                progress("t1", 1, 4, None),
                progress("t1", 3, 4, None),
                progress("t1", 2, 4, None),
                completed("t1"),
            ],
            ..Default::default()
        }]);
        let mut c = Coordinator::new(backend, &cfg()).with_events(tx);

        c.start(&images(&["a.jpg"; 4]), Mode::Single).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let RunEvent::Progress { percent, .. } = ev {
                seen.push(percent);
            }
        }
        assert_eq!(seen, vec![25, 75]);
        assert_eq!(c.state().progress_percent, 100);
    }

    #[tokio::test]
    async fn failure_event_keeps_partial_results() {
        let backend = ScriptedBackend::new(vec![Script {
            after_ack: vec![
                progress("t1", 1, 3, Some(Outcome::Real)),
                failed("t1", "model crashed"),
            ],
            ..Default::default()
        }]);
        let mut c = Coordinator::new(backend, &cfg());

        let status = c.start(&images(&["a.jpg", "b.jpg", "c.jpg"]), Mode::Single).await.unwrap();

        assert_eq!(status, RunStatus::Error);
        assert_eq!(c.state().error.as_deref(), Some("model crashed"));
        assert_eq!(c.state().accumulated_results.len(), 1);
        assert_eq!(c.state().active_task_id, None);
    }

    #[tokio::test]
    async fn events_for_other_tasks_are_ignored() {
        let backend = ScriptedBackend::new(vec![Script {
            ack: Some(Ok(ack("t2"))),
            after_ack: vec![
                progress("old", 1, 1, Some(Outcome::Fake)),
                completed("old"),
                progress("t2", 1, 1, Some(Outcome::Real)),
                completed("t2"),
            ],
            ..Default::default()
        }]);
        let mut c = Coordinator::new(backend, &cfg());

        c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap();

        assert_eq!(c.state().run_status, RunStatus::Success);
        assert_eq!(c.state().accumulated_results.len(), 1);
        assert_eq!(c.state().accumulated_results[0].outcome, Outcome::Real);
    }

    #[tokio::test]
    async fn reset_twice_matches_reset_once_and_keeps_connection() {
        let backend = ScriptedBackend::new(vec![Script {
            before_ack: vec![progress("t1", 1, 1, Some(Outcome::Real)), completed("t1")],
            ..Default::default()
        }]);
        let mut c = Coordinator::new(backend, &cfg());
        c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap();

        c.reset();
        let once = c.state().clone();
        c.reset();
        assert_eq!(c.state(), &once);

        assert_eq!(once.run_status, RunStatus::Idle);
        assert!(once.accumulated_results.is_empty());
        assert_eq!(once.progress_percent, 0);
        assert!(once.is_connected);
        assert_eq!(once.connection_id.as_deref(), Some("client-1"));
    }

    #[tokio::test]
    async fn second_run_reuses_the_connection() {
        let backend = ScriptedBackend::new(vec![
            Script {
                before_ack: vec![completed("t1")],
                ..Default::default()
            },
            Script {
                ack: Some(Ok(ack("t2"))),
                after_ack: vec![completed("t2")],
                ..Default::default()
            },
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut c = Coordinator::new(backend.clone(), &cfg()).with_events(tx);

        c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap();
        c.reset();
        while rx.try_recv().is_ok() {}
        c.start(&images(&["b.jpg"]), Mode::Single).await.unwrap();

        assert_eq!(c.state().run_status, RunStatus::Success);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
        let first = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            RunEvent::StatusChanged {
                status: RunStatus::Detecting
            }
        ));
    }

    #[tokio::test]
    async fn start_requires_reset_after_terminal_status() {
        let backend = ScriptedBackend::new(vec![]);
        let mut c = Coordinator::new(backend, &cfg());
        c.start(&[], Mode::Single).await.unwrap();
        assert_eq!(c.state().run_status, RunStatus::Error);

        let err = c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap_err();
        assert!(matches!(err, DetectError::InvalidState(_)));
        assert_eq!(c.state().run_status, RunStatus::Error);
    }

    #[tokio::test]
    async fn unpaired_fusion_input_is_rejected_without_submitting() {
        let backend = ScriptedBackend::new(vec![]);
        let mut c = Coordinator::new(backend.clone(), &cfg());

        c.start(&images(&["rgb_001.jpg", "ir_001.png", "rgb_002.jpg"]), Mode::Fusion)
            .await
            .unwrap();

        assert_eq!(c.state().run_status, RunStatus::Error);
        assert!(c.state().error.as_deref().unwrap().contains("rgb_002.jpg"));
        assert_eq!(backend.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transport_failure_on_submit_is_normalized() {
        let backend = ScriptedBackend::new(vec![Script {
            ack: Some(Err(DetectError::transport(
                "error sending request for url (http://localhost:8000/infer/single)",
            ))),
            ..Default::default()
        }]);
        let mut c = Coordinator::new(backend, &cfg());

        c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap();

        assert_eq!(c.state().run_status, RunStatus::Error);
        assert_eq!(
            c.state().error.as_deref(),
            Some(crate::error::BACKEND_UNREACHABLE)
        );
    }

    #[tokio::test]
    async fn unconfirmed_connection_times_out_instead_of_hanging() {
        let backend = ScriptedBackend::unconfirmed();
        let mut c = Coordinator::new(backend.clone(), &cfg());

        let status = c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap();

        assert_eq!(status, RunStatus::Error);
        assert!(c.state().error.as_deref().unwrap().contains("connect timed out"));
        assert!(!c.state().is_connected);
        assert_eq!(backend.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lost_connection_fails_the_run() {
        let backend = ScriptedBackend::new(vec![Script {
            after_ack: vec![progress("t1", 1, 2, Some(Outcome::Real)), BackendEvent::Disconnected],
            ..Default::default()
        }]);
        let mut c = Coordinator::new(backend, &cfg());

        c.start(&images(&["a.jpg", "b.jpg"]), Mode::Single).await.unwrap();

        assert_eq!(c.state().run_status, RunStatus::Error);
        assert!(c.state().error.as_deref().unwrap().contains("connection"));
        assert!(!c.state().is_connected);
        assert_eq!(c.state().connection_id, None);
    }

    #[tokio::test]
    async fn late_events_after_reset_are_dropped() {
        let backend = ScriptedBackend::new(vec![Script {
            before_ack: vec![failed("t1", "boom")],
            ..Default::default()
        }]);
        let mut c = Coordinator::new(backend.clone(), &cfg());
        c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap();
        c.reset();

        backend.hub.dispatch(progress("t1", 1, 1, Some(Outcome::Real)));
        backend.hub.dispatch(completed("t1"));

        assert_eq!(c.state().run_status, RunStatus::Idle);
        assert!(c.state().accumulated_results.is_empty());
        assert_eq!(backend.hub.armed_runs(), 0);
    }

    #[tokio::test]
    async fn abandoned_task_events_do_not_leak_into_the_next_run() {
        let backend = ScriptedBackend::new(vec![
            Script::default(),
            Script {
                before_ack: vec![progress("t1", 1, 1, Some(Outcome::Fake)), completed("t1")],
                ack: Some(Ok(ack("t2"))),
                after_ack: vec![progress("t2", 1, 1, Some(Outcome::Real)), completed("t2")],
            },
        ]);
        let mut c = Coordinator::new(backend.clone(), &cfg());

        let first = tokio::time::timeout(
            Duration::from_millis(50),
            c.start(&images(&["a.jpg"]), Mode::Single),
        )
        .await;
        assert!(first.is_err());
        assert_eq!(c.state().active_task_id.as_deref(), Some("t1"));
        c.reset();

        let status = c.start(&images(&["b.jpg"]), Mode::Single).await.unwrap();

        assert_eq!(status, RunStatus::Success);
        let results = &c.state().accumulated_results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, Outcome::Real);
        assert!(results[0].id.starts_with("t2"));
        assert!(c.abandoned.is_empty());
    }

    #[tokio::test]
    async fn detecting_is_reported_only_once_the_job_is_submitted() {
        let backend = ScriptedBackend::new(vec![Script {
            ack: Some(Err(DetectError::Timeout {
                what: "submit",
                after: Duration::from_secs(1),
            })),
            ..Default::default()
        }]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut c = Coordinator::new(backend.clone(), &cfg()).with_events(tx);

        c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let RunEvent::StatusChanged { status } = ev {
                statuses.push(status);
            }
        }
        assert_eq!(statuses, vec![RunStatus::Connecting, RunStatus::Error]);
        assert_eq!(backend.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connecting_run_moves_to_detecting_on_ack() {
        let backend = ScriptedBackend::new(vec![Script {
            after_ack: vec![completed("t1")],
            ..Default::default()
        }]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut c = Coordinator::new(backend, &cfg()).with_events(tx);

        c.start(&images(&["a.jpg"]), Mode::Single).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let RunEvent::StatusChanged { status } = ev {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![RunStatus::Connecting, RunStatus::Detecting, RunStatus::Success]
        );
    }

    #[test]
    fn token_discards_claim_after_settling() {
        let token = RunToken::new(1, Arc::default());
        assert!(token.accepts("anything"));
        assert!(token.settle_for("t1"));
        assert!(!token.claim("t1"));

        let token = RunToken::new(2, Arc::default());
        assert!(token.claim("t1"));
        assert!(!token.accepts("t9"));
        assert!(!token.settle_for("t9"));
        assert!(!token.is_settled());
    }

    #[test]
    fn token_refuses_abandoned_task_ids_before_claiming() {
        let abandoned: HashSet<String> = ["t1".to_string()].into();
        let token = RunToken::new(2, Arc::new(abandoned));
        assert!(!token.accepts("t1"));
        assert!(!token.settle_for("t1"));
        assert!(!token.is_settled());
        assert!(token.accepts("t2"));
    }
}
