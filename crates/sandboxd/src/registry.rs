//! Execution session registry.
//!
//! Tracks every execution from submission until it is evicted, decides
//! admission against the concurrency limit, and drives each admitted
//! execution through the process runner.
//!
//! Queued executions wait in an explicit FIFO. Slots are handed over under
//! the registry lock when a running execution finishes, so admission order
//! is submission order regardless of how tasks get scheduled.
//!
//! Locking: one registry lock guards the tables and counters, each record
//! has its own lock for status and buffers. When both are needed the
//! registry lock is always taken first.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sandbox_core::{
    Backpressure, Config, ExecutionEvent, ExecutionRequest, ExecutionResult, ExecutionSpec,
    ExecutionStatus, Id, OutputMode, OutputStream, RequestError, RequestLimits,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reporter::{self, EventSubscription, Replay};
use crate::runner::{OutputSink, ProcessOutcome, ProcessRunner};
use crate::workspace::{ResetReport, Workspace, WorkspaceError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("workspace busy: {running} execution(s) running")]
    WorkspaceBusy { running: usize },
    #[error("too many requests: {0}")]
    TooManyRequests(String),
    #[error("execution not found: {0}")]
    NotFound(String),
    #[error("registry is shutting down")]
    Shutdown,
    #[error("workspace error: {0}")]
    Workspace(WorkspaceError),
}

impl From<WorkspaceError> for RegistryError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::InvalidPath { path, reason } => Self::InvalidPath { path, reason },
            WorkspaceError::Busy { running } => Self::WorkspaceBusy { running },
            other => Self::Workspace(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Admission and retention settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_concurrent: usize,
    pub backpressure: Backpressure,
    /// Pending executions allowed in queue mode.
    pub max_queued: usize,
    /// Per-stream capture limit.
    pub max_output_bytes: usize,
    pub retention_count: usize,
    pub retention_age: Duration,
    pub limits: RequestLimits,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RegistryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            backpressure: config.backpressure,
            max_queued: config.max_queued,
            max_output_bytes: config.max_output_bytes,
            retention_count: config.retention_count,
            retention_age: config.retention_age(),
            limits: config.request_limits(),
        }
    }
}

/// Mutable part of an execution record.
#[derive(Debug)]
pub(crate) struct RecordState {
    pub(crate) status: ExecutionStatus,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) pid: Option<u32>,
    pub(crate) error: Option<String>,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) stdout_truncated: bool,
    pub(crate) stderr_truncated: bool,
    /// Sequence number of the last chunk seen on each stream.
    pub(crate) stdout_seq: Option<u64>,
    pub(crate) stderr_seq: Option<u64>,
    pub(crate) next_seq: u64,
    pub(crate) subscribers: Vec<mpsc::Sender<ExecutionEvent>>,
}

impl RecordState {
    fn new() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            started_at: None,
            ended_at: None,
            exit_code: None,
            pid: None,
            error: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            stdout_seq: None,
            stderr_seq: None,
            next_seq: 0,
            subscribers: Vec::new(),
        }
    }

    /// Send to every subscriber. Subscribers that went away or fell a
    /// full buffer behind are dropped, which ends their sequence.
    pub(crate) fn broadcast(&mut self, event: &ExecutionEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    buffer = reporter::SUBSCRIBER_BUFFER,
                    "disconnecting subscriber that stopped reading"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// One execution record.
#[derive(Debug)]
pub struct Execution {
    id: Id,
    spec: ExecutionSpec,
    command: String,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    max_output_bytes: usize,
    state: Mutex<RecordState>,
    cancel: CancellationToken,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl Execution {
    fn new(spec: ExecutionSpec, working_dir: PathBuf, max_output_bytes: usize) -> Self {
        let (status_tx, _) = watch::channel(ExecutionStatus::Pending);
        Self {
            id: Id::new(),
            command: spec.command.display(),
            spec,
            working_dir,
            created_at: Utc::now(),
            max_output_bytes,
            state: Mutex::new(RecordState::new()),
            cancel: CancellationToken::new(),
            status_tx,
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn spec(&self) -> &ExecutionSpec {
        &self.spec
    }

    /// Human-readable command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status_tx.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Process id while the execution is running.
    pub fn pid(&self) -> Option<u32> {
        self.lock_state().pid
    }

    /// Resolves once the execution reaches a terminal state.
    pub async fn wait_terminal(&self) {
        let mut rx = self.status_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(ExecutionStatus::is_terminal).await;
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        // A panic while holding the lock leaves plain data behind.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl OutputSink for Execution {
    fn on_output(&self, stream: OutputStream, data: &[u8]) {
        let mut state = self.lock_state();
        let seq = state.next_seq;
        state.next_seq += 1;

        let limit = self.max_output_bytes;
        let st = &mut *state;
        let (buf, truncated, last_seq) = match stream {
            OutputStream::Stdout => (&mut st.stdout, &mut st.stdout_truncated, &mut st.stdout_seq),
            OutputStream::Stderr => (&mut st.stderr, &mut st.stderr_truncated, &mut st.stderr_seq),
        };
        *last_seq = Some(seq);
        let room = limit.saturating_sub(buf.len());
        if data.len() > room {
            buf.extend_from_slice(&data[..room]);
            if !*truncated {
                *truncated = true;
                warn!(
                    execution_id = %self.id,
                    stream = stream.as_str(),
                    limit,
                    "output limit reached; truncating captured output"
                );
            }
        } else {
            buf.extend_from_slice(data);
        }

        if !state.subscribers.is_empty() {
            state.broadcast(&ExecutionEvent::Output {
                stream,
                seq,
                data: data.to_vec(),
            });
        }
    }
}

/// How an admitted execution ended.
#[derive(Debug)]
enum Terminal {
    Completed(i32),
    Failed(String),
    TimedOut,
    Cancelled,
}

impl Terminal {
    fn status(&self) -> ExecutionStatus {
        match self {
            Self::Completed(_) => ExecutionStatus::Completed,
            Self::Failed(_) => ExecutionStatus::Failed,
            Self::TimedOut => ExecutionStatus::TimedOut,
            Self::Cancelled => ExecutionStatus::Cancelled,
        }
    }
}

/// A newly created execution, plus its event stream when the request
/// asked for streaming output.
#[derive(Debug)]
pub struct Submission {
    pub execution: Arc<Execution>,
    pub events: Option<EventSubscription>,
}

/// A pending execution and the channel that tells its task it may start.
#[derive(Debug)]
struct Queued {
    execution: Arc<Execution>,
    admit: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct Tables {
    executions: HashMap<Id, Arc<Execution>>,
    /// Terminal executions in the order they finished.
    retired: VecDeque<(Id, Instant)>,
    /// Pending executions in submission order.
    queue: VecDeque<Queued>,
    running: usize,
    shutdown: bool,
}

/// The execution registry.
#[derive(Debug)]
pub struct Registry {
    workspace: Arc<Workspace>,
    runner: ProcessRunner,
    config: RegistryConfig,
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn new(workspace: Arc<Workspace>, runner: ProcessRunner, config: RegistryConfig) -> Self {
        Self {
            workspace,
            runner,
            config,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn slots(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Validate, admit and start an execution.
    ///
    /// Invalid requests, paths outside the workspace and refused admissions
    /// fail here, before any record or process exists.
    pub fn submit(self: &Arc<Self>, request: &ExecutionRequest) -> Result<Submission> {
        let spec = request.validate(&self.config.limits)?;
        let working_dir = self.workspace.resolve(&spec.subdirectory)?;

        let (execution, admitted, events) = {
            let mut tables = self.lock_tables();
            if tables.shutdown {
                return Err(RegistryError::Shutdown);
            }

            // A free slot goes to the queue head first, so only take one
            // when nobody is waiting.
            let has_slot = tables.queue.is_empty() && tables.running < self.slots();
            if !has_slot {
                match self.config.backpressure {
                    Backpressure::Reject => {
                        return Err(RegistryError::TooManyRequests(format!(
                            "all {} execution slots are busy",
                            self.config.max_concurrent
                        )));
                    }
                    Backpressure::Queue if tables.queue.len() >= self.config.max_queued => {
                        return Err(RegistryError::TooManyRequests(format!(
                            "{} executions already queued",
                            tables.queue.len()
                        )));
                    }
                    Backpressure::Queue => {}
                }
            }

            let execution = Arc::new(Execution::new(
                spec,
                working_dir,
                self.config.max_output_bytes,
            ));

            let events = {
                let mut state = execution.lock_state();
                (execution.spec.output_mode == OutputMode::Streaming)
                    .then(|| reporter::attach(&execution, &mut state, Replay::Live))
            };

            let admitted = if has_slot {
                Self::start_running(&execution, &mut execution.lock_state());
                tables.running += 1;
                None
            } else {
                let (admit, admitted) = oneshot::channel();
                tables.queue.push_back(Queued {
                    execution: Arc::clone(&execution),
                    admit,
                });
                Some(admitted)
            };

            tables
                .executions
                .insert(execution.id.clone(), Arc::clone(&execution));
            self.evict(&mut tables);
            (execution, admitted, events)
        };

        info!(
            execution_id = %execution.id,
            command = %execution.command,
            working_dir = %execution.working_dir.display(),
            status = %execution.status(),
            "execution submitted"
        );

        tokio::spawn(Arc::clone(self).drive(Arc::clone(&execution), admitted));

        Ok(Submission { execution, events })
    }

    /// Run one execution to a terminal state.
    ///
    /// A queued execution waits for `admitted`. By the time it fires the
    /// record is already `Running` and holds a slot. A cancelled queued
    /// execution is removed from the queue, which drops the sender.
    async fn drive(
        self: Arc<Self>,
        execution: Arc<Execution>,
        admitted: Option<oneshot::Receiver<()>>,
    ) {
        if let Some(admitted) = admitted {
            if admitted.await.is_err() {
                return;
            }
        }

        let terminal = self.run_admitted(&execution).await;
        self.finish(&execution, terminal);
    }

    fn start_running(execution: &Execution, state: &mut RecordState) {
        state.status = ExecutionStatus::Running;
        state.started_at = Some(Utc::now());
        execution.status_tx.send_replace(ExecutionStatus::Running);
    }

    /// Hand free slots to the head of the queue.
    fn promote(&self, tables: &mut Tables) {
        if tables.shutdown {
            return;
        }
        while tables.running < self.slots() {
            let Some(queued) = tables.queue.pop_front() else {
                break;
            };
            {
                let mut state = queued.execution.lock_state();
                if !state.status.can_transition_to(ExecutionStatus::Running) {
                    continue;
                }
                Self::start_running(&queued.execution, &mut state);
            }
            tables.running += 1;
            debug!(execution_id = %queued.execution.id, "execution admitted from queue");
            if queued.admit.send(()).is_err() {
                // Its task is gone; release the slot and settle the record.
                tables.running -= 1;
                let mut state = queued.execution.lock_state();
                Self::settle(&queued.execution, &mut state, Terminal::Cancelled);
                drop(state);
                tables
                    .retired
                    .push_back((queued.execution.id.clone(), Instant::now()));
            }
        }
    }

    async fn run_admitted(&self, execution: &Arc<Execution>) -> Terminal {
        if execution.cancel.is_cancelled() {
            return Terminal::Cancelled;
        }

        let working_dir = match self.workspace.prepare_dir(&execution.spec.subdirectory) {
            Ok(dir) => dir,
            Err(err) => return Terminal::Failed(err.to_string()),
        };

        let mut process = match self.runner.spawn(&execution.spec, &working_dir) {
            Ok(process) => process,
            Err(err) => {
                warn!(execution_id = %execution.id, error = %err, "spawn failed");
                return Terminal::Failed(err.to_string());
            }
        };

        execution.lock_state().pid = process.pid();
        info!(execution_id = %execution.id, pid = ?process.pid(), "process started");

        process.start_output(Arc::clone(execution) as Arc<dyn OutputSink>);
        let outcome = process
            .supervise(
                execution.spec.timeout.as_duration(),
                execution.cancel.clone(),
            )
            .await;

        match outcome {
            Ok(ProcessOutcome::Exited(code)) => Terminal::Completed(code),
            Ok(ProcessOutcome::TimedOut) => Terminal::TimedOut,
            Ok(ProcessOutcome::Cancelled) => Terminal::Cancelled,
            Err(err) => {
                warn!(execution_id = %execution.id, error = %err, "supervision failed");
                Terminal::Failed(err.to_string())
            }
        }
    }

    /// Record the terminal state, notify subscribers and retire the record.
    fn finish(&self, execution: &Execution, terminal: Terminal) {
        let mut tables = self.lock_tables();
        let result = {
            let mut state = execution.lock_state();
            let next = terminal.status();
            if !state.status.can_transition_to(next) {
                return;
            }
            // Only admitted executions reach here, so this frees a slot.
            tables.running -= 1;
            Self::settle(execution, &mut state, terminal);
            reporter::render(execution, &state)
        };
        tables
            .retired
            .push_back((execution.id.clone(), Instant::now()));
        self.promote(&mut tables);
        self.evict(&mut tables);
        drop(tables);

        info!(
            execution_id = %result.id,
            status = %result.status,
            exit_code = ?result.exit_code,
            duration_ms = ?result.duration_ms,
            "execution finished"
        );
    }

    /// Apply a terminal transition under the record lock.
    fn settle(execution: &Execution, state: &mut RecordState, terminal: Terminal) {
        let status = terminal.status();
        match terminal {
            Terminal::Completed(code) => state.exit_code = Some(code),
            Terminal::Failed(error) => state.error = Some(error),
            Terminal::TimedOut | Terminal::Cancelled => {}
        }
        state.status = status;
        state.pid = None;
        state.ended_at = Some(Utc::now());

        let finished = ExecutionEvent::Finished(Box::new(reporter::render(execution, state)));
        state.broadcast(&finished);
        // Dropping the senders closes every subscription.
        state.subscribers.clear();
        execution.status_tx.send_replace(status);
    }

    /// Drop retired records beyond the retention count or age.
    fn evict(&self, tables: &mut Tables) {
        let now = Instant::now();
        while let Some((id, retired_at)) = tables.retired.front() {
            let over_count = tables.retired.len() > self.config.retention_count;
            let too_old = now.duration_since(*retired_at) > self.config.retention_age;
            if !over_count && !too_old {
                break;
            }
            tables.executions.remove(id);
            debug!(execution_id = %id, "evicted execution record");
            tables.retired.pop_front();
        }
    }

    /// Look up an execution by id.
    pub fn get(&self, id: &str) -> Result<Arc<Execution>> {
        let mut tables = self.lock_tables();
        self.evict(&mut tables);
        tables
            .executions
            .get(&Id::from_string(id))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Current result of an execution.
    pub fn snapshot(&self, id: &str) -> Result<ExecutionResult> {
        let execution = self.get(id)?;
        Ok(reporter::result(&execution))
    }

    /// All retained executions, oldest first.
    pub fn list(&self) -> Vec<Arc<Execution>> {
        let mut tables = self.lock_tables();
        self.evict(&mut tables);
        let mut executions: Vec<_> = tables.executions.values().cloned().collect();
        executions.sort_by(|a, b| a.id.cmp(&b.id));
        executions
    }

    /// Cancel an execution.
    ///
    /// A pending execution becomes `Cancelled` immediately and never starts.
    /// A running one is terminated and settles once its process is reaped.
    /// Cancelling a terminal execution does nothing.
    pub fn cancel(&self, id: &str) -> Result<Arc<Execution>> {
        let execution = self.get(id)?;
        self.cancel_execution(&execution);
        Ok(execution)
    }

    fn cancel_execution(&self, execution: &Execution) {
        let mut tables = self.lock_tables();
        let was_pending = {
            let mut state = execution.lock_state();
            match state.status {
                ExecutionStatus::Pending => {
                    Self::settle(execution, &mut state, Terminal::Cancelled);
                    true
                }
                ExecutionStatus::Running => false,
                _ => return,
            }
        };
        execution.cancel.cancel();

        if was_pending {
            // Dropping its admission sender ends the waiting task.
            tables.queue.retain(|q| q.execution.id != execution.id);
            tables
                .retired
                .push_back((execution.id.clone(), Instant::now()));
            self.evict(&mut tables);
            info!(execution_id = %execution.id, "pending execution cancelled");
        } else {
            info!(execution_id = %execution.id, "cancelling running execution");
        }
    }

    /// Remove workspace contents. Refused while anything is running.
    ///
    /// Holds the registry lock throughout so nothing is admitted mid-reset.
    pub fn reset_workspace(&self) -> Result<ResetReport> {
        let tables = self.lock_tables();
        let report = self.workspace.reset(tables.running)?;
        drop(tables);
        Ok(report)
    }

    pub fn running_count(&self) -> usize {
        self.lock_tables().running
    }

    pub fn pending_count(&self) -> usize {
        self.lock_tables().queue.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock_tables().shutdown
    }

    /// Refuse new work, cancel everything in flight and wait for it to stop.
    pub async fn shutdown(&self) {
        let active: Vec<Arc<Execution>> = {
            let mut tables = self.lock_tables();
            tables.shutdown = true;
            tables
                .executions
                .values()
                .filter(|e| !e.is_terminal())
                .cloned()
                .collect()
        };

        if !active.is_empty() {
            info!(count = active.len(), "cancelling active executions");
        }
        for execution in &active {
            self.cancel_execution(execution);
        }
        futures_util::future::join_all(active.iter().map(|e| e.wait_terminal())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunnerConfig;
    use tempfile::TempDir;

    fn registry_with(dir: &TempDir, config: RegistryConfig) -> Arc<Registry> {
        let workspace = Arc::new(Workspace::open(dir.path(), Vec::new(), 0o755).unwrap());
        let runner = ProcessRunner::new(RunnerConfig {
            shell: "/bin/sh".to_string(),
            grace_period: Duration::from_millis(300),
        });
        Arc::new(Registry::new(workspace, runner, config))
    }

    fn config(max_concurrent: usize, backpressure: Backpressure) -> RegistryConfig {
        RegistryConfig {
            max_concurrent,
            backpressure,
            ..RegistryConfig::default()
        }
    }

    async fn finished(execution: &Execution) -> ExecutionResult {
        tokio::time::timeout(Duration::from_secs(10), execution.wait_terminal())
            .await
            .expect("execution did not finish in time");
        reporter::result(execution)
    }

    #[tokio::test]
    async fn echo_completes_with_output() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        let sub = registry.submit(&ExecutionRequest::shell("echo hello")).unwrap();
        let result = finished(&sub.execution).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert!(result.started_at.is_some() && result.ended_at.is_some());
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn traversal_is_rejected_without_a_record() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        let err = registry
            .submit(&ExecutionRequest::shell("../../etc").in_subdirectory("../outside"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPath { .. }));
        assert!(registry.list().is_empty());
        assert_eq!(registry.running_count() + registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_up_front() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        let err = registry.submit(&ExecutionRequest::shell("  ")).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidRequest(RequestError::EmptyCommand)
        ));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn exit_code_only_when_completed() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());

        let failing = registry.submit(&ExecutionRequest::shell("exit 7")).unwrap();
        let missing = registry
            .submit(&ExecutionRequest::argv(["no_such_program_for_tests"]))
            .unwrap();
        let slow = registry
            .submit(&ExecutionRequest::shell("sleep 5").with_timeout(Duration::from_millis(200)))
            .unwrap();

        let failing = finished(&failing.execution).await;
        assert_eq!(failing.status, ExecutionStatus::Completed);
        assert_eq!(failing.exit_code, Some(7));

        let missing = finished(&missing.execution).await;
        assert_eq!(missing.status, ExecutionStatus::Failed);
        assert_eq!(missing.exit_code, None);
        assert!(missing.error.is_some());

        let slow = finished(&slow.execution).await;
        assert_eq!(slow.status, ExecutionStatus::TimedOut);
        assert_eq!(slow.exit_code, None);
    }

    #[tokio::test]
    async fn timeout_keeps_output_from_before_termination() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        let sub = registry
            .submit(
                &ExecutionRequest::shell("echo early; sleep 5; echo late")
                    .with_timeout(Duration::from_millis(300)),
            )
            .unwrap();
        let result = finished(&sub.execution).await;
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.stdout, "early\n");
    }

    #[tokio::test]
    async fn queue_mode_caps_running_executions() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, config(2, Backpressure::Queue));

        let subs: Vec<_> = (0..5)
            .map(|_| registry.submit(&ExecutionRequest::shell("sleep 0.3")).unwrap())
            .collect();
        assert_eq!(registry.running_count(), 2);
        assert_eq!(registry.pending_count(), 3);
        let pending = subs
            .iter()
            .filter(|s| s.execution.status() == ExecutionStatus::Pending)
            .count();
        assert_eq!(pending, 3);

        for sub in &subs {
            let result = finished(&sub.execution).await;
            assert_eq!(result.status, ExecutionStatus::Completed);
            assert!(registry.running_count() <= 2);
        }
        assert_eq!(registry.running_count(), 0);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queued_executions_start_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, config(1, Backpressure::Queue));

        let blocker = registry.submit(&ExecutionRequest::shell("sleep 0.3")).unwrap();
        let queued: Vec<_> = (0..30)
            .map(|i| {
                registry
                    .submit(&ExecutionRequest::shell(format!("echo {i} >> order.log")))
                    .unwrap()
            })
            .collect();
        assert_eq!(registry.pending_count(), 30);

        finished(&blocker.execution).await;
        for sub in &queued {
            let result = finished(&sub.execution).await;
            assert_eq!(result.status, ExecutionStatus::Completed);
        }

        let log = std::fs::read_to_string(dir.path().join("order.log")).unwrap();
        let order: Vec<usize> = log.lines().map(|line| line.parse().unwrap()).collect();
        assert_eq!(order, (0..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn new_submissions_do_not_overtake_the_queue() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, config(1, Backpressure::Queue));

        let blocker = registry.submit(&ExecutionRequest::shell("sleep 0.2")).unwrap();
        let first = registry.submit(&ExecutionRequest::shell("sleep 0.2")).unwrap();
        finished(&blocker.execution).await;

        // The slot went straight to the queued execution.
        assert_eq!(first.execution.status(), ExecutionStatus::Running);
        let late = registry.submit(&ExecutionRequest::shell("true")).unwrap();
        assert_eq!(late.execution.status(), ExecutionStatus::Pending);

        let first = finished(&first.execution).await;
        let late = finished(&late.execution).await;
        assert!(late.started_at >= first.ended_at);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_disconnected() {
        let spec = ExecutionRequest::shell("yes")
            .validate(&RequestLimits::default())
            .unwrap();
        let execution = Execution::new(spec, PathBuf::from("/"), 16);
        let reporter = crate::reporter::Reporter::default();
        let mut lagging = reporter.subscribe(&execution, Replay::Live);
        let mut reading = reporter.subscribe(&execution, Replay::Live);

        for _ in 0..=reporter::SUBSCRIBER_BUFFER {
            execution.on_output(OutputStream::Stdout, b"y\n");
            assert!(reading.try_next().is_some());
        }
        assert_eq!(execution.lock_state().subscribers.len(), 1);
        assert!(!reading.is_finished());

        let mut received = 0;
        while let Some(event) = lagging.next().await {
            assert!(!event.is_finished());
            received += 1;
        }
        assert_eq!(received, reporter::SUBSCRIBER_BUFFER);
        assert!(lagging.is_finished());
        // Captured output stays bounded regardless of subscribers.
        assert_eq!(reporter::result(&execution).stdout.len(), 16);
    }

    #[tokio::test]
    async fn reject_mode_refuses_without_a_record() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, config(1, Backpressure::Reject));

        let first = registry.submit(&ExecutionRequest::shell("sleep 1")).unwrap();
        let err = registry.submit(&ExecutionRequest::shell("true")).unwrap_err();
        assert!(matches!(err, RegistryError::TooManyRequests(_)));
        assert_eq!(registry.list().len(), 1);

        registry.cancel(first.execution.id().as_ref()).unwrap();
        finished(&first.execution).await;
    }

    #[tokio::test]
    async fn queue_limit_applies() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            RegistryConfig {
                max_queued: 1,
                ..config(1, Backpressure::Queue)
            },
        );
        let _running = registry.submit(&ExecutionRequest::shell("sleep 1")).unwrap();
        let _queued = registry.submit(&ExecutionRequest::shell("true")).unwrap();
        let err = registry.submit(&ExecutionRequest::shell("true")).unwrap_err();
        assert!(matches!(err, RegistryError::TooManyRequests(_)));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_pending_never_spawns() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, config(1, Backpressure::Queue));
        let marker = dir.path().join("ran");

        let blocker = registry.submit(&ExecutionRequest::shell("sleep 0.5")).unwrap();
        let queued = registry
            .submit(&ExecutionRequest::shell(format!("touch {}", marker.display())))
            .unwrap();
        assert_eq!(queued.execution.status(), ExecutionStatus::Pending);

        registry.cancel(queued.execution.id().as_ref()).unwrap();
        assert_eq!(queued.execution.status(), ExecutionStatus::Cancelled);
        assert_eq!(registry.pending_count(), 0);

        finished(&blocker.execution).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!marker.exists());
        let result = reporter::result(&queued.execution);
        assert!(result.started_at.is_none());
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn cancelling_running_terminates_it() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        let sub = registry.submit(&ExecutionRequest::shell("sleep 10")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sub.execution.pid().is_some());

        registry.cancel(sub.execution.id().as_ref()).unwrap();
        let result = finished(&sub.execution).await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.exit_code, None);
        assert!(sub.execution.pid().is_none());
    }

    #[tokio::test]
    async fn cancelling_terminal_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        let sub = registry.submit(&ExecutionRequest::shell("echo done")).unwrap();
        let before = finished(&sub.execution).await;

        registry.cancel(sub.execution.id().as_ref()).unwrap();
        let after = registry.snapshot(sub.execution.id().as_ref()).unwrap();
        assert_eq!(before, after);
        assert_eq!(after.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_snapshots_are_stable() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        let sub = registry.submit(&ExecutionRequest::shell("echo once")).unwrap();
        finished(&sub.execution).await;
        let id = sub.execution.id().to_string();
        assert_eq!(registry.snapshot(&id).unwrap(), registry.snapshot(&id).unwrap());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        assert!(matches!(
            registry.get("missing"),
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.cancel("missing"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retention_evicts_oldest_terminal_records() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            RegistryConfig {
                retention_count: 2,
                ..RegistryConfig::default()
            },
        );
        let mut ids = Vec::new();
        for i in 0..3 {
            let sub = registry
                .submit(&ExecutionRequest::shell(format!("echo {i}")))
                .unwrap();
            finished(&sub.execution).await;
            ids.push(sub.execution.id().to_string());
        }
        assert!(matches!(
            registry.get(&ids[0]),
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.get(&ids[1]).is_ok());
        assert!(registry.get(&ids[2]).is_ok());
    }

    #[tokio::test]
    async fn retention_age_evicts_old_records() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            RegistryConfig {
                retention_age: Duration::from_millis(100),
                ..RegistryConfig::default()
            },
        );
        let sub = registry.submit(&ExecutionRequest::shell("true")).unwrap();
        finished(&sub.execution).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn subdirectory_is_created_and_used() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        let sub = registry
            .submit(&ExecutionRequest::shell("pwd").in_subdirectory("nested/work"))
            .unwrap();
        let result = finished(&sub.execution).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.stdout.trim_end().ends_with("nested/work"));
        assert!(dir.path().join("nested/work").is_dir());
    }

    #[tokio::test]
    async fn output_beyond_the_limit_is_truncated() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            RegistryConfig {
                max_output_bytes: 8,
                ..RegistryConfig::default()
            },
        );
        let sub = registry
            .submit(&ExecutionRequest::shell("echo 0123456789abcdef"))
            .unwrap();
        let result = finished(&sub.execution).await;
        assert_eq!(result.stdout, "01234567");
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
    }

    #[tokio::test]
    async fn reset_is_refused_while_running() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        std::fs::write(dir.path().join("scratch.txt"), "x").unwrap();

        let sub = registry.submit(&ExecutionRequest::shell("sleep 10")).unwrap();
        assert!(matches!(
            registry.reset_workspace(),
            Err(RegistryError::WorkspaceBusy { running: 1 })
        ));

        registry.cancel(sub.execution.id().as_ref()).unwrap();
        finished(&sub.execution).await;
        let report = registry.reset_workspace().unwrap();
        assert_eq!(report.removed, 1);
        assert!(!dir.path().join("scratch.txt").exists());
    }

    #[tokio::test]
    async fn shutdown_cancels_everything_and_refuses_new_work() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, config(1, Backpressure::Queue));
        let running = registry.submit(&ExecutionRequest::shell("sleep 10")).unwrap();
        let pending = registry.submit(&ExecutionRequest::shell("sleep 10")).unwrap();

        tokio::time::timeout(Duration::from_secs(10), registry.shutdown())
            .await
            .unwrap();
        assert_eq!(running.execution.status(), ExecutionStatus::Cancelled);
        assert_eq!(pending.execution.status(), ExecutionStatus::Cancelled);
        assert!(matches!(
            registry.submit(&ExecutionRequest::shell("true")),
            Err(RegistryError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn streaming_submitter_sees_every_event() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, RegistryConfig::default());
        let sub = registry
            .submit(&ExecutionRequest::shell("echo one; echo two >&2").streaming())
            .unwrap();
        let mut events = sub.events.expect("streaming request has events");

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut finished_result = None;
        while let Some(event) = events.next().await {
            match event {
                ExecutionEvent::Output { stream: OutputStream::Stdout, data, .. } => {
                    stdout.extend(data);
                }
                ExecutionEvent::Output { stream: OutputStream::Stderr, data, .. } => {
                    stderr.extend(data);
                }
                ExecutionEvent::Finished(result) => finished_result = Some(*result),
            }
        }
        assert_eq!(stdout, b"one\n");
        assert_eq!(stderr, b"two\n");
        let result = finished_result.expect("finished event");
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.stdout, "one\n");
    }
}
