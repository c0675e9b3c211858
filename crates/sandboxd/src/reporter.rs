//! Result reporter.
//!
//! Turns execution records into structured results and event streams.
//! Read-only with respect to records: it takes snapshots under the record
//! lock and never changes status.

use std::time::Duration;

use futures_util::Stream;
use sandbox_core::{Config, ExecutionEvent, ExecutionResult, OutputStream};
use tokio::sync::mpsc;

use crate::registry::{Execution, RecordState};

/// Events a subscriber may fall behind before it is disconnected.
pub(crate) const SUBSCRIBER_BUFFER: usize = 1024;

/// Where a new subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Replay {
    /// Only events produced after subscribing.
    #[default]
    Live,
    /// Buffered stdout, then buffered stderr, then live events.
    FromStart,
}

/// Renders results and hands out subscriptions.
#[derive(Debug, Clone)]
pub struct Reporter {
    max_wait: Duration,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Reporter {
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_wait())
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Current result of an execution.
    pub fn result(&self, execution: &Execution) -> ExecutionResult {
        result(execution)
    }

    /// Wait for the execution to finish, up to `wait` (capped at the
    /// configured maximum), then return its result as it stands.
    pub async fn await_result(&self, execution: &Execution, wait: Duration) -> ExecutionResult {
        let wait = wait.min(self.max_wait);
        if !execution.is_terminal() {
            let _ = tokio::time::timeout(wait, execution.wait_terminal()).await;
        }
        result(execution)
    }

    /// Subscribe to an execution's events.
    pub fn subscribe(&self, execution: &Execution, replay: Replay) -> EventSubscription {
        let mut state = execution.lock_state();
        attach(execution, &mut state, replay)
    }
}

/// Snapshot an execution as a result.
pub fn result(execution: &Execution) -> ExecutionResult {
    let state = execution.lock_state();
    render(execution, &state)
}

pub(crate) fn render(execution: &Execution, state: &RecordState) -> ExecutionResult {
    let duration_ms = match (state.started_at, state.ended_at) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
        _ => None,
    };

    ExecutionResult {
        id: execution.id().clone(),
        status: state.status,
        exit_code: state.exit_code,
        stdout: String::from_utf8_lossy(&state.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&state.stderr).into_owned(),
        stdout_truncated: state.stdout_truncated,
        stderr_truncated: state.stderr_truncated,
        error: state.error.clone(),
        command: execution.command().to_string(),
        working_dir: execution.working_dir().display().to_string(),
        created_at: execution.created_at(),
        started_at: state.started_at,
        ended_at: state.ended_at,
        duration_ms,
    }
}

/// Open a subscription under an already held record lock.
pub(crate) fn attach(
    execution: &Execution,
    state: &mut RecordState,
    replay: Replay,
) -> EventSubscription {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

    if replay == Replay::FromStart {
        let history = [
            (OutputStream::Stdout, &state.stdout, state.stdout_seq),
            (OutputStream::Stderr, &state.stderr, state.stderr_seq),
        ];
        for (stream, data, seq) in history {
            if let Some(seq) = seq.filter(|_| !data.is_empty()) {
                let _ = tx.try_send(ExecutionEvent::Output {
                    stream,
                    seq,
                    data: data.clone(),
                });
            }
        }
    }

    if state.status.is_terminal() {
        let _ = tx.try_send(ExecutionEvent::Finished(Box::new(render(execution, state))));
        // `tx` drops here, so the subscription ends after `Finished`.
    } else {
        state.subscribers.push(tx);
    }

    EventSubscription {
        rx,
        finished: false,
    }
}

/// A finite sequence of events ending with `Finished`.
///
/// Consumed either by polling with `try_next` or asynchronously with
/// `next` / `into_stream`. A consumer that falls `SUBSCRIBER_BUFFER`
/// events behind is cut off, and its sequence ends without `Finished`.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::Receiver<ExecutionEvent>,
    finished: bool,
}

impl EventSubscription {
    /// Next event, or `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        self.observe(event.as_ref());
        event
    }

    /// Next event if one is ready, without waiting.
    pub fn try_next(&mut self) -> Option<ExecutionEvent> {
        if self.finished {
            return None;
        }
        match self.rx.try_recv() {
            Ok(event) => {
                self.observe(Some(&event));
                Some(event)
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.observe(None);
                None
            }
        }
    }

    /// True once `Finished` has been delivered or the producer went away.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn observe(&mut self, event: Option<&ExecutionEvent>) {
        match event {
            Some(event) if !event.is_finished() => {}
            _ => {
                self.finished = true;
                self.rx.close();
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ExecutionEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}
