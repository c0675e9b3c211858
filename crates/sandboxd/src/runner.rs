//! Process runner.
//!
//! Runs exactly one external command per invocation, rooted at a resolved
//! working directory. Key responsibilities:
//! - Spawn the command in a fresh process group with piped output
//! - Forward every stdout/stderr chunk to an `OutputSink` in arrival order
//! - Enforce the timeout and honor cancellation with SIGTERM, a grace
//!   period, then SIGKILL to the whole group
//! - Report how the process ended
//!
//! The interface is deliberately narrow (`spawn`, `start_output`, `signal`,
//! `wait`, `supervise`) so the registry never touches process handles.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use sandbox_core::{CommandSpec, Config, ExecutionSpec, OutputStream};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages while a process runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for draining stdout/stderr after the process exits or is killed.
///
/// Background children of a finished command can keep the pipes open; the
/// readers are abandoned after this long.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read size for output pipes.
const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Receives output chunks as they are read from the child.
///
/// Called from one reader task per stream; chunks of the same stream arrive
/// strictly in order.
pub trait OutputSink: Send + Sync {
    fn on_output(&self, stream: OutputStream, data: &[u8]);
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exited on its own. Death by an outside signal `n` reports `128 + n`.
    Exited(i32),
    TimedOut,
    Cancelled,
}

/// Signals the runner sends to a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shell used for string commands (`<shell> -c <command>`).
    pub shell: String,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            grace_period: Duration::from_secs(2),
        }
    }
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shell: config.shell.clone(),
            grace_period: config.grace_period(),
        }
    }
}

/// Spawns and supervises child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RunnerConfig::default())
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn build_command(&self, spec: &ExecutionSpec, working_dir: &Path) -> (Command, String) {
        let (mut cmd, program) = match &spec.command {
            CommandSpec::Shell(script) => {
                let mut cmd = Command::new(&self.config.shell);
                cmd.arg("-c").arg(script);
                (cmd, self.config.shell.clone())
            }
            CommandSpec::Argv { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                (cmd, program.clone())
            }
        };

        cmd.current_dir(working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        (cmd, program)
    }

    /// Start the process. Nothing is running if this returns an error.
    pub fn spawn(&self, spec: &ExecutionSpec, working_dir: &Path) -> Result<SupervisedProcess> {
        let (mut cmd, program) = self.build_command(spec, working_dir);

        debug!(
            program = %program,
            working_dir = %working_dir.display(),
            env_overrides = spec.env.len(),
            "spawning process"
        );

        let child = cmd
            .spawn()
            .map_err(|source| RunnerError::Spawn { program, source })?;
        let pid = child.id();

        Ok(SupervisedProcess {
            child,
            pid,
            pumps: Vec::new(),
            grace_period: self.config.grace_period,
        })
    }

    /// Spawn, stream output to `sink` and supervise until the process ends.
    pub async fn run(
        &self,
        spec: &ExecutionSpec,
        working_dir: &Path,
        sink: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome> {
        let mut process = self.spawn(spec, working_dir)?;
        process.start_output(sink);
        process.supervise(spec.timeout.as_duration(), cancel).await
    }
}

/// A running child process and its output readers.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    pid: Option<u32>,
    pumps: Vec<JoinHandle<std::io::Result<()>>>,
    grace_period: Duration,
}

impl SupervisedProcess {
    /// Process id, which is also the process group id on Unix.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Start one reader task per output pipe.
    pub fn start_output(&mut self, sink: Arc<dyn OutputSink>) {
        if let Some(stdout) = self.child.stdout.take() {
            let sink = Arc::clone(&sink);
            self.pumps
                .push(tokio::spawn(pump(stdout, OutputStream::Stdout, sink)));
        }
        if let Some(stderr) = self.child.stderr.take() {
            self.pumps
                .push(tokio::spawn(pump(stderr, OutputStream::Stderr, sink)));
        }
    }

    /// Send a signal to the process group.
    pub fn signal(&mut self, signal: Signal) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            match self.pid {
                Some(pid) => signal_group(pid, signal),
                None => Ok(()),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            self.child.start_kill()
        }
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    ///
    /// Returns once the process has been reaped. Any other members of the
    /// group still alive at that point are killed too.
    pub async fn terminate(&mut self) -> std::io::Result<ExitStatus> {
        if let Err(err) = self.signal(Signal::Terminate) {
            warn!(pid = ?self.pid, error = %err, "failed to send SIGTERM");
        }

        let status = match timeout(self.grace_period, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    pid = ?self.pid,
                    grace_ms = self.grace_period.as_millis() as u64,
                    "process ignored SIGTERM; killing"
                );
                if let Err(err) = self.signal(Signal::Kill) {
                    warn!(pid = ?self.pid, error = %err, "failed to send SIGKILL");
                }
                if let Err(err) = self.child.start_kill() {
                    debug!(pid = ?self.pid, error = %err, "direct kill failed");
                }
                self.child.wait().await?
            }
        };

        if let Err(err) = self.signal(Signal::Kill) {
            debug!(pid = ?self.pid, error = %err, "failed to sweep process group");
        }
        Ok(status)
    }

    /// Drive the process to completion under `limit` and `cancel`.
    pub async fn supervise(
        mut self,
        limit: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let deadline = limit.map(|l| started + l);

        let outcome = loop {
            let sleep_duration = match deadline {
                Some(deadline) => {
                    HEARTBEAT_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))
                }
                None => HEARTBEAT_INTERVAL,
            };

            tokio::select! {
                status = self.child.wait() => {
                    break ProcessOutcome::Exited(exit_code(status?));
                }
                () = cancel.cancelled() => {
                    info!(pid = ?self.pid, "cancellation requested; terminating process group");
                    self.terminate().await?;
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        warn!(
                            pid = ?self.pid,
                            timeout_ms = limit.map_or(0, |l| l.as_millis() as u64),
                            "process timed out; terminating process group"
                        );
                        self.terminate().await?;
                        break ProcessOutcome::TimedOut;
                    }
                    info!(
                        pid = ?self.pid,
                        elapsed_sec = started.elapsed().as_secs(),
                        "process still running"
                    );
                }
            }
        };

        self.drain_output().await;
        Ok(outcome)
    }

    /// Wait for the readers to reach end-of-file.
    async fn drain_output(&mut self) {
        for task in std::mem::take(&mut self.pumps) {
            let abort = task.abort_handle();
            match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => warn!(pid = ?self.pid, error = %err, "output capture failed"),
                Ok(Err(err)) => warn!(pid = ?self.pid, error = %err, "output reader panicked"),
                Err(_) => {
                    warn!(pid = ?self.pid, "output still open after exit; abandoning reader");
                    abort.abort();
                }
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal as NixSignal};
    use nix::unistd::Pid;

    let sig = match signal {
        Signal::Terminate => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    let pgid = i32::try_from(pid).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
    })?;

    match killpg(Pid::from_raw(pgid), sig) {
        // Group already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Copy one pipe into the sink chunk by chunk.
async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: OutputStream,
    sink: Arc<dyn OutputSink>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..n]);
        let ready = utf8_boundary(&pending);
        if ready > 0 {
            sink.on_output(stream, &pending[..ready]);
            pending.drain(..ready);
        }
    }

    if !pending.is_empty() {
        sink.on_output(stream, &pending);
    }
    Ok(())
}

/// Length of the prefix of `buf` that does not end in a truncated UTF-8
/// sequence. Invalid bytes are not held back.
fn utf8_boundary(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => buf.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::{ExecutionRequest, RequestLimits};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collect {
        chunks: Mutex<Vec<(OutputStream, Vec<u8>)>>,
    }

    impl Collect {
        fn text(&self, stream: OutputStream) -> String {
            let chunks = self.chunks.lock().unwrap();
            let bytes: Vec<u8> = chunks
                .iter()
                .filter(|(s, _)| *s == stream)
                .flat_map(|(_, d)| d.clone())
                .collect();
            String::from_utf8(bytes).unwrap()
        }
    }

    impl OutputSink for Collect {
        fn on_output(&self, stream: OutputStream, data: &[u8]) {
            self.chunks.lock().unwrap().push((stream, data.to_vec()));
        }
    }

    fn spec(req: ExecutionRequest) -> ExecutionSpec {
        req.validate(&RequestLimits::default()).unwrap()
    }

    fn runner(grace_ms: u64) -> ProcessRunner {
        ProcessRunner::new(RunnerConfig {
            shell: "/bin/sh".to_string(),
            grace_period: Duration::from_millis(grace_ms),
        })
    }

    async fn run(
        req: ExecutionRequest,
        dir: &Path,
    ) -> (Result<ProcessOutcome>, Arc<Collect>) {
        let sink = Arc::new(Collect::default());
        let outcome = runner(500)
            .run(&spec(req), dir, sink.clone(), CancellationToken::new())
            .await;
        (outcome, sink)
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let (outcome, sink) = run(ExecutionRequest::shell("echo hello"), dir.path()).await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::Exited(0));
        assert_eq!(sink.text(OutputStream::Stdout), "hello\n");
        assert_eq!(sink.text(OutputStream::Stderr), "");
    }

    #[tokio::test]
    async fn keeps_streams_separate() {
        let dir = TempDir::new().unwrap();
        let (outcome, sink) = run(
            ExecutionRequest::shell("echo out1; echo err1 >&2; echo out2; echo err2 >&2"),
            dir.path(),
        )
        .await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::Exited(0));
        assert_eq!(sink.text(OutputStream::Stdout), "out1\nout2\n");
        assert_eq!(sink.text(OutputStream::Stderr), "err1\nerr2\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let dir = TempDir::new().unwrap();
        let (outcome, _) = run(ExecutionRequest::shell("exit 3"), dir.path()).await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::Exited(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn death_by_signal_maps_to_shell_convention() {
        let dir = TempDir::new().unwrap();
        let (outcome, _) = run(ExecutionRequest::shell("kill -9 $$"), dir.path()).await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::Exited(128 + 9));
    }

    #[tokio::test]
    async fn runs_in_working_dir_with_env() {
        let dir = TempDir::new().unwrap();
        let (outcome, sink) = run(
            ExecutionRequest::shell("pwd; echo \"$GREETING\"").with_env("GREETING", "hi there"),
            dir.path(),
        )
        .await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::Exited(0));
        let out = sink.text(OutputStream::Stdout);
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        let mut lines = out.lines();
        let pwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(pwd, canonical);
        assert_eq!(lines.next(), Some("hi there"));
    }

    #[tokio::test]
    async fn argv_commands_bypass_the_shell() {
        let dir = TempDir::new().unwrap();
        let (outcome, sink) = run(
            ExecutionRequest::argv(["echo", "$HOME", "a b"]),
            dir.path(),
        )
        .await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::Exited(0));
        assert_eq!(sink.text(OutputStream::Stdout), "$HOME a b\n");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let (outcome, sink) = run(
            ExecutionRequest::argv(["definitely_not_a_real_binary_xyz"]),
            dir.path(),
        )
        .await;
        assert!(matches!(outcome, Err(RunnerError::Spawn { .. })));
        assert!(sink.chunks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn timeout_preserves_partial_output() {
        let dir = TempDir::new().unwrap();
        let started = std::time::Instant::now();
        let (outcome, sink) = run(
            ExecutionRequest::shell("echo before; sleep 5; echo after")
                .with_timeout(Duration::from_millis(300)),
            dir.path(),
        )
        .await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::TimedOut);
        assert_eq!(sink.text(OutputStream::Stdout), "before\n");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_processes_that_ignore_sigterm() {
        let dir = TempDir::new().unwrap();
        let started = std::time::Instant::now();
        let (outcome, _) = run(
            ExecutionRequest::shell("trap '' TERM; sleep 10")
                .with_timeout(Duration::from_millis(200)),
            dir.path(),
        )
        .await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::TimedOut);
        // 200ms timeout + 500ms grace, well short of the sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn termination_reaches_background_children() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("late");
        let script = format!("(sleep 1; touch {}) & sleep 10", marker.display());
        let (outcome, _) = run(
            ExecutionRequest::shell(script).with_timeout(Duration::from_millis(200)),
            dir.path(),
        )
        .await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::TimedOut);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background child survived termination");
    }

    #[tokio::test]
    async fn cancellation_terminates_process() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let sink = Arc::new(Collect::default());
        let runner = runner(500);
        let spec = spec(ExecutionRequest::shell("echo started; sleep 10"));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = runner.run(&spec, dir.path(), sink.clone(), cancel).await;
        assert_eq!(outcome.unwrap(), ProcessOutcome::Cancelled);
        assert_eq!(sink.text(OutputStream::Stdout), "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn spawn_exposes_pid_before_supervision() {
        let dir = TempDir::new().unwrap();
        let runner = runner(500);
        let spec = spec(ExecutionRequest::shell("true"));
        let mut process = runner.spawn(&spec, dir.path()).unwrap();
        assert!(process.pid().is_some());
        process.start_output(Arc::new(Collect::default()));
        let outcome = process.supervise(None, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Exited(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signalling_a_reaped_group_is_ok() {
        let dir = TempDir::new().unwrap();
        let runner = runner(500);
        let spec = spec(ExecutionRequest::shell("true"));
        let mut process = runner.spawn(&spec, dir.path()).unwrap();
        let status = process.wait().await.unwrap();
        assert!(status.success());

        process.signal(Signal::Terminate).unwrap();
        process.signal(Signal::Kill).unwrap();
    }

    #[test]
    fn utf8_boundary_holds_back_split_sequences() {
        let snowman = "☃".as_bytes();
        assert_eq!(utf8_boundary(b"abc"), 3);
        let mut buf = b"ab".to_vec();
        buf.extend_from_slice(&snowman[..2]);
        assert_eq!(utf8_boundary(&buf), 2);
        buf.push(snowman[2]);
        assert_eq!(utf8_boundary(&buf), 5);
        assert_eq!(utf8_boundary(&[b'a', 0xff, b'b']), 3);
    }

    #[test]
    fn runner_config_from_daemon_config() {
        let mut config = Config::default();
        config.shell = "/bin/bash".to_string();
        config.grace_period_ms = 250;
        let rc = RunnerConfig::from_config(&config);
        assert_eq!(rc.shell, "/bin/bash");
        assert_eq!(rc.grace_period, Duration::from_millis(250));
    }
}
