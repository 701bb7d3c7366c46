//! Ownership of the worker subprocess: spawning, stream wiring, exit
//! detection, backoff-paced restarts and shutdown.
//!
//! The supervisor itself never runs concurrently with anything that mutates
//! it; the session dispatcher calls into it from one task. Everything that
//! waits (stdout, stderr, exit, timers) runs in helper tasks that report back
//! through [`Event`]s tagged with the process generation, so reports from a
//! process that has already been replaced are recognisably stale.

use std::{
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use loopscribe_observability::{safe_eprintln, trace};

use crate::codec::{self, Decoded, FrameDecoder, Message, WorkerInfo};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::gate::{GateState, ReadinessGate};

const READ_CHUNK: usize = 8 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Things the dispatcher reacts to besides caller commands.
#[derive(Debug)]
pub(crate) enum Event {
    Frame { generation: u64, decoded: Decoded },
    Exited { generation: u64, status: Option<String> },
    WriteFailed {
        generation: u64,
        request: Option<(String, u64)>,
        error: String,
    },
    ReadyTimeout { generation: u64 },
    RestartDue { epoch: u64 },
    Deadline { id: String, seq: u64 },
}

/// One frame queued for the worker's stdin. `request` names the registration
/// to fail if the write does not go through.
#[derive(Debug)]
struct Outbound {
    bytes: Vec<u8>,
    request: Option<(String, u64)>,
}

/// The live process. Dropping it closes the stdin queue; the process itself
/// is only killed through `kill`.
#[derive(Debug)]
struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    spawned_at: Instant,
    writer: mpsc::UnboundedSender<Outbound>,
    writer_task: JoinHandle<()>,
    kill: CancellationToken,
}

/// What the supervisor decided after the worker went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Restarting { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorSnapshot {
    pub state: GateState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub generation: u64,
    pub pid: Option<u32>,
    pub worker: Option<WorkerInfo>,
    pub next_restart_ms: Option<u64>,
}

pub(crate) struct Supervisor {
    config: WorkerConfig,
    events: mpsc::UnboundedSender<Event>,
    gate: ReadinessGate,
    handle: Option<WorkerHandle>,
    retry_count: u32,
    generation: u64,
    restart_epoch: u64,
    restart_timer: Option<CancellationToken>,
    next_restart: Option<Duration>,
    ready_timer: Option<CancellationToken>,
    worker: Option<WorkerInfo>,
}

impl Supervisor {
    pub(crate) fn new(config: WorkerConfig, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            config,
            events,
            gate: ReadinessGate::new(),
            handle: None,
            retry_count: 0,
            generation: 0,
            restart_epoch: 0,
            restart_timer: None,
            next_restart: None,
            ready_timer: None,
            worker: None,
        }
    }

    pub(crate) fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    pub(crate) fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub(crate) fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            state: self.gate.state(),
            retry_count: self.retry_count,
            max_retries: self.config.restart.max_retries,
            generation: self.generation,
            pid: self.handle.as_ref().and_then(|h| h.pid),
            worker: self.worker.clone(),
            next_restart_ms: self.next_restart.map(|d| d.as_millis() as u64),
        }
    }

    /// Generation of the most recently spawned process.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// True when `generation` is the process currently owned.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.generation == generation)
    }

    /// Spawns the worker unless one is already running. From `Failed` this is
    /// the explicit restart: the retry budget starts over.
    pub(crate) fn start(&mut self) -> WorkerResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        match self.gate.state() {
            GateState::Stopped => return Err(WorkerError::Stopped),
            GateState::Failed => self.retry_count = 0,
            _ => {}
        }
        self.cancel_restart();
        self.gate.spawning();
        if let Err(e) = self.spawn() {
            self.gate.failed(self.retry_count);
            return Err(e);
        }
        Ok(())
    }

    fn spawn(&mut self) -> WorkerResult<()> {
        let data_dir = self.config.data_dir.clone();
        let span = trace::Span::start(
            &data_dir,
            None,
            "Worker",
            "WORKER.spawn",
            Some(serde_json::json!({
                "program": self.config.program.display().to_string(),
                "args": self.config.args,
                "retry_count": self.retry_count,
            })),
        );

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(self.config.env.vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let err = WorkerError::Spawn(e.to_string());
                span.err(err.kind(), err.code(), &err.to_string(), None);
                return Err(err);
            }
        };
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let err = WorkerError::Spawn("worker stdio pipes missing".to_string());
            span.err(err.kind(), err.code(), &err.to_string(), None);
            return Err(err);
        };

        self.generation += 1;
        let generation = self.generation;
        let pid = child.id();
        let kill = CancellationToken::new();
        let (writer, queue) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(write_stdin(
            generation,
            stdin,
            queue,
            self.events.clone(),
        ));
        tokio::spawn(read_stdout(generation, stdout, self.events.clone()));
        tokio::spawn(drain_stderr(generation, stderr, data_dir));
        tokio::spawn(watch_exit(generation, child, kill.clone(), self.events.clone()));

        self.handle = Some(WorkerHandle {
            generation,
            pid,
            spawned_at: Instant::now(),
            writer,
            writer_task,
            kill,
        });
        self.arm_ready_timer(generation);
        span.ok(Some(serde_json::json!({ "pid": pid, "generation": generation })));
        Ok(())
    }

    fn arm_ready_timer(&mut self, generation: u64) {
        if let Some(t) = self.ready_timer.take() {
            t.cancel();
        }
        let Some(timeout) = self.config.ready_timeout else {
            return;
        };
        let token = CancellationToken::new();
        self.ready_timer = Some(token.clone());
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let _ = events.send(Event::ReadyTimeout { generation });
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Queues a frame for the worker's stdin.
    pub(crate) fn send(&self, bytes: Vec<u8>, request: Option<(String, u64)>) -> WorkerResult<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| WorkerError::not_ready(self.gate.state()))?;
        handle
            .writer
            .send(Outbound { bytes, request })
            .map_err(|_| WorkerError::Io("worker stdin closed".to_string()))
    }

    /// The worker completed its handshake. Only counts for the current
    /// process while it is starting.
    pub(crate) fn on_ready(&mut self, generation: u64, info: WorkerInfo) -> bool {
        if !self.is_current(generation) || !self.gate.ready() {
            return false;
        }
        if let Some(t) = self.ready_timer.take() {
            t.cancel();
        }
        let warmup_ms = self
            .handle
            .as_ref()
            .map(|h| h.spawned_at.elapsed().as_millis() as u64);
        trace::event(
            &self.config.data_dir,
            None,
            "Worker",
            "WORKER.ready",
            "ok",
            Some(serde_json::json!({
                "generation": generation,
                "warmup_ms": warmup_ms,
                "after_retries": self.retry_count,
                "worker": info,
            })),
        );
        self.retry_count = 0;
        self.worker = Some(info);
        true
    }

    pub(crate) fn on_ready_timeout(&mut self, generation: u64) {
        if !self.is_current(generation) || self.gate.state() != GateState::Starting {
            return;
        }
        trace::event_err(
            &self.config.data_dir,
            None,
            "Worker",
            "WORKER.ready_timeout",
            trace::TraceError {
                kind: "timeout".to_string(),
                code: "E_WORKER_READY_TIMEOUT".to_string(),
                message: "worker did not become ready in time; killing it".to_string(),
            },
            Some(serde_json::json!({
                "generation": generation,
                "timeout_ms": self.config.ready_timeout.map(|d| d.as_millis() as u64),
            })),
        );
        if let Some(h) = &self.handle {
            h.kill.cancel();
        }
    }

    /// The current process is gone. Clears the handle and readiness and
    /// applies the restart policy. Returns `None` for stale generations.
    pub(crate) fn on_exit(&mut self, generation: u64, status: Option<&str>) -> Option<ExitOutcome> {
        if !self.is_current(generation) {
            return None;
        }
        self.handle = None;
        self.worker = None;
        if let Some(t) = self.ready_timer.take() {
            t.cancel();
        }
        safe_eprintln!(
            "supervisor: worker generation {generation} exited ({})",
            status.unwrap_or("unknown status")
        );
        Some(self.after_failure())
    }

    fn after_failure(&mut self) -> ExitOutcome {
        match self.config.restart.next_attempt(self.retry_count) {
            Some((attempt, delay)) => {
                self.retry_count = attempt;
                self.gate.restarting();
                self.schedule_restart(delay);
                ExitOutcome::Restarting { attempt, delay }
            }
            None => {
                self.gate.failed(self.retry_count);
                ExitOutcome::Exhausted {
                    attempts: self.retry_count,
                }
            }
        }
    }

    fn schedule_restart(&mut self, delay: Duration) {
        self.cancel_restart();
        let epoch = self.restart_epoch;
        let token = CancellationToken::new();
        self.restart_timer = Some(token.clone());
        self.next_restart = Some(delay);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(Event::RestartDue { epoch });
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Invalidates any scheduled restart, including one whose timer already
    /// fired but has not been handled yet.
    fn cancel_restart(&mut self) {
        self.restart_epoch += 1;
        self.next_restart = None;
        if let Some(t) = self.restart_timer.take() {
            t.cancel();
        }
    }

    /// A backoff elapsed. A spawn that fails here counts as another
    /// consecutive failure.
    pub(crate) fn on_restart_due(&mut self, epoch: u64) -> Option<WorkerResult<()>> {
        if epoch != self.restart_epoch || self.gate.state() != GateState::Restarting {
            return None;
        }
        self.restart_timer = None;
        self.next_restart = None;
        self.gate.spawning();
        let res = self.spawn();
        if res.is_err() {
            self.after_failure();
        }
        Some(res)
    }

    /// Best-effort `shutdown` frame, then kill. Cancels any scheduled restart
    /// and leaves the gate `Stopped`. Returns whether a process was running.
    pub(crate) async fn stop(&mut self) -> bool {
        self.cancel_restart();
        if let Some(t) = self.ready_timer.take() {
            t.cancel();
        }
        self.gate.stop();
        self.worker = None;
        let Some(handle) = self.handle.take() else {
            return false;
        };

        let span = trace::Span::start(
            &self.config.data_dir,
            None,
            "Worker",
            "WORKER.stop",
            Some(serde_json::json!({ "generation": handle.generation, "pid": handle.pid })),
        );
        let WorkerHandle {
            writer,
            writer_task,
            kill,
            ..
        } = handle;
        if let Ok(bytes) = codec::encode(&Message::Shutdown) {
            let _ = writer.send(Outbound {
                bytes,
                request: None,
            });
        }
        // Closing the queue lets the writer flush and close stdin.
        drop(writer);
        let flushed = tokio::time::timeout(SHUTDOWN_GRACE, writer_task).await.is_ok();
        kill.cancel();
        span.ok(Some(serde_json::json!({ "shutdown_flushed": flushed })));
        true
    }
}

async fn write_stdin(
    generation: u64,
    mut stdin: ChildStdin,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(out) = queue.recv().await {
        let res = async {
            stdin.write_all(&out.bytes).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = res {
            let _ = events.send(Event::WriteFailed {
                generation,
                request: out.request,
                error: e.to_string(),
            });
            // Fail whatever else is queued the same way instead of writing
            // into a broken pipe again.
            while let Ok(rest) = queue.try_recv() {
                let _ = events.send(Event::WriteFailed {
                    generation,
                    request: rest.request,
                    error: e.to_string(),
                });
            }
            return;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn read_stdout(generation: u64, mut stdout: ChildStdout, events: mpsc::UnboundedSender<Event>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        decoder.feed(&buf[..n]);
        while let Some(decoded) = decoder.next_frame() {
            if events.send(Event::Frame { generation, decoded }).is_err() {
                return;
            }
        }
    }
    if let Some(decoded) = decoder.finish() {
        let _ = events.send(Event::Frame { generation, decoded });
    }
}

/// Stderr is diagnostics only: logged line by line, never parsed.
async fn drain_stderr(generation: u64, stderr: ChildStderr, data_dir: PathBuf) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        trace::event(
            &data_dir,
            None,
            "Worker",
            "WORKER.stderr",
            "ok",
            Some(serde_json::json!({
                "generation": generation,
                "line": trace::clamp_field(&line),
            })),
        );
    }
}

async fn watch_exit(
    generation: u64,
    mut child: Child,
    kill: CancellationToken,
    events: mpsc::UnboundedSender<Event>,
) {
    let waited = tokio::select! {
        res = child.wait() => res,
        _ = kill.cancelled() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let status = match waited {
        Ok(st) => Some(describe_exit(&st)),
        Err(e) => Some(format!("wait failed: {e}")),
    };
    let _ = events.send(Event::Exited { generation, status });
}

/// Advisory only: distinguishes a signal from an exit code in logs.
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("signal {sig}");
        }
    }
    status.to_string()
}
