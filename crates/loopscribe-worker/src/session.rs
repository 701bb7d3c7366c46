//! Public entry point: `start`, `stop`, `submit`.
//!
//! A [`TranscriptionSession`] is a cheap, clonable handle onto one dispatcher
//! task. The dispatcher exclusively owns the supervisor, the readiness gate
//! and the correlator, and mutates them only in reaction to caller commands,
//! decoded frames, process exits and timers. Callers never touch that state;
//! they send a command and wait on a one-shot completion.

use std::{path::PathBuf, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use loopscribe_observability::{payload_digest, trace, PayloadDigest, Span, TraceError};

use crate::codec::{self, DecodeError, Decoded, Message, Transcript};
use crate::config::WorkerConfig;
use crate::correlator::{Completion, Correlator};
use crate::error::{WorkerError, WorkerResult};
use crate::gate::GateState;
use crate::supervisor::{Event, ExitOutcome, Supervisor, SupervisorSnapshot};

/// Point-in-time view of the session, published after every dispatcher step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub supervisor: SupervisorSnapshot,
    pub pending: usize,
}

impl SessionStatus {
    pub fn state(&self) -> GateState {
        self.supervisor.state
    }
}

enum Command {
    Start {
        reply: oneshot::Sender<WorkerResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Submit {
        id: String,
        audio_base64: String,
        reply: oneshot::Sender<WorkerResult<Completion>>,
    },
}

#[derive(Clone)]
pub struct TranscriptionSession {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    data_dir: Arc<PathBuf>,
}

impl TranscriptionSession {
    /// Creates the session and its dispatcher task. Must be called inside a
    /// tokio runtime. Nothing is spawned until [`TranscriptionSession::start`].
    ///
    /// When the last handle is dropped the dispatcher stops the worker.
    pub fn new(config: WorkerConfig) -> Self {
        let data_dir = Arc::new(config.data_dir.clone());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(config, events.clone());
        let (status_tx, status) = watch::channel(SessionStatus {
            supervisor: supervisor.snapshot(),
            pending: 0,
        });
        let dispatcher = Dispatcher {
            supervisor,
            correlator: Correlator::new(),
            events,
            status: status_tx,
        };
        tokio::spawn(dispatcher.run(command_rx, event_rx));
        Self {
            commands,
            status,
            data_dir,
        }
    }

    /// Spawns the worker if none is running. Returns once the process is
    /// spawned; readiness arrives later (see [`TranscriptionSession::wait_ready`]).
    pub async fn start(&self) -> WorkerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { reply })?;
        rx.await.unwrap_or(Err(WorkerError::ConnectionLost))
    }

    /// Stops the worker and fails every pending request with `Stopped`.
    /// Idempotent; the session cannot be started again afterwards.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Transcribes raw audio bytes (a WAV file or 16-bit PCM, as the worker
    /// expects).
    pub async fn submit(&self, id: impl Into<String>, audio: &[u8]) -> WorkerResult<Transcript> {
        let id = id.into();
        let digest = payload_digest(audio);
        self.submit_encoded(id, STANDARD.encode(audio), digest).await
    }

    /// Same as [`TranscriptionSession::submit`] for audio that is already
    /// base64 encoded.
    pub async fn submit_base64(
        &self,
        id: impl Into<String>,
        audio_base64: String,
    ) -> WorkerResult<Transcript> {
        let digest = payload_digest(audio_base64.as_bytes());
        self.submit_encoded(id.into(), audio_base64, digest).await
    }

    async fn submit_encoded(
        &self,
        id: String,
        audio_base64: String,
        digest: PayloadDigest,
    ) -> WorkerResult<Transcript> {
        let span = Span::start(
            &self.data_dir,
            Some(&id),
            "Session",
            "SESSION.submit",
            Some(serde_json::json!({ "audio": digest })),
        );
        let (reply, rx) = oneshot::channel();
        let res = match self.send(Command::Submit {
            id,
            audio_base64,
            reply,
        }) {
            Ok(()) => match rx.await {
                Ok(Ok(completion)) => completion.wait().await,
                Ok(Err(e)) => Err(e),
                Err(_) => Err(WorkerError::ConnectionLost),
            },
            Err(e) => Err(e),
        };
        match &res {
            Ok(t) => span.ok(Some(serde_json::json!({
                "text_chars": t.text.chars().count(),
                "words": t.words.len(),
            }))),
            Err(e) => span.err(e.kind(), e.code(), &e.to_string(), None),
        }
        res
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Waits until the gate opens. Fails early if the session reaches
    /// `Failed` or `Stopped`, and with `Timeout` after `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> WorkerResult<()> {
        let mut rx = self.status.clone();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| {
                matches!(
                    s.state(),
                    GateState::Ready | GateState::Failed | GateState::Stopped
                )
            }),
        )
        .await;
        let status = match settled {
            Err(_) => {
                return Err(WorkerError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => return Err(WorkerError::ConnectionLost),
            Ok(Ok(s)) => s.clone(),
        };
        match status.state() {
            GateState::Ready => Ok(()),
            GateState::Stopped => Err(WorkerError::Stopped),
            _ => Err(WorkerError::RetryBudgetExhausted {
                attempts: status.supervisor.retry_count,
            }),
        }
    }

    fn send(&self, cmd: Command) -> WorkerResult<()> {
        self.commands
            .send(cmd)
            .map_err(|_| WorkerError::ConnectionLost)
    }
}

struct Dispatcher {
    supervisor: Supervisor,
    correlator: Correlator,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Sender<SessionStatus>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut keepalive = self.supervisor.config().keepalive_interval.map(|period| {
            let mut iv = tokio::time::interval_at(Instant::now() + period, period);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv
        });

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        // Every session handle is gone.
                        self.stop().await;
                        break;
                    }
                },
                Some(ev) = events.recv() => self.on_event(ev),
                _ = tick(&mut keepalive) => self.keepalive(),
            }
            self.publish();
        }
    }

    fn publish(&self) {
        self.status.send_replace(SessionStatus {
            supervisor: self.supervisor.snapshot(),
            pending: self.correlator.len(),
        });
    }

    fn data_dir(&self) -> PathBuf {
        self.supervisor.config().data_dir.clone()
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            // Publish before replying so a caller that just got its answer
            // also sees the state it produced.
            Command::Start { reply } => {
                let res = self.supervisor.start();
                self.publish();
                let _ = reply.send(res);
            }
            Command::Stop { reply } => {
                self.stop().await;
                self.publish();
                let _ = reply.send(());
            }
            Command::Submit {
                id,
                audio_base64,
                reply,
            } => {
                let res = self.submit(id, audio_base64);
                self.publish();
                let _ = reply.send(res);
            }
        }
    }

    async fn stop(&mut self) {
        let had_process = self.supervisor.stop().await;
        let cancelled = self.correlator.cancel_all(WorkerError::Stopped);
        if had_process || cancelled > 0 {
            trace::event(
                &self.data_dir(),
                None,
                "Session",
                "SESSION.stop",
                "ok",
                Some(serde_json::json!({ "cancelled": cancelled })),
            );
        }
    }

    fn submit(&mut self, id: String, audio_base64: String) -> WorkerResult<Completion> {
        // Nothing reaches the process unless the gate is open.
        self.supervisor.gate().check()?;
        let frame = codec::encode(&Message::Transcribe {
            id: id.clone(),
            audio_base64,
        })
        .map_err(|e| WorkerError::Io(e.to_string()))?;
        let (seq, completion) = self.correlator.register(&id)?;
        if let Err(e) = self.supervisor.send(frame, Some((id.clone(), seq))) {
            self.correlator.fail(&id, e.clone());
            return Err(e);
        }
        if let Some(timeout) = self.supervisor.config().request_timeout {
            let token = CancellationToken::new();
            self.correlator.set_deadline(&id, seq, token.clone());
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        let _ = events.send(Event::Deadline { id, seq });
                    }
                    _ = token.cancelled() => {}
                }
            });
        }
        Ok(completion)
    }

    fn keepalive(&mut self) {
        if !self.supervisor.gate().is_ready() {
            return;
        }
        if let Ok(bytes) = codec::encode(&Message::Keepalive) {
            let _ = self.supervisor.send(bytes, None);
        }
    }

    fn on_event(&mut self, ev: Event) {
        match ev {
            Event::Frame {
                generation,
                decoded,
            } => {
                if self.supervisor.is_current(generation) {
                    self.on_frame(generation, decoded);
                }
            }
            Event::Exited { generation, status } => self.on_exit(generation, status),
            Event::WriteFailed {
                generation,
                request,
                error,
            } => {
                if let Some((id, seq)) = request {
                    let err = WorkerError::Io(error);
                    if self.correlator.fail_if_current(&id, seq, err.clone()) {
                        self.trace_err(Some(&id), "SESSION.write_failed", &err, generation);
                    }
                }
            }
            Event::ReadyTimeout { generation } => self.supervisor.on_ready_timeout(generation),
            Event::RestartDue { epoch } => {
                if let Some(Err(e)) = self.supervisor.on_restart_due(epoch) {
                    // No new process exists; report the one that died last.
                    let generation = self.supervisor.generation();
                    self.trace_err(None, "SESSION.restart_failed", &e, generation);
                }
            }
            Event::Deadline { id, seq } => {
                let Some(timeout) = self.supervisor.config().request_timeout else {
                    return;
                };
                let err = WorkerError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                };
                self.correlator.fail_if_current(&id, seq, err);
            }
        }
    }

    fn on_frame(&mut self, generation: u64, decoded: Decoded) {
        let msg = match decoded {
            Ok(m) => m,
            Err(e) => return self.on_decode_error(generation, e),
        };
        let data_dir = self.data_dir();
        match msg {
            Message::Ready { .. } => {
                if let Some(info) = msg.worker_info() {
                    self.supervisor.on_ready(generation, info);
                }
            }
            Message::Result { id, text, words } => {
                if !self.correlator.resolve(&id, Transcript { text, words }) {
                    // Answer arrived after its caller was already failed.
                    trace::event(
                        &data_dir,
                        Some(&id),
                        "Session",
                        "SESSION.orphan_result",
                        "skipped",
                        None,
                    );
                }
            }
            Message::Error { id, error } => match id.filter(|s| !s.is_empty()) {
                Some(id) => {
                    self.correlator
                        .fail(&id, WorkerError::Worker { message: error });
                }
                None => trace::event_err(
                    &data_dir,
                    None,
                    "Worker",
                    "WORKER.error",
                    TraceError {
                        kind: "protocol".to_string(),
                        code: "E_WORKER_REPORTED".to_string(),
                        message: trace::clamp_field(&error),
                    },
                    Some(serde_json::json!({ "generation": generation })),
                ),
            },
            Message::Status { message } | Message::Debug { message } => trace::event(
                &data_dir,
                None,
                "Worker",
                "WORKER.status",
                "ok",
                Some(serde_json::json!({
                    "generation": generation,
                    "message": trace::clamp_field(&message),
                })),
            ),
            // Host-to-worker frames echoed back, or types this host does not know.
            Message::Transcribe { .. }
            | Message::Shutdown
            | Message::Keepalive
            | Message::Unknown => {}
        }
    }

    fn on_decode_error(&mut self, generation: u64, e: DecodeError) {
        let err = WorkerError::Decode {
            reason: e.reason.clone(),
        };
        if let Some(id) = &e.id {
            self.correlator.fail(id, err.clone());
        }
        trace::event_err(
            &self.data_dir(),
            e.id.as_deref(),
            "Worker",
            "WORKER.decode",
            TraceError {
                kind: err.kind().to_string(),
                code: err.code().to_string(),
                message: e.reason,
            },
            Some(serde_json::json!({ "generation": generation, "line": e.line })),
        );
    }

    fn on_exit(&mut self, generation: u64, status: Option<String>) {
        let Some(outcome) = self.supervisor.on_exit(generation, status.as_deref()) else {
            return;
        };
        let cancelled = self
            .correlator
            .cancel_all(WorkerError::ProcessTerminated {
                status: status.clone(),
            });
        let ctx = match outcome {
            ExitOutcome::Restarting { attempt, delay } => serde_json::json!({
                "restart_attempt": attempt,
                "restart_delay_ms": delay.as_millis() as u64,
            }),
            ExitOutcome::Exhausted { attempts } => serde_json::json!({
                "restart_attempt": null,
                "attempts": attempts,
            }),
        };
        trace::event_err(
            &self.data_dir(),
            None,
            "Worker",
            "WORKER.exit",
            TraceError {
                kind: "process".to_string(),
                code: match outcome {
                    ExitOutcome::Restarting { .. } => "E_WORKER_TERMINATED",
                    ExitOutcome::Exhausted { .. } => "E_WORKER_RETRY_EXHAUSTED",
                }
                .to_string(),
                message: status.unwrap_or_else(|| "unknown status".to_string()),
            },
            Some(serde_json::json!({
                "generation": generation,
                "cancelled": cancelled,
                "policy": ctx,
            })),
        );
    }

    fn trace_err(&self, request_id: Option<&str>, step_id: &str, err: &WorkerError, generation: u64) {
        trace::event_err(
            &self.data_dir(),
            request_id,
            "Session",
            step_id,
            TraceError {
                kind: err.kind().to_string(),
                code: err.code().to_string(),
                message: err.to_string(),
            },
            Some(serde_json::json!({ "generation": generation })),
        );
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RestartPolicy;
    use std::future::Future;

    const ECHO_WORKER: &str = r#"
printf '{"type":"ready","model":"fake-base","device":"cpu"}\n'
while IFS= read -r line; do
  case "$line" in
    *'"type":"shutdown"'*) exit 0 ;;
    *'"type":"keepalive"'*) printf '%s\n' "$line" >> "$KEEPALIVE_LOG"; continue ;;
  esac
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$id" in
    fail*) printf '{"type":"error","id":"%s","error":"engine exploded"}\n' "$id" ;;
    slow*) ;;
    bad*) printf 'not json at all\n{"type":"result","id":"%s","text":5}\n' "$id" ;;
    *) printf '{"type":"status","message":"working"}\n{"type":"result","id":"%s","text":"hello","words":[]}\n' "$id" ;;
  esac
done
"#;

    const BATCH_WORKER: &str = r#"
printf '{"type":"ready"}\n'
IFS= read -r first
IFS= read -r second
a=$(printf '%s\n' "$first" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
b=$(printf '%s\n' "$second" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
printf '{"type":"result","id":"%s","text":"text-%s","words":[]}\n{"type":"result","id":"%s","text":"text-%s","words":[]}\n' "$b" "$b" "$a" "$a"
cat > /dev/null
"#;

    const CRASH_ONCE_WORKER: &str = r#"
printf '{"type":"ready"}\n'
IFS= read -r line
if [ ! -e "$CRASH_MARK" ]; then
  : > "$CRASH_MARK"
  exit 7
fi
id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
printf '{"type":"result","id":"%s","text":"recovered","words":[]}\n' "$id"
cat > /dev/null
"#;

    fn sh_config(script: &str, dir: &std::path::Path) -> WorkerConfig {
        let mut cfg = WorkerConfig::new("/bin/sh", dir).with_args(["-c", script]);
        cfg.env
            .extra
            .insert("KEEPALIVE_LOG".into(), dir.join("keepalive.log").display().to_string());
        cfg.env
            .extra
            .insert("CRASH_MARK".into(), dir.join("crashed").display().to_string());
        cfg
    }

    fn fast_restarts(cfg: &mut WorkerConfig, max_retries: u32) {
        cfg.restart = RestartPolicy {
            max_retries,
            base_delay: Duration::from_millis(5),
        };
    }

    async fn within<T>(fut: impl Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(10), fut)
            .await
            .expect("timed out waiting")
    }

    async fn wait_state(session: &TranscriptionSession, want: GateState) -> SessionStatus {
        let mut rx = session.subscribe();
        let s = within(rx.wait_for(|s| s.state() == want))
            .await
            .expect("dispatcher alive");
        s.clone()
    }

    async fn ready_session(cfg: WorkerConfig) -> TranscriptionSession {
        let session = TranscriptionSession::new(cfg);
        session.start().await.expect("start");
        session
            .wait_ready(Duration::from_secs(10))
            .await
            .expect("ready");
        session
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected_without_spawning() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = TranscriptionSession::new(sh_config(ECHO_WORKER, td.path()));
        let err = session.submit("r1", b"audio").await.unwrap_err();
        assert!(matches!(err, WorkerError::NotReady { .. }), "{err:?}");
        let status = session.status();
        assert_eq!(status.state(), GateState::NotStarted);
        assert_eq!(status.supervisor.generation, 0);
        assert_eq!(status.supervisor.pid, None);
    }

    #[tokio::test]
    async fn ready_then_result_resolves_submit() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = ready_session(sh_config(ECHO_WORKER, td.path())).await;

        let status = session.status();
        let worker = status.supervisor.worker.expect("worker info");
        assert_eq!(worker.model.as_deref(), Some("fake-base"));
        assert!(status.supervisor.pid.is_some());

        let got = within(session.submit("r1", b"RIFF....WAVE")).await.expect("result");
        assert_eq!(
            got,
            Transcript {
                text: "hello".into(),
                words: vec![]
            }
        );
        session.stop().await;
    }

    #[tokio::test]
    async fn worker_error_fails_only_that_request() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = ready_session(sh_config(ECHO_WORKER, td.path())).await;

        let (bad, good) = within(async {
            tokio::join!(session.submit("fail-1", b"x"), session.submit("ok-1", b"y"))
        })
        .await;
        assert_eq!(
            bad.unwrap_err(),
            WorkerError::Worker {
                message: "engine exploded".into()
            }
        );
        assert_eq!(good.expect("ok").text, "hello");
        session.stop().await;
    }

    #[tokio::test]
    async fn malformed_frame_fails_the_named_request_and_stream_survives() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = ready_session(sh_config(ECHO_WORKER, td.path())).await;

        let err = within(session.submit("bad-1", b"x")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Decode { .. }), "{err:?}");
        assert_eq!(within(session.submit("after", b"x")).await.expect("ok").text, "hello");
        assert_eq!(session.status().state(), GateState::Ready);
        session.stop().await;
    }

    #[tokio::test]
    async fn frames_arriving_in_one_read_resolve_independently() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = ready_session(sh_config(BATCH_WORKER, td.path())).await;

        let (a, b) = within(async {
            tokio::join!(session.submit("a", b"1"), session.submit("b", b"2"))
        })
        .await;
        assert_eq!(a.expect("a").text, "text-a");
        assert_eq!(b.expect("b").text, "text-b");
        session.stop().await;
    }

    #[tokio::test]
    async fn exit_before_ready_schedules_first_backoff() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = TranscriptionSession::new(sh_config("exit 3", td.path()));
        session.start().await.expect("start");

        let status = wait_state(&session, GateState::Restarting).await;
        assert_eq!(status.supervisor.retry_count, 1);
        assert_eq!(status.supervisor.next_restart_ms, Some(2000));
        assert_eq!(status.supervisor.pid, None);

        let err = session.submit("r1", b"x").await.unwrap_err();
        assert!(matches!(err, WorkerError::NotReady { .. }), "{err:?}");

        session.stop().await;
        assert_eq!(session.status().state(), GateState::Stopped);
        assert_eq!(session.status().supervisor.next_restart_ms, None);
    }

    #[tokio::test]
    async fn crash_fails_pending_request_then_worker_recovers() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = sh_config(CRASH_ONCE_WORKER, td.path());
        fast_restarts(&mut cfg, 3);
        let session = ready_session(cfg).await;

        let err = within(session.submit("r1", b"x")).await.unwrap_err();
        assert!(
            matches!(err, WorkerError::ProcessTerminated { ref status } if status.as_deref() == Some("exit code 7")),
            "{err:?}"
        );

        within(session.wait_ready(Duration::from_secs(10)))
            .await
            .expect("restarted");
        // A successful handshake resets the budget.
        assert_eq!(session.status().supervisor.retry_count, 0);
        assert_eq!(session.status().supervisor.generation, 2);
        assert_eq!(within(session.submit("r2", b"x")).await.expect("ok").text, "recovered");
        session.stop().await;
    }

    #[tokio::test]
    async fn exhausted_budget_stops_restarting() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = sh_config("exit 1", td.path());
        fast_restarts(&mut cfg, 2);
        let session = TranscriptionSession::new(cfg);
        session.start().await.expect("start");

        let err = session.wait_ready(Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(err, WorkerError::RetryBudgetExhausted { attempts: 2 });
        let status = session.status();
        assert_eq!(status.state(), GateState::Failed);
        assert_eq!(status.supervisor.generation, 3);

        let err = session.submit("r1", b"x").await.unwrap_err();
        assert_eq!(err, WorkerError::RetryBudgetExhausted { attempts: 2 });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.status().supervisor.generation, 3);
        session.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_pending_and_is_idempotent() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = ready_session(sh_config(ECHO_WORKER, td.path())).await;

        let pending = {
            let s = session.clone();
            tokio::spawn(async move { s.submit("slow-1", b"x").await })
        };
        let mut rx = session.subscribe();
        within(rx.wait_for(|s| s.pending == 1)).await.expect("pending");

        session.stop().await;
        assert_eq!(within(pending).await.expect("join").unwrap_err(), WorkerError::Stopped);
        assert_eq!(session.status().state(), GateState::Stopped);
        assert_eq!(session.status().pending, 0);

        session.stop().await;
        assert_eq!(session.status().state(), GateState::Stopped);
        assert_eq!(session.start().await.unwrap_err(), WorkerError::Stopped);
        assert_eq!(session.submit("r2", b"x").await.unwrap_err(), WorkerError::Stopped);
    }

    #[tokio::test]
    async fn request_deadline_fails_without_worker_reply() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = sh_config(ECHO_WORKER, td.path());
        cfg.request_timeout = Some(Duration::from_millis(50));
        let session = ready_session(cfg).await;

        let err = within(session.submit("slow-2", b"x")).await.unwrap_err();
        assert_eq!(err, WorkerError::Timeout { timeout_ms: 50 });
        // The id is free again and the worker is still usable.
        let again = within(session.submit("slow-2", b"x")).await.unwrap_err();
        assert_eq!(again.code(), "E_REQUEST_TIMEOUT");
        assert_eq!(within(session.submit("r3", b"x")).await.expect("ok").text, "hello");
        session.stop().await;
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = ready_session(sh_config(ECHO_WORKER, td.path())).await;

        let first = {
            let s = session.clone();
            tokio::spawn(async move { s.submit("slow-dup", b"x").await })
        };
        let mut rx = session.subscribe();
        within(rx.wait_for(|s| s.pending == 1)).await.expect("pending");

        let err = session.submit("slow-dup", b"y").await.unwrap_err();
        assert_eq!(err, WorkerError::DuplicateId { id: "slow-dup".into() });
        session.stop().await;
        assert_eq!(within(first).await.expect("join").unwrap_err(), WorkerError::Stopped);
    }

    #[tokio::test]
    async fn silent_worker_is_killed_after_ready_timeout() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = sh_config("exec sleep 30", td.path());
        cfg.ready_timeout = Some(Duration::from_millis(50));
        fast_restarts(&mut cfg, 0);
        let session = TranscriptionSession::new(cfg);
        session.start().await.expect("start");

        let err = within(session.wait_ready(Duration::from_secs(10))).await.unwrap_err();
        assert_eq!(err, WorkerError::RetryBudgetExhausted { attempts: 0 });
        session.stop().await;
    }

    #[tokio::test]
    async fn keepalive_frames_are_sent_while_ready() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut cfg = sh_config(ECHO_WORKER, td.path());
        cfg.keepalive_interval = Some(Duration::from_millis(20));
        let session = ready_session(cfg).await;

        let log = td.path().join("keepalive.log");
        within(async {
            loop {
                if std::fs::read_to_string(&log).is_ok_and(|s| s.contains("keepalive")) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        session.stop().await;
    }

    #[tokio::test]
    async fn missing_program_fails_start() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = TranscriptionSession::new(WorkerConfig::new(
            td.path().join("no-such-worker"),
            td.path(),
        ));
        let err = session.start().await.unwrap_err();
        assert_eq!(err.code(), "E_WORKER_SPAWN");
        assert_eq!(session.status().state(), GateState::Failed);
    }

    #[tokio::test]
    async fn failed_restart_spawn_is_traced_against_the_dead_generation() {
        let td = tempfile::tempdir().expect("tempdir");
        let wd = td.path().join("wd");
        std::fs::create_dir(&wd).expect("mkdir");
        // The first process removes its own working directory, so every
        // restart fails to spawn.
        let mut cfg = sh_config(r#"cd / && rmdir "$WORKER_DIR"; exit 1"#, td.path());
        cfg.working_dir = Some(wd.clone());
        cfg.env
            .extra
            .insert("WORKER_DIR".into(), wd.display().to_string());
        fast_restarts(&mut cfg, 2);
        let session = TranscriptionSession::new(cfg);
        session.start().await.expect("start");

        let err = within(session.wait_ready(Duration::from_secs(10))).await.unwrap_err();
        assert_eq!(err, WorkerError::RetryBudgetExhausted { attempts: 2 });
        assert_eq!(session.status().supervisor.generation, 1);

        let raw = std::fs::read_to_string(trace::trace_path(td.path())).expect("trace");
        let generations: Vec<_> = raw
            .lines()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .filter(|v| v["step_id"] == "SESSION.restart_failed")
            .map(|v| v["ctx"]["generation"].as_u64())
            .collect();
        assert_eq!(generations, vec![Some(1), Some(1)]);
        session.stop().await;
    }

    #[tokio::test]
    async fn lifecycle_is_traced() {
        let td = tempfile::tempdir().expect("tempdir");
        let session = ready_session(sh_config(ECHO_WORKER, td.path())).await;
        within(session.submit("r1", b"x")).await.expect("ok");
        session.stop().await;

        let raw = std::fs::read_to_string(trace::trace_path(td.path())).expect("trace");
        for step in ["WORKER.spawn", "WORKER.ready", "SESSION.submit", "WORKER.status", "WORKER.stop"] {
            assert!(raw.contains(step), "missing {step}");
        }
        // Audio never lands in the trace, only its digest.
        assert!(raw.contains("sha256"));
    }
}
