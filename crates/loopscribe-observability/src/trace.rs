use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::Value;

const DEFAULT_TRACE_MAX_BYTES: u64 = 10_000_000; // 10MB
const DEFAULT_TRACE_MAX_FILES: usize = 5;
const MAX_FIELD_CHARS: usize = 4_000;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            !(t == "0" || t == "false" || t == "no" || t == "off")
        }
        Err(_) => default,
    }
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn enabled() -> bool {
    // On unless LOOPSCRIBE_TRACE_ENABLED=0.
    env_flag("LOOPSCRIBE_TRACE_ENABLED", true)
}

pub fn trace_path(data_dir: &Path) -> PathBuf {
    data_dir.join("trace.jsonl")
}

fn rotate_if_needed_best_effort(data_dir: &Path) {
    let max_files = env_num("LOOPSCRIBE_TRACE_MAX_FILES", DEFAULT_TRACE_MAX_FILES);
    if max_files == 0 {
        return;
    }
    let p = trace_path(data_dir);
    let len = match std::fs::metadata(&p) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if len <= env_num("LOOPSCRIBE_TRACE_MAX_BYTES", DEFAULT_TRACE_MAX_BYTES) {
        return;
    }

    // Drop the oldest first so renames on Windows never hit an existing target.
    let _ = std::fs::remove_file(data_dir.join(format!("trace.jsonl.{max_files}")));
    for i in (1..max_files).rev() {
        let src = data_dir.join(format!("trace.jsonl.{i}"));
        if src.exists() {
            let _ = std::fs::rename(&src, data_dir.join(format!("trace.jsonl.{}", i + 1)));
        }
    }
    let _ = std::fs::rename(&p, data_dir.join("trace.jsonl.1"));
}

fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Appends one record to `trace.jsonl`. Failures are reported on stderr and
/// otherwise ignored; tracing never fails the caller.
pub fn emit_best_effort(data_dir: &Path, ev: &TraceEvent) {
    if !enabled() {
        return;
    }
    let mut line = match serde_json::to_string(ev) {
        Ok(s) => s,
        Err(e) => {
            crate::safe_eprintln!("trace: serialize failed: {e}");
            return;
        }
    };
    line.push('\n');

    let _guard = match write_lock().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let _ = std::fs::create_dir_all(data_dir);
    rotate_if_needed_best_effort(data_dir);

    let p = trace_path(data_dir);
    let mut f = match OpenOptions::new().create(true).append(true).open(&p) {
        Ok(f) => f,
        Err(e) => {
            crate::safe_eprintln!("trace: open failed: {}: {e}", p.display());
            return;
        }
    };
    if let Err(e) = f.write_all(line.as_bytes()) {
        crate::safe_eprintln!("trace: write failed: {e}");
    }
}

/// Truncates free-form text (worker stderr, malformed frames) before it lands
/// in a trace record.
pub fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max_chars).collect()
}

pub fn clamp_field(s: &str) -> String {
    clamp_chars(s, MAX_FIELD_CHARS)
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String,    // process|protocol|io|logic|timeout
    pub code: String,    // E_*
    pub message: String, // short
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub request_id: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

pub fn event(
    data_dir: &Path,
    request_id: Option<&str>,
    stage: &str,
    step_id: &str,
    status: &str,
    ctx: Option<Value>,
) {
    emit_best_effort(
        data_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            request_id: request_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx,
        },
    );
}

/// Point event carrying an error classification.
pub fn event_err(
    data_dir: &Path,
    request_id: Option<&str>,
    stage: &str,
    step_id: &str,
    error: TraceError,
    ctx: Option<Value>,
) {
    emit_best_effort(
        data_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            request_id: request_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: "err".to_string(),
            duration_ms: None,
            error: Some(error),
            ctx,
        },
    );
}

/// A start/end pair. Dropping a span without `ok`/`err` records it as aborted.
pub struct Span {
    data_dir: PathBuf,
    request_id: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        data_dir: &Path,
        request_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        let span = Self {
            data_dir: data_dir.to_path_buf(),
            request_id: request_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        };
        span.emit("start", "ok", None, None, ctx);
        span
    }

    fn emit(
        &self,
        op: &str,
        status: &str,
        duration_ms: Option<u128>,
        error: Option<TraceError>,
        ctx: Option<Value>,
    ) {
        emit_best_effort(
            &self.data_dir,
            &TraceEvent {
                ts_ms: now_ms(),
                request_id: self.request_id.clone(),
                stage: self.stage.clone(),
                step_id: self.step_id.clone(),
                op: op.to_string(),
                status: status.to_string(),
                duration_ms,
                error,
                ctx,
            },
        );
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.finished = true;
        self.emit("end", "ok", Some(self.t0.elapsed().as_millis()), None, ctx);
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        self.finished = true;
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        self.emit(
            "end",
            "err",
            Some(self.t0.elapsed().as_millis()),
            Some(error),
            ctx,
        );
    }

    pub fn err_anyhow(self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        let mut m = serde_json::Map::new();
        m.insert("err_chain".to_string(), serde_json::json!(chain));
        match ctx {
            Some(Value::Object(extra)) => m.extend(extra),
            Some(v) => {
                m.insert("extra".to_string(), v);
            }
            None => {}
        }
        self.err(kind, code, &err.to_string(), Some(Value::Object(m)));
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        self.emit(
            "end",
            "aborted",
            Some(self.t0.elapsed().as_millis()),
            Some(error),
            None,
        );
    }
}
