use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failure delivered to a caller of the session.
///
/// `Clone` because a single process exit or stop fans the same failure out to
/// every pending request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("worker not ready (state: {state})")]
    NotReady { state: String },

    #[error("malformed frame from worker: {reason}")]
    Decode { reason: String },

    #[error("worker reported failure: {message}")]
    Worker { message: String },

    #[error("worker terminated{}", status_suffix(.status))]
    ProcessTerminated { status: Option<String> },

    #[error("worker restart budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },

    #[error("session stopped")]
    Stopped,

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("request id `{id}` is already in flight")]
    DuplicateId { id: String },

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker i/o failure: {0}")]
    Io(String),

    #[error("connection to session dispatcher lost")]
    ConnectionLost,
}

fn status_suffix(status: &Option<String>) -> String {
    status
        .as_deref()
        .map(|s| format!(" ({s})"))
        .unwrap_or_default()
}

impl WorkerError {
    pub fn not_ready(state: impl std::fmt::Display) -> Self {
        Self::NotReady {
            state: state.to_string(),
        }
    }

    /// Stable machine-readable code, one per variant.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotReady { .. } => "E_WORKER_NOT_READY",
            Self::Decode { .. } => "E_WORKER_DECODE",
            Self::Worker { .. } => "E_WORKER_REPORTED",
            Self::ProcessTerminated { .. } => "E_WORKER_TERMINATED",
            Self::RetryBudgetExhausted { .. } => "E_WORKER_RETRY_EXHAUSTED",
            Self::Stopped => "E_SESSION_STOPPED",
            Self::Timeout { .. } => "E_REQUEST_TIMEOUT",
            Self::DuplicateId { .. } => "E_REQUEST_DUPLICATE_ID",
            Self::Spawn(_) => "E_WORKER_SPAWN",
            Self::Io(_) => "E_WORKER_IO",
            Self::ConnectionLost => "E_SESSION_CONNECTION_LOST",
        }
    }

    /// Coarse class used as the trace `kind`.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Decode { .. } | Self::Worker { .. } => "protocol",
            Self::ProcessTerminated { .. }
            | Self::RetryBudgetExhausted { .. }
            | Self::Spawn(_) => "process",
            Self::Io(_) => "io",
            Self::Timeout { .. } => "timeout",
            Self::NotReady { .. }
            | Self::Stopped
            | Self::DuplicateId { .. }
            | Self::ConnectionLost => "logic",
        }
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
