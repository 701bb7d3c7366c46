//! Supervisor for a long-lived transcription worker process.
//!
//! The worker speaks newline-delimited JSON on stdin/stdout (see [`codec`]).
//! [`TranscriptionSession`] spawns it, holds callers back until it reports
//! `ready`, matches results to requests by id and restarts it with
//! exponential backoff when it dies.

pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod gate;
pub mod python_runtime;
pub mod session;
mod supervisor;

pub use codec::{Transcript, Word, WorkerInfo};
pub use config::{EngineEnv, RestartPolicy, Settings, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use gate::GateState;
pub use session::{SessionStatus, TranscriptionSession};
pub use supervisor::{describe_exit, ExitOutcome, SupervisorSnapshot};
