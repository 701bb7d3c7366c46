//! Best-effort diagnostics shared by the worker crate and the tools: a rotating
//! JSONL trace file, stderr breadcrumbs and payload digests.

mod digest;
mod safe_print;
pub mod trace;

pub use digest::{payload_digest, sha256_hex, PayloadDigest};
pub use trace::{Span, TraceError};
