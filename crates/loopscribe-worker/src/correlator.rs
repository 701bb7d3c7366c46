use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec::Transcript;
use crate::error::{WorkerError, WorkerResult};

pub type Outcome = WorkerResult<Transcript>;

/// Caller side of a registration: resolves once with the worker's answer or a
/// failure.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    pub async fn wait(self) -> Outcome {
        // A dropped sender means the dispatcher went away without answering.
        self.rx.await.unwrap_or(Err(WorkerError::ConnectionLost))
    }
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    tx: oneshot::Sender<Outcome>,
    /// Cancels the deadline timer armed for this registration, if any.
    deadline: Option<CancellationToken>,
}

impl Pending {
    fn finish(self, outcome: Outcome) {
        if let Some(t) = self.deadline {
            t.cancel();
        }
        // The caller may have given up; its receiver being gone is fine.
        let _ = self.tx.send(outcome);
    }
}

/// In-flight requests keyed by caller-chosen id.
///
/// Entries are removed the moment they are answered, so every completion is
/// fulfilled exactly once and late frames for the same id fall through as
/// no-ops.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<String, Pending>,
    next_seq: u64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id`. The returned sequence number identifies this particular
    /// registration, so a deadline armed for it cannot fail a later request
    /// that reuses the id.
    pub fn register(&mut self, id: &str) -> WorkerResult<(u64, Completion)> {
        if self.pending.contains_key(id) {
            return Err(WorkerError::DuplicateId { id: id.to_string() });
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.to_string(),
            Pending {
                seq,
                tx,
                deadline: None,
            },
        );
        Ok((seq, Completion { rx }))
    }

    /// Ties a deadline timer to registration `seq` of `id`. The token is
    /// cancelled as soon as the request completes by any path. Returns `false`
    /// (and cancels the token) when that registration is already gone.
    pub fn set_deadline(&mut self, id: &str, seq: u64, token: CancellationToken) -> bool {
        match self.pending.get_mut(id) {
            Some(p) if p.seq == seq => {
                if let Some(old) = p.deadline.replace(token) {
                    old.cancel();
                }
                true
            }
            _ => {
                token.cancel();
                false
            }
        }
    }

    /// Returns `false` when nothing was waiting on `id`.
    pub fn resolve(&mut self, id: &str, transcript: Transcript) -> bool {
        self.complete(id, Ok(transcript))
    }

    pub fn fail(&mut self, id: &str, err: WorkerError) -> bool {
        self.complete(id, Err(err))
    }

    /// Fails `id` only if it is still the registration numbered `seq`.
    pub fn fail_if_current(&mut self, id: &str, seq: u64, err: WorkerError) -> bool {
        match self.pending.get(id) {
            Some(p) if p.seq == seq => self.fail(id, err),
            _ => false,
        }
    }

    /// Fails every pending request with `err` and clears the set. Returns how
    /// many were failed.
    pub fn cancel_all(&mut self, err: WorkerError) -> usize {
        let n = self.pending.len();
        for (_, p) in self.pending.drain() {
            p.finish(Err(err.clone()));
        }
        n
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn complete(&mut self, id: &str, outcome: Outcome) -> bool {
        match self.pending.remove(id) {
            Some(p) => {
                p.finish(outcome);
                true
            }
            None => false,
        }
    }
}
