use serde::Serialize;
use sha2::{Digest, Sha256};

/// What the trace records about an audio payload instead of the payload itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadDigest {
    pub bytes: usize,
    pub sha256: String,
}

pub fn sha256_hex(b: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(b);
    hex::encode(h.finalize())
}

pub fn payload_digest(b: &[u8]) -> PayloadDigest {
    PayloadDigest {
        bytes: b.len(),
        sha256: sha256_hex(b),
    }
}
