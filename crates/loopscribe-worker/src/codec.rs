//! Line-delimited JSON framing for the worker's stdin/stdout.
//!
//! Every frame is one JSON object terminated by `\n`. Outbound frames are
//! produced by [`encode`]; inbound bytes are fed to a [`FrameDecoder`], which
//! keeps any unterminated tail for the next read.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use loopscribe_observability::trace::clamp_chars;

/// A worker that never terminates its line would otherwise grow the buffer
/// without bound.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const ERROR_LINE_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub words: Vec<Word>,
}

/// Metadata a worker may attach to its `ready` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub model: Option<String>,
    pub engine: Option<String>,
    pub device: Option<String>,
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engine: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<bool>,
    },
    Transcribe {
        id: String,
        audio_base64: String,
    },
    Result {
        id: String,
        text: String,
        #[serde(default)]
        words: Vec<Word>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        // Some worker builds report under `message`.
        #[serde(default, alias = "message")]
        error: String,
    },
    Shutdown,
    Keepalive,
    Status {
        #[serde(default)]
        message: String,
    },
    Debug {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Request id the frame refers to, if any. An empty id counts as none.
    pub fn id(&self) -> Option<&str> {
        let id = match self {
            Self::Transcribe { id, .. } | Self::Result { id, .. } => Some(id.as_str()),
            Self::Error { id, .. } => id.as_deref(),
            _ => None,
        };
        id.filter(|s| !s.is_empty())
    }

    pub fn worker_info(&self) -> Option<WorkerInfo> {
        match self {
            Self::Ready {
                model,
                engine,
                device,
                fallback,
            } => Some(WorkerInfo {
                model: model.clone(),
                engine: engine.clone(),
                device: device.clone(),
                fallback: fallback.unwrap_or(false),
            }),
            _ => None,
        }
    }
}

/// One inbound line that could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// Set when the line was JSON carrying a string `id`, so the failure can be
    /// routed to that request alone.
    pub id: Option<String>,
    pub reason: String,
    /// Clamped, lossily decoded copy of the offending line.
    pub line: String,
}

pub type Decoded = Result<Message, DecodeError>;

pub fn encode(msg: &Message) -> serde_json::Result<Vec<u8>> {
    let mut out = serde_json::to_vec(msg)?;
    out.push(b'\n');
    Ok(out)
}

pub fn decode_line(line: &[u8]) -> Decoded {
    serde_json::from_slice::<Message>(line).map_err(|e| DecodeError {
        id: serde_json::from_slice::<Value>(line)
            .ok()
            .and_then(|v| v.get("id")?.as_str().map(str::to_string))
            .filter(|s| !s.is_empty()),
        reason: e.to_string(),
        line: clamp_chars(&String::from_utf8_lossy(line), ERROR_LINE_CHARS),
    })
}

/// Incremental stdout decoder. Holds unterminated bytes between reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
    /// Everything in `buf[pos..scanned]` is known to hold no newline.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk read from the stream. Frames are pulled lazily with
    /// [`FrameDecoder::next_frame`].
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.scanned -= self.pos;
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, skipping empty lines. `None` once only an
    /// unterminated tail (or nothing) is left.
    pub fn next_frame(&mut self) -> Option<Decoded> {
        loop {
            let from = self.scanned.max(self.pos);
            let Some(off) = self.buf[from..].iter().position(|b| *b == b'\n') else {
                self.scanned = self.buf.len();
                return self.overflow();
            };
            let nl = from + off;
            let line = trim_line(&self.buf[self.pos..nl]);
            let decoded = (!line.is_empty()).then(|| decode_line(line));
            self.pos = nl + 1;
            self.scanned = self.pos;
            if let Some(d) = decoded {
                return Some(d);
            }
        }
    }

    /// Feeds a chunk and drains every complete frame it finished.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.feed(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Decodes whatever unterminated tail is left at end of stream.
    pub fn finish(&mut self) -> Option<Decoded> {
        let tail = std::mem::take(&mut self.buf);
        let start = std::mem::replace(&mut self.pos, 0);
        self.scanned = 0;
        let line = trim_line(&tail[start..]);
        (!line.is_empty()).then(|| decode_line(line))
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn overflow(&mut self) -> Option<Decoded> {
        if self.pending_len() <= MAX_FRAME_BYTES {
            return None;
        }
        let dropped = self.pending_len();
        let head = clamp_chars(
            &String::from_utf8_lossy(&self.buf[self.pos..self.pos + ERROR_LINE_CHARS]),
            ERROR_LINE_CHARS,
        );
        self.buf.clear();
        self.pos = 0;
        self.scanned = 0;
        Some(Err(DecodeError {
            id: None,
            reason: format!("frame exceeds {MAX_FRAME_BYTES} bytes ({dropped} buffered)"),
            line: head,
        }))
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(d: Decoded) -> Message {
        d.expect("decoded frame")
    }

    #[test]
    fn encode_transcribe_matches_wire_shape() {
        let bytes = encode(&Message::Transcribe {
            id: "r1".into(),
            audio_base64: "AAA=".into(),
        })
        .expect("encode");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            "{\"type\":\"transcribe\",\"id\":\"r1\",\"audio_base64\":\"AAA=\"}\n"
        );
    }

    #[test]
    fn encode_control_frames_are_bare_type_objects() {
        let shutdown = encode(&Message::Shutdown).expect("encode");
        assert_eq!(shutdown, b"{\"type\":\"shutdown\"}\n");
        let keepalive = encode(&Message::Keepalive).expect("encode");
        assert_eq!(keepalive, b"{\"type\":\"keepalive\"}\n");
    }

    #[test]
    fn two_frames_in_one_read_decode_independently() {
        let mut dec = FrameDecoder::new();
        let out = dec.decode(
            b"{\"type\":\"result\",\"id\":\"a\",\"text\":\"x\",\"words\":[]}\n{\"type\":\"result\",\"id\":\"b\",\"text\":\"y\",\"words\":[]}\n",
        );
        assert_eq!(out.len(), 2);
        let ids: Vec<_> = out
            .into_iter()
            .map(|d| ok(d).id().map(str::to_string))
            .collect();
        assert_eq!(ids, vec![Some("a".to_string()), Some("b".to_string())]);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn partial_line_is_held_until_terminated() {
        let mut dec = FrameDecoder::new();
        assert!(dec.decode(b"{\"type\":\"re").is_empty());
        assert!(dec.pending_len() > 0);
        let out = dec.decode(b"ady\"}\n{\"type\"");
        assert_eq!(out.len(), 1);
        assert!(matches!(ok(out.into_iter().next().unwrap()), Message::Ready { .. }));
        assert_eq!(dec.pending_len(), "{\"type\"".len());
    }

    #[test]
    fn blank_lines_and_crlf_are_skipped() {
        let mut dec = FrameDecoder::new();
        let out = dec.decode(b"\n\n{\"type\":\"ready\"}\r\n\r\n\n{\"type\":\"shutdown\"}\n");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn malformed_line_does_not_stop_the_stream() {
        let mut dec = FrameDecoder::new();
        let out = dec.decode(b"not json\n{\"type\":\"ready\"}\n");
        assert_eq!(out.len(), 2);
        let err = out[0].clone().unwrap_err();
        assert_eq!(err.id, None);
        assert_eq!(err.line, "not json");
        assert!(matches!(out[1], Ok(Message::Ready { .. })));
    }

    #[test]
    fn malformed_frame_with_id_names_the_request() {
        let err = decode_line(b"{\"type\":\"result\",\"id\":\"r9\",\"text\":5}").unwrap_err();
        assert_eq!(err.id.as_deref(), Some("r9"));
    }

    #[test]
    fn unknown_type_is_ignored_not_an_error() {
        let m = ok(decode_line(b"{\"type\":\"transcription\",\"id\":\"x\",\"text\":\"hi\"}"));
        assert_eq!(m, Message::Unknown);
        assert_eq!(m.id(), None);
    }

    #[test]
    fn ready_carries_optional_worker_metadata() {
        let m = ok(decode_line(
            b"{\"type\":\"ready\",\"model\":\"faster-whisper-base\",\"engine\":\"faster\",\"device\":\"cpu\",\"fallback\":true}",
        ));
        let info = m.worker_info().expect("ready");
        assert_eq!(info.model.as_deref(), Some("faster-whisper-base"));
        assert_eq!(info.device.as_deref(), Some("cpu"));
        assert!(info.fallback);

        let bare = ok(decode_line(b"{\"type\":\"ready\"}"));
        assert_eq!(bare.worker_info(), Some(WorkerInfo::default()));
    }

    #[test]
    fn error_frame_accepts_message_alias_and_missing_id() {
        let m = ok(decode_line(b"{\"type\":\"error\",\"message\":\"boom\"}"));
        assert_eq!(
            m,
            Message::Error {
                id: None,
                error: "boom".into()
            }
        );
        let m = ok(decode_line(b"{\"type\":\"error\",\"id\":\"\",\"error\":\"Missing audio\"}"));
        assert_eq!(m.id(), None);
    }

    #[test]
    fn result_words_carry_timestamps() {
        let m = ok(decode_line(
            b"{\"type\":\"result\",\"id\":\"r1\",\"text\":\"hi there\",\"words\":[{\"word\":\"hi\",\"start\":0,\"end\":0.4},{\"word\":\"there\",\"start\":0.4,\"end\":0.9}]}",
        ));
        match m {
            Message::Result { words, .. } => {
                assert_eq!(words.len(), 2);
                assert_eq!(words[1].word, "there");
                assert!((words[1].end - 0.9).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn long_line_split_across_many_reads_decodes_in_linear_time() {
        let text = "a".repeat(8 * 1024 * 1024);
        let frame = format!("{{\"type\":\"result\",\"id\":\"big\",\"text\":\"{text}\",\"words\":[]}}\n");
        let bytes = frame.as_bytes();
        let mut dec = FrameDecoder::new();
        let t0 = std::time::Instant::now();
        let (body, last) = bytes.split_at(bytes.len() - 1);
        for chunk in body.chunks(8 * 1024) {
            dec.feed(chunk);
            assert!(dec.next_frame().is_none());
        }
        assert_eq!(dec.pending_len(), body.len());
        let out = dec.decode(last);
        // Rescanning the tail on every read takes tens of seconds here.
        assert!(t0.elapsed() < std::time::Duration::from_secs(5), "{:?}", t0.elapsed());
        assert_eq!(out.len(), 1);
        match ok(out.into_iter().next().expect("frame")) {
            Message::Result { id, text: got, .. } => {
                assert_eq!(id, "big");
                assert_eq!(got.len(), text.len());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn newline_after_scanned_tail_is_found() {
        let mut dec = FrameDecoder::new();
        assert!(dec.decode(b"{\"type\":").is_empty());
        assert!(dec.decode(b"\"ready\"}").is_empty());
        let out = dec.decode(b"\n{\"type\":\"shutdown\"}\n{\"ty");
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Ok(Message::Shutdown)));
        let out = dec.decode(b"pe\":\"keepalive\"}\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Ok(Message::Keepalive)));
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn finish_flushes_unterminated_tail() {
        let mut dec = FrameDecoder::new();
        assert!(dec.decode(b"{\"type\":\"ready\"}").is_empty());
        assert!(matches!(dec.finish(), Some(Ok(Message::Ready { .. }))));
        assert!(dec.finish().is_none());
    }
}
