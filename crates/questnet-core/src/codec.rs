//! Quests, answers and the wire codec seam.
//!
//! The engine never looks inside a frame body. It needs exactly four things
//! from a codec: the fixed header length, the body length a header announces,
//! whether a header starts a request, and encode/decode of whole frames.
//!
//! # Implementors
//!
//! - `BinaryCodec` (questnet-module, default): 12-byte little-endian header.

use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ErrorCode, NetResult};

/// Method name of the keepalive quest.
pub const PING_METHOD: &str = "*ping";
/// Method name of the key-exchange quest.
pub const KEY_METHOD: &str = "*key";

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

fn next_seq() -> u32 {
    loop {
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        if seq != 0 {
            return seq;
        }
    }
}

/// A request. Sequence numbers are process-wide and never 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quest {
    method: String,
    seq: u32,
    two_way: bool,
    payload: Vec<u8>,
}

impl Quest {
    /// Two-way quest expecting exactly one answer.
    pub fn new(method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::build(method.into(), payload, true)
    }

    /// Fire-and-forget quest.
    pub fn one_way(method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::build(method.into(), payload, false)
    }

    fn build(method: String, payload: Vec<u8>, two_way: bool) -> Self {
        Self {
            method,
            seq: next_seq(),
            two_way,
            payload,
        }
    }

    /// Rebuild a quest received from the wire, keeping the peer's seq.
    pub fn from_parts(method: String, seq: u32, two_way: bool, payload: Vec<u8>) -> Self {
        Self {
            method,
            seq,
            two_way,
            payload,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    #[inline]
    pub fn is_two_way(&self) -> bool {
        self.two_way
    }

    #[inline]
    pub fn is_one_way(&self) -> bool {
        !self.two_way
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl fmt::Display for Quest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "quest {} seq {} {} ({} bytes)",
            self.method,
            self.seq,
            if self.two_way { "two-way" } else { "one-way" },
            self.payload.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerStatus {
    Ok,
    Error { code: u32, ex: String },
}

/// A response, correlated to its quest by `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    seq: u32,
    status: AnswerStatus,
    payload: Vec<u8>,
}

impl Answer {
    pub fn ok(seq: u32, payload: Vec<u8>) -> Self {
        Self {
            seq,
            status: AnswerStatus::Ok,
            payload,
        }
    }

    pub fn for_quest(quest: &Quest, payload: Vec<u8>) -> Self {
        Self::ok(quest.seq(), payload)
    }

    pub fn error(seq: u32, code: ErrorCode, ex: impl Into<String>) -> Self {
        Self::error_raw(seq, code.code(), ex)
    }

    /// Error answer with an application-defined code.
    pub fn error_raw(seq: u32, code: u32, ex: impl Into<String>) -> Self {
        Self {
            seq,
            status: AnswerStatus::Error {
                code,
                ex: ex.into(),
            },
            payload: Vec::new(),
        }
    }

    pub fn error_for(quest: &Quest, code: ErrorCode, ex: impl Into<String>) -> Self {
        Self::error(quest.seq(), code, ex)
    }

    #[inline]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn status(&self) -> &AnswerStatus {
        &self.status
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, AnswerStatus::Error { .. })
    }

    pub fn error_code(&self) -> Option<u32> {
        match &self.status {
            AnswerStatus::Error { code, .. } => Some(*code),
            AnswerStatus::Ok => None,
        }
    }

    /// The engine-level code, when the error code is one of ours.
    pub fn error_kind(&self) -> Option<ErrorCode> {
        self.error_code().and_then(ErrorCode::from_code)
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.status {
            AnswerStatus::Error { ex, .. } => Some(ex),
            AnswerStatus::Ok => None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            AnswerStatus::Ok => write!(f, "answer seq {} ({} bytes)", self.seq, self.payload.len()),
            AnswerStatus::Error { code, ex } => {
                write!(f, "error answer seq {} code {}: {}", self.seq, code, ex)
            }
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Quest(Quest),
    Answer(Answer),
}

/// Wire format seam.
///
/// **Contract:**
/// - `header_len()` is constant for the lifetime of the codec.
/// - `body_len()` and `is_request()` only see the first `header_len()` bytes.
/// - `decode()` receives exactly header + body of one frame, already decrypted.
pub trait Codec: Send + Sync {
    fn header_len(&self) -> usize;

    /// Body length announced by a header, or an error for a malformed header.
    fn body_len(&self, header: &[u8]) -> NetResult<usize>;

    fn is_request(&self, header: &[u8]) -> bool;

    fn encode_quest(&self, quest: &Quest) -> NetResult<Vec<u8>>;

    fn encode_answer(&self, answer: &Answer) -> NetResult<Vec<u8>>;

    fn decode(&self, frame: &[u8]) -> NetResult<Frame>;
}
