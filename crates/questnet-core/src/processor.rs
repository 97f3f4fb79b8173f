//! Quest processor seam: what the application sees of a connection.
//!
//! The engine calls [`QuestProcessor::connected`] once and
//! [`QuestProcessor::connection_will_close`] at most once per connection, and
//! [`QuestProcessor::process`] for every quest the server pushes to the
//! client. Processors run on task-pool threads.
//!
//! Answering state lives in a [`QuestContext`] passed to `process`. A
//! processor may answer early through the context, hand the answer off to
//! another thread through an [`AsyncAnswer`], or simply return it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::{Answer, Quest};
use crate::error::ErrorCode;
use crate::info::ConnectionInfo;

/// Sends an encoded answer back over the connection a quest arrived on.
pub trait AnswerSink: Send + Sync {
    /// `false` when the connection is already gone.
    fn send_answer(&self, answer: Answer) -> bool;
}

/// Application callbacks for one client.
pub trait QuestProcessor: Send + Sync {
    /// Connect attempt finished. `false` also covers cancelled connections.
    fn connected(&self, _info: &ConnectionInfo, _connected: bool) {}

    /// Connection is about to be torn down.
    fn connection_will_close(&self, _info: &ConnectionInfo, _closed_by_error: bool) {}

    /// Handle a server-pushed quest. Two-way quests must be answered exactly
    /// once, either here or through the context.
    fn process(&self, _ctx: &QuestContext, quest: &Quest) -> Option<Answer> {
        Some(Answer::error_for(
            quest,
            ErrorCode::UnknownMethod,
            format!("unknown method: {}", quest.method()),
        ))
    }
}

/// Per-quest answering state.
pub struct QuestContext {
    info: Arc<ConnectionInfo>,
    seq: u32,
    two_way: bool,
    answered: Arc<AtomicBool>,
    sink: Arc<dyn AnswerSink>,
}

impl QuestContext {
    pub fn new(info: Arc<ConnectionInfo>, quest: &Quest, sink: Arc<dyn AnswerSink>) -> Self {
        Self {
            info,
            seq: quest.seq(),
            two_way: quest.is_two_way(),
            answered: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn is_two_way(&self) -> bool {
        self.two_way
    }

    /// True once an answer was sent or handed to an [`AsyncAnswer`].
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }

    /// Send the answer before `process` returns. Fails for one-way quests
    /// and for a second answer.
    pub fn send_answer(&self, answer: Answer) -> bool {
        if !self.two_way || self.answered.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.sink.send_answer(answer)
    }

    /// Take over answering from another thread. `None` for one-way quests or
    /// when an answer was already sent.
    pub fn async_answer(&self) -> Option<AsyncAnswer> {
        if !self.two_way || self.answered.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(AsyncAnswer {
            seq: self.seq,
            sink: Some(self.sink.clone()),
        })
    }
}

/// Deferred answer for a two-way quest.
///
/// Dropping it unsent answers the quest with `UnknownError`, so the peer is
/// never left waiting for its timeout.
pub struct AsyncAnswer {
    seq: u32,
    sink: Option<Arc<dyn AnswerSink>>,
}

impl AsyncAnswer {
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn send(mut self, payload: Vec<u8>) -> bool {
        self.deliver(Answer::ok(self.seq, payload))
    }

    pub fn send_error(mut self, code: u32, ex: impl Into<String>) -> bool {
        self.deliver(Answer::error_raw(self.seq, code, ex))
    }

    fn deliver(&mut self, answer: Answer) -> bool {
        match self.sink.take() {
            Some(sink) => sink.send_answer(answer),
            None => false,
        }
    }
}

impl Drop for AsyncAnswer {
    fn drop(&mut self) {
        let seq = self.seq;
        self.deliver(Answer::error(
            seq,
            ErrorCode::UnknownError,
            "async answer dropped without sending",
        ));
    }
}
