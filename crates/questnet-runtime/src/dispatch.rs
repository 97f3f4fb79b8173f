//! Routing of decoded frames.
//!
//! Answers go to whoever is waiting in the connection's correlator. Quests
//! pushed by the server go to the connection's processor on a pool thread.

use std::any::Any;
use std::sync::{Arc, Weak};

use questnet_core::{
    kdebug, kerror, kinfo, kwarn, Answer, AnswerSink, ConnectionToken, ErrorCode, Frame, Quest, QuestContext,
    QuestProcessor,
};

use crate::connection::{Connection, Pinned};
use crate::engine::EngineCore;

pub(crate) fn deal_frame(core: &Arc<EngineCore>, conn: &Pinned, frame: Frame) {
    match frame {
        Frame::Answer(answer) => deal_answer(core, conn, answer),
        Frame::Quest(quest) => deal_quest(core, conn, quest),
    }
}

pub(crate) fn deal_answer(core: &EngineCore, conn: &Connection, answer: Answer) {
    if core.config().log_client_answers {
        kinfo!("{} <- {}", answer, conn.info().endpoint());
    }
    match conn.correlator().take(answer.seq()) {
        Some(cb) => core.deliver(cb, Ok(answer)),
        None => kwarn!("no pending quest for answer seq {}, dropped. {}", answer.seq(), conn.info()),
    }
}

pub(crate) fn deal_quest(core: &Arc<EngineCore>, conn: &Pinned, quest: Quest) {
    let Some(processor) = conn.processor().cloned() else {
        kerror!("no quest processor set, {} dropped. {}", quest, conn.info());
        return;
    };

    let sink: Arc<dyn AnswerSink> = Arc::new(ConnectionSink {
        engine: Arc::downgrade(core),
        token: conn.token(),
    });
    let ctx = QuestContext::new(conn.info().clone(), &quest, sink.clone());
    let two_way = quest.is_two_way();
    let seq = quest.seq();

    let submitted = core.run_task(Box::new(move || process_quest(&*processor, ctx, quest)));
    if !submitted {
        kwarn!("task pool full, quest seq {} refused. {}", seq, conn.info());
        if two_way {
            sink.send_answer(Answer::error(seq, ErrorCode::WorkQueueFull, "client task queue is full"));
        }
    }
}

/// Run the processor and make sure a two-way quest ends up answered once.
fn process_quest(processor: &dyn QuestProcessor, ctx: QuestContext, quest: Quest) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| processor.process(&ctx, &quest)));
    let answer = match result {
        Ok(answer) => answer,
        Err(panic) => {
            let msg = panic_message(&panic);
            kerror!("processing {} panicked: {}. {}", quest, msg, ctx.info());
            if !ctx.is_answered() && quest.is_two_way() {
                ctx.send_answer(Answer::error_for(&quest, ErrorCode::UnknownError, msg));
            }
            return;
        }
    };

    if quest.is_one_way() {
        if answer.is_some() {
            kwarn!("answer returned for one-way {}, dropped. {}", quest, ctx.info());
        }
        return;
    }

    match answer {
        Some(answer) if ctx.is_answered() => {
            kerror!("{} double answered, second answer dropped ({}). {}", quest, answer, ctx.info());
        }
        Some(answer) => {
            if !ctx.send_answer(answer) {
                kdebug!("answer for {} not sent, connection gone. {}", quest, ctx.info());
            }
        }
        None if ctx.is_answered() => {}
        None => {
            kerror!("{} lost an answer. {}", quest, ctx.info());
            ctx.send_answer(Answer::error_for(&quest, ErrorCode::UnknownError, "lost an answer"));
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Answers go back over the connection the quest arrived on, if it is
/// still the same connection.
struct ConnectionSink {
    engine: Weak<EngineCore>,
    token: ConnectionToken,
}

impl AnswerSink for ConnectionSink {
    fn send_answer(&self, answer: Answer) -> bool {
        let Some(core) = self.engine.upgrade() else { return false };
        let bytes = match core.codec().encode_answer(&answer) {
            Ok(b) => b,
            Err(e) => {
                kerror!("encode {} failed: {}", answer, e);
                return false;
            }
        };
        match core.registry().sign_token(self.token) {
            Some(conn) => core.send_bytes(&conn, bytes, false).is_ok(),
            None => false,
        }
    }
}
