//! # questnet-core
//!
//! Core types and traits for the questnet client engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Default implementations of every trait live in `questnet-module`; the
//! engine itself lives in `questnet-runtime`.
//!
//! ## Modules
//!
//! - `error` - `ErrorCode` (wire-visible) and `NetError` (Rust-side)
//! - `info` - connection identity and transport kind
//! - `state` - lifecycle status enums
//! - `codec` - quests, answers, frames and the `Codec` trait
//! - `encryptor` - cipher, cipher suite and key exchange traits
//! - `processor` - quest processor, per-quest context, async answers
//! - `datagram` - reliable-datagram trait for UDP connections
//! - `notifier` - reactor wakeup trait
//! - `pool` - task pool trait
//! - `clock` - monotonic millisecond clock
//! - `kprint` - kernel-style logging macros
//! - `env` - environment variable utilities

pub mod error;
pub mod info;
pub mod state;
pub mod codec;
pub mod encryptor;
pub mod processor;
pub mod datagram;
pub mod notifier;
pub mod pool;
pub mod clock;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use error::{ErrorCode, NetError, NetResult};
pub use info::{ConnectionInfo, ConnectionToken, RawSocket, Transport};
pub use state::{ConnStatus, EventStatus};
pub use codec::{Answer, AnswerStatus, Codec, Frame, Quest, KEY_METHOD, PING_METHOD};
pub use encryptor::{CipherMode, CipherSuite, Encryptor, Handshake, KeyExchange, KeyHandshake, KeyMaterial};
pub use processor::{AnswerSink, AsyncAnswer, QuestContext, QuestProcessor};
pub use datagram::{DatagramRecv, ReliableDatagram};
pub use notifier::Notifier;
pub use pool::{Task, TaskPool};
pub use clock::now_ms;
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt, env_is_set};
