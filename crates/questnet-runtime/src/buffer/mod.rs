//! Per-connection byte pipeline.
//!
//! - `recv` - frame assembly with optional deciphering
//! - `send` - ordered, token-guarded writes with optional enciphering

pub mod recv;
pub mod send;

pub use recv::{RecvBuffer, RecvStatus};
pub use send::{SendBuffer, SendOutcome};
