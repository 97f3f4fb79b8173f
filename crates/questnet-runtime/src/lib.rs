//! # questnet-runtime
//!
//! The client engine proper. Built on the seams in `questnet-core` and the
//! default implementations in `questnet-module`.
//!
//! This crate provides:
//! - Engine configuration (`EngineConfig`, `QNET_*` environment overrides)
//! - Buffer pipeline: token-guarded send/receive with optional encryption
//! - Answer correlator with expiry
//! - Connection lifecycle gate, connection registry, keepalive
//! - Reactor thread, timeout thread, reclaimer
//! - `TcpClient` / `UdpClient`
//!
//! With the `test-peer` feature, `testkit` exposes loopback peers.

pub mod config;
pub mod buffer;
pub mod correlator;
pub mod lifecycle;
pub mod keepalive;
pub mod connection;
pub mod registry;
pub mod engine;
pub mod client;

mod io;
mod dispatch;

#[cfg(any(test, feature = "test-peer"))]
pub mod testkit;

// Re-exports
pub use config::{ConfigError, EngineConfig};
pub use correlator::{AnswerCallback, QuestResult, Rejected};
pub use connection::{Connection, ConnectionOwner, RawFrameHandler};
pub use engine::{ClientEngine, EngineCore, ReactorStats, TimeoutStats};
pub use keepalive::KeepAliveParams;
pub use client::{ClientCore, TcpClient, UdpClient};
