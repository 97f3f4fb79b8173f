//! # questnet - Client-side RPC Engine
//!
//! One reactor thread multiplexing many TCP and UDP connections, with
//! quests and answers correlated by sequence number.
//!
//! ## Features
//!
//! - **Single reactor**: `poll(2)` over every connection plus a wakeup notifier
//! - **Sync and async quests**: blocking `send_quest`, callback-based `send_quest_async`
//! - **Timeouts**: per-quest expiry driven by a dedicated timeout thread
//! - **Keepalive**: ping-based liveness for idle TCP connections
//! - **Encryption**: optional key handshake, stream or package cipher modes
//! - **Server push**: quests sent by the server reach your `QuestProcessor`
//! - **Reliable datagrams**: UDP connections behind a pluggable datagram layer
//!
//! ## Quick Start
//!
//! ```ignore
//! use questnet::{Quest, TcpClient};
//! use std::time::Duration;
//!
//! fn main() -> questnet::NetResult<()> {
//!     let client = TcpClient::create("127.0.0.1:8011")?;
//!
//!     // Blocking call; connects on first use.
//!     let quest = Quest::new("echo", b"hello".to_vec());
//!     if let Some(answer) = client.send_quest(&quest, Some(Duration::from_secs(5))) {
//!         println!("answer: {:?}", answer.payload());
//!     }
//!
//!     // Callback call; runs on a task pool thread.
//!     client.send_quest_async(Quest::new("echo", b"again".to_vec()), |result| {
//!         match result {
//!             Ok(answer) => println!("async answer: {}", answer),
//!             Err(code) => println!("failed: {}", code),
//!         }
//!     }, None);
//!
//!     questnet::shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │          TcpClient / UdpClient, QuestProcessor              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Client Engine                           │
//! │   Registry, lifecycle gate, correlator, send/recv buffers   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Reactor  │      │  Timeout  │      │   Task    │
//!    │  Thread   │      │  Thread   │      │   Pool    │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                  questnet-module                        │
//!    │    poll set, notifier, codec, cipher, datagram layer    │
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The process-wide engine is configured from `QNET_*` environment
//! variables (see `EngineConfig::from_env`). Independent engines can be
//! started with `ClientEngine::start` and handed to `TcpClient::with_engine`.

use std::net::ToSocketAddrs;

// Re-export core types
pub use questnet_core::{
    Answer,
    AnswerStatus,
    AsyncAnswer,
    CipherMode,
    CipherSuite,
    ConnStatus,
    ConnectionInfo,
    ConnectionToken,
    ErrorCode,
    KeyExchange,
    NetError,
    NetResult,
    Quest,
    QuestContext,
    QuestProcessor,
    Transport,
};

// Re-export kprint macros for debug logging
pub use questnet_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use questnet_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use questnet_core::{env_get, env_get_bool, env_get_ms, env_get_opt, env_is_set};

// Re-export default implementations
pub use questnet_module::{BinaryCodec, ChaChaSuite, PresharedExchange};

// Re-export runtime types
pub use questnet_runtime::{
    AnswerCallback,
    ClientEngine,
    ConfigError,
    EngineConfig,
    KeepAliveParams,
    QuestResult,
    RawFrameHandler,
    TcpClient,
    UdpClient,
};

#[cfg(feature = "test-peer")]
pub use questnet_runtime::testkit;

/// TCP client on the process-wide engine.
///
/// Same as `TcpClient::create`.
pub fn tcp_client<A: ToSocketAddrs>(endpoint: A) -> NetResult<TcpClient> {
    TcpClient::create(endpoint)
}

/// UDP client on the process-wide engine.
pub fn udp_client<A: ToSocketAddrs>(endpoint: A) -> NetResult<UdpClient> {
    UdpClient::create(endpoint)
}

/// Shut down the process-wide engine.
///
/// Open connections are closed and pending quests fail. Clients created
/// afterwards start a new engine.
pub fn shutdown() {
    ClientEngine::shutdown_global();
}
