//! Library defaults for `EngineConfig`.

/// Connect deadline for new connections
pub const CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Answer deadline when the caller passes none
pub const QUEST_TIMEOUT_MS: u64 = 5_000;

/// Task pool workers alive at all times
pub const RESIDENT_TASK_THREADS: usize = 4;
/// Task pool ceiling including burst workers
pub const MAX_TASK_THREADS: usize = 64;
/// Tasks accepted but not yet started
pub const TASK_QUEUE_DEPTH: usize = 4096;

/// Registry capacity
pub const MAX_SOCKETS: usize = 4096;
/// Largest frame accepted from a peer
pub const MAX_PACKAGE_LEN: usize = 8 * 1024 * 1024;
/// Timeout thread period
pub const TICK_MS: u64 = 100;

pub const IGNORE_SIGPIPE: bool = true;
pub const LOG_CLIENT_QUESTS: bool = false;
pub const LOG_CLIENT_ANSWERS: bool = false;

/// Keepalive for new TCP clients
pub const KEEPALIVE: bool = false;
pub const PING_INTERVAL_MS: u64 = 20_000;
pub const MAX_PING_RETRY: u32 = 3;

pub const UDP_MTU: usize = 1400;
/// UDP peer silence before the connection is considered lost
pub const UDP_IDLE_LIMIT_MS: u64 = 60_000;
/// UDP heartbeat period when nothing else is sent
pub const UDP_HEARTBEAT_MS: u64 = 20_000;
