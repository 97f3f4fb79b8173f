//! Reliable-datagram seam for UDP connections.
//!
//! The engine treats the datagram layer as a black box that accepts whole
//! frames, turns them into datagrams, and hands back whole frames on
//! receive. Reliability (acks, retransmit, ordering) is the implementor's
//! business; the engine only drives `flush` from the reactor and from the
//! periodic sweep.
//!
//! # Implementors
//!
//! - `BasicDatagram` (questnet-module): one frame per datagram, heartbeat,
//!   idle-based liveness. No retransmission.

use crate::error::NetResult;
use crate::info::RawSocket;

/// Outcome of draining a socket's receive side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramRecv {
    /// Socket drained (EAGAIN); frames, if any, were appended.
    Drained,
    /// Peer refused or the socket failed; the connection must close.
    Failed(i32),
}

pub trait ReliableDatagram: Send {
    /// Queue one encoded frame. `discardable` frames may be dropped under
    /// pressure instead of failing the send.
    fn enqueue(&mut self, frame: Vec<u8>, discardable: bool) -> NetResult<()>;

    /// Write as much queued data as the socket accepts. `Ok(true)` means
    /// data is still pending and write readiness is wanted.
    fn flush(&mut self, socket: RawSocket, now_ms: u64) -> Result<bool, i32>;

    /// Read every available datagram, appending complete frames to `out`.
    fn receive(&mut self, socket: RawSocket, now_ms: u64, out: &mut Vec<Vec<u8>>) -> DatagramRecv;

    /// False once the peer has been silent too long.
    fn is_alive(&self, now_ms: u64) -> bool;

    /// Set when the layer has decided the connection is unusable.
    fn require_close(&self) -> bool;
}
