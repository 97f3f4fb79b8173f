//! Per-connection I/O, driven by the reactor.
//!
//! Readiness for a socket that is still connecting completes the connect
//! instead of doing I/O. Otherwise TCP reads whole frames under the receive
//! token and hands them to `dispatch`; writes drain the send buffer. UDP
//! reads every pending datagram and flushes the datagram layer.

use std::sync::Arc;

use questnet_core::{kerror, kinfo, kwarn, now_ms, ConnectionInfo, DatagramRecv, ErrorCode, NetError, NetResult, RawSocket};
use questnet_module::sys;

use crate::buffer::{RecvStatus, SendOutcome};
use crate::connection::{ConnIo, Pinned, RawFrameHandler, TcpIo, UdpIo};
use crate::dispatch;
use crate::engine::EngineCore;

/// POLLERR / POLLNVAL on `fd`.
pub(crate) fn on_error(core: &Arc<EngineCore>, fd: RawSocket) {
    let Some(conn) = core.registry().sign(fd) else { return };
    if !conn.is_socket_connected() {
        connect_completed(core, &conn);
        return;
    }
    kwarn!("socket error reported by poll. {}", conn.info());
    drop(conn);
    core.clear_connection(fd, ErrorCode::UnknownError);
}

pub(crate) fn process(core: &Arc<EngineCore>, fd: RawSocket, can_read: bool, can_write: bool) {
    let Some(conn) = core.registry().sign(fd) else { return };
    if !conn.is_socket_connected() {
        connect_completed(core, &conn);
        return;
    }
    match conn.io() {
        ConnIo::Tcp(tcp) => process_tcp(core, &conn, tcp, can_read, can_write),
        ConnIo::Udp(udp) => process_udp(core, &conn, udp, can_read, can_write),
    }
}

/// Pending connect finished, one way or the other.
fn connect_completed(core: &Arc<EngineCore>, conn: &Pinned) {
    if !conn.mark_socket_connected() {
        return;
    }
    let err = sys::socket_error(conn.socket());
    let connected = err == 0;
    if !connected {
        kinfo!("connect failed (errno {}). {}", err, conn.info());
    }
    match conn.owner() {
        Some(owner) => owner.socket_connected(conn.arc(), connected),
        None => core.close_token(conn.token(), ErrorCode::InvalidConnection, true),
    }
}

fn process_tcp(core: &Arc<EngineCore>, conn: &Pinned, tcp: &TcpIo, can_read: bool, can_write: bool) {
    let mut failed = false;
    if can_read {
        match read_frames(core, conn, tcp) {
            Ok(false) => {}
            Ok(true) => {
                core.close_token(conn.token(), ErrorCode::ConnectionClosed, false);
                return;
            }
            Err(e) => {
                kerror!("receive failed: {}. Connection will be closed. {}", e, conn.info());
                failed = true;
            }
        }
    }

    if !failed && can_write {
        match tcp.send.send(conn.socket(), None) {
            Ok(SendOutcome::WouldBlock) => core.request_write(conn.socket()),
            Ok(_) => {}
            Err(e) => {
                kerror!("send failed (errno {}). Connection will be closed. {}", e, conn.info());
                failed = true;
            }
        }
    }

    if failed {
        core.close_token(conn.token(), ErrorCode::InvalidConnection, true);
    }
}

/// Read and dispatch frames until the socket is drained. `Ok(true)` when
/// the peer closed.
fn read_frames(core: &Arc<EngineCore>, conn: &Pinned, tcp: &TcpIo) -> NetResult<bool> {
    if !tcp.recv.get_token() {
        return Ok(false);
    }
    conn.touch_recv(now_ms());

    let codec = core.codec();
    let result = loop {
        match tcp.recv.recv_package(conn.socket(), codec) {
            Ok(RecvStatus::NeedMore) => break Ok(false),
            Ok(RecvStatus::Closed) => break Ok(true),
            Ok(RecvStatus::Complete) => match conn.raw_receiver() {
                Some(raw) => match tcp.recv.fetch_raw() {
                    Ok(bytes) => {
                        if !deliver_raw(conn, &**raw, &bytes) {
                            break Err(NetError::Code(ErrorCode::InvalidConnection));
                        }
                    }
                    Err(e) => break Err(e),
                },
                None => match tcp.recv.fetch(codec) {
                    Ok(frame) => dispatch::deal_frame(core, conn, frame),
                    Err(e) => break Err(e),
                },
            },
            Err(e) => break Err(e),
        }
    };
    tcp.recv.return_token();
    result
}

/// Hand a frame to the raw receiver. A false return or a panic fails the
/// connection.
fn deliver_raw(conn: &Pinned, raw: &RawFrameHandler, bytes: &[u8]) -> bool {
    let info: &ConnectionInfo = conn.info();
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| raw(info, bytes))) {
        Ok(accepted) => accepted,
        Err(_) => {
            kerror!("raw receiver panicked. {}", info);
            false
        }
    }
}

fn process_udp(core: &Arc<EngineCore>, conn: &Pinned, udp: &UdpIo, can_read: bool, can_write: bool) {
    let now = now_ms();
    let mut failed = false;

    if can_read {
        let mut datagrams = Vec::new();
        if let DatagramRecv::Failed(e) = udp.receive(conn.socket(), now, &mut datagrams) {
            kerror!("datagram receive failed (errno {}). {}", e, conn.info());
            failed = true;
        }
        for data in datagrams {
            if let Some(raw) = conn.raw_receiver() {
                if !deliver_raw(conn, &**raw, &data) {
                    failed = true;
                    break;
                }
                continue;
            }
            match core.codec().decode(&data) {
                Ok(frame) => dispatch::deal_frame(core, conn, frame),
                Err(e) => kwarn!("undecodable datagram of {} bytes dropped: {}. {}", data.len(), e, conn.info()),
            }
        }
    }

    if !failed && can_write {
        match udp.flush(conn.socket(), now) {
            Ok(true) => core.request_write(conn.socket()),
            Ok(false) => {}
            Err(e) => {
                kerror!("datagram send failed (errno {}). {}", e, conn.info());
                failed = true;
            }
        }
    }

    if failed {
        core.close_token(conn.token(), ErrorCode::InvalidConnection, true);
    }
}
