//! Per-connection event gate.
//!
//! Decides, under the connection's mutex, which of the two one-shot
//! lifecycle callbacks may run. Guarantees:
//! - `connected` fires at most once (as success, failure or cancellation);
//! - `connection_will_close` fires at most once, only after a successful
//!   `connected` has finished, never for a connection that failed or was
//!   cancelled;
//! - a close requested while `connected` is running is deferred until it
//!   finishes.

use questnet_core::EventStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedPermit {
    Denied,
    /// Run `connected(true)` (or the failure path).
    Connected,
    /// Connection was discarded first: run only the cancellation.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePermit {
    Denied,
    /// Run `connection_will_close`.
    Close,
    /// Connected event never ran: report `connected(false)` instead.
    Cancelled,
}

#[derive(Debug)]
pub struct EventGate {
    connected: EventStatus,
    close: EventStatus,
    discarded: bool,
    close_pending: bool,
    cancelled: bool,
}

impl Default for EventGate {
    fn default() -> Self {
        Self::new()
    }
}

impl EventGate {
    pub fn new() -> Self {
        Self {
            connected: EventStatus::Undone,
            close: EventStatus::Undone,
            discarded: false,
            close_pending: false,
            cancelled: false,
        }
    }

    /// Mark the connection as superseded or closed by its owner.
    pub fn discard(&mut self) {
        self.discarded = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn connected_status(&self) -> EventStatus {
        self.connected
    }

    pub fn close_status(&self) -> EventStatus {
        self.close
    }

    pub fn begin_connected(&mut self) -> ConnectedPermit {
        if !self.connected.is_undone() {
            return ConnectedPermit::Denied;
        }
        self.connected = EventStatus::InProgress;
        if self.discarded {
            self.cancelled = true;
            ConnectedPermit::Cancelled
        } else {
            ConnectedPermit::Connected
        }
    }

    /// Returns true when a close was deferred and must run now.
    pub fn finish_connected(&mut self, success: bool) -> bool {
        debug_assert_eq!(self.connected, EventStatus::InProgress, "finish_connected without begin");
        self.connected = EventStatus::Done;
        if !success {
            self.close = EventStatus::Done;
            self.close_pending = false;
            return false;
        }
        if self.close_pending && self.close.is_undone() {
            self.close_pending = false;
            self.close = EventStatus::InProgress;
            return true;
        }
        false
    }

    pub fn begin_close(&mut self) -> ClosePermit {
        if !self.close.is_undone() {
            return ClosePermit::Denied;
        }
        match self.connected {
            EventStatus::InProgress => {
                self.close_pending = true;
                ClosePermit::Denied
            }
            EventStatus::Undone => {
                self.discarded = true;
                self.cancelled = true;
                self.connected = EventStatus::InProgress;
                self.close = EventStatus::InProgress;
                ClosePermit::Cancelled
            }
            EventStatus::Done => {
                self.close = EventStatus::InProgress;
                ClosePermit::Close
            }
        }
    }

    pub fn finish_close(&mut self) {
        debug_assert_eq!(self.close, EventStatus::InProgress, "finish_close without begin");
        self.close = EventStatus::Done;
        if self.cancelled && self.connected == EventStatus::InProgress {
            self.connected = EventStatus::Done;
        }
    }

    /// Both events resolved; nothing will fire for this connection again.
    pub fn is_terminal(&self) -> bool {
        self.close.is_done() && (self.connected.is_done() || self.cancelled)
    }
}
