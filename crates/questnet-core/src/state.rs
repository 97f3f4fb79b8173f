//! Lifecycle status types shared by the engine and the client layer.

use core::fmt;

/// Progress of a one-shot lifecycle event (connected / closing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventStatus {
    /// Not yet started
    Undone = 0,
    /// Callback is running on some thread
    InProgress = 1,
    /// Callback finished (or was suppressed)
    Done = 2,
}

impl EventStatus {
    #[inline]
    pub const fn is_undone(&self) -> bool {
        matches!(self, EventStatus::Undone)
    }

    #[inline]
    pub const fn is_done(&self) -> bool {
        matches!(self, EventStatus::Done)
    }
}

impl From<u8> for EventStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => EventStatus::Undone,
            1 => EventStatus::InProgress,
            _ => EventStatus::Done,
        }
    }
}

/// Client-side connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    NotConnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnStatus {
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, ConnStatus::Connected)
    }
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnStatus::NotConnected => write!(f, "not-connected"),
            ConnStatus::Connecting => write!(f, "connecting"),
            ConnStatus::Connected => write!(f, "connected"),
        }
    }
}
