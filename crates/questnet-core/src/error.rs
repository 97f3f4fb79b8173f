//! Error types for the questnet client engine.
//!
//! Two layers:
//! - [`ErrorCode`]: the wire-visible status carried by error answers and
//!   delivered to answer callbacks. Stable numeric values.
//! - [`NetError`]: the Rust-side error returned from fallible operations
//!   (socket setup, codec, configuration).

use core::fmt;

/// Result type for engine operations
pub type NetResult<T> = Result<T, NetError>;

/// Status codes delivered to answer callbacks and carried by error answers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Connection closed normally (by either side or by the client)
    ConnectionClosed = 20001,
    /// Connection failed, was lost, or its handshake was rejected
    InvalidConnection = 20002,
    /// No answer arrived before the quest deadline
    Timeout = 20003,
    /// Quest could not be queued on the connection
    SendError = 20004,
    /// Task pool saturated
    WorkQueueFull = 20005,
    /// Anything else (processor panic, lost answer, socket error)
    UnknownError = 20006,
    /// Connection superseded or closed before it finished connecting
    Cancelled = 20007,
    /// Frame could not be decoded
    InvalidPackage = 20008,
    /// Quest processor has no handler for the method
    UnknownMethod = 20009,
}

impl ErrorCode {
    /// Numeric wire value.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            20001 => Some(Self::ConnectionClosed),
            20002 => Some(Self::InvalidConnection),
            20003 => Some(Self::Timeout),
            20004 => Some(Self::SendError),
            20005 => Some(Self::WorkQueueFull),
            20006 => Some(Self::UnknownError),
            20007 => Some(Self::Cancelled),
            20008 => Some(Self::InvalidPackage),
            20009 => Some(Self::UnknownMethod),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionClosed => "connection closed",
            Self::InvalidConnection => "invalid connection",
            Self::Timeout => "timeout",
            Self::SendError => "send error",
            Self::WorkQueueFull => "work queue full",
            Self::UnknownError => "unknown error",
            Self::Cancelled => "cancelled",
            Self::InvalidPackage => "invalid package",
            Self::UnknownMethod => "unknown method",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Errors returned from fallible engine operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// OS error with errno
    Os(i32),
    /// Host name could not be resolved to an address
    AddressResolve(String),
    /// Frame encode/decode failure
    Codec(String),
    /// Invalid configuration
    Config(String),
    /// Engine-level status (queue full, connection closed, ...)
    Code(ErrorCode),
}

impl NetError {
    /// Capture the current thread's errno.
    pub fn last_os_error() -> Self {
        NetError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// The closest [`ErrorCode`] for delivering this error to a callback.
    pub fn to_code(&self) -> ErrorCode {
        match self {
            NetError::Code(code) => *code,
            NetError::Codec(_) => ErrorCode::InvalidPackage,
            NetError::Os(_) | NetError::AddressResolve(_) => ErrorCode::InvalidConnection,
            NetError::Config(_) => ErrorCode::UnknownError,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Os(e) => write!(f, "OS error: errno {}", e),
            NetError::AddressResolve(host) => write!(f, "cannot resolve address: {}", host),
            NetError::Codec(msg) => write!(f, "codec error: {}", msg),
            NetError::Config(msg) => write!(f, "config error: {}", msg),
            NetError::Code(code) => write!(f, "{}", code),
        }
    }
}

impl std::error::Error for NetError {}

impl From<ErrorCode> for NetError {
    fn from(code: ErrorCode) -> Self {
        NetError::Code(code)
    }
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => NetError::Os(errno),
            None => NetError::Codec(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in [
            ErrorCode::ConnectionClosed,
            ErrorCode::InvalidConnection,
            ErrorCode::Timeout,
            ErrorCode::SendError,
            ErrorCode::WorkQueueFull,
            ErrorCode::UnknownError,
            ErrorCode::Cancelled,
            ErrorCode::InvalidPackage,
            ErrorCode::UnknownMethod,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", ErrorCode::Timeout), "timeout (20003)");
        assert_eq!(format!("{}", NetError::Os(11)), "OS error: errno 11");
        assert_eq!(
            format!("{}", NetError::Code(ErrorCode::Cancelled)),
            "cancelled (20007)"
        );
    }

    #[test]
    fn test_error_conversion() {
        let e: NetError = ErrorCode::WorkQueueFull.into();
        assert!(matches!(e, NetError::Code(ErrorCode::WorkQueueFull)));
        assert_eq!(e.to_code(), ErrorCode::WorkQueueFull);
        assert_eq!(NetError::Os(104).to_code(), ErrorCode::InvalidConnection);
    }
}
