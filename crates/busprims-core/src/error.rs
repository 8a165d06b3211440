use std::fmt;

/// Closed set of error codes shared by every bus component.
///
/// Codes are grouped by the subsystem that raises them. The grouping matters
/// to the recovery plan: lifecycle codes usually carry a retry/diagnostic
/// action, buffer codes carry integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Channel lifecycle
    SocketInit,
    SocketClose,
    Bind,
    Connect,
    Listen,
    SetSockopt,
    InvalidIdentity,
    InvalidEndpoint,

    // Transport I/O
    SendFrame,
    RecvFrame,
    PollFailed,
    Timeout,
    IncompleteEnvelope,
    BadMessageSize,

    // Buffer pool
    BufferFull,
    BufferOverflow,
    InvalidHandle,
    DoubleRelease,

    // Routing
    UnresolvedDestination,

    // Storage / keys
    KeyNotFound,
    InitKeys,
}

impl ErrorCode {
    /// Stable snake-case name, used as a structured log field.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::SocketInit => "socket_init",
            ErrorCode::SocketClose => "socket_close",
            ErrorCode::Bind => "bind",
            ErrorCode::Connect => "connect",
            ErrorCode::Listen => "listen",
            ErrorCode::SetSockopt => "set_sockopt",
            ErrorCode::InvalidIdentity => "invalid_identity",
            ErrorCode::InvalidEndpoint => "invalid_endpoint",
            ErrorCode::SendFrame => "send_frame",
            ErrorCode::RecvFrame => "recv_frame",
            ErrorCode::PollFailed => "poll_failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::IncompleteEnvelope => "incomplete_envelope",
            ErrorCode::BadMessageSize => "bad_message_size",
            ErrorCode::BufferFull => "buffer_full",
            ErrorCode::BufferOverflow => "buffer_overflow",
            ErrorCode::InvalidHandle => "invalid_handle",
            ErrorCode::DoubleRelease => "double_release",
            ErrorCode::UnresolvedDestination => "unresolved_destination",
            ErrorCode::KeyNotFound => "key_not_found",
            ErrorCode::InitKeys => "init_keys",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad an error is. Ordering is meaningful: `High` and above consult the
/// recovery plan, `Critical` without a successful recovery is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Tagged error value reported through the [`ErrorHandler`](crate::ErrorHandler).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{severity}] {code}: {message}")]
pub struct BusError {
    code: ErrorCode,
    message: String,
    severity: Severity,
}

impl BusError {
    /// Create an error with explicit severity.
    pub fn new(code: ErrorCode, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code,
            message: message.into(),
            severity,
        }
    }

    /// Create an error with the default `Medium` severity.
    pub fn medium(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message, Severity::Medium)
    }

    /// Lower a component error into the core error value.
    pub fn from_classified<E: Classify + ?Sized>(err: &E) -> Self {
        Self::new(err.code(), err.to_string(), err.severity())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }
}

/// Implemented by every component error enum so it can be reported through
/// the recovery core without losing its code or severity.
pub trait Classify: fmt::Display {
    /// Error code this error maps to.
    fn code(&self) -> ErrorCode;

    /// Severity of this error. Defaults to `Medium`.
    fn severity(&self) -> Severity {
        Severity::Medium
    }
}

impl Classify for BusError {
    fn code(&self) -> ErrorCode {
        self.code
    }

    fn severity(&self) -> Severity {
        self.severity
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("pool exhausted")]
    struct Exhausted;

    impl Classify for Exhausted {
        fn code(&self) -> ErrorCode {
            ErrorCode::BufferFull
        }

        fn severity(&self) -> Severity {
            Severity::Low
        }
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn display_includes_all_tags() {
        let err = BusError::new(ErrorCode::Bind, "address in use", Severity::High);
        assert_eq!(err.to_string(), "[HIGH] bind: address in use");
    }

    #[test]
    fn medium_is_default_severity() {
        let err = BusError::medium(ErrorCode::SendFrame, "chunk write failed");
        assert_eq!(err.severity(), Severity::Medium);
        assert_eq!(err.code(), ErrorCode::SendFrame);
        assert_eq!(err.message(), "chunk write failed");
    }

    #[test]
    fn classified_errors_keep_code_and_severity() {
        let err = BusError::from_classified(&Exhausted);
        assert_eq!(err.code(), ErrorCode::BufferFull);
        assert_eq!(err.severity(), Severity::Low);
        assert_eq!(err.message(), "pool exhausted");
    }
}
