use std::fmt;
use std::io;

use busprims_frame::FrameError;
use busprims_router::RouterError;
use busprims_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CliError {}

fn tagged(code: i32, context: &str, err: impl fmt::Display) -> CliError {
    CliError::new(code, format!("{context}: {err}"))
}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    tagged(code, context, err)
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other => {
            let code = match other {
                TransportError::Timeout { .. } => TIMEOUT,
                TransportError::InvalidEndpoint { .. }
                | TransportError::PathTooLong { .. }
                | TransportError::InvalidOption { .. } => USAGE,
                _ => TRANSPORT_ERROR,
            };
            tagged(code, context, other)
        }
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        other => {
            let code = match other {
                FrameError::PayloadTooLarge { .. } => DATA_INVALID,
                FrameError::Timeout | FrameError::IncompleteEnvelope { .. } => TIMEOUT,
                FrameError::ConnectionClosed => FAILURE,
                _ => INTERNAL,
            };
            tagged(code, context, other)
        }
    }
}

pub fn router_error(context: &str, err: RouterError) -> CliError {
    match err {
        RouterError::Transport(err) => transport_error(context, err),
        RouterError::Frame(err) => frame_error(context, err),
        other => {
            let code = match other {
                RouterError::MissingIdentity => USAGE,
                RouterError::NotConnected | RouterError::UnknownPeer(_) => FAILURE,
                _ => INTERNAL,
            };
            tagged(code, context, other)
        }
    }
}
