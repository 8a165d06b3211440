//! Socket option store.
//!
//! Options are validated on `set` and otherwise passed through untouched to
//! whoever consumes them (identity greeting, stream timeouts). CURVE key
//! options are validated and stored for an encrypting layer; the stream
//! transport in this crate does not run the CURVE handshake itself.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use busprims_core::CURVE_KEY_LEN;
use bytes::Bytes;

use crate::error::{Result, TransportError};

/// Longest routing identity accepted.
pub const MAX_IDENTITY_LEN: usize = 255;

/// Option selector for [`SocketOptions::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOptionKind {
    Identity,
    RecvTimeout,
    SendTimeout,
    Linger,
    CurveServer,
    CurvePublicKey,
    CurveSecretKey,
    CurveServerKey,
}

impl SocketOptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketOptionKind::Identity => "identity",
            SocketOptionKind::RecvTimeout => "recv_timeout",
            SocketOptionKind::SendTimeout => "send_timeout",
            SocketOptionKind::Linger => "linger",
            SocketOptionKind::CurveServer => "curve_server",
            SocketOptionKind::CurvePublicKey => "curve_public_key",
            SocketOptionKind::CurveSecretKey => "curve_secret_key",
            SocketOptionKind::CurveServerKey => "curve_server_key",
        }
    }
}

/// A single socket option value.
#[derive(Clone, PartialEq, Eq)]
pub enum SocketOption {
    /// Routing identity announced to the peer.
    Identity(Bytes),
    RecvTimeout(Option<Duration>),
    SendTimeout(Option<Duration>),
    Linger(Duration),
    /// Act as the CURVE server side.
    CurveServer(bool),
    CurvePublicKey(String),
    CurveSecretKey(String),
    /// Public key of the server a client connects to.
    CurveServerKey(String),
}

impl SocketOption {
    pub fn kind(&self) -> SocketOptionKind {
        match self {
            SocketOption::Identity(_) => SocketOptionKind::Identity,
            SocketOption::RecvTimeout(_) => SocketOptionKind::RecvTimeout,
            SocketOption::SendTimeout(_) => SocketOptionKind::SendTimeout,
            SocketOption::Linger(_) => SocketOptionKind::Linger,
            SocketOption::CurveServer(_) => SocketOptionKind::CurveServer,
            SocketOption::CurvePublicKey(_) => SocketOptionKind::CurvePublicKey,
            SocketOption::CurveSecretKey(_) => SocketOptionKind::CurveSecretKey,
            SocketOption::CurveServerKey(_) => SocketOptionKind::CurveServerKey,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            SocketOption::Identity(identity) => validate_identity(identity),
            SocketOption::CurvePublicKey(key)
            | SocketOption::CurveSecretKey(key)
            | SocketOption::CurveServerKey(key) => {
                if key.len() == CURVE_KEY_LEN {
                    Ok(())
                } else {
                    Err(TransportError::InvalidOption {
                        option: self.kind().as_str(),
                        reason: format!(
                            "expected a {CURVE_KEY_LEN}-character key, got {}",
                            key.len()
                        ),
                    })
                }
            }
            SocketOption::RecvTimeout(Some(timeout)) | SocketOption::SendTimeout(Some(timeout))
                if timeout.is_zero() =>
            {
                Err(TransportError::InvalidOption {
                    option: self.kind().as_str(),
                    reason: "use None for no timeout instead of zero".into(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for SocketOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketOption::Identity(id) => {
                write!(f, "Identity({:?})", String::from_utf8_lossy(id))
            }
            SocketOption::RecvTimeout(t) => write!(f, "RecvTimeout({t:?})"),
            SocketOption::SendTimeout(t) => write!(f, "SendTimeout({t:?})"),
            SocketOption::Linger(t) => write!(f, "Linger({t:?})"),
            SocketOption::CurveServer(on) => write!(f, "CurveServer({on})"),
            SocketOption::CurvePublicKey(key) => write!(f, "CurvePublicKey({key:?})"),
            SocketOption::CurveSecretKey(_) => f.write_str("CurveSecretKey(<redacted>)"),
            SocketOption::CurveServerKey(key) => write!(f, "CurveServerKey({key:?})"),
        }
    }
}

/// Check a routing identity: 1 to [`MAX_IDENTITY_LEN`] bytes, not starting
/// with a NUL byte (reserved for generated identities).
pub fn validate_identity(identity: &[u8]) -> Result<()> {
    let reason = if identity.is_empty() {
        "identity is empty".to_string()
    } else if identity.len() > MAX_IDENTITY_LEN {
        format!(
            "identity is {} bytes, max {MAX_IDENTITY_LEN}",
            identity.len()
        )
    } else if identity[0] == 0 {
        "identity must not start with a NUL byte".to_string()
    } else {
        return Ok(());
    };
    Err(TransportError::InvalidOption {
        option: SocketOptionKind::Identity.as_str(),
        reason,
    })
}

/// Validated option values for one socket.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    values: HashMap<SocketOptionKind, SocketOption>,
}

impl SocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store `option`, replacing any earlier value of the same
    /// kind.
    pub fn set(&mut self, option: SocketOption) -> Result<()> {
        option.validate()?;
        self.values.insert(option.kind(), option);
        Ok(())
    }

    pub fn get(&self, kind: SocketOptionKind) -> Option<&SocketOption> {
        self.values.get(&kind)
    }

    pub fn identity(&self) -> Option<&Bytes> {
        match self.get(SocketOptionKind::Identity) {
            Some(SocketOption::Identity(identity)) => Some(identity),
            _ => None,
        }
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        match self.get(SocketOptionKind::RecvTimeout) {
            Some(SocketOption::RecvTimeout(timeout)) => *timeout,
            _ => None,
        }
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        match self.get(SocketOptionKind::SendTimeout) {
            Some(SocketOption::SendTimeout(timeout)) => *timeout,
            _ => None,
        }
    }

    pub fn linger(&self) -> Option<Duration> {
        match self.get(SocketOptionKind::Linger) {
            Some(SocketOption::Linger(linger)) => Some(*linger),
            _ => None,
        }
    }

    /// Whether server-side CURVE keys are fully installed.
    pub fn is_curve_server(&self) -> bool {
        matches!(
            self.get(SocketOptionKind::CurveServer),
            Some(SocketOption::CurveServer(true))
        ) && self.get(SocketOptionKind::CurvePublicKey).is_some()
            && self.get(SocketOptionKind::CurveSecretKey).is_some()
    }
}
