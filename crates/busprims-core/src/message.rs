//! Fixed-layout bus message and the well-known client roles.
//!
//! Wire layout (packed, little-endian, 302 bytes):
//!
//! ```text
//! ┌────────┬─────────┬───────────┬──────────────┬─────────────┐
//! │ src_id │ dist_id │ timestamp │ category     │ data        │
//! │ i32    │ i32     │ i64       │ 30 bytes     │ 256 bytes   │
//! │ @0     │ @4      │ @8        │ @16          │ @46         │
//! └────────┴─────────┴───────────┴──────────────┴─────────────┘
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};

/// Length of the `category` field.
pub const CATEGORY_LEN: usize = 30;
/// Length of the `data` field.
pub const DATA_LEN: usize = 256;
/// Total encoded size of a [`Message`].
pub const MESSAGE_SIZE: usize = 4 + 4 + 8 + CATEGORY_LEN + DATA_LEN;

/// Endpoint every participant uses unless configured otherwise.
pub const DEFAULT_ENDPOINT: &str = "ipc:///tmp/secure_ipc";

/// Well-known client roles. The numeric value doubles as `src_id`/`dist_id`
/// and as the routing-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClientId {
    Manager = 0,
    Peer = 1,
    Ui = 2,
    Router = 3,
}

impl ClientId {
    pub const ALL: [ClientId; 4] = [
        ClientId::Manager,
        ClientId::Peer,
        ClientId::Ui,
        ClientId::Router,
    ];

    /// Fixed display id, also used as the client's default transport identity.
    pub fn identity(self) -> &'static str {
        match self {
            ClientId::Manager => "manager",
            ClientId::Peer => "peerxxx",
            ClientId::Ui => "uixxxxx",
            ClientId::Router => "ipcrout",
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ClientId::Manager),
            1 => Some(ClientId::Peer),
            2 => Some(ClientId::Ui),
            3 => Some(ClientId::Router),
            _ => None,
        }
    }

    /// Parse a role by name (`manager`, `peer`, `ui`, `router`) or by number.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "manager" => Some(ClientId::Manager),
            "peer" => Some(ClientId::Peer),
            "ui" => Some(ClientId::Ui),
            "router" => Some(ClientId::Router),
            other => other.parse().ok().and_then(Self::from_i32),
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identity())
    }
}

/// Human-readable name for a raw client id, including unknown ones.
pub fn client_name(raw: i32) -> String {
    match ClientId::from_i32(raw) {
        Some(id) => id.identity().to_string(),
        None => format!("client#{raw}"),
    }
}

/// One bus message. Immutable once built; the router only reads the ids.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub src_id: i32,
    pub dist_id: i32,
    pub timestamp: i64,
    pub category: [u8; CATEGORY_LEN],
    pub data: [u8; DATA_LEN],
}

impl Message {
    /// Message from `src` to `dist`, stamped with the current Unix time in
    /// milliseconds.
    pub fn new(src: ClientId, dist: ClientId) -> Self {
        Self {
            src_id: src.as_i32(),
            dist_id: dist.as_i32(),
            timestamp: unix_millis(),
            category: [0; CATEGORY_LEN],
            data: [0; DATA_LEN],
        }
    }

    /// Set the category, truncated to [`CATEGORY_LEN`] bytes.
    pub fn with_category(mut self, category: &str) -> Self {
        copy_truncated(&mut self.category, category.as_bytes());
        self
    }

    /// Set the data, truncated to [`DATA_LEN`] bytes.
    pub fn with_data(mut self, data: &[u8]) -> Self {
        copy_truncated(&mut self.data, data);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn source(&self) -> Option<ClientId> {
        ClientId::from_i32(self.src_id)
    }

    pub fn destination(&self) -> Option<ClientId> {
        ClientId::from_i32(self.dist_id)
    }

    /// Category up to the first NUL, lossily decoded.
    pub fn category_str(&self) -> String {
        String::from_utf8_lossy(trim_nul(&self.category)).into_owned()
    }

    /// Data up to the last non-NUL byte.
    pub fn data_trimmed(&self) -> &[u8] {
        let end = self
            .data
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |pos| pos + 1);
        &self.data[..end]
    }

    /// Append the wire encoding to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_i32_le(self.src_id);
        dst.put_i32_le(self.dist_id);
        dst.put_i64_le(self.timestamp);
        dst.put_slice(&self.category);
        dst.put_slice(&self.data);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESSAGE_SIZE);
        self.encode(&mut out);
        out
    }

    /// Decode from exactly [`MESSAGE_SIZE`] bytes. Any other length is
    /// rejected with the observed size.
    pub fn decode(mut src: &[u8]) -> Result<Self, usize> {
        if src.len() != MESSAGE_SIZE {
            return Err(src.len());
        }
        let src_id = src.get_i32_le();
        let dist_id = src.get_i32_le();
        let timestamp = src.get_i64_le();
        let mut category = [0u8; CATEGORY_LEN];
        src.copy_to_slice(&mut category);
        let mut data = [0u8; DATA_LEN];
        src.copy_to_slice(&mut data);
        Ok(Self {
            src_id,
            dist_id,
            timestamp,
            category,
            data,
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("src_id", &self.src_id)
            .field("dist_id", &self.dist_id)
            .field("timestamp", &self.timestamp)
            .field("category", &self.category_str())
            .field("data_len", &self.data_trimmed().len())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Frame ---")?;
        writeln!(f, "src: {}", self.src_id)?;
        writeln!(f, "dist: {}", self.dist_id)?;
        writeln!(f, "timestamp: {}", self.timestamp)?;
        writeln!(f, "category: {}", self.category_str())?;
        write!(f, "data: ")?;
        for byte in self.data_trimmed() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn copy_truncated(dst: &mut [u8], src: &[u8]) {
    dst.fill(0);
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
