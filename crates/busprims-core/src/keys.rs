//! Credential provider interface.
//!
//! Key generation and the encrypted key store live outside this workspace.
//! Components receive a [`KeyProvider`] explicitly and never reach for a
//! process-wide instance.

use std::collections::HashMap;
use std::fmt;

use crate::error::{BusError, ErrorCode, Result, Severity};
use crate::message::ClientId;

/// Length of a Z85-encoded CURVE25519 key.
pub const CURVE_KEY_LEN: usize = 40;

/// Public/secret key pair for one endpoint. The secret half is redacted in
/// debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    public: String,
    secret: String,
}

impl Keypair {
    /// Build a key pair. Both halves must be [`CURVE_KEY_LEN`] characters.
    pub fn new(public: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let public = public.into();
        let secret = secret.into();
        for (half, key) in [("public", &public), ("secret", &secret)] {
            if key.len() != CURVE_KEY_LEN {
                return Err(BusError::new(
                    ErrorCode::InitKeys,
                    format!(
                        "{half} key must be {CURVE_KEY_LEN} characters, got {}",
                        key.len()
                    ),
                    Severity::Medium,
                ));
            }
        }
        Ok(Self { public, secret })
    }

    pub fn public(&self) -> &str {
        &self.public
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .field(
                "secret",
                &format_args!("<redacted:{} bytes>", self.secret.len()),
            )
            .finish()
    }
}

/// Source of endpoint credentials.
pub trait KeyProvider {
    /// Key pair stored for `role`.
    fn identity_keypair(&self, role: ClientId) -> Result<Keypair>;

    /// Produce a fresh key pair.
    fn generate_keypair(&self) -> Result<Keypair>;
}

/// In-memory provider for tests and development deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    keys: HashMap<ClientId, Keypair>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keypair(mut self, role: ClientId, keypair: Keypair) -> Self {
        self.keys.insert(role, keypair);
        self
    }

    pub fn insert(&mut self, role: ClientId, keypair: Keypair) -> Option<Keypair> {
        self.keys.insert(role, keypair)
    }
}

impl KeyProvider for MemoryKeyStore {
    fn identity_keypair(&self, role: ClientId) -> Result<Keypair> {
        self.keys.get(&role).cloned().ok_or_else(|| {
            BusError::medium(
                ErrorCode::KeyNotFound,
                format!("no key pair stored for {role}"),
            )
        })
    }

    fn generate_keypair(&self) -> Result<Keypair> {
        Err(BusError::medium(
            ErrorCode::InitKeys,
            "in-memory key store cannot generate keys",
        ))
    }
}
