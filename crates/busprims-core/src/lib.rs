//! Shared building blocks for the busprims IPC bus.
//!
//! - [`error`]: the tagged error value every component reports through
//! - [`recovery`]: the recovery plan and the error handler that runs it
//! - [`pool`]: fixed-capacity slot pool with corruption detection
//! - [`message`]: the fixed-layout bus message and client roles
//! - [`keys`]: credential provider interface

pub mod error;
pub mod keys;
pub mod message;
pub mod pool;
pub mod recovery;

pub use error::{BusError, Classify, ErrorCode, Result, Severity};
pub use keys::{KeyProvider, Keypair, MemoryKeyStore, CURVE_KEY_LEN};
pub use message::{
    client_name, ClientId, Message, CATEGORY_LEN, DATA_LEN, DEFAULT_ENDPOINT, MESSAGE_SIZE,
};
pub use pool::{PoolError, PoolSnapshot, Slot, SlotHandle, SlotPool, CANARY};
pub use recovery::{
    Disposition, ErrorHandler, FatalPolicy, RecoveryAction, RecoveryPlan, RecoveryPlanBuilder,
};
