//! Identity-routed IPC message bus.
//!
//! Named processes exchange fixed-layout [`core::Message`]s through a central
//! bus. Every payload travels as a chunked, identity-addressed envelope, and
//! send buffers come from a fixed-capacity slot pool.
//!
//! # Crate Structure
//!
//! - [`core`]: errors, recovery plans, the slot pool, messages and keys
//! - [`transport`]: endpoints, Unix domain and TCP streams, readiness polling
//! - [`frame`]: wire codec and multipart envelopes
//! - [`router`]: client transport, ROUTER socket, routing table and bus

/// Re-export core types.
pub mod core {
    pub use busprims_core::*;
}

/// Re-export transport types.
pub mod transport {
    pub use busprims_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use busprims_frame::*;
}

/// Re-export router and bus types.
pub mod router {
    pub use busprims_router::*;
}
