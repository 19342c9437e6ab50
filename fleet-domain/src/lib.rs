//! Core traits, types and reconnect policy for the fleet session daemon.
//!
//! This crate defines the vocabulary of the system. All other crates depend
//! on `fleet-domain` and speak its types. No I/O lives here.
//!
//! # Structure
//!
//! - [`error`]     — [`FleetError`] and [`Result<T>`] alias
//! - [`tenant`]    — [`TenantKey`], the normalized phone-number identity
//! - [`policy`]    — [`ReconnectPolicy`] backoff and [`DisconnectCode`] classification
//! - [`transport`] — [`ProtocolClient`] / [`ProtocolSession`] seams to the protocol engine
//! - [`session`]   — [`Credentials`], [`SessionStatus`], observer and handler traits

mod error;
mod policy;
mod session;
mod tenant;
mod transport;

// --- error
pub use error::{FleetError, Result};

// --- tenant
pub use tenant::TenantKey;

// --- policy
pub use policy::{
    // ---
    DisconnectClass,
    DisconnectCode,
    ReconnectPolicy,
    DEFAULT_BASE_DELAY,
    DEFAULT_CAP_DELAY,
    DEFAULT_JITTER_MAX,
    DEFAULT_MAX_ATTEMPTS,
};

// --- transport
pub use transport::{ProtocolClient, ProtocolSession, ProtocolSessionPtr};

// --- session
pub use session::{
    // ---
    BlockEntry,
    BlockList,
    Credentials,
    MessageHandler,
    SessionObserver,
    SessionStatus,
};
