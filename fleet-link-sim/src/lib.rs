//! In-process protocol client for fleet unit and integration testing.
//!
//! [`SimClient`] implements [`fleet_domain::ProtocolClient`] without any
//! network. Each `open()` builds a [`SimSession`] that emits observer events
//! from a spawned task, driven by a per-tenant script of [`SimStep`]s:
//!
//! - open normally (after a pairing code is requested, when unregistered)
//! - close with a chosen disconnect code
//! - fail during socket setup
//! - hang until closed from outside
//!
//! # Quick start
//!
//! ```rust
//! use fleet_link_sim::{SimClient, SimConfig};
//!
//! let client = SimClient::new(SimConfig::healthy());
//! ```

mod client;
mod config;
mod session;

// --- public API
pub use client::{OpenRecord, SimClient};
pub use config::{SimConfig, SimStep};
pub use session::SimSession;
