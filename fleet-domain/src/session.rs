use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{FleetError, Result};
use super::policy::DisconnectCode;
use super::tenant::TenantKey;
use super::transport::ProtocolSessionPtr;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Opaque auth payload produced by the protocol layer.
///
/// The daemon never looks inside beyond checking that it is a non-empty
/// JSON object; the protocol layer owns the schema and rewrites it as
/// keys rotate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(serde_json::Value);

// ---

impl Credentials {
    // ---
    /// Wrap a credential document. Rejects anything that is not a
    /// non-empty JSON object.
    pub fn new(doc: serde_json::Value) -> Result<Self> {
        // ---
        match doc.as_object() {
            Some(map) if !map.is_empty() => Ok(Self(doc)),
            _ => Err(FleetError::Store("credential document is not a non-empty object".into())),
        }
    }

    // ---

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        // ---
        let doc: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| FleetError::Store(e.to_string()))?;
        Self::new(doc)
    }

    // ---

    pub fn to_vec(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail.
        serde_json::to_vec_pretty(&self.0).unwrap_or_default()
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Diagnostic snapshot of one tenant's registry record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    // ---
    pub connected: bool,
    pub connecting: bool,
    pub reconnect_attempts: u32,
    pub has_scheduled: bool,
}

// ---------------------------------------------------------------------------
// BlockEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockEntry {
    // ---
    pub tenant: TenantKey,
    pub blocked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SessionObserver
// ---------------------------------------------------------------------------

/// Lifecycle slots handed to the protocol layer when a session is built.
///
/// The protocol client calls these in order for a given session:
/// `on_connecting`, any number of `on_credentials_update`, then at most one
/// `on_open`, and finally one `on_close`. Slots are fixed for the life of
/// the session; nothing registers or removes listeners afterwards.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    // ---
    /// Socket construction has begun.
    async fn on_connecting(&self) {}

    /// The session authenticated. `session` is the same handle `open`
    /// returned.
    async fn on_open(&self, session: ProtocolSessionPtr) {
        let _ = session;
    }

    /// The session ended. Called exactly once per session, including
    /// after `close()` or `end()`.
    async fn on_close(&self, code: DisconnectCode) {
        let _ = code;
    }

    /// The protocol layer rotated keys. Must be durable before returning.
    async fn on_credentials_update(&self, creds: Credentials) {
        let _ = creds;
    }
}

// ---------------------------------------------------------------------------
// MessageHandler
// ---------------------------------------------------------------------------

/// Downstream consumer of an open session (command dispatch,
/// auto-responses, ...). Activated once per successful open.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn activate(&self, tenant: &TenantKey, session: ProtocolSessionPtr);
}

// ---------------------------------------------------------------------------
// BlockList
// ---------------------------------------------------------------------------

/// Tenants that must never be connected, restored or paired.
#[async_trait]
pub trait BlockList: Send + Sync {
    // ---
    async fn is_blocked(&self, tenant: &TenantKey) -> Result<bool>;

    async fn block(&self, tenant: &TenantKey) -> Result<()>;

    async fn unblock(&self, tenant: &TenantKey) -> Result<()>;

    async fn list(&self) -> Result<Vec<BlockEntry>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
