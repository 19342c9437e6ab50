use std::sync::Arc;

use async_trait::async_trait;

use super::error::Result;
use super::session::{Credentials, SessionObserver};
use super::tenant::TenantKey;

// ---

/// Shared handle to a live protocol session. Held by the registry and
/// the message handler at the same time.
pub type ProtocolSessionPtr = Arc<dyn ProtocolSession>;

// ---------------------------------------------------------------------------
// ProtocolSession
// ---------------------------------------------------------------------------

/// One connection to the messaging service, owned by an external protocol
/// engine. The daemon only drives its lifecycle.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    // ---
    fn tenant(&self) -> &TenantKey;

    /// Authenticated identity reported by the service, `None` until the
    /// session has logged in.
    fn identity(&self) -> Option<String>;

    /// `false` while the tenant has never completed pairing.
    fn is_registered(&self) -> bool;

    /// Ask the service for a device-link code. Only meaningful while
    /// unregistered.
    async fn request_pairing_code(&self) -> Result<String>;

    /// Graceful shutdown that keeps the device linked.
    async fn end(&self) -> Result<()>;

    /// Tear down the socket. Safe to call on an already-closed session.
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ProtocolClient
// ---------------------------------------------------------------------------

/// Factory for protocol sessions.
///
/// Implementations: `fleet_link_sim::SimClient`. A production build plugs
/// the real protocol engine in behind this trait.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    // ---
    /// Build a session for `tenant` and start connecting.
    ///
    /// `creds` is `None` for a first-time pairing. `observer` receives every
    /// lifecycle event of the returned session; events may arrive only
    /// after this call has returned.
    async fn open(
        &self,
        tenant: &TenantKey,
        creds: Option<Credentials>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<ProtocolSessionPtr>;
}
