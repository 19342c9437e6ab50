//! [`LogHandler`] — message handling for open sessions.
//!
//! Command dispatch and auto-responses live outside this daemon. The
//! bundled handler only records that a session became available to them.

use async_trait::async_trait;

// ---

use fleet_domain::{MessageHandler, ProtocolSessionPtr, TenantKey};

// ---

pub struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    // ---
    async fn activate(&self, tenant: &TenantKey, session: ProtocolSessionPtr) {
        tracing::info!(
            %tenant,
            identity = session.identity().as_deref().unwrap_or("?"),
            registered = session.is_registered(),
            "message handling active"
        );
    }
}
