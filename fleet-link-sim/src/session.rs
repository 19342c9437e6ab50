use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

// ---

use async_trait::async_trait;
use tokio::sync::Notify;

// ---

use fleet_domain::{
    // ---
    Credentials,
    DisconnectCode,
    FleetError,
    ProtocolSession,
    ProtocolSessionPtr,
    Result,
    SessionObserver,
    TenantKey,
};

// ---

use super::{SimConfig, SimStep};

// ---------------------------------------------------------------------------
// SimSession
// ---------------------------------------------------------------------------

/// In-process stand-in for one protocol session.
///
/// Built by [`super::SimClient::open`]. Emits observer events from a
/// spawned task according to its [`SimStep`]; tests can also end it from
/// the outside with [`SimSession::drop_link`].
pub struct SimSession {
    // ---
    tenant: TenantKey,
    registered: AtomicBool,
    identity: Mutex<Option<String>>,
    closed: AtomicBool,
    refuse_code: bool,
    code_requested: Notify,
    closing: Notify,
    observer: Arc<dyn SessionObserver>,
    config: SimConfig,
}

// ---

impl SimSession {
    // ---
    pub(crate) fn start(
        tenant: TenantKey,
        registered: bool,
        observer: Arc<dyn SessionObserver>,
        step: SimStep,
        config: SimConfig,
    ) -> Arc<Self> {
        // ---
        let session = Arc::new(Self {
            tenant,
            registered: AtomicBool::new(registered),
            identity: Mutex::new(None),
            closed: AtomicBool::new(false),
            refuse_code: step == SimStep::RefuseCode,
            code_requested: Notify::new(),
            closing: Notify::new(),
            observer,
            config,
        });

        tokio::spawn(session.clone().drive(step));
        session
    }

    // ---

    async fn drive(self: Arc<Self>, step: SimStep) {
        // ---
        tokio::time::sleep(self.config.event_delay).await;
        if self.is_closed() {
            return;
        }
        self.observer.on_connecting().await;

        match step {
            SimStep::Open => {
                if !self.is_registered() {
                    tokio::select! {
                        _ = self.code_requested.notified() => {}
                        _ = self.closing.notified() => return,
                    }
                    tokio::time::sleep(self.config.link_delay).await;
                    if self.is_closed() {
                        return;
                    }
                    if self.config.flush_creds_on_pair {
                        self.flush_creds().await;
                    }
                    self.registered.store(true, Ordering::SeqCst);
                }

                if self.is_closed() {
                    return;
                }
                *self.identity.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(format!("{}@s.sim", self.tenant));
                tracing::debug!(tenant = %self.tenant, "sim session open");
                let handle: ProtocolSessionPtr = self.clone();
                self.observer.on_open(handle).await;
            }

            SimStep::Close(code) => self.drop_link(code).await,

            // FailSetup never reaches here; the rest wait for an outside close.
            SimStep::FailSetup | SimStep::Hang | SimStep::RefuseCode => {}
        }
    }

    // ---

    async fn flush_creds(&self) {
        // ---
        let doc = serde_json::json!({
            "me": { "id": format!("{}@s.sim", self.tenant) },
            "registered": true,
        });
        match Credentials::new(doc) {
            Ok(creds) => self.observer.on_credentials_update(creds).await,
            Err(e) => tracing::error!(tenant = %self.tenant, "sim credentials rejected: {e}"),
        }
    }

    // ---

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ---

    /// End the session with `code`, as if the service dropped it.
    ///
    /// Fires `on_close` exactly once across all ways of closing.
    pub async fn drop_link(&self, code: DisconnectCode) {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.notify_one();
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::debug!(tenant = %self.tenant, %code, "sim session closed");
        self.observer.on_close(code).await;
    }

    // ---

    /// Push a key rotation through the observer.
    pub async fn rotate_creds(&self, creds: Credentials) {
        self.observer.on_credentials_update(creds).await;
    }
}

// ---

#[async_trait]
impl ProtocolSession for SimSession {
    // ---
    fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    fn identity(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    // ---

    async fn request_pairing_code(&self) -> Result<String> {
        // ---
        if self.is_closed() {
            return Err(FleetError::Protocol("session closed".into()));
        }
        if self.refuse_code {
            return Err(FleetError::Protocol("pairing code request rejected".into()));
        }
        if self.is_registered() {
            return Err(FleetError::Protocol(format!(
                "tenant {} is already registered",
                self.tenant
            )));
        }
        self.code_requested.notify_one();
        Ok(self.config.pairing_code.clone())
    }

    // ---

    async fn end(&self) -> Result<()> {
        self.drop_link(DisconnectCode::CONNECTION_CLOSED).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.drop_link(DisconnectCode::CONNECTION_CLOSED).await;
        Ok(())
    }
}
