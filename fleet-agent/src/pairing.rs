//! [`PairingFlow`] — first-time handshake for a tenant.
//!
//! Pairing runs on a transient protocol session with no credentials. Once
//! it opens, the credentials it flushed are checked on disk, mirrored to
//! the database, and the transient session is ended. After a cooldown the
//! tenant is brought up by the [`SessionDriver`] like any other.
//!
//! Only one pairing runs at a time. The spawned pairing task holds an
//! owned guard on a process-wide async mutex until its sub-flow settles;
//! every exit path releases it by drop.

use std::sync::Arc;
use std::time::Duration;

// ---

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

// ---

use fleet_domain::{
    // ---
    BlockList,
    Credentials,
    DisconnectCode,
    FleetError,
    ProtocolClient,
    ProtocolSessionPtr,
    Result,
    SessionObserver,
    TenantKey,
};
use fleet_store::CredentialStore;

// ---

use super::{ConnectionManager, SessionDriver};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const CODE_GROUP: usize = 4;
const FLUSH_POLL: Duration = Duration::from_millis(250);
const EVENT_CHANNEL_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// PairingEvent
// ---------------------------------------------------------------------------

/// What the caller of [`PairingFlow::pair`] hears back, in order: zero or
/// more codes (a restart issues a fresh one), then exactly one of `Paired`
/// or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    // ---
    Code(String),
    Paired,
    Failed(String),
}

// ---------------------------------------------------------------------------
// PairingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PairingConfig {
    // ---
    /// Wait between ending the transient session and the real connect.
    pub cooldown: Duration,

    /// How long the protocol layer gets to flush credentials after open.
    pub flush_grace: Duration,

    /// How long to wait for the user to enter a code before giving up.
    pub code_timeout: Duration,

    /// Transient-close restarts allowed before the pairing is abandoned.
    pub max_restarts: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(3),
            flush_grace: Duration::from_secs(5),
            code_timeout: Duration::from_secs(180),
            max_restarts: fleet_domain::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

// ---------------------------------------------------------------------------
// format_pairing_code
// ---------------------------------------------------------------------------

/// `"ABCD1234"` → `"ABCD-1234"`. Separators already present are dropped
/// first.
pub fn format_pairing_code(raw: &str) -> String {
    // ---
    let chars: Vec<char> = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    chars
        .chunks(CODE_GROUP)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

// ---------------------------------------------------------------------------
// PairingFlow
// ---------------------------------------------------------------------------

pub struct PairingFlow {
    // ---
    lock: Arc<Mutex<()>>,
    driver: Arc<SessionDriver>,
    registry: Arc<ConnectionManager>,
    store: Arc<CredentialStore>,
    block_list: Arc<dyn BlockList>,
    client: Arc<dyn ProtocolClient>,
    config: PairingConfig,
}

// ---

impl PairingFlow {
    // ---
    pub fn new(
        driver: Arc<SessionDriver>,
        store: Arc<CredentialStore>,
        block_list: Arc<dyn BlockList>,
        client: Arc<dyn ProtocolClient>,
        config: PairingConfig,
    ) -> Self {
        // ---
        Self {
            lock: Arc::new(Mutex::new(())),
            registry: driver.registry().clone(),
            driver,
            store,
            block_list,
            client,
            config,
        }
    }

    // ---

    /// Start pairing `tenant`. Blocked or already connected tenants are
    /// refused up front; everything after that is reported on the returned
    /// channel.
    pub async fn pair(self: &Arc<Self>, tenant: TenantKey) -> Result<mpsc::Receiver<PairingEvent>> {
        // ---
        self.precheck(&tenant).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let flow = Arc::clone(self);

        tokio::spawn(async move {
            let _guard = flow.lock.clone().lock_owned().await;
            tracing::info!(%tenant, "pairing started");

            let event = match flow.run(&tenant, &tx).await {
                Ok(()) => {
                    tracing::info!(%tenant, "pairing complete");
                    PairingEvent::Paired
                }
                Err(e) => {
                    tracing::error!(%tenant, "pairing failed: {e}");
                    PairingEvent::Failed(e.to_string())
                }
            };
            if tx.send(event).await.is_err() {
                tracing::debug!(%tenant, "pairing caller went away before the outcome");
            }
        });

        Ok(rx)
    }

    // ---

    /// Wait for the first pairing code for `tenant`.
    ///
    /// The pairing keeps running after the code is returned.
    pub async fn request_code(
        self: &Arc<Self>,
        tenant: TenantKey,
        timeout: Duration,
    ) -> Result<String> {
        // ---
        let mut rx = self.pair(tenant.clone()).await?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(PairingEvent::Code(code))) => Ok(code),
            Ok(Some(PairingEvent::Paired)) => Err(FleetError::AlreadyConnected(tenant)),
            Ok(Some(PairingEvent::Failed(reason))) => {
                Err(FleetError::PairingAbandoned { tenant, reason })
            }
            Ok(None) => Err(FleetError::PairingAbandoned {
                tenant,
                reason: "pairing task ended without a code".into(),
            }),
            Err(_) => Err(FleetError::PairingAbandoned {
                tenant,
                reason: format!("no pairing code within {timeout:?}"),
            }),
        }
    }

    // ---

    async fn precheck(&self, tenant: &TenantKey) -> Result<()> {
        // ---
        if self.block_list.is_blocked(tenant).await? {
            return Err(FleetError::Blocked(tenant.clone()));
        }
        if self.registry.is_connected(tenant) || self.registry.is_connecting(tenant) {
            return Err(FleetError::AlreadyConnected(tenant.clone()));
        }
        Ok(())
    }

    // ---

    /// The mutex-protected sub-flow.
    async fn run(&self, tenant: &TenantKey, events: &mpsc::Sender<PairingEvent>) -> Result<()> {
        // ---
        // State may have moved while queued behind another pairing.
        self.precheck(tenant).await?;
        // A backing-off tenant must not reconnect on old credentials mid-pairing.
        self.registry.forget(tenant);

        let mut restarts = 0u32;
        loop {
            // Only a flush from this session may pass verification.
            self.store.delete_local(tenant).await?;

            let (signal_tx, mut signals) = mpsc::unbounded_channel();
            let observer = Arc::new(PairingObserver {
                tenant: tenant.clone(),
                store: self.store.clone(),
                signals: signal_tx,
            });
            let session = self.client.open(tenant, None, observer).await?;

            if !session.is_registered() {
                let raw = match session.request_pairing_code().await {
                    Ok(raw) => raw,
                    Err(e) => {
                        close_quietly(tenant, &session).await;
                        return Err(e);
                    }
                };
                let code = format_pairing_code(&raw);
                tracing::info!(%tenant, %code, "pairing code issued");
                if events.send(PairingEvent::Code(code)).await.is_err() {
                    tracing::debug!(%tenant, "pairing caller went away, code not delivered");
                }
            }

            let waited = tokio::time::timeout(self.config.code_timeout, signals.recv()).await;
            let signal = match waited {
                Ok(signal) => signal,
                Err(_) => {
                    close_quietly(tenant, &session).await;
                    return Err(FleetError::PairingAbandoned {
                        tenant: tenant.clone(),
                        reason: "pairing code was not entered in time".into(),
                    });
                }
            };

            match signal {
                Some(Signal::Open(session)) => return self.finish(tenant, session).await,

                Some(Signal::Close(code)) if !code.classify().should_reconnect() => {
                    if let Err(e) = self.store.delete(tenant).await {
                        tracing::warn!(%tenant, "removing partial credentials failed: {e}");
                    }
                    return Err(FleetError::PairingAbandoned {
                        tenant: tenant.clone(),
                        reason: format!("fatal disconnect (code {code})"),
                    });
                }

                Some(Signal::Close(code)) => {
                    restarts += 1;
                    if restarts > self.config.max_restarts {
                        return Err(FleetError::PairingAbandoned {
                            tenant: tenant.clone(),
                            reason: format!("gave up after {} restarts", self.config.max_restarts),
                        });
                    }
                    tracing::info!(%tenant, %code, restarts, "pairing session closed, restarting");
                }

                None => {
                    return Err(FleetError::Protocol(format!(
                        "pairing session for {tenant} went away without closing"
                    )));
                }
            }
        }
    }

    // ---

    async fn finish(&self, tenant: &TenantKey, session: ProtocolSessionPtr) -> Result<()> {
        // ---
        let deadline = Instant::now() + self.config.flush_grace;
        while self.store.read_local(tenant).await?.is_none() {
            if Instant::now() >= deadline {
                close_quietly(tenant, &session).await;
                return Err(FleetError::PairingVerification(tenant.clone()));
            }
            tokio::time::sleep(FLUSH_POLL).await;
        }

        self.store.mirror_to_db(tenant).await?;
        tracing::info!(%tenant, "paired credentials persisted");

        if let Err(e) = session.end().await {
            tracing::warn!(%tenant, "ending pairing session failed: {e}");
        }
        tokio::time::sleep(self.config.cooldown).await;

        self.driver.connect(tenant).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PairingObserver
// ---------------------------------------------------------------------------

enum Signal {
    // ---
    Open(ProtocolSessionPtr),
    Close(DisconnectCode),
}

// ---

struct PairingObserver {
    // ---
    tenant: TenantKey,
    store: Arc<CredentialStore>,
    signals: mpsc::UnboundedSender<Signal>,
}

// ---

#[async_trait]
impl SessionObserver for PairingObserver {
    // ---
    async fn on_open(&self, session: ProtocolSessionPtr) {
        let _ = self.signals.send(Signal::Open(session));
    }

    async fn on_close(&self, code: DisconnectCode) {
        let _ = self.signals.send(Signal::Close(code));
    }

    async fn on_credentials_update(&self, creds: Credentials) {
        if let Err(e) = self.store.write_local(&self.tenant, &creds).await {
            tracing::error!(tenant = %self.tenant, "persisting pairing credentials failed: {e}");
        }
    }
}

// ---

async fn close_quietly(tenant: &TenantKey, session: &ProtocolSessionPtr) {
    if let Err(e) = session.close().await {
        tracing::warn!(%tenant, "closing pairing session failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
