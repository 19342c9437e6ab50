//! [`SessionDriver`] — one tenant's lifecycle, from credentials to an open
//! session and back.
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──on_open──▶ Open
//!                        │                      │
//!                        └──────on_close────────┴──▶ Closed
//!                                                      │
//!                Fatal ─▶ credentials deleted, record purged
//!            Transient ─▶ retry scheduled ─▶ Connecting
//!            exhausted ─▶ record purged (Idle)
//! ```
//!
//! # Attempts and generations
//!
//! Every attempt gets a fresh generation number and an observer bound to
//! it. Observer events whose generation is no longer current are dropped,
//! so closing a session on purpose (disconnect, delete, block) never feeds
//! back into the reconnect path, and a late close from an old session
//! cannot tear down a newer one.
//!
//! Callers that arrive while an attempt is in flight subscribe to that
//! attempt's `watch` channel instead of starting a second one.
//!
//! # Lock order
//!
//! `attempts` is taken before the registry lock, never the other way round.
//! Neither is held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

// ---

use async_trait::async_trait;
use tokio::sync::watch;

// ---

use fleet_domain::{
    // ---
    BlockEntry,
    BlockList,
    Credentials,
    DisconnectClass,
    DisconnectCode,
    FleetError,
    MessageHandler,
    ProtocolClient,
    ProtocolSessionPtr,
    Result,
    SessionObserver,
    SessionStatus,
    TenantKey,
};
use fleet_store::CredentialStore;

// ---

use super::{ConnectionManager, RetryFn, RetryFuture, ScheduleOutcome};

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum AttemptOutcome {
    // ---
    Open(ProtocolSessionPtr),
    Closed(DisconnectCode),
    Failed(String),
}

type OutcomeTx = watch::Sender<Option<AttemptOutcome>>;
type OutcomeRx = watch::Receiver<Option<AttemptOutcome>>;

// ---

#[derive(Default)]
struct Current {
    // ---
    generation: u64,
    /// Present while the attempt is unresolved.
    pending: Option<OutcomeTx>,
    /// Session built for the unresolved attempt, so it can be abandoned.
    pending_session: Option<ProtocolSessionPtr>,
}

// ---

impl Current {
    // ---
    fn resolve(&mut self, outcome: AttemptOutcome) {
        self.pending_session = None;
        if let Some(tx) = self.pending.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

// ---

enum Begin {
    // ---
    Open(ProtocolSessionPtr),
    Pending(OutcomeRx),
}

// ---------------------------------------------------------------------------
// SessionDriver
// ---------------------------------------------------------------------------

pub struct SessionDriver {
    // ---
    registry: Arc<ConnectionManager>,
    store: Arc<CredentialStore>,
    block_list: Arc<dyn BlockList>,
    client: Arc<dyn ProtocolClient>,
    handler: Arc<dyn MessageHandler>,

    attempts: Mutex<HashMap<TenantKey, Current>>,
    next_generation: AtomicU64,

    /// Handed to observers and retry closures; they must not keep the
    /// driver alive on their own.
    me: Weak<SessionDriver>,
}

// ---

impl SessionDriver {
    // ---
    pub fn new(
        registry: Arc<ConnectionManager>,
        store: Arc<CredentialStore>,
        block_list: Arc<dyn BlockList>,
        client: Arc<dyn ProtocolClient>,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<Self> {
        // ---
        Arc::new_cyclic(|me| Self {
            registry,
            store,
            block_list,
            client,
            handler,
            attempts: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            me: me.clone(),
        })
    }

    // ---

    pub fn registry(&self) -> &Arc<ConnectionManager> {
        &self.registry
    }

    fn attempts(&self) -> MutexGuard<'_, HashMap<TenantKey, Current>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, tenant: &TenantKey, generation: u64) -> bool {
        self.attempts()
            .get(tenant)
            .is_some_and(|c| c.generation == generation)
    }

    // --- connect -----------------------------------------------------------

    /// Bring `tenant` online and wait for the attempt to resolve.
    ///
    /// An already-open session is returned as is. A call that lands while
    /// an attempt is in flight resolves with that attempt's outcome.
    pub async fn connect(&self, tenant: &TenantKey) -> Result<ProtocolSessionPtr> {
        // ---
        match self.begin(tenant, false).await? {
            Some(Begin::Open(session)) => Ok(session),
            Some(Begin::Pending(rx)) => Self::await_outcome(tenant, rx).await,
            None => Err(FleetError::Protocol("connection attempt abandoned".into())),
        }
    }

    // ---

    /// Start (or join) an attempt without waiting for it to resolve.
    ///
    /// A retry only goes ahead while the registry still has the tenant
    /// waiting to reconnect; otherwise it yields `None`.
    async fn begin(&self, tenant: &TenantKey, from_retry: bool) -> Result<Option<Begin>> {
        // ---
        if self.block_list.is_blocked(tenant).await? {
            self.registry.clear_scheduled_reconnect(tenant);
            return Err(FleetError::Blocked(tenant.clone()));
        }

        let (generation, rx) = {
            let mut attempts = self.attempts();

            if from_retry && !self.registry.awaiting_retry(tenant) {
                tracing::debug!(%tenant, "tenant no longer awaiting reconnect, retry dropped");
                return Ok(None);
            }

            if let Some(session) = self.registry.get_connection(tenant) {
                if session.identity().is_some() {
                    return Ok(Some(Begin::Open(session)));
                }
                tracing::debug!(%tenant, "dropping dead handle before reconnecting");
                self.registry.remove_connection(tenant);
            }

            let current = attempts.entry(tenant.clone()).or_default();
            if let Some(tx) = &current.pending {
                tracing::debug!(%tenant, "joining in-flight connection attempt");
                return Ok(Some(Begin::Pending(tx.subscribe())));
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = watch::channel(None);
            current.generation = generation;
            current.pending = Some(tx);
            self.registry.mark_connecting(tenant);
            (generation, rx)
        };

        tracing::info!(%tenant, generation, "connection attempt started");
        match self.open_session(tenant, generation).await {
            Ok(()) => Ok(Some(Begin::Pending(rx))),
            Err(e) => {
                self.fail_attempt(tenant, generation, &e);
                Err(e)
            }
        }
    }

    // ---

    async fn open_session(&self, tenant: &TenantKey, generation: u64) -> Result<()> {
        // ---
        let creds = self
            .store
            .read(tenant)
            .await?
            .ok_or_else(|| FleetError::NoCredentials(tenant.clone()))?;

        let observer = Arc::new(DriverObserver {
            driver: self.me.clone(),
            tenant: tenant.clone(),
            generation,
        });
        let session = self.client.open(tenant, Some(creds), observer).await?;

        let superseded = {
            let mut attempts = self.attempts();
            match attempts.get_mut(tenant) {
                Some(c) if c.generation == generation && c.pending.is_some() => {
                    c.pending_session = Some(session.clone());
                    false
                }
                Some(c) => c.generation != generation,
                None => true,
            }
        };
        if superseded {
            tracing::debug!(%tenant, generation, "attempt superseded during setup");
            if let Err(e) = session.close().await {
                tracing::warn!(%tenant, "closing superseded session failed: {e}");
            }
        }
        Ok(())
    }

    // ---

    fn fail_attempt(&self, tenant: &TenantKey, generation: u64, err: &FleetError) {
        // ---
        let mut attempts = self.attempts();
        if let Some(current) = attempts.get_mut(tenant) {
            if current.generation == generation {
                current.resolve(AttemptOutcome::Failed(err.to_string()));
                self.registry.unmark_connecting(tenant);
            }
        }
        drop(attempts);
        tracing::warn!(%tenant, "connection attempt failed: {err}");
    }

    // ---

    async fn await_outcome(tenant: &TenantKey, mut rx: OutcomeRx) -> Result<ProtocolSessionPtr> {
        // ---
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| FleetError::Protocol("connection attempt abandoned".into()))?
            .clone();

        match outcome {
            Some(AttemptOutcome::Open(session)) => Ok(session),
            Some(AttemptOutcome::Closed(code)) => match code.classify() {
                DisconnectClass::Fatal => Err(FleetError::FatalAuth {
                    tenant: tenant.clone(),
                    code,
                }),
                _ => Err(FleetError::Transient {
                    tenant: tenant.clone(),
                    code,
                }),
            },
            Some(AttemptOutcome::Failed(reason)) => Err(FleetError::Protocol(reason)),
            None => Err(FleetError::Protocol("connection attempt abandoned".into())),
        }
    }

    // --- observer callbacks ------------------------------------------------

    async fn handle_open(&self, tenant: &TenantKey, generation: u64, session: ProtocolSessionPtr) {
        // ---
        let installed = {
            let mut attempts = self.attempts();
            match attempts.get_mut(tenant) {
                Some(current) if current.generation == generation => {
                    self.registry.add_connection(tenant, session.clone());
                    current.resolve(AttemptOutcome::Open(session.clone()));
                    true
                }
                _ => false,
            }
        };

        if !installed {
            tracing::debug!(%tenant, generation, "stale open ignored");
            if let Err(e) = session.close().await {
                tracing::warn!(%tenant, "closing stale session failed: {e}");
            }
            return;
        }

        tracing::info!(
            %tenant,
            identity = session.identity().as_deref().unwrap_or("?"),
            "session open"
        );

        match self.store.mirror_to_db(tenant).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(%tenant, "open session has no credentials on disk"),
            Err(e) => tracing::warn!(%tenant, "mirroring credentials to database failed: {e}"),
        }

        self.handler.activate(tenant, session).await;
    }

    // ---

    async fn handle_close(&self, tenant: &TenantKey, generation: u64, code: DisconnectCode) {
        // ---
        {
            let mut attempts = self.attempts();
            match attempts.get_mut(tenant) {
                Some(current) if current.generation == generation => {
                    current.resolve(AttemptOutcome::Closed(code));
                    self.registry.remove_connection(tenant);
                    self.registry.unmark_connecting(tenant);
                }
                _ => {
                    tracing::debug!(%tenant, generation, %code, "stale close ignored");
                    return;
                }
            }
        }

        match code.classify() {
            DisconnectClass::Fatal => {
                tracing::warn!(%tenant, %code, "fatal disconnect, deleting credentials");
                self.registry.forget(tenant);
                self.attempts().remove(tenant);
                if let Err(e) = self.store.delete(tenant).await {
                    tracing::error!(%tenant, "deleting credentials failed: {e}");
                }
            }

            class => {
                tracing::info!(%tenant, %code, ?class, "session closed, reconnecting");
                match self.registry.schedule_reconnect(tenant, self.retry_fn(tenant)) {
                    ScheduleOutcome::Scheduled { attempt, delay } => {
                        let delay_ms = delay.as_millis() as u64;
                        tracing::debug!(%tenant, attempt, delay_ms, "retry armed");
                    }
                    ScheduleOutcome::GaveUp { attempts } => {
                        let err = FleetError::MaxAttemptsExceeded {
                            tenant: tenant.clone(),
                            attempts,
                        };
                        tracing::error!(%tenant, "{err}");
                    }
                }
            }
        }
    }

    // ---

    async fn handle_credentials(&self, tenant: &TenantKey, generation: u64, creds: Credentials) {
        // ---
        if !self.is_current(tenant, generation) {
            tracing::debug!(%tenant, generation, "stale credential update ignored");
            return;
        }
        match self.store.write_local(tenant, &creds).await {
            Ok(()) => tracing::debug!(%tenant, "credentials rotated"),
            Err(e) => tracing::error!(%tenant, "persisting rotated credentials failed: {e}"),
        }
    }

    // --- retries -----------------------------------------------------------

    fn retry_fn(&self, tenant: &TenantKey) -> RetryFn {
        // ---
        let driver = self.me.clone();
        let tenant = tenant.clone();
        Arc::new(move || -> RetryFuture {
            let driver = driver.clone();
            let tenant = tenant.clone();
            Box::pin(async move {
                match driver.upgrade() {
                    Some(driver) => driver.retry(&tenant).await,
                    None => Ok(()),
                }
            })
        })
    }

    // ---

    /// Start the next attempt for a scheduled retry. Its outcome comes back
    /// through the observer, which schedules again on a further close.
    async fn retry(&self, tenant: &TenantKey) -> Result<()> {
        // ---
        match self.begin(tenant, true).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_terminal() => {
                tracing::warn!(%tenant, "retry abandoned: {e}");
                self.registry.forget(tenant);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // --- control plane -----------------------------------------------------

    /// Close the session and drop all state, keeping credentials.
    pub async fn disconnect(&self, tenant: &TenantKey) {
        // ---
        // Dropping the entry retires its generation along with it.
        let abandoned = {
            let mut attempts = self.attempts();
            let session = attempts.remove(tenant).and_then(|mut current| {
                let session = current.pending_session.take();
                current.resolve(AttemptOutcome::Failed(format!(
                    "tenant {tenant} disconnected"
                )));
                session
            });
            self.registry.forget(tenant);
            session
        };

        if let Some(session) = abandoned {
            if let Err(e) = session.close().await {
                tracing::warn!(%tenant, "closing in-flight session failed: {e}");
            }
        }
        tracing::info!(%tenant, "disconnected");
    }

    // ---

    /// Disconnect and delete credentials from both stores.
    pub async fn delete(&self, tenant: &TenantKey) -> Result<()> {
        self.disconnect(tenant).await;
        self.store.delete(tenant).await?;
        Ok(())
    }

    // ---

    pub async fn block(&self, tenant: &TenantKey) -> Result<()> {
        self.block_list.block(tenant).await?;
        self.delete(tenant).await
    }

    pub async fn unblock(&self, tenant: &TenantKey) -> Result<()> {
        self.block_list.unblock(tenant).await
    }

    pub async fn blocked(&self) -> Result<Vec<BlockEntry>> {
        self.block_list.list().await
    }

    // ---

    pub fn status(&self, tenant: &TenantKey) -> SessionStatus {
        self.registry.get_status(tenant)
    }
}

// ---------------------------------------------------------------------------
// DriverObserver
// ---------------------------------------------------------------------------

/// Observer slots for one attempt. Bound to a generation at construction.
struct DriverObserver {
    // ---
    driver: Weak<SessionDriver>,
    tenant: TenantKey,
    generation: u64,
}

// ---

#[async_trait]
impl SessionObserver for DriverObserver {
    // ---
    async fn on_connecting(&self) {
        tracing::debug!(tenant = %self.tenant, generation = self.generation, "connecting");
    }

    async fn on_open(&self, session: ProtocolSessionPtr) {
        if let Some(driver) = self.driver.upgrade() {
            driver.handle_open(&self.tenant, self.generation, session).await;
        }
    }

    async fn on_close(&self, code: DisconnectCode) {
        if let Some(driver) = self.driver.upgrade() {
            driver.handle_close(&self.tenant, self.generation, code).await;
        }
    }

    async fn on_credentials_update(&self, creds: Credentials) {
        if let Some(driver) = self.driver.upgrade() {
            driver.handle_credentials(&self.tenant, self.generation, creds).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
