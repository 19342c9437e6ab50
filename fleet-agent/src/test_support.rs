//! Shared fixtures for the agent's unit tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

// ---

use async_trait::async_trait;
use tempfile::TempDir;

// ---

use fleet_domain::{
    // ---
    BlockList,
    Credentials,
    MessageHandler,
    ProtocolClient,
    ProtocolSessionPtr,
    ReconnectPolicy,
    SessionObserver,
    TenantKey,
};
use fleet_link_sim::{SimClient, SimConfig};
use fleet_store::{CredentialStore, Database};

// ---

use super::{ConnectionManager, SessionDriver};

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

pub fn tenant(n: &str) -> TenantKey {
    TenantKey::parse(n).unwrap()
}

pub fn creds(id: &str) -> Credentials {
    Credentials::new(serde_json::json!({ "me": { "id": id } })).unwrap()
}

pub fn policy() -> ReconnectPolicy {
    ReconnectPolicy {
        jitter_max: Duration::ZERO,
        ..Default::default()
    }
}

// ---

struct Quiet;

#[async_trait]
impl SessionObserver for Quiet {}

/// An authenticated sim session nobody is listening to.
pub async fn open_session(t: &TenantKey) -> ProtocolSessionPtr {
    // ---
    let client = SimClient::default();
    let session = client
        .open(t, Some(creds("x")), Arc::new(Quiet))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.identity().is_some());
    session
}

// ---------------------------------------------------------------------------
// RecordingHandler
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingHandler {
    activations: Mutex<Vec<TenantKey>>,
}

impl RecordingHandler {
    // ---
    pub fn activations(&self) -> Vec<TenantKey> {
        self.activations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, t: &TenantKey) -> usize {
        self.activations().iter().filter(|a| *a == t).count()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn activate(&self, tenant: &TenantKey, _session: ProtocolSessionPtr) {
        self.activations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tenant.clone());
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Everything a driver needs, wired to a temp directory, an in-memory
/// database and a [`SimClient`].
pub struct Harness {
    // ---
    _dir: TempDir,
    pub db: Database,
    pub store: Arc<CredentialStore>,
    pub block_list: Arc<dyn BlockList>,
    pub registry: Arc<ConnectionManager>,
    pub client: Arc<SimClient>,
    pub handler: Arc<RecordingHandler>,
    pub driver: Arc<SessionDriver>,
}

impl Harness {
    // ---
    pub fn new() -> Self {
        Self::with_config(SimConfig::healthy())
    }

    pub fn with_config(config: SimConfig) -> Self {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path(), db.clone()));
        let block_list: Arc<dyn BlockList> = Arc::new(db.clone());
        let registry = Arc::new(ConnectionManager::new(policy()));
        let client = Arc::new(SimClient::new(config));
        let handler = Arc::new(RecordingHandler::default());

        let driver = SessionDriver::new(
            registry.clone(),
            store.clone(),
            block_list.clone(),
            client.clone(),
            handler.clone(),
        );

        Self {
            _dir: dir,
            db,
            store,
            block_list,
            registry,
            client,
            handler,
            driver,
        }
    }

    /// Give `t` credentials in both locations.
    pub async fn seed(&self, t: &TenantKey) {
        self.store.write(t, &creds(t.as_str())).await.unwrap();
    }
}
