use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

// ---

use async_trait::async_trait;
use tokio::time::Instant;

// ---

use fleet_domain::{
    // ---
    Credentials,
    FleetError,
    ProtocolClient,
    ProtocolSessionPtr,
    Result,
    SessionObserver,
    TenantKey,
};

// ---

use super::{SimConfig, SimSession, SimStep};

// ---------------------------------------------------------------------------
// OpenRecord
// ---------------------------------------------------------------------------

/// One call to [`SimClient::open`], in call order.
#[derive(Debug, Clone)]
pub struct OpenRecord {
    // ---
    pub tenant: TenantKey,
    pub with_creds: bool,
    pub at: Instant,
}

// ---------------------------------------------------------------------------
// SimClient
// ---------------------------------------------------------------------------

/// In-process protocol client. Does not touch the network.
///
/// Per-tenant behaviour is scripted with [`SimClient::script`]; tenants
/// without a script (or whose script ran out) follow
/// [`SimConfig::default_step`].
#[derive(Default)]
pub struct SimClient {
    // ---
    config: SimConfig,
    scripts: Mutex<HashMap<TenantKey, VecDeque<SimStep>>>,
    opens: Mutex<Vec<OpenRecord>>,
    sessions: Mutex<HashMap<TenantKey, Arc<SimSession>>>,
}

// ---

impl SimClient {
    // ---
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    // ---

    /// Queue the behaviour of the next `open()` calls for `tenant`.
    pub fn script(&self, tenant: &TenantKey, steps: impl IntoIterator<Item = SimStep>) {
        // ---
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts.entry(tenant.clone()).or_default().extend(steps);
    }

    // ---

    /// Every `open()` call so far.
    pub fn opens(&self) -> Vec<OpenRecord> {
        self.opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn open_order(&self) -> Vec<TenantKey> {
        self.opens().into_iter().map(|r| r.tenant).collect()
    }

    pub fn open_count(&self, tenant: &TenantKey) -> usize {
        self.opens().iter().filter(|r| &r.tenant == tenant).count()
    }

    // ---

    /// Most recent session built for `tenant`.
    pub fn latest(&self, tenant: &TenantKey) -> Option<Arc<SimSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }

    // ---

    fn next_step(&self, tenant: &TenantKey) -> SimStep {
        // ---
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts
            .get_mut(tenant)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.config.default_step)
    }
}

// ---

#[async_trait]
impl ProtocolClient for SimClient {
    // ---
    async fn open(
        &self,
        tenant: &TenantKey,
        creds: Option<Credentials>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<ProtocolSessionPtr> {
        // ---
        self.opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(OpenRecord {
                tenant: tenant.clone(),
                with_creds: creds.is_some(),
                at: Instant::now(),
            });

        let step = self.next_step(tenant);
        if step == SimStep::FailSetup {
            return Err(FleetError::Protocol(format!(
                "simulated socket failure for {tenant}"
            )));
        }

        let session = SimSession::start(
            tenant.clone(),
            creds.is_some(),
            observer,
            step,
            self.config.clone(),
        );
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant.clone(), session.clone());

        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use tokio::sync::mpsc;

    use fleet_domain::{DisconnectCode, ProtocolSession};

    use super::*;

    // ---

    #[derive(Debug)]
    enum Seen {
        Connecting,
        Creds,
        Open,
        Close(DisconnectCode),
    }

    struct Recorder(mpsc::UnboundedSender<Seen>);

    #[async_trait]
    impl SessionObserver for Recorder {
        async fn on_connecting(&self) {
            let _ = self.0.send(Seen::Connecting);
        }
        async fn on_open(&self, _session: ProtocolSessionPtr) {
            let _ = self.0.send(Seen::Open);
        }
        async fn on_close(&self, code: DisconnectCode) {
            let _ = self.0.send(Seen::Close(code));
        }
        async fn on_credentials_update(&self, _creds: Credentials) {
            let _ = self.0.send(Seen::Creds);
        }
    }

    fn tenant(n: &str) -> TenantKey {
        TenantKey::parse(n).unwrap()
    }

    fn creds() -> Credentials {
        Credentials::new(serde_json::json!({ "me": { "id": "x" } })).unwrap()
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn registered_session_opens() {
        let client = SimClient::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let s = client
            .open(&tenant("111"), Some(creds()), Arc::new(Recorder(tx)))
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(Seen::Connecting)));
        assert!(matches!(rx.recv().await, Some(Seen::Open)));
        assert_eq!(s.identity().as_deref(), Some("111@s.sim"));
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_session_waits_for_code_then_flushes_creds() {
        let client = SimClient::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let s = client
            .open(&tenant("111"), None, Arc::new(Recorder(tx)))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Seen::Connecting)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "must not open before a code is requested");

        assert_eq!(s.request_pairing_code().await.unwrap(), "12345678");
        assert!(matches!(rx.recv().await, Some(Seen::Creds)));
        assert!(matches!(rx.recv().await, Some(Seen::Open)));
        assert!(s.is_registered());
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_close_then_default() {
        let client = SimClient::default();
        let t = tenant("111");
        client.script(&t, [SimStep::Close(DisconnectCode::CONNECTION_LOST)]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.open(&t, Some(creds()), Arc::new(Recorder(tx))).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Seen::Connecting)));
        assert!(matches!(
            rx.recv().await,
            Some(Seen::Close(DisconnectCode::CONNECTION_LOST))
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.open(&t, Some(creds()), Arc::new(Recorder(tx))).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Seen::Connecting)));
        assert!(matches!(rx.recv().await, Some(Seen::Open)));

        assert_eq!(client.open_count(&t), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_fires_exactly_once() {
        let client = SimClient::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = tenant("111");

        let s = client.open(&t, Some(creds()), Arc::new(Recorder(tx))).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Seen::Connecting)));
        assert!(matches!(rx.recv().await, Some(Seen::Open)));

        s.close().await.unwrap();
        s.end().await.unwrap();
        client.latest(&t).unwrap().drop_link(DisconnectCode(999)).await;

        assert!(matches!(
            rx.recv().await,
            Some(Seen::Close(DisconnectCode::CONNECTION_CLOSED))
        ));
        assert!(rx.try_recv().is_err());
        assert!(s.identity().is_none());
    }

    #[tokio::test]
    async fn fail_setup_is_an_error() {
        let client = SimClient::default();
        let t = tenant("111");
        client.script(&t, [SimStep::FailSetup]);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(client.open(&t, Some(creds()), Arc::new(Recorder(tx))).await.is_err());
        assert_eq!(client.open_count(&t), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_code_leaves_session_up_until_closed() {
        let client = SimClient::default();
        let t = tenant("111");
        client.script(&t, [SimStep::RefuseCode]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let s = client.open(&t, None, Arc::new(Recorder(tx))).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Seen::Connecting)));
        assert!(s.request_pairing_code().await.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        s.close().await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(Seen::Close(DisconnectCode::CONNECTION_CLOSED))
        ));
    }
}
