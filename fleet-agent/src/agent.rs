//! [`Agent`] — processes control-plane commands and delegates to the
//! [`SessionDriver`] and [`PairingFlow`].
//!
//! `Agent` owns no session state. Each command runs in its own task so a
//! slow connect or pairing never holds up the commands behind it; the
//! driver already serializes what needs serializing.

use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::sync::{mpsc, oneshot};

// ---

use fleet_domain::{BlockEntry, Result, SessionStatus, TenantKey};

// ---

use super::{PairingFlow, SessionDriver};

// ---------------------------------------------------------------------------
// AgentCmd
// ---------------------------------------------------------------------------

/// Commands from the control surface to the agent loop. Every command
/// carries its own reply channel.
#[derive(Debug)]
pub enum AgentCmd {
    // ---
    /// Start pairing; replies with the first pairing code.
    Pair {
        tenant: TenantKey,
        reply: oneshot::Sender<Result<String>>,
    },

    Connect {
        tenant: TenantKey,
        reply: oneshot::Sender<Result<()>>,
    },

    /// Close the session, keep the credentials.
    Disconnect {
        tenant: TenantKey,
        reply: oneshot::Sender<Result<()>>,
    },

    /// Close the session and delete the credentials.
    Delete {
        tenant: TenantKey,
        reply: oneshot::Sender<Result<()>>,
    },

    Block {
        tenant: TenantKey,
        reply: oneshot::Sender<Result<()>>,
    },

    Unblock {
        tenant: TenantKey,
        reply: oneshot::Sender<Result<()>>,
    },

    /// One tenant, or every tracked tenant when `tenant` is `None`.
    Status {
        tenant: Option<TenantKey>,
        reply: oneshot::Sender<Vec<(TenantKey, SessionStatus)>>,
    },

    ListBlocked {
        reply: oneshot::Sender<Result<Vec<BlockEntry>>>,
    },
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    // ---
    cmd_rx: mpsc::Receiver<AgentCmd>,
    driver: Arc<SessionDriver>,
    pairing: Arc<PairingFlow>,
    code_timeout: Duration,
}

// ---

impl Agent {
    // ---
    pub fn new(
        cmd_rx: mpsc::Receiver<AgentCmd>,
        driver: Arc<SessionDriver>,
        pairing: Arc<PairingFlow>,
        code_timeout: Duration,
    ) -> Self {
        Self {
            cmd_rx,
            driver,
            pairing,
            code_timeout,
        }
    }

    // ---

    pub async fn run(mut self) {
        // ---
        while let Some(cmd) = self.cmd_rx.recv().await {
            let driver = self.driver.clone();
            let pairing = self.pairing.clone();
            let code_timeout = self.code_timeout;
            tokio::spawn(dispatch(cmd, driver, pairing, code_timeout));
        }

        tracing::info!("agent loop exiting");
    }
}

// ---

async fn dispatch(
    cmd: AgentCmd,
    driver: Arc<SessionDriver>,
    pairing: Arc<PairingFlow>,
    code_timeout: Duration,
) {
    // ---
    match cmd {
        AgentCmd::Pair { tenant, reply } => {
            tracing::info!(%tenant, "pair → pairing flow");
            let _ = reply.send(pairing.request_code(tenant, code_timeout).await);
        }

        AgentCmd::Connect { tenant, reply } => {
            tracing::info!(%tenant, "connect → session driver");
            let _ = reply.send(driver.connect(&tenant).await.map(|_| ()));
        }

        AgentCmd::Disconnect { tenant, reply } => {
            tracing::info!(%tenant, "disconnect → session driver");
            driver.disconnect(&tenant).await;
            let _ = reply.send(Ok(()));
        }

        AgentCmd::Delete { tenant, reply } => {
            tracing::info!(%tenant, "delete → session driver");
            let _ = reply.send(driver.delete(&tenant).await);
        }

        AgentCmd::Block { tenant, reply } => {
            tracing::info!(%tenant, "block → session driver");
            let _ = reply.send(driver.block(&tenant).await);
        }

        AgentCmd::Unblock { tenant, reply } => {
            tracing::info!(%tenant, "unblock → session driver");
            let _ = reply.send(driver.unblock(&tenant).await);
        }

        AgentCmd::Status { tenant, reply } => {
            let statuses = match tenant {
                Some(tenant) => {
                    let status = driver.status(&tenant);
                    vec![(tenant, status)]
                }
                None => driver.registry().snapshot(),
            };
            let _ = reply.send(statuses);
        }

        AgentCmd::ListBlocked { reply } => {
            let _ = reply.send(driver.blocked().await);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use fleet_domain::FleetError;

    use super::*;
    use crate::test_support::{tenant, Harness};
    use crate::PairingConfig;

    fn spawn_agent(h: &Harness) -> mpsc::Sender<AgentCmd> {
        // ---
        let pairing = Arc::new(PairingFlow::new(
            h.driver.clone(),
            h.store.clone(),
            h.block_list.clone(),
            h.client.clone(),
            PairingConfig::default(),
        ));
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(Agent::new(rx, h.driver.clone(), pairing, Duration::from_secs(30)).run());
        tx
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn connect_then_status() {
        let h = Harness::new();
        let t = tenant("111");
        h.seed(&t).await;
        let tx = spawn_agent(&h);

        let (reply, rx) = oneshot::channel();
        tx.send(AgentCmd::Connect { tenant: t.clone(), reply }).await.unwrap();
        rx.await.unwrap().unwrap();

        let (reply, rx) = oneshot::channel();
        tx.send(AgentCmd::Status { tenant: None, reply }).await.unwrap();
        let statuses = rx.await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, t);
        assert!(statuses[0].1.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn block_is_listed_and_refuses_connect() {
        let h = Harness::new();
        let t = tenant("111");
        h.seed(&t).await;
        let tx = spawn_agent(&h);

        let (reply, rx) = oneshot::channel();
        tx.send(AgentCmd::Block { tenant: t.clone(), reply }).await.unwrap();
        rx.await.unwrap().unwrap();

        let (reply, rx) = oneshot::channel();
        tx.send(AgentCmd::ListBlocked { reply }).await.unwrap();
        let blocked = rx.await.unwrap().unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].tenant, t);

        let (reply, rx) = oneshot::channel();
        tx.send(AgentCmd::Connect { tenant: t.clone(), reply }).await.unwrap();
        assert!(matches!(rx.await.unwrap(), Err(FleetError::Blocked(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn pair_replies_with_code() {
        let h = Harness::new();
        let tx = spawn_agent(&h);

        let (reply, rx) = oneshot::channel();
        tx.send(AgentCmd::Pair {
            tenant: tenant("111"),
            reply,
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), "1234-5678");
    }
}
