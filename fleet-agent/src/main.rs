//! Fleet agent daemon.
//!
//! Keeps many paired messaging sessions alive in one process: restores
//! them at startup, reconnects them after transient failures, and drops
//! them for good when their credentials are revoked.
//!
//! Usage:
//!   fleet-agent --sessions-dir /var/lib/fleet/sessions --db-path /var/lib/fleet/fleet.db
//!
//! Operator commands are read from stdin (`help` lists them).

use std::sync::Arc;
use std::time::Duration;

// ---

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---

use fleet_domain::{BlockList, ProtocolClient};
use fleet_link_sim::{SimClient, SimConfig};
use fleet_store::{CredentialStore, Database};

// ---

mod agent;
mod config;
mod connection_manager;
mod console;
mod handler;
mod pairing;
mod restore;
mod session_driver;

#[cfg(test)]
mod test_support;

// ---

use config::Config;
use handler::LogHandler;

// Gateway re-exports: siblings import via super::Symbol
pub use agent::{Agent, AgentCmd};
pub use connection_manager::{ConnectionManager, RetryFn, RetryFuture, ScheduleOutcome};
pub use pairing::{PairingConfig, PairingFlow};
pub use restore::{RestoreConfig, Restorer};
pub use session_driver::SessionDriver;

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---

    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "fleet-agent starting");

    // Ensure the sessions directory exists.
    std::fs::create_dir_all(&cfg.sessions_dir)?;
    info!(sessions_dir = %cfg.sessions_dir.display(), "sessions directory ready");

    let db = Database::open(&cfg.db_path)?;
    info!(db_path = %cfg.db_path.display(), "database open");

    let store = Arc::new(CredentialStore::new(&cfg.sessions_dir, db.clone()));
    let block_list: Arc<dyn BlockList> = Arc::new(db);
    let registry = Arc::new(ConnectionManager::new(cfg.reconnect_policy()));

    // The protocol engine is external; the in-process simulator stands in
    // for it so the daemon runs end to end.
    let client: Arc<dyn ProtocolClient> = Arc::new(SimClient::new(SimConfig {
        link_delay: Duration::from_secs(cfg.sim_link_delay_secs),
        ..SimConfig::healthy()
    }));

    let driver = SessionDriver::new(
        registry.clone(),
        store.clone(),
        block_list.clone(),
        client.clone(),
        Arc::new(LogHandler),
    );
    let pairing = Arc::new(PairingFlow::new(
        driver.clone(),
        store.clone(),
        block_list.clone(),
        client,
        cfg.pairing_config(),
    ));

    // Restoration runs independently of the control surface.
    if cfg.no_restore {
        info!("restoration disabled");
    } else {
        let restorer = Restorer::new(driver.clone(), store, block_list, cfg.restore_config());
        tokio::spawn(async move {
            let report = restorer.run().await;
            info!(
                attempted = report.attempted.len(),
                restored = report.restored,
                failed = report.failed,
                "startup restoration done"
            );
        });
    }

    // Agent dispatches console commands to the driver and pairing flow.
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let agent = Agent::new(
        cmd_rx,
        driver.clone(),
        pairing,
        Duration::from_secs(cfg.pairing_code_timeout_secs),
    );
    tokio::spawn(agent.run());
    tokio::spawn(console::run(cmd_tx));

    tokio::signal::ctrl_c().await?;

    let live = registry.tenants();
    info!(tenants = live.len(), "shutting down");
    for tenant in &live {
        driver.disconnect(tenant).await;
    }

    Ok(())
}
