//! CLI configuration for `fleet-agent`.
//!
//! Every flag also reads a `FLEET_*` environment variable:
//!   fleet-agent [--sessions-dir ./sessions] [--db-path ./fleet.db] [--no-restore]

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

// ---

use fleet_domain::{ReconnectPolicy, DEFAULT_JITTER_MAX};

// ---

use super::{PairingConfig, RestoreConfig};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "fleet-agent", about = "Multi-tenant messaging session daemon")]
pub struct Config {
    // ---
    /// Root of the per-tenant credential directories
    /// (`<sessions-dir>/<tenant>/creds.json`).
    ///
    /// Created automatically if it does not exist.
    #[arg(long, env = "FLEET_SESSIONS_DIR", default_value = "./sessions")]
    pub sessions_dir: PathBuf,

    /// SQLite database holding the credential mirror and the block list.
    #[arg(long, env = "FLEET_DB_PATH", default_value = "./fleet.db")]
    pub db_path: PathBuf,

    /// Tenants restored per batch at startup.
    #[arg(long, env = "FLEET_RESTORE_BATCH_SIZE", default_value_t = 2)]
    pub restore_batch_size: usize,

    /// Pause after each restored tenant.
    #[arg(long, env = "FLEET_RESTORE_TENANT_DELAY_SECS", default_value_t = 5)]
    pub restore_tenant_delay_secs: u64,

    /// Pause between restoration batches.
    #[arg(long, env = "FLEET_RESTORE_BATCH_DELAY_SECS", default_value_t = 10)]
    pub restore_batch_delay_secs: u64,

    /// First reconnect delay; doubles per attempt.
    #[arg(long, env = "FLEET_RECONNECT_BASE_SECS", default_value_t = 10)]
    pub reconnect_base_secs: u64,

    /// Ceiling on a single reconnect delay.
    #[arg(long, env = "FLEET_RECONNECT_CAP_SECS", default_value_t = 120)]
    pub reconnect_cap_secs: u64,

    /// Reconnect attempts before a tenant is given up on.
    #[arg(long, env = "FLEET_RECONNECT_MAX_ATTEMPTS", default_value_t = 5)]
    pub reconnect_max_attempts: u32,

    /// Wait between a finished pairing handshake and the real connect.
    #[arg(long, env = "FLEET_PAIRING_COOLDOWN_SECS", default_value_t = 3)]
    pub pairing_cooldown_secs: u64,

    /// How long `pair` waits for a pairing code.
    #[arg(long, env = "FLEET_PAIRING_CODE_TIMEOUT_SECS", default_value_t = 180)]
    pub pairing_code_timeout_secs: u64,

    /// Simulated time for a user to enter a pairing code on the phone.
    #[arg(long, env = "FLEET_SIM_LINK_DELAY_SECS", default_value_t = 10)]
    pub sim_link_delay_secs: u64,

    /// Skip restoring persisted tenants at startup.
    #[arg(long, env = "FLEET_NO_RESTORE")]
    pub no_restore: bool,
}

// ---

impl Config {
    // ---
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_secs(self.reconnect_base_secs),
            cap_delay: Duration::from_secs(self.reconnect_cap_secs),
            max_attempts: self.reconnect_max_attempts,
            jitter_max: DEFAULT_JITTER_MAX,
        }
    }

    pub fn restore_config(&self) -> RestoreConfig {
        RestoreConfig {
            batch_size: self.restore_batch_size,
            tenant_delay: Duration::from_secs(self.restore_tenant_delay_secs),
            batch_delay: Duration::from_secs(self.restore_batch_delay_secs),
            ..Default::default()
        }
    }

    pub fn pairing_config(&self) -> PairingConfig {
        PairingConfig {
            cooldown: Duration::from_secs(self.pairing_cooldown_secs),
            code_timeout: Duration::from_secs(self.pairing_code_timeout_secs),
            max_restarts: self.reconnect_max_attempts,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults_match_the_documented_policy() {
        let cfg = Config::try_parse_from(["fleet-agent"]).unwrap();

        assert_eq!(cfg.reconnect_policy(), ReconnectPolicy::default());

        let restore = cfg.restore_config();
        assert_eq!(restore.batch_size, 2);
        assert_eq!(restore.tenant_delay, Duration::from_secs(5));
        assert_eq!(restore.batch_delay, Duration::from_secs(10));
        assert!(!cfg.no_restore);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::try_parse_from([
            "fleet-agent",
            "--sessions-dir",
            "/var/lib/fleet/sessions",
            "--restore-batch-size",
            "4",
            "--reconnect-max-attempts",
            "8",
            "--no-restore",
        ])
        .unwrap();

        assert_eq!(cfg.sessions_dir, PathBuf::from("/var/lib/fleet/sessions"));
        assert_eq!(cfg.restore_config().batch_size, 4);
        assert_eq!(cfg.reconnect_policy().max_attempts, 8);
        assert_eq!(cfg.pairing_config().max_restarts, 8);
        assert!(cfg.no_restore);
    }
}
