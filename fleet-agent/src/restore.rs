//! [`Restorer`] — brings previously paired tenants back at startup.
//!
//! Candidates are every tenant with credentials in the database or on
//! disk. Tenants that are blocked, or that are already live, are left
//! alone. The rest are restored strictly one at a time in small batches,
//! with a pause after each tenant and a longer one between batches, so a
//! large fleet does not hit the remote service all at once.
//!
//! Failures are per tenant: they are logged, counted in the
//! [`RestoreReport`], and the run moves on.

use std::sync::Arc;
use std::time::Duration;

// ---

use fleet_domain::{BlockList, TenantKey};
use fleet_store::{CredentialStore, Reconciled};

// ---

use super::{ConnectionManager, SessionDriver};

// ---------------------------------------------------------------------------
// RestoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    // ---
    pub batch_size: usize,
    pub tenant_delay: Duration,
    pub batch_delay: Duration,

    /// Upper bound on waiting for one tenant's attempt to resolve.
    pub attempt_timeout: Duration,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            tenant_delay: Duration::from_secs(5),
            batch_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// RestoreReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    // ---
    pub candidates: usize,
    pub restored: usize,
    pub failed: usize,
    pub skipped_blocked: usize,
    pub skipped_active: usize,
    pub skipped_no_creds: usize,

    /// Tenants handed to the driver, in order.
    pub attempted: Vec<TenantKey>,
}

// ---------------------------------------------------------------------------
// Restorer
// ---------------------------------------------------------------------------

pub struct Restorer {
    // ---
    driver: Arc<SessionDriver>,
    registry: Arc<ConnectionManager>,
    store: Arc<CredentialStore>,
    block_list: Arc<dyn BlockList>,
    config: RestoreConfig,
}

// ---

impl Restorer {
    // ---
    pub fn new(
        driver: Arc<SessionDriver>,
        store: Arc<CredentialStore>,
        block_list: Arc<dyn BlockList>,
        config: RestoreConfig,
    ) -> Self {
        // ---
        Self {
            registry: driver.registry().clone(),
            driver,
            store,
            block_list,
            config,
        }
    }

    // ---

    pub async fn run(&self) -> RestoreReport {
        // ---
        let mut report = RestoreReport::default();

        let candidates = match self.store.known_tenants().await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!("listing persisted tenants failed, nothing restored: {e}");
                return report;
            }
        };
        report.candidates = candidates.len();

        let mut queue = Vec::with_capacity(candidates.len());
        for tenant in candidates {
            if self.registry.is_connected(&tenant) || self.registry.is_connecting(&tenant) {
                tracing::debug!(%tenant, "already active, not restoring");
                report.skipped_active += 1;
                continue;
            }
            match self.block_list.is_blocked(&tenant).await {
                Ok(false) => queue.push(tenant),
                Ok(true) => {
                    tracing::info!(%tenant, "blocked, not restoring");
                    report.skipped_blocked += 1;
                }
                Err(e) => {
                    tracing::warn!(%tenant, "block list lookup failed: {e}");
                    report.failed += 1;
                }
            }
        }

        let batches: Vec<&[TenantKey]> = queue.chunks(self.config.batch_size.max(1)).collect();
        let total = batches.len();
        tracing::info!(
            candidates = report.candidates,
            queued = queue.len(),
            batches = total,
            "restoration starting"
        );

        for (index, batch) in batches.into_iter().enumerate() {
            tracing::info!(batch = index + 1, of = total, size = batch.len(), "restoring batch");
            for tenant in batch {
                self.restore_one(tenant, &mut report).await;
            }
            if index + 1 < total {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        tracing::info!(
            restored = report.restored,
            failed = report.failed,
            skipped_blocked = report.skipped_blocked,
            skipped_active = report.skipped_active,
            skipped_no_creds = report.skipped_no_creds,
            "restoration finished"
        );
        report
    }

    // ---

    async fn restore_one(&self, tenant: &TenantKey, report: &mut RestoreReport) {
        // ---
        match self.store.reconcile(tenant).await {
            Ok(Reconciled::Missing) => {
                tracing::info!(%tenant, "no credentials left, skipping");
                report.skipped_no_creds += 1;
                return;
            }
            Ok(source) => tracing::debug!(%tenant, ?source, "credentials reconciled"),
            Err(e) => {
                tracing::warn!(%tenant, "reconciling credentials failed: {e}");
                report.failed += 1;
                return;
            }
        }

        report.attempted.push(tenant.clone());
        match tokio::time::timeout(self.config.attempt_timeout, self.driver.connect(tenant)).await {
            Ok(Ok(_)) => {
                tracing::info!(%tenant, "restored");
                report.restored += 1;
            }
            Ok(Err(e)) => {
                tracing::warn!(%tenant, "restore attempt failed: {e}");
                report.failed += 1;
            }
            Err(_) => {
                tracing::warn!(%tenant, "restore attempt still unresolved, moving on");
                report.failed += 1;
            }
        }

        tokio::time::sleep(self.config.tenant_delay).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
