//! [`ConnectionManager`] — the in-memory session registry.
//!
//! One [`SessionRecord`] per tracked tenant, behind a single mutex that is
//! only ever held for the length of one call. No method awaits, so every
//! operation is atomic with respect to every other.
//!
//! # Record invariants
//!
//! ```text
//! handle.is_some()          => !connecting
//! scheduled_retry.is_some() => handle.is_none() && !connecting
//! ```
//!
//! `reconnect_attempts` goes back to zero when a session opens
//! ([`ConnectionManager::add_connection`]) and when the tenant is purged
//! ([`ConnectionManager::forget`], or giving up in
//! [`ConnectionManager::schedule_reconnect`]).
//!
//! # Retry timers
//!
//! A scheduled retry is a spawned task that sleeps, removes itself from the
//! record, then runs the caller's retry closure. If the closure fails the
//! task schedules the next attempt itself, so a chain of setup failures
//! still walks up the backoff curve and eventually gives up.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// ---

use tokio::task::JoinHandle;

// ---

use fleet_domain::{
    // ---
    ProtocolSessionPtr,
    ReconnectPolicy,
    Result,
    SessionStatus,
    TenantKey,
};

// ---------------------------------------------------------------------------
// RetryFn
// ---------------------------------------------------------------------------

pub type RetryFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Closure run when a scheduled retry fires. May run many times.
pub type RetryFn = Arc<dyn Fn() -> RetryFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// ScheduleOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    // ---
    /// A timer is armed for retry number `attempt`.
    Scheduled { attempt: u32, delay: Duration },

    /// The ceiling was reached. The tenant's record is gone.
    GaveUp { attempts: u32 },
}

// ---------------------------------------------------------------------------
// SessionRecord
// ---------------------------------------------------------------------------

struct ScheduledRetry {
    // ---
    id: u64,
    task: JoinHandle<()>,
}

// ---

#[derive(Default)]
struct SessionRecord {
    // ---
    handle: Option<ProtocolSessionPtr>,
    connecting: bool,
    reconnect_attempts: u32,
    scheduled_retry: Option<ScheduledRetry>,
}

// ---

impl SessionRecord {
    // ---
    fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.identity().is_some())
    }

    fn cancel_retry(&mut self) -> bool {
        // ---
        match self.scheduled_retry.take() {
            Some(retry) => {
                retry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Nothing worth keeping; the entry can leave the map.
    fn is_idle(&self) -> bool {
        self.handle.is_none()
            && !self.connecting
            && self.reconnect_attempts == 0
            && self.scheduled_retry.is_none()
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            connected: self.is_connected(),
            connecting: self.connecting,
            reconnect_attempts: self.reconnect_attempts,
            has_scheduled: self.scheduled_retry.is_some(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

pub struct ConnectionManager {
    // ---
    policy: ReconnectPolicy,
    records: Mutex<HashMap<TenantKey, SessionRecord>>,
    next_timer_id: AtomicU64,
}

// ---

impl ConnectionManager {
    // ---
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
            next_timer_id: AtomicU64::new(1),
        }
    }

    // ---

    fn records(&self) -> MutexGuard<'_, HashMap<TenantKey, SessionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- queries -----------------------------------------------------------

    /// Live handle present and the session reports an authenticated identity.
    pub fn is_connected(&self, tenant: &TenantKey) -> bool {
        self.records()
            .get(tenant)
            .is_some_and(SessionRecord::is_connected)
    }

    pub fn is_connecting(&self, tenant: &TenantKey) -> bool {
        self.records().get(tenant).is_some_and(|r| r.connecting)
    }

    pub fn get_connection(&self, tenant: &TenantKey) -> Option<ProtocolSessionPtr> {
        self.records().get(tenant).and_then(|r| r.handle.clone())
    }

    pub fn get_status(&self, tenant: &TenantKey) -> SessionStatus {
        self.records()
            .get(tenant)
            .map(SessionRecord::status)
            .unwrap_or_default()
    }

    /// Every tracked tenant, sorted.
    pub fn tenants(&self) -> Vec<TenantKey> {
        // ---
        let mut tenants: Vec<TenantKey> = self.records().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Status of every tracked tenant, sorted by tenant.
    pub fn snapshot(&self) -> Vec<(TenantKey, SessionStatus)> {
        // ---
        let mut all: Vec<(TenantKey, SessionStatus)> = self
            .records()
            .iter()
            .map(|(t, r)| (t.clone(), r.status()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    // --- connecting flag ---------------------------------------------------

    /// Flag an attempt as started. Cancels any pending retry timer.
    ///
    /// Refuses (returns `false`) while a handle is installed.
    pub fn mark_connecting(&self, tenant: &TenantKey) -> bool {
        // ---
        let mut records = self.records();
        let record = records.entry(tenant.clone()).or_default();
        if record.handle.is_some() {
            tracing::warn!(%tenant, "mark_connecting refused, live handle installed");
            return false;
        }
        record.cancel_retry();
        record.connecting = true;
        true
    }

    // ---

    pub fn unmark_connecting(&self, tenant: &TenantKey) {
        // ---
        let mut records = self.records();
        if let Some(record) = records.get_mut(tenant) {
            record.connecting = false;
            if record.is_idle() {
                records.remove(tenant);
            }
        }
    }

    // --- handles -----------------------------------------------------------

    /// Install an open session: clears `connecting`, resets attempts and
    /// cancels any pending retry in one step.
    pub fn add_connection(&self, tenant: &TenantKey, handle: ProtocolSessionPtr) {
        // ---
        let old = {
            let mut records = self.records();
            let record = records.entry(tenant.clone()).or_default();
            record.cancel_retry();
            record.connecting = false;
            record.reconnect_attempts = 0;
            record.handle.replace(handle)
        };

        if let Some(old) = old {
            tracing::warn!(%tenant, "replacing an installed session handle");
            close_in_background(tenant, old);
        }
    }

    // ---

    /// Take the handle out and close it in the background. Close failures
    /// are logged, never returned. Attempts are left alone.
    pub fn remove_connection(&self, tenant: &TenantKey) {
        // ---
        let handle = {
            let mut records = self.records();
            let Some(record) = records.get_mut(tenant) else {
                return;
            };
            let handle = record.handle.take();
            if record.is_idle() {
                records.remove(tenant);
            }
            handle
        };

        if let Some(handle) = handle {
            close_in_background(tenant, handle);
        }
    }

    // ---

    /// Purge the tenant: cancel its timer, close its handle, drop the
    /// record. Used on give-up, fatal disconnects, delete and block.
    pub fn forget(&self, tenant: &TenantKey) {
        // ---
        let record = self.records().remove(tenant);
        if let Some(mut record) = record {
            record.cancel_retry();
            if let Some(handle) = record.handle.take() {
                close_in_background(tenant, handle);
            }
            tracing::debug!(%tenant, "registry record purged");
        }
    }

    /// True while `tenant` is between a transient close and its next
    /// attempt. A fired timer checks this before reconnecting, since the
    /// tenant may have been disconnected once the timer left the record.
    pub fn awaiting_retry(&self, tenant: &TenantKey) -> bool {
        self.records()
            .get(tenant)
            .is_some_and(|r| r.reconnect_attempts > 0 && r.handle.is_none())
    }

    // --- retry timers ------------------------------------------------------

    /// Arm the next retry for `tenant`, or give up.
    ///
    /// At the ceiling the record is purged and no timer is armed. Below it,
    /// any earlier timer is cancelled, the attempt counter goes up, and a
    /// new timer is armed with the policy delay for that attempt.
    pub fn schedule_reconnect(
        self: &Arc<Self>,
        tenant: &TenantKey,
        retry: RetryFn,
    ) -> ScheduleOutcome {
        // ---
        let mut records = self.records();

        let attempts = records.get(tenant).map_or(0, |r| r.reconnect_attempts);
        if self.policy.exhausted(attempts) {
            if let Some(mut record) = records.remove(tenant) {
                record.cancel_retry();
                if let Some(handle) = record.handle.take() {
                    close_in_background(tenant, handle);
                }
            }
            drop(records);
            tracing::error!(
                %tenant,
                attempts,
                "reconnect ceiling reached, giving up until restarted manually"
            );
            return ScheduleOutcome::GaveUp { attempts };
        }

        let record = records.entry(tenant.clone()).or_default();
        record.cancel_retry();
        record.connecting = false;
        record.reconnect_attempts += 1;
        let attempt = record.reconnect_attempts;
        let delay = self.policy.delay(attempt);

        // Spawned under the lock so the timer can never fire and look for
        // its own entry before that entry exists.
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(Arc::clone(self).fire_retry(tenant.clone(), id, delay, retry));
        record.scheduled_retry = Some(ScheduledRetry { id, task });

        tracing::info!(
            %tenant,
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        ScheduleOutcome::Scheduled { attempt, delay }
    }

    // ---

    async fn fire_retry(
        self: Arc<Self>,
        tenant: TenantKey,
        id: u64,
        delay: Duration,
        retry: RetryFn,
    ) {
        // ---
        tokio::time::sleep(delay).await;

        // Detach from the record first; from here on the retry cannot be
        // cancelled, only superseded.
        {
            let mut records = self.records();
            if let Some(record) = records.get_mut(&tenant) {
                if record.scheduled_retry.as_ref().is_some_and(|r| r.id == id) {
                    record.scheduled_retry = None;
                }
            }
        }

        tracing::info!(%tenant, "reconnect timer fired");
        if let Err(e) = retry().await {
            tracing::warn!(%tenant, "reconnect attempt failed to start: {e}");
            self.schedule_reconnect(&tenant, retry);
        }
    }

    // ---

    /// Cancel a pending retry, if any. Idempotent.
    pub fn clear_scheduled_reconnect(&self, tenant: &TenantKey) {
        // ---
        let mut records = self.records();
        if let Some(record) = records.get_mut(tenant) {
            if record.cancel_retry() {
                tracing::debug!(%tenant, "scheduled reconnect cancelled");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn close_in_background(tenant: &TenantKey, handle: ProtocolSessionPtr) {
    // ---
    let tenant = tenant.clone();
    tokio::spawn(async move {
        if let Err(e) = handle.close().await {
            tracing::warn!(%tenant, "closing session handle failed: {e}");
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::AtomicUsize;

    use fleet_domain::FleetError;

    use super::*;
    use crate::test_support::{open_session, tenant};

    fn manager() -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(ReconnectPolicy {
            jitter_max: Duration::ZERO,
            ..Default::default()
        }))
    }

    /// Retry closure that counts calls and returns `result`.
    fn counting_retry(calls: Arc<AtomicUsize>, fail: bool) -> RetryFn {
        Arc::new(move || -> RetryFuture {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(FleetError::Protocol("socket refused".into()))
                } else {
                    Ok(())
                }
            })
        })
    }

    // ---

    #[tokio::test(start_paused = true)]
    async fn connecting_and_connected_are_exclusive() {
        let mgr = manager();
        let t = tenant("111");

        assert!(mgr.mark_connecting(&t));
        assert!(mgr.is_connecting(&t));
        assert!(!mgr.is_connected(&t));

        mgr.add_connection(&t, open_session(&t).await);
        assert!(mgr.is_connected(&t));
        assert!(!mgr.is_connecting(&t));

        // A live handle refuses a second attempt.
        assert!(!mgr.mark_connecting(&t));
        assert!(!(mgr.is_connected(&t) && mgr.is_connecting(&t)));
    }

    #[tokio::test(start_paused = true)]
    async fn add_connection_resets_attempts_and_cancels_timer() {
        let mgr = manager();
        let t = tenant("111");
        let calls = Arc::new(AtomicUsize::new(0));

        mgr.schedule_reconnect(&t, counting_retry(calls.clone(), false));
        mgr.schedule_reconnect(&t, counting_retry(calls.clone(), false));
        assert_eq!(mgr.get_status(&t).reconnect_attempts, 2);
        assert!(mgr.get_status(&t).has_scheduled);

        mgr.add_connection(&t, open_session(&t).await);
        let status = mgr.get_status(&t);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.has_scheduled);
        assert!(status.connected);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "cancelled timer must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn second_schedule_replaces_first_timer() {
        let mgr = manager();
        let t = tenant("111");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        mgr.schedule_reconnect(&t, counting_retry(first.clone(), false));
        let outcome = mgr.schedule_reconnect(&t, counting_retry(second.clone(), false));
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                attempt: 2,
                delay: Duration::from_secs(20)
            }
        );

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(!mgr.get_status(&t).has_scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_waits_for_policy_delay() {
        let mgr = manager();
        let t = tenant("111");
        let calls = Arc::new(AtomicUsize::new(0));

        mgr.schedule_reconnect(&t, counting_retry(calls.clone(), false));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_retry_walks_backoff_then_gives_up() {
        let mgr = manager();
        let t = tenant("111");
        let calls = Arc::new(AtomicUsize::new(0));

        mgr.schedule_reconnect(&t, counting_retry(calls.clone(), true));

        // 10 + 20 + 40 + 80 + 120 seconds of backoff, then the ceiling.
        tokio::time::sleep(Duration::from_secs(10 + 20 + 40 + 80 + 120 + 5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(mgr.get_status(&t), SessionStatus::default());
        assert!(mgr.tenants().is_empty());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_at_ceiling_purges_the_tenant() {
        let mgr = manager();
        let t = tenant("111");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            mgr.schedule_reconnect(&t, counting_retry(calls.clone(), false));
        }
        assert_eq!(mgr.get_status(&t).reconnect_attempts, 5);

        let outcome = mgr.schedule_reconnect(&t, counting_retry(calls.clone(), false));
        assert_eq!(outcome, ScheduleOutcome::GaveUp { attempts: 5 });

        let status = mgr.get_status(&t);
        assert!(!status.connected);
        assert!(!status.connecting);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.has_scheduled);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_scheduled_is_idempotent() {
        let mgr = manager();
        let t = tenant("111");
        let calls = Arc::new(AtomicUsize::new(0));

        mgr.clear_scheduled_reconnect(&t);
        mgr.schedule_reconnect(&t, counting_retry(calls.clone(), false));
        mgr.clear_scheduled_reconnect(&t);
        mgr.clear_scheduled_reconnect(&t);

        let status = mgr.get_status(&t);
        assert!(!status.has_scheduled);
        assert_eq!(status.reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_connecting_cancels_pending_retry() {
        let mgr = manager();
        let t = tenant("111");
        let calls = Arc::new(AtomicUsize::new(0));

        mgr.schedule_reconnect(&t, counting_retry(calls.clone(), false));
        assert!(mgr.mark_connecting(&t));

        let status = mgr.get_status(&t);
        assert!(status.connecting);
        assert!(!status.has_scheduled);
        assert_eq!(status.reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_connection_closes_handle() {
        let mgr = manager();
        let t = tenant("111");

        let session = open_session(&t).await;
        mgr.add_connection(&t, session.clone());
        mgr.remove_connection(&t);
        assert!(mgr.get_connection(&t).is_none());
        assert!(!mgr.is_connected(&t));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.identity().is_none(), "handle should be closed");
    }

    #[tokio::test(start_paused = true)]
    async fn remove_connection_keeps_attempt_count() {
        let mgr = manager();
        let t = tenant("111");
        let calls = Arc::new(AtomicUsize::new(0));

        mgr.schedule_reconnect(&t, counting_retry(calls, false));
        mgr.clear_scheduled_reconnect(&t);
        mgr.remove_connection(&t);

        assert_eq!(mgr.get_status(&t).reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_records_leave_the_map() {
        let mgr = manager();
        let t = tenant("111");

        mgr.mark_connecting(&t);
        assert_eq!(mgr.tenants(), vec![t.clone()]);
        mgr.unmark_connecting(&t);
        assert!(mgr.tenants().is_empty());

        mgr.add_connection(&t, open_session(&t).await);
        assert_eq!(mgr.snapshot().len(), 1);
        mgr.forget(&t);
        assert!(mgr.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn awaiting_retry_tracks_backoff_state() {
        let mgr = manager();
        let t = tenant("111");
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(!mgr.awaiting_retry(&t));

        mgr.schedule_reconnect(&t, counting_retry(calls.clone(), false));
        assert!(mgr.awaiting_retry(&t));

        // Still awaiting once the timer has fired and left the record.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!mgr.get_status(&t).has_scheduled);
        assert!(mgr.awaiting_retry(&t));

        mgr.forget(&t);
        assert!(!mgr.awaiting_retry(&t));

        mgr.schedule_reconnect(&t, counting_retry(calls, false));
        mgr.add_connection(&t, open_session(&t).await);
        assert!(!mgr.awaiting_retry(&t));
    }
}
