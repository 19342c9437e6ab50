//! Reconnect policy — backoff schedule and disconnect classification.
//!
//! Both halves are stateless. The session registry asks for a delay each
//! time it arms a retry timer; the session driver asks for a class each
//! time a session closes.

use std::fmt;
use std::time::Duration;

// ---

use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_CAP_DELAY: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_JITTER_MAX: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// DisconnectCode
// ---------------------------------------------------------------------------

/// Close reason reported by the protocol layer when a session ends.
///
/// The numeric values follow the status codes the messaging service puts
/// on its stream errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisconnectCode(pub u16);

// ---

impl DisconnectCode {
    // ---
    pub const LOGGED_OUT: Self = Self(401);
    pub const FORBIDDEN: Self = Self(403);
    pub const CONNECTION_LOST: Self = Self(408);
    pub const MULTIDEVICE_MISMATCH: Self = Self(411);
    pub const CONNECTION_CLOSED: Self = Self(428);
    pub const CONNECTION_REPLACED: Self = Self(440);
    pub const BAD_SESSION: Self = Self(500);
    pub const UNAVAILABLE_SERVICE: Self = Self(503);
    pub const RESTART_REQUIRED: Self = Self(515);

    // ---

    pub fn classify(self) -> DisconnectClass {
        // ---
        match self {
            Self::LOGGED_OUT | Self::FORBIDDEN | Self::MULTIDEVICE_MISMATCH | Self::BAD_SESSION => {
                DisconnectClass::Fatal
            }
            Self::CONNECTION_LOST
            | Self::CONNECTION_CLOSED
            | Self::CONNECTION_REPLACED
            | Self::UNAVAILABLE_SERVICE
            | Self::RESTART_REQUIRED => DisconnectClass::Transient,
            _ => DisconnectClass::Unknown,
        }
    }
}

impl fmt::Display for DisconnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DisconnectClass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectClass {
    // ---
    /// Credentials can never be reused. Delete them, do not reconnect.
    Fatal,

    /// Network or remote hiccup. Reconnect with backoff.
    Transient,

    /// Not in the table. Treated exactly like [`DisconnectClass::Transient`].
    Unknown,
}

// ---

impl DisconnectClass {
    pub fn should_reconnect(self) -> bool {
        !matches!(self, DisconnectClass::Fatal)
    }
}

// ---------------------------------------------------------------------------
// ReconnectPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff with a small positive jitter.
///
/// ```text
/// delay(n) = min(base * 2^(n-1), cap) + jitter,   jitter in [0, jitter_max]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    // ---
    pub base_delay: Duration,
    pub cap_delay: Duration,

    /// Attempts allowed before the registry gives up on a tenant.
    pub max_attempts: u32,

    pub jitter_max: Duration,
}

// ---

impl Default for ReconnectPolicy {
    fn default() -> Self {
        // ---
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            cap_delay: DEFAULT_CAP_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter_max: DEFAULT_JITTER_MAX,
        }
    }
}

// ---

impl ReconnectPolicy {
    // ---
    /// Delay before retry number `attempt` (1-based) with fresh random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        // ---
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.delay_with_jitter(attempt, jitter)
    }

    // ---

    /// Deterministic form of [`Self::delay`]. `jitter` is clamped to
    /// `jitter_max`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        // ---
        self.backoff(attempt) + jitter.min(self.jitter_max)
    }

    // ---

    /// The un-jittered part of the schedule.
    pub fn backoff(&self, attempt: u32) -> Duration {
        // ---
        // 2^16 * base already dwarfs any sane cap; clamp the shift so the
        // multiplication cannot overflow.
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.base_delay.saturating_mul(1u32 << exp);
        scaled.min(self.cap_delay)
    }

    // ---

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
