use std::time::Duration;

// ---

use fleet_domain::DisconnectCode;

// ---------------------------------------------------------------------------
// SimStep
// ---------------------------------------------------------------------------

/// What the next `open()` for a tenant does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStep {
    // ---
    /// Connect and authenticate. Unregistered sessions first wait for a
    /// pairing code to be requested.
    Open,

    /// Connect, then close with the given code without ever opening.
    Close(DisconnectCode),

    /// `open()` itself fails before any event is emitted.
    FailSetup,

    /// Emit `on_connecting` and then nothing until closed.
    Hang,

    /// Like [`SimStep::Hang`], but `request_pairing_code` fails.
    RefuseCode,
}

// ---------------------------------------------------------------------------
// SimConfig
// ---------------------------------------------------------------------------

/// Behaviour of a [`super::SimClient`].
///
/// Defaults to a well-behaved service: every session opens.
#[derive(Debug, Clone)]
pub struct SimConfig {
    // ---
    /// Step used once a tenant's script runs out.
    pub default_step: SimStep,

    /// Delay between `open()` returning and the first event.
    pub event_delay: Duration,

    /// Delay between a pairing code being requested and the simulated user
    /// entering it on the phone.
    pub link_delay: Duration,

    /// Code handed out by `request_pairing_code`.
    pub pairing_code: String,

    /// When `false`, a freshly paired session opens without ever pushing
    /// credentials, as if the protocol layer lost the flush.
    pub flush_creds_on_pair: bool,
}

// ---

impl Default for SimConfig {
    fn default() -> Self {
        // ---
        Self {
            default_step: SimStep::Open,
            event_delay: Duration::from_millis(10),
            link_delay: Duration::from_millis(10),
            pairing_code: "12345678".into(),
            flush_creds_on_pair: true,
        }
    }
}

// ---

impl SimConfig {
    // ---
    /// Every session opens.
    pub fn healthy() -> Self {
        Self::default()
    }

    // ---

    /// Every session drops with `code` before opening.
    pub fn always_close(code: DisconnectCode) -> Self {
        Self {
            default_step: SimStep::Close(code),
            ..Default::default()
        }
    }
}
