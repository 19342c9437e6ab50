use thiserror::Error;

use super::policy::DisconnectCode;
use super::tenant::TenantKey;

// ---

#[derive(Debug, Error)]
pub enum FleetError {
    // ---
    #[error("invalid tenant key: {0:?}")]
    InvalidTenant(String),

    /// No credentials anywhere. Pairing must happen first; never retried.
    #[error("no credentials for tenant {0}, pairing required")]
    NoCredentials(TenantKey),

    /// Credentials are revoked or invalid. They have been deleted.
    #[error("fatal auth failure for tenant {tenant} (code {code})")]
    FatalAuth { tenant: TenantKey, code: DisconnectCode },

    /// The session closed for a recoverable reason. A retry is scheduled.
    #[error("transient disconnect for tenant {tenant} (code {code})")]
    Transient { tenant: TenantKey, code: DisconnectCode },

    #[error("reconnect ceiling reached for tenant {tenant} after {attempts} attempts")]
    MaxAttemptsExceeded { tenant: TenantKey, attempts: u32 },

    #[error("pairing for tenant {0} opened but credentials never reached disk")]
    PairingVerification(TenantKey),

    #[error("pairing for tenant {tenant} abandoned: {reason}")]
    PairingAbandoned { tenant: TenantKey, reason: String },

    #[error("tenant {0} is blocked")]
    Blocked(TenantKey),

    #[error("tenant {0} is already connected")]
    AlreadyConnected(TenantKey),

    #[error("store error: {0}")]
    Store(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

impl FleetError {
    // ---
    /// `true` for errors a scheduled retry cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FleetError::NoCredentials(_)
                | FleetError::FatalAuth { .. }
                | FleetError::Blocked(_)
                | FleetError::InvalidTenant(_)
                | FleetError::MaxAttemptsExceeded { .. }
        )
    }
}

// ---

pub type Result<T> = std::result::Result<T, FleetError>;
