//! Error types for `fleet-store`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    // ---
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt credentials for tenant {tenant}: {reason}")]
    Corrupt { tenant: String, reason: String },

    #[error("database worker failed: {0}")]
    Worker(String),
}

// ---

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Bridge to fleet_domain::FleetError
// ---------------------------------------------------------------------------

impl From<StoreError> for fleet_domain::FleetError {
    // ---
    fn from(e: StoreError) -> Self {
        fleet_domain::FleetError::Store(e.to_string())
    }
}
