//! Credential persistence and block list for the fleet session daemon.
//!
//! Credentials live in two places:
//!
//! - [`FsCredentials`] — `<sessions-dir>/<tenant>/creds.json`, rewritten by
//!   the protocol layer while a session is live;
//! - [`Database`] — a SQLite mirror used to restore sessions after the
//!   sessions directory is lost.
//!
//! [`CredentialStore`] keeps the two in step. [`Database`] also implements
//! [`fleet_domain::BlockList`].

mod db;
mod error;
mod fs;
mod store;

pub use db::Database;
pub use error::{Result, StoreError};
pub use fs::{FsCredentials, CREDS_FILE};
pub use store::{CredentialStore, Reconciled};
