//! [`FsCredentials`] — one directory per tenant under a sessions root.
//!
//! ```text
//! <root>/
//!   15550102030/
//!     creds.json
//!   447700900123/
//!     creds.json
//! ```
//!
//! The filesystem copy is authoritative while a session is live: the
//! protocol layer rewrites it every time keys rotate. Writers for the same
//! tenant are serialized by a per-tenant async lock, and each write lands
//! through a temp file + rename so a reader never sees half a document.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

// ---

use tokio::sync::OwnedMutexGuard;

// ---

use fleet_domain::{Credentials, TenantKey};

// ---

use super::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const CREDS_FILE: &str = "creds.json";

const CREDS_TMP_FILE: &str = "creds.json.tmp";

// ---------------------------------------------------------------------------
// FsCredentials
// ---------------------------------------------------------------------------

pub struct FsCredentials {
    // ---
    root: PathBuf,

    /// One async lock per tenant, created on first use. The outer mutex is
    /// only held long enough to clone the `Arc`.
    locks: Mutex<HashMap<TenantKey, Arc<tokio::sync::Mutex<()>>>>,
}

// ---

impl FsCredentials {
    // ---
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    // ---

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tenant_dir(&self, tenant: &TenantKey) -> PathBuf {
        self.root.join(tenant.as_str())
    }

    // ---

    /// Acquire the write lock for `tenant`. Everything that mutates the
    /// tenant's directory runs while holding the returned guard.
    pub async fn lock(&self, tenant: &TenantKey) -> OwnedMutexGuard<()> {
        // ---
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(tenant.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    // ---

    /// Read the tenant's credentials.
    ///
    /// `Ok(None)` when no file exists; [`StoreError::Corrupt`] when the file
    /// is present but not a valid credential document.
    pub async fn read(&self, tenant: &TenantKey) -> Result<Option<Credentials>> {
        // ---
        let path = self.tenant_dir(tenant).join(CREDS_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Credentials::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                tenant: tenant.to_string(),
                reason: e.to_string(),
            })
    }

    // ---

    pub async fn write(&self, tenant: &TenantKey, creds: &Credentials) -> Result<()> {
        // ---
        let _guard = self.lock(tenant).await;
        self.write_locked(tenant, creds).await
    }

    // ---

    /// Write without taking the tenant lock. The caller must already hold
    /// the guard from [`Self::lock`].
    pub async fn write_locked(&self, tenant: &TenantKey, creds: &Credentials) -> Result<()> {
        // ---
        let dir = self.tenant_dir(tenant);
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(CREDS_TMP_FILE);
        tokio::fs::write(&tmp, creds.to_vec()).await?;
        tokio::fs::rename(&tmp, dir.join(CREDS_FILE)).await?;

        tracing::debug!(%tenant, "credentials written to disk");
        Ok(())
    }

    // ---

    /// Remove the tenant's whole session directory. Missing is not an error.
    pub async fn delete(&self, tenant: &TenantKey) -> Result<()> {
        // ---
        let _guard = self.lock(tenant).await;
        match tokio::fs::remove_dir_all(self.tenant_dir(tenant)).await {
            Ok(()) => {
                tracing::info!(%tenant, "session directory removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ---

    /// Tenants whose directory holds a readable, valid `creds.json`.
    ///
    /// Directories whose name is not already a normalized tenant key, and
    /// directories with missing or corrupt credentials, are skipped.
    pub async fn list(&self) -> Result<Vec<TenantKey>> {
        // ---
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tenants = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let tenant = match TenantKey::parse(&name) {
                Ok(t) if t.as_str() == name => t,
                _ => {
                    tracing::debug!(dir = %name, "skipping non-tenant directory");
                    continue;
                }
            };

            match self.read(&tenant).await {
                Ok(Some(_)) => tenants.push(tenant),
                Ok(None) => {}
                Err(e) => tracing::warn!(%tenant, "ignoring session directory: {e}"),
            }
        }

        tenants.sort();
        Ok(tenants)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
