//! [`CredentialStore`] — filesystem and database copies kept in step.
//!
//! The filesystem copy wins whenever both exist. The database copy is only
//! read when the filesystem has nothing, and is then written back out so
//! the protocol layer finds it where it expects.

use std::collections::BTreeSet;
use std::path::PathBuf;

// ---

use fleet_domain::{Credentials, TenantKey};

// ---

use super::error::Result;
use super::{Database, FsCredentials};

// ---------------------------------------------------------------------------
// Reconciled
// ---------------------------------------------------------------------------

/// Where a tenant's credentials came from during [`CredentialStore::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    // ---
    /// Filesystem copy existed and was mirrored into the database.
    Local,

    /// Only the database had credentials; they were written to disk.
    FromDatabase,

    /// Neither location has credentials.
    Missing,
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

pub struct CredentialStore {
    // ---
    fs: FsCredentials,
    db: Database,
}

// ---

impl CredentialStore {
    // ---
    pub fn new(sessions_dir: impl Into<PathBuf>, db: Database) -> Self {
        Self {
            fs: FsCredentials::new(sessions_dir),
            db,
        }
    }

    // ---

    pub fn fs(&self) -> &FsCredentials {
        &self.fs
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ---

    /// Credentials for `tenant`, filesystem first.
    ///
    /// A database-only copy is written out to the filesystem before being
    /// returned.
    pub async fn read(&self, tenant: &TenantKey) -> Result<Option<Credentials>> {
        // ---
        let _guard = self.fs.lock(tenant).await;

        if let Some(creds) = self.fs.read(tenant).await? {
            return Ok(Some(creds));
        }

        match self.db.get_credentials(tenant).await? {
            Some(creds) => {
                tracing::info!(%tenant, "restoring credentials from database to disk");
                self.fs.write_locked(tenant, &creds).await?;
                Ok(Some(creds))
            }
            None => Ok(None),
        }
    }

    // ---

    pub async fn read_local(&self, tenant: &TenantKey) -> Result<Option<Credentials>> {
        self.fs.read(tenant).await
    }

    pub async fn read_db(&self, tenant: &TenantKey) -> Result<Option<Credentials>> {
        self.db.get_credentials(tenant).await
    }

    // ---

    /// Write both copies.
    pub async fn write(&self, tenant: &TenantKey, creds: &Credentials) -> Result<()> {
        // ---
        let _guard = self.fs.lock(tenant).await;
        self.fs.write_locked(tenant, creds).await?;
        self.db.put_credentials(tenant, creds).await
    }

    // ---

    /// Write only the filesystem copy. Used for key rotations pushed by the
    /// protocol layer during a live session.
    pub async fn write_local(&self, tenant: &TenantKey, creds: &Credentials) -> Result<()> {
        self.fs.write(tenant, creds).await
    }

    /// Remove only the filesystem copy. The database mirror stays as the
    /// recovery copy.
    pub async fn delete_local(&self, tenant: &TenantKey) -> Result<()> {
        self.fs.delete(tenant).await
    }

    // ---

    /// Copy the filesystem credentials into the database.
    ///
    /// Returns `false` when there is nothing on disk to mirror.
    pub async fn mirror_to_db(&self, tenant: &TenantKey) -> Result<bool> {
        // ---
        let _guard = self.fs.lock(tenant).await;
        match self.fs.read(tenant).await? {
            Some(creds) => {
                self.db.put_credentials(tenant, &creds).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ---

    /// Remove both copies.
    pub async fn delete(&self, tenant: &TenantKey) -> Result<()> {
        // ---
        self.fs.delete(tenant).await?;
        self.db.delete_credentials(tenant).await?;
        tracing::info!(%tenant, "credentials deleted");
        Ok(())
    }

    // ---

    /// Bring both copies in line for `tenant`, holding the tenant write
    /// lock for the whole exchange.
    ///
    /// A corrupt filesystem copy counts as absent so the database copy can
    /// replace it.
    pub async fn reconcile(&self, tenant: &TenantKey) -> Result<Reconciled> {
        // ---
        let _guard = self.fs.lock(tenant).await;

        let local = match self.fs.read(tenant).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(%tenant, "discarding unreadable local credentials: {e}");
                None
            }
        };

        if let Some(creds) = local {
            self.db.put_credentials(tenant, &creds).await?;
            return Ok(Reconciled::Local);
        }

        match self.db.get_credentials(tenant).await? {
            Some(creds) => {
                self.fs.write_locked(tenant, &creds).await?;
                Ok(Reconciled::FromDatabase)
            }
            None => Ok(Reconciled::Missing),
        }
    }

    // ---

    pub async fn list_local(&self) -> Result<Vec<TenantKey>> {
        self.fs.list().await
    }

    pub async fn list_db(&self) -> Result<Vec<TenantKey>> {
        self.db.list_credential_tenants().await
    }

    // ---

    /// Union of database and filesystem tenants, sorted.
    pub async fn known_tenants(&self) -> Result<Vec<TenantKey>> {
        // ---
        let mut all: BTreeSet<TenantKey> = self.list_db().await?.into_iter().collect();
        all.extend(self.list_local().await?);
        Ok(all.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn tenant(n: &str) -> TenantKey {
        TenantKey::parse(n).unwrap()
    }

    fn creds(id: &str) -> Credentials {
        Credentials::new(serde_json::json!({ "me": { "id": id } })).unwrap()
    }

    fn store(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(dir.path(), Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn filesystem_copy_wins_over_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let t = tenant("111");

        store.db().put_credentials(&t, &creds("old")).await.unwrap();
        store.write_local(&t, &creds("new")).await.unwrap();

        assert_eq!(store.read(&t).await.unwrap(), Some(creds("new")));
    }

    #[tokio::test]
    async fn read_falls_back_to_database_and_writes_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let t = tenant("111");

        store.db().put_credentials(&t, &creds("db")).await.unwrap();

        assert_eq!(store.read(&t).await.unwrap(), Some(creds("db")));
        assert_eq!(store.read_local(&t).await.unwrap(), Some(creds("db")));
    }

    #[tokio::test]
    async fn reconcile_mirrors_local_into_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let t = tenant("111");
        store.write_local(&t, &creds("disk")).await.unwrap();

        assert_eq!(store.reconcile(&t).await.unwrap(), Reconciled::Local);
        assert_eq!(store.read_db(&t).await.unwrap(), Some(creds("disk")));
    }

    #[tokio::test]
    async fn reconcile_restores_database_copy_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let t = tenant("111");
        store.db().put_credentials(&t, &creds("db")).await.unwrap();

        assert_eq!(store.reconcile(&t).await.unwrap(), Reconciled::FromDatabase);
        assert_eq!(store.read_local(&t).await.unwrap(), Some(creds("db")));
    }

    #[tokio::test]
    async fn reconcile_replaces_corrupt_local_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let t = tenant("111");
        std::fs::create_dir_all(dir.path().join("111")).unwrap();
        std::fs::write(dir.path().join("111").join(crate::CREDS_FILE), b"garbage").unwrap();
        store.db().put_credentials(&t, &creds("db")).await.unwrap();

        assert_eq!(store.reconcile(&t).await.unwrap(), Reconciled::FromDatabase);
        assert_eq!(store.read_local(&t).await.unwrap(), Some(creds("db")));
    }

    #[tokio::test]
    async fn reconcile_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert_eq!(store.reconcile(&tenant("111")).await.unwrap(), Reconciled::Missing);
    }

    #[tokio::test]
    async fn delete_clears_both_copies() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let t = tenant("111");
        store.write(&t, &creds("a")).await.unwrap();

        store.delete(&t).await.unwrap();
        assert!(store.read_local(&t).await.unwrap().is_none());
        assert!(store.read_db(&t).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_local_keeps_database_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let t = tenant("111");
        store.write(&t, &creds("a")).await.unwrap();

        store.delete_local(&t).await.unwrap();
        assert!(store.read_local(&t).await.unwrap().is_none());
        assert_eq!(store.read_db(&t).await.unwrap(), Some(creds("a")));
    }

    #[tokio::test]
    async fn known_tenants_is_the_sorted_union() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.db().put_credentials(&tenant("333"), &creds("c")).await.unwrap();
        store.write(&tenant("222"), &creds("b")).await.unwrap();
        store.write_local(&tenant("111"), &creds("a")).await.unwrap();

        assert_eq!(
            store.known_tenants().await.unwrap(),
            vec![tenant("111"), tenant("222"), tenant("333")]
        );
    }

    #[tokio::test]
    async fn mirror_without_local_copy_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(!store.mirror_to_db(&tenant("111")).await.unwrap());
    }
}
