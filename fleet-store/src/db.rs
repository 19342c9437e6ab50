//! [`Database`] — SQLite mirror of tenant credentials plus the block list.
//!
//! The database is the disaster-recovery copy: it outlives a wiped
//! sessions directory and seeds restoration at startup. `rusqlite` is
//! synchronous, so every query runs on the blocking pool behind one shared
//! connection.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

// ---

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

// ---

use fleet_domain::{BlockEntry, BlockList, Credentials, TenantKey};

// ---

use super::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    tenant      TEXT PRIMARY KEY,
    creds       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blocked_tenants (
    tenant      TEXT PRIMARY KEY,
    blocked_at  TEXT NOT NULL
);
";

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Cheap-clone handle to the daemon database.
#[derive(Clone)]
pub struct Database {
    // ---
    conn: Arc<Mutex<Connection>>,
}

// ---

impl Database {
    // ---
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        // ---
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    // ---

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    // ---

    fn init(conn: Connection) -> Result<Self> {
        // ---
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        // ---
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    // --- credentials --------------------------------------------------------

    pub async fn put_credentials(&self, tenant: &TenantKey, creds: &Credentials) -> Result<()> {
        // ---
        let tenant = tenant.to_string();
        let doc = creds.as_json().to_string();
        let now = Utc::now().to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO credentials (tenant, creds, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tenant) DO UPDATE SET creds = excluded.creds,
                                                   updated_at = excluded.updated_at",
                params![tenant, doc, now],
            )?;
            Ok(())
        })
        .await
    }

    // ---

    pub async fn get_credentials(&self, tenant: &TenantKey) -> Result<Option<Credentials>> {
        // ---
        let key = tenant.to_string();
        let doc: Option<String> = self
            .with_conn(move |conn| {
                let doc = conn
                    .query_row(
                        "SELECT creds FROM credentials WHERE tenant = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(doc)
            })
            .await?;

        match doc {
            None => Ok(None),
            Some(doc) => Credentials::from_slice(doc.as_bytes())
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    tenant: tenant.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    // ---

    pub async fn delete_credentials(&self, tenant: &TenantKey) -> Result<()> {
        // ---
        let tenant = tenant.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM credentials WHERE tenant = ?1", params![tenant])?;
            Ok(())
        })
        .await
    }

    // ---

    /// Every tenant with a credential row. Rows whose key does not
    /// normalize are logged and skipped.
    pub async fn list_credential_tenants(&self) -> Result<Vec<TenantKey>> {
        // ---
        let rows: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT tenant FROM credentials ORDER BY tenant")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|raw| match TenantKey::parse(&raw) {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::warn!(row = %raw, "skipping credential row: {e}");
                    None
                }
            })
            .collect())
    }

    // --- block list ---------------------------------------------------------

    async fn blocked_entry(&self, tenant: &TenantKey) -> Result<Option<String>> {
        // ---
        let tenant = tenant.to_string();
        self.with_conn(move |conn| {
            let at = conn
                .query_row(
                    "SELECT blocked_at FROM blocked_tenants WHERE tenant = ?1",
                    params![tenant],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(at)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// BlockList
// ---------------------------------------------------------------------------

#[async_trait]
impl BlockList for Database {
    // ---
    async fn is_blocked(&self, tenant: &TenantKey) -> fleet_domain::Result<bool> {
        Ok(self.blocked_entry(tenant).await?.is_some())
    }

    // ---

    async fn block(&self, tenant: &TenantKey) -> fleet_domain::Result<()> {
        // ---
        let key = tenant.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO blocked_tenants (tenant, blocked_at) VALUES (?1, ?2)",
                params![key, now],
            )?;
            Ok(())
        })
        .await?;

        tracing::info!(%tenant, "tenant blocked");
        Ok(())
    }

    // ---

    async fn unblock(&self, tenant: &TenantKey) -> fleet_domain::Result<()> {
        // ---
        let key = tenant.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM blocked_tenants WHERE tenant = ?1", params![key])?;
            Ok(())
        })
        .await?;

        tracing::info!(%tenant, "tenant unblocked");
        Ok(())
    }

    // ---

    async fn list(&self) -> fleet_domain::Result<Vec<BlockEntry>> {
        // ---
        let rows: Vec<(String, String)> = self
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT tenant, blocked_at FROM blocked_tenants ORDER BY tenant")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (raw, at) in rows {
            let Ok(tenant) = TenantKey::parse(&raw) else {
                tracing::warn!(row = %raw, "skipping malformed block entry");
                continue;
            };
            let blocked_at = DateTime::parse_from_rfc3339(&at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default();
            entries.push(BlockEntry { tenant, blocked_at });
        }
        Ok(entries)
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

    #[tokio::test]
    async fn credentials_upsert_and_delete() {
        let db = Database::open_in_memory().unwrap();
        let t = tenant("111");

        assert!(db.get_credentials(&t).await.unwrap().is_none());

        db.put_credentials(&t, &creds("v1")).await.unwrap();
        db.put_credentials(&t, &creds("v2")).await.unwrap();
        assert_eq!(db.get_credentials(&t).await.unwrap(), Some(creds("v2")));

        db.delete_credentials(&t).await.unwrap();
        assert!(db.get_credentials(&t).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_credential_tenants_is_sorted() {
        let db = Database::open_in_memory().unwrap();
        db.put_credentials(&tenant("333"), &creds("c")).await.unwrap();
        db.put_credentials(&tenant("111"), &creds("a")).await.unwrap();

        assert_eq!(
            db.list_credential_tenants().await.unwrap(),
            vec![tenant("111"), tenant("333")]
        );
    }

    #[tokio::test]
    async fn block_and_unblock() {
        let db = Database::open_in_memory().unwrap();
        let t = tenant("+1 555 0100");

        assert!(!db.is_blocked(&t).await.unwrap());
        db.block(&t).await.unwrap();
        db.block(&t).await.unwrap();
        assert!(db.is_blocked(&t).await.unwrap());

        let listed = db.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tenant, t);

        db.unblock(&t).await.unwrap();
        assert!(!db.is_blocked(&t).await.unwrap());
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("fleet.db");

        {
            let db = Database::open(&path).unwrap();
            db.put_credentials(&tenant("111"), &creds("a")).await.unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_credentials(&tenant("111")).await.unwrap(), Some(creds("a")));
    }
}
