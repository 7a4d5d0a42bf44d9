//! SQLite connection handling.
//!
//! [`Database`] wraps a `rusqlite::Connection` behind `Arc<Mutex<>>` and
//! dispatches all access onto the blocking thread pool via
//! `tokio::task::spawn_blocking`, so store calls never stall the async
//! runtime. Foundry is single-writer per process: one connection, one
//! writer, serialized writes.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::{FoundryError, Result};

use super::migration;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `path` and apply pragmas. Blocks
    /// briefly on file I/O; call during startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening element store");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests and scratch runs.
    pub fn open_in_memory() -> Result<Self> {
        debug!("opening in-memory element store");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database and run all pending migrations.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        self.execute_mut(migration::run_all).await
    }

    /// Current schema version (0 when no migration has run).
    pub async fn schema_version(&self) -> Result<u32> {
        self.execute(migration::current_version).await
    }

    /// Run a read-mostly closure against the connection on the blocking
    /// pool. This is the primary way the store talks to SQLite.
    pub async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| FoundryError::DatabaseError(format!("connection poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Run a closure that needs `&mut Connection` (transactions).
    ///
    /// Multi-row writes go through here wrapped in an immediate
    /// transaction so partially-applied state is never observable.
    pub async fn execute_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| FoundryError::DatabaseError(format!("connection poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    fn apply_pragmas(conn: &Connection) -> Result<()> {
        debug!("applying SQLite pragmas");

        // WAL: concurrent readers, non-blocking writes. NORMAL sync is
        // safe under WAL (a power cut loses the tail, never corrupts).
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        Ok(())
    }
}
