//! Schema migrations.
//!
//! Migrations are static SQL keyed by version, applied in order inside
//! transactions and tracked in a `_migrations` table so re-runs are
//! no-ops.

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::{FoundryError, Result};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "core schema — elements, dependencies, events, dirty set, child counters, sessions",
    sql: r#"
        CREATE TABLE elements (
            id         TEXT PRIMARY KEY,
            el_type    TEXT NOT NULL,
            status     TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            data       TEXT NOT NULL
        );
        CREATE INDEX idx_elements_type ON elements(el_type);
        CREATE INDEX idx_elements_type_status ON elements(el_type, status);

        CREATE TABLE dependencies (
            blocked_id TEXT NOT NULL,
            blocker_id TEXT NOT NULL,
            dep_type   TEXT NOT NULL CHECK(dep_type IN ('blocks','parent-child','awaits','relates-to')),
            created_at TEXT NOT NULL,
            created_by TEXT NOT NULL,
            metadata   TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (blocked_id, blocker_id, dep_type)
        );
        CREATE INDEX idx_dependencies_blocker ON dependencies(blocker_id);

        CREATE TABLE events (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            element_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            actor      TEXT NOT NULL,
            old_value  TEXT,
            new_value  TEXT,
            timestamp  TEXT NOT NULL
        );
        CREATE INDEX idx_events_element ON events(element_id);

        CREATE TABLE dirty_elements (
            element_id TEXT PRIMARY KEY,
            marked_at  TEXT NOT NULL
        );

        CREATE TABLE child_counters (
            parent_id  TEXT PRIMARY KEY,
            last_child INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE sessions (
            id                  TEXT PRIMARY KEY,
            agent_id            TEXT NOT NULL,
            agent_role          TEXT NOT NULL,
            provider_session_id TEXT,
            mode                TEXT NOT NULL,
            status              TEXT NOT NULL CHECK(status IN ('starting','running','suspended','terminated')),
            working_directory   TEXT NOT NULL,
            worktree            TEXT,
            task_id             TEXT,
            pid                 INTEGER,
            created_at          TEXT NOT NULL,
            started_at          TEXT,
            last_activity_at    TEXT,
            ended_at            TEXT,
            termination_reason  TEXT,
            drained             INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_sessions_agent ON sessions(agent_id);
        CREATE INDEX idx_sessions_status ON sessions(status);
    "#,
}];

/// Apply all pending migrations.
pub fn run_all(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  TEXT NOT NULL
        )",
        [],
    )?;

    let current = current_version(conn)?;

    for migration in MIGRATIONS {
        if migration.version <= current {
            debug!(version = migration.version, "migration already applied");
            continue;
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(migration.sql).map_err(|e| {
            FoundryError::DatabaseError(format!(
                "migration v{} ({}) failed: {e}",
                migration.version, migration.description
            ))
        })?;
        tx.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "migration applied"
        );
    }

    Ok(())
}

/// Highest applied migration version; 0 on a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    let table_exists: bool = conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = '_migrations'",
        [],
        |row| row.get(0),
    )?;
    if !table_exists {
        return Ok(0);
    }

    let version: Option<u32> =
        conn.query_row("SELECT max(version) FROM _migrations", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}
