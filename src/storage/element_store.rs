//! Typed element CRUD with dirty-tracking, child-counter allocation,
//! and the append-only event journal.
//!
//! The async [`ElementStore`] API wraps row-level helpers in [`rows`];
//! services that need multi-row atomicity (claiming, instantiation,
//! dispatch) compose the same helpers inside a single immediate
//! transaction via [`Database::execute_mut`].

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

use crate::models::{
    Dependency, DependencyType, Element, ElementFilter, Event, EventType,
};
use crate::validation::validate_element;
use crate::{FoundryError, Result};

use super::db::Database;

/// Row-level operations on an open connection. Everything here is
/// synchronous and transaction-agnostic: callers decide the boundary.
pub mod rows {
    use super::*;
    use std::str::FromStr;

    pub fn insert_element(conn: &Connection, element: &Element) -> Result<()> {
        let data = serde_json::to_string(element)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO elements (id, el_type, status, created_at, updated_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                element.id,
                element.element_type().as_str(),
                element.status_str(),
                element.created_at.to_rfc3339(),
                element.updated_at.to_rfc3339(),
                data
            ],
        )?;
        if inserted == 0 {
            return Err(FoundryError::AlreadyExists(element.id.clone()));
        }
        Ok(())
    }

    pub fn get_element(conn: &Connection, id: &str) -> Result<Option<Element>> {
        let data: Option<String> = conn
            .query_row("SELECT data FROM elements WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn write_element(conn: &Connection, element: &Element) -> Result<()> {
        let data = serde_json::to_string(element)?;
        let changed = conn.execute(
            "UPDATE elements SET status = ?2, updated_at = ?3, data = ?4 WHERE id = ?1",
            rusqlite::params![
                element.id,
                element.status_str(),
                element.updated_at.to_rfc3339(),
                data
            ],
        )?;
        if changed == 0 {
            return Err(FoundryError::NotFound(element.id.clone()));
        }
        Ok(())
    }

    pub fn delete_element(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn.execute("DELETE FROM elements WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    pub fn mark_dirty(conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO dirty_elements (element_id, marked_at) VALUES (?1, ?2)
             ON CONFLICT(element_id) DO UPDATE SET marked_at = excluded.marked_at",
            rusqlite::params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn append_event(
        conn: &Connection,
        element_id: &str,
        event_type: EventType,
        actor: &str,
        old_value: Option<&Value>,
        new_value: Option<&Value>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO events (element_id, event_type, actor, old_value, new_value, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                element_id,
                event_type.as_str(),
                actor,
                old_value.map(|v| v.to_string()),
                new_value.map(|v| v.to_string()),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn insert_dependency(conn: &Connection, dep: &Dependency) -> Result<()> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO dependencies
             (blocked_id, blocker_id, dep_type, created_at, created_by, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                dep.blocked_id,
                dep.blocker_id,
                dep.dep_type.as_str(),
                dep.created_at.to_rfc3339(),
                dep.created_by,
                serde_json::to_string(&dep.metadata)?
            ],
        )?;
        if inserted == 0 {
            return Err(FoundryError::DuplicateDependency {
                blocked: dep.blocked_id.clone(),
                blocker: dep.blocker_id.clone(),
                dep_type: dep.dep_type.as_str().to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_dependency(
        conn: &Connection,
        blocked_id: &str,
        blocker_id: &str,
        dep_type: DependencyType,
    ) -> Result<bool> {
        let changed = conn.execute(
            "DELETE FROM dependencies WHERE blocked_id = ?1 AND blocker_id = ?2 AND dep_type = ?3",
            rusqlite::params![blocked_id, blocker_id, dep_type.as_str()],
        )?;
        Ok(changed > 0)
    }

    // The dep_type string is returned alongside and parsed by the
    // caller, where a real error type is available.
    fn dependency_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Dependency, String)> {
        let dep_type_raw: String = row.get(2)?;
        let created_at_raw: String = row.get(3)?;
        let metadata_raw: String = row.get(5)?;
        Ok((
            Dependency {
                blocked_id: row.get(0)?,
                blocker_id: row.get(1)?,
                dep_type: DependencyType::Blocks,
                created_at: DateTime::parse_from_rfc3339(&created_at_raw)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                created_by: row.get(4)?,
                metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
            },
            dep_type_raw,
        ))
    }

    fn collect_dependencies(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Dependency>> {
        let mut stmt = conn.prepare(sql)?;
        let mapped = stmt.query_map(params, dependency_from_row)?;
        let mut deps = Vec::new();
        for item in mapped {
            let (mut dep, raw_type) = item?;
            dep.dep_type = DependencyType::from_str(&raw_type)
                .map_err(FoundryError::DatabaseError)?;
            deps.push(dep);
        }
        Ok(deps)
    }

    const DEP_COLUMNS: &str =
        "blocked_id, blocker_id, dep_type, created_at, created_by, metadata";

    /// Dependencies where `id` is the blocked side (incoming edges).
    pub fn deps_where_blocked(
        conn: &Connection,
        id: &str,
        dep_type: Option<DependencyType>,
    ) -> Result<Vec<Dependency>> {
        match dep_type {
            Some(t) => collect_dependencies(
                conn,
                &format!(
                    "SELECT {DEP_COLUMNS} FROM dependencies WHERE blocked_id = ?1 AND dep_type = ?2"
                ),
                &[&id, &t.as_str()],
            ),
            None => collect_dependencies(
                conn,
                &format!("SELECT {DEP_COLUMNS} FROM dependencies WHERE blocked_id = ?1"),
                &[&id],
            ),
        }
    }

    /// Dependencies where `id` is the blocker side (outgoing edges).
    pub fn deps_where_blocker(
        conn: &Connection,
        id: &str,
        dep_type: Option<DependencyType>,
    ) -> Result<Vec<Dependency>> {
        match dep_type {
            Some(t) => collect_dependencies(
                conn,
                &format!(
                    "SELECT {DEP_COLUMNS} FROM dependencies WHERE blocker_id = ?1 AND dep_type = ?2"
                ),
                &[&id, &t.as_str()],
            ),
            None => collect_dependencies(
                conn,
                &format!("SELECT {DEP_COLUMNS} FROM dependencies WHERE blocker_id = ?1"),
                &[&id],
            ),
        }
    }

    pub fn deps_involving(conn: &Connection, id: &str) -> Result<Vec<Dependency>> {
        collect_dependencies(
            conn,
            &format!(
                "SELECT {DEP_COLUMNS} FROM dependencies WHERE blocked_id = ?1 OR blocker_id = ?1"
            ),
            &[&id],
        )
    }

    pub fn delete_deps_involving(conn: &Connection, id: &str) -> Result<usize> {
        let changed = conn.execute(
            "DELETE FROM dependencies WHERE blocked_id = ?1 OR blocker_id = ?1",
            [id],
        )?;
        Ok(changed)
    }

    /// Atomic child-number allocation: upsert-increment returning the
    /// new counter. Successive calls yield 1, 2, 3, ... with no gaps.
    pub fn next_child_number(conn: &Connection, parent_id: &str) -> Result<u64> {
        let n: u64 = conn.query_row(
            "INSERT INTO child_counters (parent_id, last_child) VALUES (?1, 1)
             ON CONFLICT(parent_id) DO UPDATE SET last_child = last_child + 1
             RETURNING last_child",
            [parent_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn child_counter(conn: &Connection, parent_id: &str) -> Result<u64> {
        let n: Option<u64> = conn
            .query_row(
                "SELECT last_child FROM child_counters WHERE parent_id = ?1",
                [parent_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(n.unwrap_or(0))
    }

    pub fn reset_child_counter(conn: &Connection, parent_id: &str) -> Result<()> {
        conn.execute("DELETE FROM child_counters WHERE parent_id = ?1", [parent_id])?;
        Ok(())
    }

    pub fn list_elements(conn: &Connection, filter: &ElementFilter) -> Result<Vec<Element>> {
        let mut sql = "SELECT data FROM elements".to_string();
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(el_type) = filter.element_type {
            params.push(Box::new(el_type.as_str().to_string()));
            clauses.push(format!("el_type = ?{}", params.len()));
        }
        if let Some(status) = &filter.status {
            params.push(Box::new(status.clone()));
            clauses.push(format!("status = ?{}", params.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mapped = stmt.query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))?;

        let mut elements = Vec::new();
        for raw in mapped {
            let element: Element = serde_json::from_str(&raw?)?;
            if !filter.tags.is_empty()
                && !filter.tags.iter().all(|t| element.tags.contains(t))
            {
                continue;
            }
            elements.push(element);
        }

        let offset = filter.offset.unwrap_or(0);
        let limited: Vec<Element> = match filter.limit {
            Some(limit) => elements.into_iter().skip(offset).take(limit).collect(),
            None => elements.into_iter().skip(offset).collect(),
        };
        Ok(limited)
    }
}

/// Totals reported by [`ElementStore::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub elements: u64,
    pub dependencies: u64,
    pub events: u64,
    pub dirty: u64,
}

/// The element store: exclusive owner of every element row.
#[derive(Clone)]
pub struct ElementStore {
    db: Database,
}

impl ElementStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Create an element: validates, writes the row, marks dirty, and
    /// emits `created` — atomically.
    pub async fn create(&self, element: Element) -> Result<Element> {
        validate_element(&element)?;
        let stored = element.clone();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                rows::insert_element(&tx, &element)?;
                rows::mark_dirty(&tx, &element.id)?;
                let snapshot = serde_json::to_value(&element)?;
                rows::append_event(
                    &tx,
                    &element.id,
                    EventType::Created,
                    &element.created_by,
                    None,
                    Some(&snapshot),
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!(id = %stored.id, el_type = %stored.element_type(), "element created");
        Ok(stored)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Element>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| rows::get_element(conn, &id))
            .await
    }

    /// Like [`get`](Self::get) but NOT_FOUND when absent.
    pub async fn require(&self, id: &str) -> Result<Element> {
        self.get(id)
            .await?
            .ok_or_else(|| FoundryError::NotFound(id.to_string()))
    }

    /// Apply a mutation to an element. Emits `updated` with the old/new
    /// snapshots, plus `status-changed` when the mutation moved the
    /// status.
    pub async fn update<F>(&self, id: &str, actor: &str, mutate: F) -> Result<Element>
    where
        F: FnOnce(&mut Element) -> Result<()> + Send + 'static,
    {
        let id = id.to_string();
        let actor = actor.to_string();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let old = rows::get_element(&tx, &id)?
                    .ok_or_else(|| FoundryError::NotFound(id.clone()))?;
                let mut updated = old.clone();
                mutate(&mut updated)?;
                updated.updated_at = Utc::now();
                validate_element(&updated)?;

                rows::write_element(&tx, &updated)?;
                rows::mark_dirty(&tx, &id)?;

                let old_json = serde_json::to_value(&old)?;
                let new_json = serde_json::to_value(&updated)?;
                rows::append_event(
                    &tx,
                    &id,
                    EventType::Updated,
                    &actor,
                    Some(&old_json),
                    Some(&new_json),
                )?;

                let old_status = old.status_str();
                let new_status = updated.status_str();
                if old_status != new_status {
                    rows::append_event(
                        &tx,
                        &id,
                        EventType::StatusChanged,
                        &actor,
                        Some(&serde_json::json!({ "status": old_status })),
                        Some(&serde_json::json!({ "status": new_status })),
                    )?;
                }

                tx.commit()?;
                Ok(updated)
            })
            .await
    }

    /// Delete an element, cascading every dependency that references it
    /// on either side.
    pub async fn delete(&self, id: &str, actor: &str, reason: Option<&str>) -> Result<()> {
        let id = id.to_string();
        let actor = actor.to_string();
        let reason = reason.map(|r| r.to_string());
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let old = rows::get_element(&tx, &id)?
                    .ok_or_else(|| FoundryError::NotFound(id.clone()))?;

                rows::delete_deps_involving(&tx, &id)?;
                rows::delete_element(&tx, &id)?;
                rows::mark_dirty(&tx, &id)?;

                let old_json = serde_json::to_value(&old)?;
                let detail = serde_json::json!({ "reason": reason });
                rows::append_event(
                    &tx,
                    &id,
                    EventType::Deleted,
                    &actor,
                    Some(&old_json),
                    Some(&detail),
                )?;

                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn list(&self, filter: ElementFilter) -> Result<Vec<Element>> {
        self.db
            .execute(move |conn| rows::list_elements(conn, &filter))
            .await
    }

    /// Allocate the next hierarchical child id under `parent_id`.
    pub async fn allocate_child_id(&self, parent_id: &str) -> Result<String> {
        let parent = parent_id.to_string();
        self.db
            .execute(move |conn| {
                let n = rows::next_child_number(conn, &parent)?;
                Ok(format!("{parent}.{n}"))
            })
            .await
    }

    pub async fn child_counter(&self, parent_id: &str) -> Result<u64> {
        let parent = parent_id.to_string();
        self.db
            .execute(move |conn| rows::child_counter(conn, &parent))
            .await
    }

    pub async fn reset_child_counter(&self, parent_id: &str) -> Result<()> {
        let parent = parent_id.to_string();
        self.db
            .execute(move |conn| rows::reset_child_counter(conn, &parent))
            .await
    }

    /// Record a service-level event (claimed, task-dispatched, ...).
    pub async fn record_event(
        &self,
        element_id: &str,
        event_type: EventType,
        actor: &str,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) -> Result<()> {
        let element_id = element_id.to_string();
        let actor = actor.to_string();
        self.db
            .execute(move |conn| {
                rows::append_event(
                    conn,
                    &element_id,
                    event_type,
                    &actor,
                    old_value.as_ref(),
                    new_value.as_ref(),
                )
            })
            .await
    }

    pub async fn events_for(&self, element_id: &str) -> Result<Vec<Event>> {
        let element_id = element_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, element_id, event_type, actor, old_value, new_value, timestamp
                     FROM events WHERE element_id = ?1 ORDER BY id ASC",
                )?;
                let mapped = stmt.query_map([&element_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?;

                let mut events = Vec::new();
                for item in mapped {
                    let (id, element_id, event_type, actor, old_raw, new_raw, ts) = item?;
                    events.push(Event {
                        id,
                        element_id,
                        event_type: event_type
                            .parse()
                            .map_err(FoundryError::DatabaseError)?,
                        actor,
                        old_value: old_raw.and_then(|r| serde_json::from_str(&r).ok()),
                        new_value: new_raw.and_then(|r| serde_json::from_str(&r).ok()),
                        timestamp: DateTime::parse_from_rfc3339(&ts)
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    });
                }
                Ok(events)
            })
            .await
    }

    pub async fn get_dirty_elements(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT element_id, marked_at FROM dirty_elements ORDER BY marked_at ASC",
                )?;
                let mapped = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut dirty = Vec::new();
                for item in mapped {
                    let (id, ts) = item?;
                    dirty.push((
                        id,
                        DateTime::parse_from_rfc3339(&ts)
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    ));
                }
                Ok(dirty)
            })
            .await
    }

    pub async fn clear_dirty(&self) -> Result<()> {
        self.db
            .execute(|conn| {
                conn.execute("DELETE FROM dirty_elements", [])?;
                Ok(())
            })
            .await
    }

    pub async fn clear_dirty_ids(&self, ids: Vec<String>) -> Result<()> {
        self.db
            .execute(move |conn| {
                for id in &ids {
                    conn.execute("DELETE FROM dirty_elements WHERE element_id = ?1", [id])?;
                }
                Ok(())
            })
            .await
    }

    pub async fn element_count(&self) -> Result<u64> {
        self.db
            .execute(|conn| {
                let n: u64 = conn.query_row("SELECT count(*) FROM elements", [], |row| row.get(0))?;
                Ok(n)
            })
            .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.db
            .execute(|conn| {
                let elements: u64 =
                    conn.query_row("SELECT count(*) FROM elements", [], |row| row.get(0))?;
                let dependencies: u64 =
                    conn.query_row("SELECT count(*) FROM dependencies", [], |row| row.get(0))?;
                let events: u64 =
                    conn.query_row("SELECT count(*) FROM events", [], |row| row.get(0))?;
                let dirty: u64 =
                    conn.query_row("SELECT count(*) FROM dirty_elements", [], |row| row.get(0))?;
                Ok(StoreStats {
                    elements,
                    dependencies,
                    events,
                    dirty,
                })
            })
            .await
    }
}
