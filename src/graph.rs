//! Directed typed dependency edges between elements.
//!
//! Edge direction convention: an edge (blocked, blocker) means "blocked
//! must wait for blocker to finish". Blocking types (blocks,
//! parent-child, awaits) participate in cycle detection and readiness;
//! relates-to is bidirectional and stored canonically with the
//! lexicographically smaller id on the blocked side.

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use serde_json::Map;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::constants::CYCLE_CHECK_MAX_DEPTH;
use crate::models::{Dependency, DependencyType, EventType};
use crate::storage::{rows, ElementStore};
use crate::validation::validate_element_id;
use crate::{FoundryError, Result};

/// Request to add an edge.
#[derive(Debug, Clone)]
pub struct NewDependency {
    pub blocked_id: String,
    pub blocker_id: String,
    pub dep_type: DependencyType,
    pub created_by: String,
    pub metadata: Map<String, serde_json::Value>,
}

impl NewDependency {
    pub fn new(
        blocked_id: impl Into<String>,
        blocker_id: impl Into<String>,
        dep_type: DependencyType,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            blocked_id: blocked_id.into(),
            blocker_id: blocker_id.into(),
            dep_type,
            created_by: created_by.into(),
            metadata: Map::new(),
        }
    }
}

/// Outcome of a cycle probe.
#[derive(Debug, Clone, Default)]
pub struct CycleCheck {
    /// Full cycle path when one was found, starting and ending at the
    /// proposed blocker.
    pub cycle_path: Option<Vec<String>>,
    /// The traversal hit the depth bound before exhausting the graph.
    /// Treated as no-cycle; operators relying on strict acyclicity in
    /// very deep graphs should watch for this in the logs.
    pub depth_limit_reached: bool,
}

#[derive(Clone)]
pub struct DependencyGraph {
    store: ElementStore,
}

impl DependencyGraph {
    pub fn new(store: ElementStore) -> Self {
        Self { store }
    }

    /// Add a dependency edge. Canonicalizes relates-to, verifies both
    /// endpoints exist, rejects duplicates, and refuses blocking edges
    /// that would close a cycle. All checks and the insert share one
    /// transaction.
    pub async fn add(&self, req: NewDependency) -> Result<Dependency> {
        validate_element_id(&req.blocked_id)?;
        validate_element_id(&req.blocker_id)?;

        let (blocked_id, blocker_id) = canonicalize(&req);
        if blocked_id == blocker_id {
            return Err(FoundryError::CycleDetected {
                path: vec![blocked_id.clone(), blocked_id],
            });
        }

        let dep = Dependency {
            blocked_id,
            blocker_id,
            dep_type: req.dep_type,
            created_at: Utc::now(),
            created_by: req.created_by,
            metadata: req.metadata,
        };

        let stored = dep.clone();
        self.store
            .database()
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                for endpoint in [&dep.blocked_id, &dep.blocker_id] {
                    if rows::get_element(&tx, endpoint)?.is_none() {
                        return Err(FoundryError::NotFound(endpoint.clone()));
                    }
                }

                if dep.dep_type.is_blocking() {
                    let probe = find_cycle(
                        &tx,
                        &dep.blocker_id,
                        &dep.blocked_id,
                        CYCLE_CHECK_MAX_DEPTH,
                    )?;
                    if let Some(path) = probe.cycle_path {
                        return Err(FoundryError::CycleDetected { path });
                    }
                    if probe.depth_limit_reached {
                        warn!(
                            blocked = %dep.blocked_id,
                            blocker = %dep.blocker_id,
                            depth = CYCLE_CHECK_MAX_DEPTH,
                            "cycle probe hit depth bound, accepting edge"
                        );
                    }
                }

                rows::insert_dependency(&tx, &dep)?;
                rows::mark_dirty(&tx, &dep.blocked_id)?;
                let detail = serde_json::to_value(&dep)?;
                rows::append_event(
                    &tx,
                    &dep.blocked_id,
                    EventType::DependencyAdded,
                    &dep.created_by,
                    None,
                    Some(&detail),
                )?;

                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!(
            blocked = %stored.blocked_id,
            blocker = %stored.blocker_id,
            dep_type = %stored.dep_type,
            "dependency added"
        );
        Ok(stored)
    }

    /// Remove an edge; DEPENDENCY_NOT_FOUND when absent.
    pub async fn remove(
        &self,
        blocked_id: &str,
        blocker_id: &str,
        dep_type: DependencyType,
        actor: &str,
    ) -> Result<()> {
        let (blocked, blocker) = if dep_type == DependencyType::RelatesTo {
            order_related(blocked_id, blocker_id)
        } else {
            (blocked_id.to_string(), blocker_id.to_string())
        };
        let actor = actor.to_string();

        self.store
            .database()
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let removed = rows::delete_dependency(&tx, &blocked, &blocker, dep_type)?;
                if !removed {
                    return Err(FoundryError::DependencyNotFound {
                        blocked,
                        blocker,
                        dep_type: dep_type.as_str().to_string(),
                    });
                }
                rows::mark_dirty(&tx, &blocked)?;
                let detail = serde_json::json!({
                    "blockedId": blocked,
                    "blockerId": blocker,
                    "type": dep_type.as_str(),
                });
                rows::append_event(
                    &tx,
                    &blocked,
                    EventType::DependencyRemoved,
                    &actor,
                    Some(&detail),
                    None,
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Incoming edges: what `id` waits for.
    pub async fn dependencies_of(
        &self,
        id: &str,
        dep_type: Option<DependencyType>,
    ) -> Result<Vec<Dependency>> {
        let id = id.to_string();
        self.store
            .database()
            .execute(move |conn| rows::deps_where_blocked(conn, &id, dep_type))
            .await
    }

    /// Outgoing edges: who waits for `id`.
    pub async fn dependents_of(
        &self,
        id: &str,
        dep_type: Option<DependencyType>,
    ) -> Result<Vec<Dependency>> {
        let id = id.to_string();
        self.store
            .database()
            .execute(move |conn| rows::deps_where_blocker(conn, &id, dep_type))
            .await
    }

    /// Ids related to `id` via relates-to edges, either side.
    pub async fn related_to(&self, id: &str) -> Result<Vec<String>> {
        let id = id.to_string();
        self.store
            .database()
            .execute(move |conn| {
                let mut related = Vec::new();
                for dep in rows::deps_involving(conn, &id)? {
                    if dep.dep_type != DependencyType::RelatesTo {
                        continue;
                    }
                    let other = if dep.blocked_id == id {
                        dep.blocker_id
                    } else {
                        dep.blocked_id
                    };
                    related.push(other);
                }
                Ok(related)
            })
            .await
    }

    /// Probe for a cycle that adding (blocked ← blocker) would close,
    /// without mutating anything.
    pub async fn check_cycle(&self, blocked_id: &str, blocker_id: &str) -> Result<CycleCheck> {
        let blocked = blocked_id.to_string();
        let blocker = blocker_id.to_string();
        self.store
            .database()
            .execute(move |conn| find_cycle(conn, &blocker, &blocked, CYCLE_CHECK_MAX_DEPTH))
            .await
    }
}

fn canonicalize(req: &NewDependency) -> (String, String) {
    if req.dep_type == DependencyType::RelatesTo {
        order_related(&req.blocked_id, &req.blocker_id)
    } else {
        (req.blocked_id.clone(), req.blocker_id.clone())
    }
}

fn order_related(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// BFS over blocking edges. Adding (blocked ← blocker) closes a cycle
/// iff the blocked node already reaches the blocker through existing
/// blocker→blocked edges, so the search starts at `blocked` and follows
/// each node's dependents. Bounded by `max_depth` edge hops; a probe
/// that hits the bound reports `depth_limit_reached` instead of a
/// cycle.
pub(crate) fn find_cycle(
    conn: &Connection,
    blocker_id: &str,
    blocked_id: &str,
    max_depth: usize,
) -> Result<CycleCheck> {
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut predecessor: HashMap<String, String> = HashMap::new();
    let mut depth_limit_reached = false;

    queue.push_back((blocked_id.to_string(), 0));
    visited.insert(blocked_id.to_string());

    while let Some((node, depth)) = queue.pop_front() {
        // A target only discoverable at the bound is reported as
        // depth-limited, not as a cycle.
        if depth >= max_depth {
            depth_limit_reached = true;
            continue;
        }

        if node == blocker_id {
            // Walk predecessors back to the start, then close the loop
            // at the proposed blocker.
            let mut path = vec![node.clone()];
            let mut cursor = node;
            while let Some(prev) = predecessor.get(&cursor) {
                path.push(prev.clone());
                cursor = prev.clone();
            }
            path.reverse();
            let mut full = Vec::with_capacity(path.len() + 1);
            full.push(blocker_id.to_string());
            full.extend(path);
            return Ok(CycleCheck {
                cycle_path: Some(full),
                depth_limit_reached: false,
            });
        }

        for dep in rows::deps_where_blocker(conn, &node, None)? {
            if !dep.dep_type.is_blocking() {
                continue;
            }
            if visited.insert(dep.blocked_id.clone()) {
                predecessor.insert(dep.blocked_id.clone(), node.clone());
                queue.push_back((dep.blocked_id, depth + 1));
            }
        }
    }

    Ok(CycleCheck {
        cycle_path: None,
        depth_limit_reached,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Element, ElementKind, TaskData};
    use crate::storage::Database;

    async fn fixtures() -> (ElementStore, DependencyGraph) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = ElementStore::new(db);
        let graph = DependencyGraph::new(store.clone());
        (store, graph)
    }

    async fn task(store: &ElementStore, title: &str) -> String {
        store
            .create(Element::new(ElementKind::Task(TaskData::new(title)), "el-sys"))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn add_and_query_both_directions() {
        let (store, graph) = fixtures().await;
        let a = task(&store, "a").await;
        let b = task(&store, "b").await;

        graph
            .add(NewDependency::new(&a, &b, DependencyType::Blocks, "el-sys"))
            .await
            .unwrap();

        let incoming = graph.dependencies_of(&a, None).await.unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].blocker_id, b);

        let outgoing = graph.dependents_of(&b, None).await.unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].blocked_id, a);
    }

    #[tokio::test]
    async fn duplicate_edge_rejected() {
        let (store, graph) = fixtures().await;
        let a = task(&store, "a").await;
        let b = task(&store, "b").await;

        graph
            .add(NewDependency::new(&a, &b, DependencyType::Blocks, "el-sys"))
            .await
            .unwrap();
        let err = graph
            .add(NewDependency::new(&a, &b, DependencyType::Blocks, "el-sys"))
            .await
            .unwrap_err();
        assert!(matches!(err, FoundryError::DuplicateDependency { .. }));
    }

    #[tokio::test]
    async fn missing_endpoint_rejected() {
        let (store, graph) = fixtures().await;
        let a = task(&store, "a").await;
        let err = graph
            .add(NewDependency::new(
                &a,
                "el-ghost",
                DependencyType::Blocks,
                "el-sys",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, FoundryError::NotFound(_)));
    }

    #[tokio::test]
    async fn two_node_cycle_rejected_with_path() {
        let (store, graph) = fixtures().await;
        let a = task(&store, "a").await;
        let b = task(&store, "b").await;

        // A waits for B.
        graph
            .add(NewDependency::new(&a, &b, DependencyType::Blocks, "el-sys"))
            .await
            .unwrap();

        // B waits for A would close the loop.
        let err = graph
            .add(NewDependency::new(&b, &a, DependencyType::Blocks, "el-sys"))
            .await
            .unwrap_err();
        match err {
            FoundryError::CycleDetected { path } => {
                assert_eq!(path, vec![a.clone(), b.clone(), a.clone()]);
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }

        // Graph unchanged: only the original edge remains.
        assert_eq!(graph.dependencies_of(&b, None).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn relates_to_is_canonical_and_excluded_from_cycles() {
        let (store, graph) = fixtures().await;
        let a = task(&store, "a").await;
        let b = task(&store, "b").await;
        let (lo, hi) = if a <= b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };

        // Insert with the endpoints deliberately reversed.
        let dep = graph
            .add(NewDependency::new(&hi, &lo, DependencyType::RelatesTo, "el-sys"))
            .await
            .unwrap();
        assert_eq!(dep.blocked_id, lo);
        assert_eq!(dep.blocker_id, hi);

        // The mirrored insert is the same canonical triple.
        let err = graph
            .add(NewDependency::new(&lo, &hi, DependencyType::RelatesTo, "el-sys"))
            .await
            .unwrap_err();
        assert!(matches!(err, FoundryError::DuplicateDependency { .. }));

        assert_eq!(graph.related_to(&a).await.unwrap(), vec![if a == lo { hi } else { lo }]);
    }

    #[tokio::test]
    async fn add_then_remove_restores_the_graph() {
        let (store, graph) = fixtures().await;
        let a = task(&store, "a").await;
        let b = task(&store, "b").await;

        graph
            .add(NewDependency::new(&a, &b, DependencyType::Awaits, "el-sys"))
            .await
            .unwrap();
        graph
            .remove(&a, &b, DependencyType::Awaits, "el-sys")
            .await
            .unwrap();

        assert!(graph.dependencies_of(&a, None).await.unwrap().is_empty());

        let err = graph
            .remove(&a, &b, DependencyType::Awaits, "el-sys")
            .await
            .unwrap_err();
        assert!(matches!(err, FoundryError::DependencyNotFound { .. }));
    }

    #[tokio::test]
    async fn depth_limit_is_permissive() {
        let (store, graph) = fixtures().await;

        // Chain t0 <- t1 <- t2 <- t3 (each waits for the next).
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(task(&store, &format!("t{i}")).await);
        }
        for pair in ids.windows(2) {
            graph
                .add(NewDependency::new(
                    &pair[0],
                    &pair[1],
                    DependencyType::Blocks,
                    "el-sys",
                ))
                .await
                .unwrap();
        }

        // Proposing "t3 waits for t0" closes the loop; reaching t0 from
        // t3 needs 3 hops. With max_depth 3 the probe stops at the
        // bound and reports no cycle.
        let blocker = ids[0].clone();
        let blocked = ids[3].clone();
        let probe = store
            .database()
            .execute(move |conn| find_cycle(conn, &blocker, &blocked, 3))
            .await
            .unwrap();
        assert!(probe.cycle_path.is_none());
        assert!(probe.depth_limit_reached);

        // One more hop of budget finds it.
        let blocker = ids[0].clone();
        let blocked = ids[3].clone();
        let probe = store
            .database()
            .execute(move |conn| find_cycle(conn, &blocker, &blocked, 4))
            .await
            .unwrap();
        assert!(probe.cycle_path.is_some());
    }
}
