//! The "what is runnable now" predicate.
//!
//! A task is ready iff it is open or in progress, every incoming
//! blocking edge points at a finished blocker, its scheduled time (if
//! any) has been reached, and its assignee resolves. The query is a
//! pure function of element + dependency state; each call reads a
//! single consistent snapshot.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;

use crate::models::{
    Element, ElementFilter, ElementKind, ElementType, TaskStatus,
};
use crate::storage::{rows, ElementStore};
use crate::Result;

/// Optional narrowing of the ready set.
#[derive(Debug, Clone, Default)]
pub struct ReadinessQuery {
    /// Only tasks assigned to this entity or team.
    pub assignee: Option<String>,
    /// All listed tags must be present.
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct ReadinessService {
    store: ElementStore,
}

impl ReadinessService {
    pub fn new(store: ElementStore) -> Self {
        Self { store }
    }

    /// Tasks ready to run now, ordered by (priority asc, created_at
    /// asc).
    pub async fn ready_tasks(&self, query: ReadinessQuery) -> Result<Vec<Element>> {
        let now = Utc::now();
        self.store
            .database()
            .execute(move |conn| {
                let mut filter = ElementFilter::of_type(ElementType::Task);
                filter.tags = query.tags.clone();
                let candidates = rows::list_elements(conn, &filter)?;

                let mut ready = Vec::new();
                for element in candidates {
                    let task = match element.as_task() {
                        Some(t) => t,
                        None => continue,
                    };
                    if let Some(wanted) = &query.assignee {
                        if task.assignee.as_deref() != Some(wanted.as_str()) {
                            continue;
                        }
                    }
                    if task_is_ready(conn, &element, now)? {
                        ready.push(element);
                    }
                }

                ready.sort_by(|a, b| {
                    let pa = a.as_task().map(|t| t.priority).unwrap_or(u8::MAX);
                    let pb = b.as_task().map(|t| t.priority).unwrap_or(u8::MAX);
                    pa.cmp(&pb).then(a.created_at.cmp(&b.created_at))
                });

                if let Some(limit) = query.limit {
                    ready.truncate(limit);
                }
                Ok(ready)
            })
            .await
    }

    /// Evaluate the readiness predicate for one task.
    pub async fn is_ready(&self, task_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        let now = Utc::now();
        self.store
            .database()
            .execute(move |conn| match rows::get_element(conn, &task_id)? {
                Some(element) => task_is_ready(conn, &element, now),
                None => Ok(false),
            })
            .await
    }
}

/// The predicate itself, evaluated against one connection snapshot.
pub(crate) fn task_is_ready(
    conn: &Connection,
    element: &Element,
    now: DateTime<Utc>,
) -> Result<bool> {
    let task = match element.as_task() {
        Some(t) => t,
        None => return Ok(false),
    };

    if !matches!(task.status, TaskStatus::Open | TaskStatus::InProgress) {
        return Ok(false);
    }

    if let Some(scheduled_for) = task.scheduled_for {
        // Exactly-now counts as reached.
        if scheduled_for > now {
            return Ok(false);
        }
    }

    for dep in rows::deps_where_blocked(conn, &element.id, None)? {
        if !dep.dep_type.is_blocking() {
            continue;
        }
        let blocker = match rows::get_element(conn, &dep.blocker_id)? {
            Some(b) => b,
            // Cascading delete removes edges with the element; a
            // dangling blocker is treated as satisfied.
            None => continue,
        };
        if !blocker_satisfied(&dep.dep_type, &blocker) {
            return Ok(false);
        }
    }

    if let Some(assignee_id) = &task.assignee {
        match rows::get_element(conn, assignee_id)? {
            Some(assignee) => match &assignee.kind {
                ElementKind::Team(team) => {
                    if !team_has_active_member(conn, team)? {
                        return Ok(false);
                    }
                }
                _ => {}
            },
            None => {
                warn!(task = %element.id, assignee = %assignee_id, "assignee does not resolve");
                return Ok(false);
            }
        }
    }

    Ok(true)
}

/// Whether a blocking edge on this blocker is satisfied.
///
/// Parent-child edges whose blocker is a workflow or plan are ownership
/// records written at instantiation, not gates: blocking on them would
/// leave every instantiated child waiting for an aggregate that can
/// only finish once the children run. Parent-child between tasks gates
/// normally (a parent waits for its subtask).
fn blocker_satisfied(dep_type: &crate::models::DependencyType, blocker: &Element) -> bool {
    use crate::models::DependencyType;

    match &blocker.kind {
        ElementKind::Task(t) => t.status.is_terminal(),
        ElementKind::Workflow(w) => {
            if *dep_type == DependencyType::ParentChild {
                true
            } else {
                w.status.is_terminal()
            }
        }
        ElementKind::Plan(p) => {
            if *dep_type == DependencyType::ParentChild {
                true
            } else {
                p.status.is_terminal()
            }
        }
        // Non-lifecycle blockers (documents, entities, ...) never gate.
        _ => true,
    }
}

fn team_has_active_member(conn: &Connection, team: &crate::models::TeamData) -> Result<bool> {
    for member_id in &team.members {
        if let Some(member) = rows::get_element(conn, member_id)? {
            if let Some(entity) = member.as_entity() {
                if entity.is_active != Some(false) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DependencyGraph, NewDependency};
    use crate::models::{
        DependencyType, EntityData, EntityType, TaskData, TeamData,
    };
    use crate::storage::Database;
    use chrono::Duration;
    use std::collections::BTreeSet;

    async fn fixtures() -> (ElementStore, DependencyGraph, ReadinessService) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = ElementStore::new(db);
        (
            store.clone(),
            DependencyGraph::new(store.clone()),
            ReadinessService::new(store),
        )
    }

    async fn create_task(store: &ElementStore, data: TaskData) -> Element {
        store
            .create(Element::new(ElementKind::Task(data), "el-sys"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_unblocked_task_is_ready() {
        let (store, _, readiness) = fixtures().await;
        let task = create_task(&store, TaskData::new("go")).await;
        assert!(readiness.is_ready(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn closed_task_is_not_ready() {
        let (store, _, readiness) = fixtures().await;
        let mut data = TaskData::new("done");
        data.status = TaskStatus::Closed;
        let task = create_task(&store, data).await;
        assert!(!readiness.is_ready(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn incomplete_blocker_blocks() {
        let (store, graph, readiness) = fixtures().await;
        let blocked = create_task(&store, TaskData::new("blocked")).await;
        let blocker = create_task(&store, TaskData::new("blocker")).await;
        graph
            .add(NewDependency::new(
                &blocked.id,
                &blocker.id,
                DependencyType::Blocks,
                "el-sys",
            ))
            .await
            .unwrap();

        assert!(!readiness.is_ready(&blocked.id).await.unwrap());

        store
            .update(&blocker.id, "el-sys", |el| {
                el.as_task_mut().unwrap().status = TaskStatus::Closed;
                Ok(())
            })
            .await
            .unwrap();
        assert!(readiness.is_ready(&blocked.id).await.unwrap());
    }

    #[tokio::test]
    async fn scheduled_for_now_is_ready_future_is_not() {
        let (store, _, readiness) = fixtures().await;

        let mut due = TaskData::new("due");
        due.scheduled_for = Some(Utc::now() - Duration::seconds(1));
        let due = create_task(&store, due).await;
        assert!(readiness.is_ready(&due.id).await.unwrap());

        let mut later = TaskData::new("later");
        later.scheduled_for = Some(Utc::now() + Duration::hours(1));
        let later = create_task(&store, later).await;
        assert!(!readiness.is_ready(&later.id).await.unwrap());
    }

    #[tokio::test]
    async fn team_assignee_requires_an_active_member() {
        let (store, _, readiness) = fixtures().await;

        let member = store
            .create(Element::new(
                ElementKind::Entity(EntityData {
                    name: "worker-1".to_string(),
                    entity_type: EntityType::Agent,
                    is_active: Some(false),
                }),
                "el-sys",
            ))
            .await
            .unwrap();
        let team = store
            .create(Element::new(
                ElementKind::Team(TeamData {
                    name: "builders".to_string(),
                    members: BTreeSet::from([member.id.clone()]),
                }),
                "el-sys",
            ))
            .await
            .unwrap();

        let mut data = TaskData::new("team task");
        data.assignee = Some(team.id.clone());
        let task = create_task(&store, data).await;

        // Sole member inactive: not ready.
        assert!(!readiness.is_ready(&task.id).await.unwrap());

        store
            .update(&member.id, "el-sys", |el| {
                if let ElementKind::Entity(e) = &mut el.kind {
                    e.is_active = Some(true);
                }
                Ok(())
            })
            .await
            .unwrap();
        assert!(readiness.is_ready(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn unresolvable_assignee_blocks() {
        let (store, _, readiness) = fixtures().await;
        let mut data = TaskData::new("orphan");
        data.assignee = Some("el-gone".to_string());
        let task = create_task(&store, data).await;
        assert!(!readiness.is_ready(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn workflow_ownership_edge_does_not_gate_children() {
        let (store, graph, readiness) = fixtures().await;
        let workflow = store
            .create(Element::new(
                ElementKind::Workflow(crate::models::WorkflowData::new("wf")),
                "el-sys",
            ))
            .await
            .unwrap();
        let child = create_task(&store, TaskData::new("step")).await;
        graph
            .add(NewDependency::new(
                &child.id,
                &workflow.id,
                DependencyType::ParentChild,
                "el-sys",
            ))
            .await
            .unwrap();

        assert!(readiness.is_ready(&child.id).await.unwrap());
    }

    #[tokio::test]
    async fn ordering_is_priority_then_age() {
        let (store, _, readiness) = fixtures().await;

        let mut low = TaskData::new("low");
        low.priority = 4;
        create_task(&store, low).await;

        let mut critical = TaskData::new("critical");
        critical.priority = 1;
        create_task(&store, critical).await;

        let ready = readiness.ready_tasks(ReadinessQuery::default()).await.unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].as_task().unwrap().title, "critical");
        assert_eq!(ready[1].as_task().unwrap().title, "low");
    }
}
