//! Aggregate-status derivation for workflows and plans.
//!
//! A workflow's status follows its child tasks (children = parent-child
//! edges where the workflow is the blocker): first child in progress
//! auto-starts it, any tombstoned child auto-fails it, all children
//! closed auto-completes it. Same-tick precedence: fail > start >
//! complete. Plans use the analogous transitions over their state set.

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::models::{
    DependencyType, Element, ElementFilter, ElementKind, ElementType, PlanStatus,
    TaskStatus, WorkflowStatus,
};
use crate::storage::{rows, ElementStore};
use crate::Result;

/// The single transition an aggregate should take right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    Start,
    Complete,
    Fail,
}

/// A transition that was applied, for daemon logging.
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub element_id: String,
    pub transition: StatusTransition,
}

#[derive(Clone)]
pub struct AutoStatusEngine {
    store: ElementStore,
}

impl AutoStatusEngine {
    pub fn new(store: ElementStore) -> Self {
        Self { store }
    }

    /// Compute the pending transition for one workflow or plan, if any.
    pub async fn compute(&self, aggregate_id: &str) -> Result<Option<StatusTransition>> {
        let id = aggregate_id.to_string();
        self.store
            .database()
            .execute(move |conn| match rows::get_element(conn, &id)? {
                Some(element) => compute_transition(conn, &element),
                None => Ok(None),
            })
            .await
    }

    /// Compute and apply the transition for one aggregate. Returns the
    /// transition taken, if any.
    pub async fn apply(
        &self,
        aggregate_id: &str,
        actor: &str,
    ) -> Result<Option<StatusTransition>> {
        let transition = match self.compute(aggregate_id).await? {
            Some(t) => t,
            None => return Ok(None),
        };

        self.store
            .update(aggregate_id, actor, move |element| {
                apply_transition(element, transition);
                Ok(())
            })
            .await?;

        info!(aggregate = %aggregate_id, ?transition, "auto-status transition applied");
        Ok(Some(transition))
    }

    /// Re-evaluate every aggregate that a task's mutation could have
    /// affected: its parents via parent-child edges.
    pub async fn run_for_parents_of(
        &self,
        task_id: &str,
        actor: &str,
    ) -> Result<Vec<AppliedTransition>> {
        let task_id_owned = task_id.to_string();
        let parents: Vec<String> = self
            .store
            .database()
            .execute(move |conn| {
                let deps = rows::deps_where_blocked(
                    conn,
                    &task_id_owned,
                    Some(DependencyType::ParentChild),
                )?;
                Ok(deps.into_iter().map(|d| d.blocker_id).collect())
            })
            .await?;

        let mut applied = Vec::new();
        for parent in parents {
            if let Some(transition) = self.apply(&parent, actor).await? {
                applied.push(AppliedTransition {
                    element_id: parent,
                    transition,
                });
            }
        }
        Ok(applied)
    }

    /// Sweep all non-terminal workflows and plans. The daemon runs this
    /// each tick so a transition is never more than one tick away.
    pub async fn sweep(&self, actor: &str) -> Result<Vec<AppliedTransition>> {
        let mut aggregates = self
            .store
            .list(ElementFilter::of_type(ElementType::Workflow))
            .await?;
        aggregates.extend(
            self.store
                .list(ElementFilter::of_type(ElementType::Plan))
                .await?,
        );

        let mut applied = Vec::new();
        for element in aggregates {
            let terminal = match &element.kind {
                ElementKind::Workflow(w) => w.status.is_terminal(),
                ElementKind::Plan(p) => p.status.is_terminal(),
                _ => true,
            };
            if terminal {
                continue;
            }
            if let Some(transition) = self.apply(&element.id, actor).await? {
                applied.push(AppliedTransition {
                    element_id: element.id,
                    transition,
                });
            }
        }
        Ok(applied)
    }
}

fn compute_transition(conn: &Connection, element: &Element) -> Result<Option<StatusTransition>> {
    let children = child_task_statuses(conn, &element.id)?;

    let any_tombstone = children.iter().any(|s| *s == TaskStatus::Tombstone);
    let any_in_progress = children.iter().any(|s| *s == TaskStatus::InProgress);
    let all_closed = !children.is_empty() && children.iter().all(|s| *s == TaskStatus::Closed);

    let transition = match &element.kind {
        ElementKind::Workflow(workflow) => match workflow.status {
            WorkflowStatus::Pending if any_tombstone => Some(StatusTransition::Fail),
            WorkflowStatus::Running if any_tombstone => Some(StatusTransition::Fail),
            WorkflowStatus::Pending if any_in_progress => Some(StatusTransition::Start),
            WorkflowStatus::Running if all_closed => Some(StatusTransition::Complete),
            _ => None,
        },
        ElementKind::Plan(plan) => match plan.status {
            PlanStatus::Draft if any_tombstone => Some(StatusTransition::Fail),
            PlanStatus::Active if any_tombstone => Some(StatusTransition::Fail),
            PlanStatus::Draft if any_in_progress => Some(StatusTransition::Start),
            PlanStatus::Active if all_closed => Some(StatusTransition::Complete),
            _ => None,
        },
        _ => None,
    };

    if transition.is_some() {
        debug!(aggregate = %element.id, ?transition, "auto-status transition due");
    }
    Ok(transition)
}

fn apply_transition(element: &mut Element, transition: StatusTransition) {
    let now = Utc::now();
    match &mut element.kind {
        ElementKind::Workflow(workflow) => match transition {
            StatusTransition::Start => {
                workflow.status = WorkflowStatus::Running;
                workflow.started_at.get_or_insert(now);
            }
            StatusTransition::Complete => {
                workflow.status = WorkflowStatus::Completed;
                workflow.finished_at = Some(now);
            }
            StatusTransition::Fail => {
                workflow.status = WorkflowStatus::Failed;
                workflow.finished_at = Some(now);
                workflow
                    .failure_reason
                    .get_or_insert_with(|| "child task tombstoned".to_string());
            }
        },
        ElementKind::Plan(plan) => match transition {
            StatusTransition::Start => plan.status = PlanStatus::Active,
            StatusTransition::Complete => plan.status = PlanStatus::Completed,
            // Plans have no failed state; a tombstoned member cancels.
            StatusTransition::Fail => plan.status = PlanStatus::Cancelled,
        },
        _ => {}
    }
}

fn child_task_statuses(conn: &Connection, aggregate_id: &str) -> Result<Vec<TaskStatus>> {
    let deps = rows::deps_where_blocker(conn, aggregate_id, Some(DependencyType::ParentChild))?;
    let mut statuses = Vec::new();
    for dep in deps {
        if let Some(child) = rows::get_element(conn, &dep.blocked_id)? {
            if let Some(task) = child.as_task() {
                statuses.push(task.status);
            }
        }
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DependencyGraph, NewDependency};
    use crate::models::{TaskData, WorkflowData};
    use crate::storage::Database;

    async fn fixtures() -> (ElementStore, DependencyGraph, AutoStatusEngine) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = ElementStore::new(db);
        (
            store.clone(),
            DependencyGraph::new(store.clone()),
            AutoStatusEngine::new(store),
        )
    }

    async fn workflow_with_children(
        store: &ElementStore,
        graph: &DependencyGraph,
        statuses: &[TaskStatus],
    ) -> (String, Vec<String>) {
        let workflow = store
            .create(Element::new(
                ElementKind::Workflow(WorkflowData::new("wf")),
                "el-sys",
            ))
            .await
            .unwrap();

        let mut children = Vec::new();
        for (i, status) in statuses.iter().enumerate() {
            let mut data = TaskData::new(format!("step {i}"));
            data.status = *status;
            let child = store
                .create(Element::new(ElementKind::Task(data), "el-sys"))
                .await
                .unwrap();
            graph
                .add(NewDependency::new(
                    &child.id,
                    &workflow.id,
                    DependencyType::ParentChild,
                    "el-sys",
                ))
                .await
                .unwrap();
            children.push(child.id);
        }
        (workflow.id, children)
    }

    #[tokio::test]
    async fn pending_workflow_auto_starts_on_first_in_progress_child() {
        let (store, graph, engine) = fixtures().await;
        let (wf, _) = workflow_with_children(
            &store,
            &graph,
            &[TaskStatus::InProgress, TaskStatus::Open],
        )
        .await;

        assert_eq!(engine.compute(&wf).await.unwrap(), Some(StatusTransition::Start));
        engine.apply(&wf, "el-sys").await.unwrap();

        let workflow = store.require(&wf).await.unwrap();
        let data = workflow.as_workflow().unwrap();
        assert_eq!(data.status, WorkflowStatus::Running);
        assert!(data.started_at.is_some());
    }

    #[tokio::test]
    async fn running_workflow_completes_when_all_children_close() {
        let (store, graph, engine) = fixtures().await;
        let (wf, children) = workflow_with_children(
            &store,
            &graph,
            &[TaskStatus::InProgress, TaskStatus::InProgress],
        )
        .await;
        engine.apply(&wf, "el-sys").await.unwrap(); // pending -> running

        for child in &children {
            store
                .update(child, "el-sys", |el| {
                    el.as_task_mut().unwrap().status = TaskStatus::Closed;
                    Ok(())
                })
                .await
                .unwrap();
        }

        assert_eq!(
            engine.compute(&wf).await.unwrap(),
            Some(StatusTransition::Complete)
        );
        engine.apply(&wf, "el-sys").await.unwrap();

        let data = store.require(&wf).await.unwrap();
        let data = data.as_workflow().unwrap().clone();
        assert_eq!(data.status, WorkflowStatus::Completed);
        assert!(data.finished_at.is_some());
    }

    #[tokio::test]
    async fn tombstone_wins_over_start_and_complete() {
        let (store, graph, engine) = fixtures().await;
        let (wf, _) = workflow_with_children(
            &store,
            &graph,
            &[TaskStatus::InProgress, TaskStatus::Tombstone],
        )
        .await;

        assert_eq!(engine.compute(&wf).await.unwrap(), Some(StatusTransition::Fail));
        engine.apply(&wf, "el-sys").await.unwrap();

        let element = store.require(&wf).await.unwrap();
        let data = element.as_workflow().unwrap();
        assert_eq!(data.status, WorkflowStatus::Failed);
        assert!(data.failure_reason.is_some());
    }

    #[tokio::test]
    async fn zero_children_never_auto_completes() {
        let (store, graph, engine) = fixtures().await;
        let (wf, _) = workflow_with_children(&store, &graph, &[]).await;

        store
            .update(&wf, "el-sys", |el| {
                el.as_workflow_mut().unwrap().status = WorkflowStatus::Running;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(engine.compute(&wf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn parent_reevaluation_follows_a_task_mutation() {
        let (store, graph, engine) = fixtures().await;
        let (wf, children) =
            workflow_with_children(&store, &graph, &[TaskStatus::Open]).await;

        store
            .update(&children[0], "el-sys", |el| {
                el.as_task_mut().unwrap().status = TaskStatus::InProgress;
                Ok(())
            })
            .await
            .unwrap();

        let applied = engine.run_for_parents_of(&children[0], "el-sys").await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].element_id, wf);
        assert_eq!(applied[0].transition, StatusTransition::Start);
    }

    #[tokio::test]
    async fn plan_cancels_on_tombstoned_member() {
        let (store, graph, engine) = fixtures().await;
        let plan = store
            .create(Element::new(
                ElementKind::Plan(crate::models::PlanData {
                    title: "roadmap".to_string(),
                    status: PlanStatus::Active,
                }),
                "el-sys",
            ))
            .await
            .unwrap();

        let mut data = TaskData::new("doomed");
        data.status = TaskStatus::Tombstone;
        let member = store
            .create(Element::new(ElementKind::Task(data), "el-sys"))
            .await
            .unwrap();
        graph
            .add(NewDependency::new(
                &member.id,
                &plan.id,
                DependencyType::ParentChild,
                "el-sys",
            ))
            .await
            .unwrap();

        assert_eq!(
            engine.compute(&plan.id).await.unwrap(),
            Some(StatusTransition::Fail)
        );
        engine.apply(&plan.id, "el-sys").await.unwrap();
        let element = store.require(&plan.id).await.unwrap();
        assert_eq!(element.as_plan().unwrap().status, PlanStatus::Cancelled);
    }
}
