//! Task assignment: plan membership, claim-from-team, reassignment.
//!
//! A task assigned to a team is claimable by any member; the first
//! qualified claimant wins because the whole claim (precondition check,
//! assignee transfer, metadata, event) runs in one immediate
//! transaction against the single-writer store. All mutations are
//! idempotent up to equality on target state.

use chrono::Utc;
use rusqlite::TransactionBehavior;
use serde_json::json;
use tracing::{debug, info};

use crate::models::{
    Dependency, DependencyType, Element, ElementKind, EventType, PlanStatus,
};
use crate::storage::{rows, ElementStore};
use crate::{FoundryError, Result};

#[derive(Clone)]
pub struct AssignmentService {
    store: ElementStore,
}

impl AssignmentService {
    pub fn new(store: ElementStore) -> Self {
        Self { store }
    }

    /// Attach a task to a plan via a parent-child edge. Re-adding an
    /// existing membership is a no-op.
    pub async fn add_task_to_plan(
        &self,
        task_id: &str,
        plan_id: &str,
        actor: &str,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let plan_id = plan_id.to_string();
        let actor = actor.to_string();

        self.store
            .database()
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let plan = rows::get_element(&tx, &plan_id)?
                    .ok_or_else(|| FoundryError::NotFound(plan_id.clone()))?;
                let plan_data = plan
                    .as_plan()
                    .ok_or_else(|| FoundryError::InvalidInput(format!("{plan_id} is not a plan")))?;
                if plan_data.status == PlanStatus::Cancelled {
                    return Err(FoundryError::Validation(format!(
                        "plan {plan_id} is cancelled"
                    )));
                }

                let task = rows::get_element(&tx, &task_id)?
                    .ok_or_else(|| FoundryError::NotFound(task_id.clone()))?;
                if task.as_task().is_none() {
                    return Err(FoundryError::InvalidInput(format!(
                        "{task_id} is not a task"
                    )));
                }

                let existing =
                    rows::deps_where_blocked(&tx, &task_id, Some(DependencyType::ParentChild))?;
                if existing.iter().any(|d| d.blocker_id == plan_id) {
                    debug!(task = %task_id, plan = %plan_id, "task already in plan");
                    return Ok(());
                }

                rows::insert_dependency(
                    &tx,
                    &Dependency {
                        blocked_id: task_id.clone(),
                        blocker_id: plan_id.clone(),
                        dep_type: DependencyType::ParentChild,
                        created_at: Utc::now(),
                        created_by: actor.clone(),
                        metadata: Default::default(),
                    },
                )?;
                rows::mark_dirty(&tx, &task_id)?;
                rows::append_event(
                    &tx,
                    &plan_id,
                    EventType::PlanTaskAdded,
                    &actor,
                    None,
                    Some(&json!({ "taskId": task_id })),
                )?;

                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Detach a task from a plan. Removing an absent membership is a
    /// no-op.
    pub async fn remove_task_from_plan(
        &self,
        task_id: &str,
        plan_id: &str,
        actor: &str,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let plan_id = plan_id.to_string();
        let actor = actor.to_string();

        self.store
            .database()
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let removed = rows::delete_dependency(
                    &tx,
                    &task_id,
                    &plan_id,
                    DependencyType::ParentChild,
                )?;
                if removed {
                    rows::mark_dirty(&tx, &task_id)?;
                    rows::append_event(
                        &tx,
                        &plan_id,
                        EventType::PlanTaskRemoved,
                        &actor,
                        Some(&json!({ "taskId": task_id })),
                        None,
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Claim a team-assigned task for `claimant_id`.
    ///
    /// Preconditions: the task's assignee resolves to a team and the
    /// claimant is a member. On success the assignee becomes the
    /// claimant and `metadata.claimedFromTeam` records the team. A
    /// repeat claim by the same claimant is a no-op; a claim of a task
    /// already held by someone else fails ALREADY_ASSIGNED.
    pub async fn claim_task_from_team(
        &self,
        task_id: &str,
        claimant_id: &str,
        actor: &str,
    ) -> Result<Element> {
        let task_id = task_id.to_string();
        let claimant_id = claimant_id.to_string();
        let actor = actor.to_string();

        let claimed = self
            .store
            .database()
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let mut task_el = rows::get_element(&tx, &task_id)?
                    .ok_or_else(|| FoundryError::NotFound(task_id.clone()))?;
                let assignee = task_el
                    .as_task()
                    .ok_or_else(|| FoundryError::InvalidInput(format!("{task_id} is not a task")))?
                    .assignee
                    .clone()
                    .ok_or_else(|| {
                        FoundryError::InvalidInput(format!("task {task_id} has no assignee"))
                    })?;

                let assignee_el = rows::get_element(&tx, &assignee)?
                    .ok_or_else(|| FoundryError::NotFound(assignee.clone()))?;

                let team = match &assignee_el.kind {
                    ElementKind::Team(team) => team,
                    _ => {
                        if assignee == claimant_id {
                            // Already ours; target state reached.
                            return Ok(task_el);
                        }
                        return Err(FoundryError::AlreadyAssigned {
                            task_id: task_id.clone(),
                            assignee,
                        });
                    }
                };

                if !team.members.contains(&claimant_id) {
                    return Err(FoundryError::Validation(format!(
                        "{claimant_id} is not a member of team {assignee}"
                    )));
                }
                if rows::get_element(&tx, &claimant_id)?.is_none() {
                    return Err(FoundryError::NotFound(claimant_id.clone()));
                }

                let team_id = assignee_el.id.clone();
                if let Some(task) = task_el.as_task_mut() {
                    task.assignee = Some(claimant_id.clone());
                }
                task_el
                    .metadata
                    .insert("claimedFromTeam".to_string(), json!(team_id));
                task_el.updated_at = Utc::now();

                rows::write_element(&tx, &task_el)?;
                rows::mark_dirty(&tx, &task_id)?;
                rows::append_event(
                    &tx,
                    &task_id,
                    EventType::Claimed,
                    &actor,
                    Some(&json!({ "assignee": team_id })),
                    Some(&json!({ "assignee": claimant_id, "claimedFromTeam": team_id })),
                )?;

                tx.commit()?;
                Ok(task_el)
            })
            .await?;

        info!(task = %claimed.id, claimant = %claimant_id_of(&claimed), "task claimed from team");
        Ok(claimed)
    }

    /// Direct reassignment; no team-membership check. Emits `assigned`.
    pub async fn reassign(
        &self,
        task_id: &str,
        new_assignee: &str,
        actor: &str,
    ) -> Result<Element> {
        let task_id = task_id.to_string();
        let new_assignee = new_assignee.to_string();
        let actor = actor.to_string();

        self.store
            .database()
            .execute_mut(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let mut task_el = rows::get_element(&tx, &task_id)?
                    .ok_or_else(|| FoundryError::NotFound(task_id.clone()))?;
                let old_assignee = task_el
                    .as_task()
                    .ok_or_else(|| FoundryError::InvalidInput(format!("{task_id} is not a task")))?
                    .assignee
                    .clone();

                if old_assignee.as_deref() == Some(new_assignee.as_str()) {
                    return Ok(task_el);
                }
                if rows::get_element(&tx, &new_assignee)?.is_none() {
                    return Err(FoundryError::NotFound(new_assignee.clone()));
                }

                if let Some(task) = task_el.as_task_mut() {
                    task.assignee = Some(new_assignee.clone());
                }
                task_el.updated_at = Utc::now();

                rows::write_element(&tx, &task_el)?;
                rows::mark_dirty(&tx, &task_id)?;
                rows::append_event(
                    &tx,
                    &task_id,
                    EventType::Assigned,
                    &actor,
                    Some(&json!({ "assignee": old_assignee })),
                    Some(&json!({ "assignee": new_assignee })),
                )?;

                tx.commit()?;
                Ok(task_el)
            })
            .await
    }
}

fn claimant_id_of(task: &Element) -> String {
    task.as_task()
        .and_then(|t| t.assignee.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        EntityData, EntityType, PlanData, TaskData, TeamData,
    };
    use crate::storage::Database;
    use std::collections::BTreeSet;

    async fn fixtures() -> (ElementStore, AssignmentService) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = ElementStore::new(db);
        (store.clone(), AssignmentService::new(store))
    }

    async fn entity(store: &ElementStore, name: &str) -> String {
        store
            .create(Element::new(
                ElementKind::Entity(EntityData {
                    name: name.to_string(),
                    entity_type: EntityType::Agent,
                    is_active: Some(true),
                }),
                "el-sys",
            ))
            .await
            .unwrap()
            .id
    }

    async fn team_task(
        store: &ElementStore,
    ) -> (String, String, String, String) {
        let m1 = entity(store, "m1").await;
        let m2 = entity(store, "m2").await;
        let team = store
            .create(Element::new(
                ElementKind::Team(TeamData {
                    name: "crew".to_string(),
                    members: BTreeSet::from([m1.clone(), m2.clone()]),
                }),
                "el-sys",
            ))
            .await
            .unwrap();

        let mut data = TaskData::new("shared work");
        data.assignee = Some(team.id.clone());
        let task = store
            .create(Element::new(ElementKind::Task(data), "el-sys"))
            .await
            .unwrap();
        (task.id, team.id, m1, m2)
    }

    #[tokio::test]
    async fn first_claim_wins_second_gets_already_assigned() {
        let (store, service) = fixtures().await;
        let (task, team, m1, m2) = team_task(&store).await;

        let claimed = service.claim_task_from_team(&task, &m1, &m1).await.unwrap();
        assert_eq!(claimed.as_task().unwrap().assignee.as_deref(), Some(m1.as_str()));
        assert_eq!(
            claimed.metadata.get("claimedFromTeam"),
            Some(&json!(team))
        );

        let err = service.claim_task_from_team(&task, &m2, &m2).await.unwrap_err();
        match err {
            FoundryError::AlreadyAssigned { assignee, .. } => assert_eq!(assignee, m1),
            other => panic!("expected AlreadyAssigned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn racing_claims_produce_exactly_one_winner() {
        let (store, service) = fixtures().await;
        let (task, _, m1, m2) = team_task(&store).await;

        let (r1, r2) = tokio::join!(
            service.claim_task_from_team(&task, &m1, &m1),
            service.claim_task_from_team(&task, &m2, &m2),
        );

        let successes = [r1.is_ok(), r2.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);

        let winner = store.require(&task).await.unwrap();
        let assignee = winner.as_task().unwrap().assignee.clone().unwrap();
        assert!(assignee == m1 || assignee == m2);
    }

    #[tokio::test]
    async fn repeat_claim_by_winner_is_a_no_op() {
        let (store, service) = fixtures().await;
        let (task, _, m1, _) = team_task(&store).await;

        service.claim_task_from_team(&task, &m1, &m1).await.unwrap();
        let again = service.claim_task_from_team(&task, &m1, &m1).await.unwrap();
        assert_eq!(again.as_task().unwrap().assignee.as_deref(), Some(m1.as_str()));

        let events = store.events_for(&task).await.unwrap();
        let claims = events
            .iter()
            .filter(|e| e.event_type == EventType::Claimed)
            .count();
        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn non_member_cannot_claim() {
        let (store, service) = fixtures().await;
        let (task, _, _, _) = team_task(&store).await;
        let outsider = entity(&store, "outsider").await;

        let err = service
            .claim_task_from_team(&task, &outsider, &outsider)
            .await
            .unwrap_err();
        assert!(matches!(err, FoundryError::Validation(_)));
    }

    #[tokio::test]
    async fn plan_membership_round_trip() {
        let (store, service) = fixtures().await;
        let plan = store
            .create(Element::new(
                ElementKind::Plan(PlanData {
                    title: "q3".to_string(),
                    status: PlanStatus::Active,
                }),
                "el-sys",
            ))
            .await
            .unwrap();
        let task = store
            .create(Element::new(ElementKind::Task(TaskData::new("t")), "el-sys"))
            .await
            .unwrap();

        service.add_task_to_plan(&task.id, &plan.id, "el-sys").await.unwrap();
        // Re-adding is a no-op, not a duplicate error.
        service.add_task_to_plan(&task.id, &plan.id, "el-sys").await.unwrap();

        service
            .remove_task_from_plan(&task.id, &plan.id, "el-sys")
            .await
            .unwrap();
        service
            .remove_task_from_plan(&task.id, &plan.id, "el-sys")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_plan_rejects_new_tasks() {
        let (store, service) = fixtures().await;
        let plan = store
            .create(Element::new(
                ElementKind::Plan(PlanData {
                    title: "dead".to_string(),
                    status: PlanStatus::Cancelled,
                }),
                "el-sys",
            ))
            .await
            .unwrap();
        let task = store
            .create(Element::new(ElementKind::Task(TaskData::new("t")), "el-sys"))
            .await
            .unwrap();

        let err = service
            .add_task_to_plan(&task.id, &plan.id, "el-sys")
            .await
            .unwrap_err();
        assert!(matches!(err, FoundryError::Validation(_)));
    }

    #[tokio::test]
    async fn reassign_skips_membership_checks() {
        let (store, service) = fixtures().await;
        let (task, _, _, _) = team_task(&store).await;
        let anyone = entity(&store, "anyone").await;

        let updated = service.reassign(&task, &anyone, "el-sys").await.unwrap();
        assert_eq!(
            updated.as_task().unwrap().assignee.as_deref(),
            Some(anyone.as_str())
        );
    }
}
