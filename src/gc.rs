//! Age-based removal of finished ephemeral workflows.
//!
//! A workflow is collectable once it is ephemeral, terminal, and its
//! `finished_at` is older than the configured age. Collection removes
//! the child tasks, every dependency touching the workflow or its
//! children, then the workflow itself. Dry runs are pure queries.

use chrono::{Duration, Utc};
use rusqlite::TransactionBehavior;
use serde_json::json;
use tracing::{debug, info};

use crate::models::{DependencyType, ElementFilter, ElementType, EventType};
use crate::storage::{rows, ElementStore};
use crate::Result;

#[derive(Debug, Clone)]
pub struct GcOptions {
    pub max_age_ms: i64,
    pub dry_run: bool,
    pub limit: Option<usize>,
}

impl GcOptions {
    pub fn max_age_ms(max_age_ms: i64) -> Self {
        Self {
            max_age_ms,
            dry_run: false,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub deleted_workflow_ids: Vec<String>,
    pub deleted_task_ids: Vec<String>,
    pub removed_dependencies: usize,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct GarbageCollector {
    store: ElementStore,
}

impl GarbageCollector {
    pub fn new(store: ElementStore) -> Self {
        Self { store }
    }

    pub async fn garbage_collect(&self, options: GcOptions, actor: &str) -> Result<GcReport> {
        let cutoff = Utc::now() - Duration::milliseconds(options.max_age_ms);

        let mut candidates: Vec<(String, chrono::DateTime<Utc>)> = self
            .store
            .list(ElementFilter::of_type(ElementType::Workflow))
            .await?
            .into_iter()
            .filter_map(|element| {
                let workflow = element.as_workflow()?;
                if !workflow.ephemeral || !workflow.status.is_terminal() {
                    return None;
                }
                let finished_at = workflow.finished_at?;
                if finished_at <= cutoff {
                    Some((element.id, finished_at))
                } else {
                    None
                }
            })
            .collect();
        candidates.sort_by_key(|(_, finished_at)| *finished_at);
        if let Some(limit) = options.limit {
            candidates.truncate(limit);
        }

        if candidates.is_empty() {
            return Ok(GcReport {
                dry_run: options.dry_run,
                ..Default::default()
            });
        }

        let dry_run = options.dry_run;
        let actor = actor.to_string();
        let report = self
            .store
            .database()
            .execute_mut(move |conn| {
                let mut report = GcReport {
                    dry_run,
                    ..Default::default()
                };

                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                for (workflow_id, _) in candidates {
                    let children: Vec<String> = rows::deps_where_blocker(
                        &tx,
                        &workflow_id,
                        Some(DependencyType::ParentChild),
                    )?
                    .into_iter()
                    .map(|d| d.blocked_id)
                    .collect();

                    let mut removed_deps = 0;
                    if !dry_run {
                        for child in &children {
                            removed_deps += rows::delete_deps_involving(&tx, child)?;
                            rows::delete_element(&tx, child)?;
                            rows::mark_dirty(&tx, child)?;
                        }
                        removed_deps += rows::delete_deps_involving(&tx, &workflow_id)?;
                        rows::delete_element(&tx, &workflow_id)?;
                        rows::mark_dirty(&tx, &workflow_id)?;
                        rows::append_event(
                            &tx,
                            &workflow_id,
                            EventType::GcRemoved,
                            &actor,
                            None,
                            Some(&json!({ "children": children })),
                        )?;
                    } else {
                        // Pure query: count what a real pass would
                        // remove.
                        for child in &children {
                            removed_deps += rows::deps_involving(&tx, child)?.len();
                        }
                        removed_deps += rows::deps_involving(&tx, &workflow_id)?
                            .iter()
                            .filter(|d| {
                                // Edges to children were already counted.
                                !children.contains(&d.blocked_id)
                                    && !children.contains(&d.blocker_id)
                            })
                            .count();
                    }

                    debug!(
                        workflow = %workflow_id,
                        children = children.len(),
                        dry_run,
                        "workflow collected"
                    );
                    report.deleted_task_ids.extend(children);
                    report.deleted_workflow_ids.push(workflow_id);
                    report.removed_dependencies += removed_deps;
                }
                tx.commit()?;
                Ok(report)
            })
            .await?;

        info!(
            workflows = report.deleted_workflow_ids.len(),
            tasks = report.deleted_task_ids.len(),
            dry_run = report.dry_run,
            "garbage collection pass finished"
        );
        Ok(report)
    }
}
