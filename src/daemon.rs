//! The dispatch daemon: a single periodic control loop that matches
//! ready tasks to available workers, drives session lifecycle, fires
//! steward schedules, delivers inboxes, and runs GC.
//!
//! One tick at a time, never overlapping. Within a tick the sub-steps
//! run in a fixed order — reconcile (first tick only), reap, auto-
//! status sweep, ready query, match, drain, stewards, inbox, gc — and
//! a failure in one matched task or one steward is logged and skipped
//! without aborting the tick.

use chrono::{DateTime, Utc};
use cron::Schedule;
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::assignment::AssignmentService;
use crate::autostatus::AutoStatusEngine;
use crate::constants::{BUSY_RETRY_BACKOFF_MS, BUSY_RETRY_LIMIT};
use crate::gc::{GarbageCollector, GcOptions};
use crate::graph::DependencyGraph;
use crate::messaging::MessagingService;
use crate::models::{
    AgentProfile, AgentRole, AgentSessionStatus, Element, ElementFilter, ElementKind,
    ElementType, EventType, TaskStatus,
};
use crate::readiness::{ReadinessQuery, ReadinessService};
use crate::session::{SessionManager, SessionStatus, StartOptions};
use crate::storage::ElementStore;
use crate::worktree::WorktreeManager;
use crate::{FoundryError, Result};

/// Every service the daemon coordinates, wired once at startup. There
/// is no process-global state.
#[derive(Clone)]
pub struct Services {
    pub store: ElementStore,
    pub graph: DependencyGraph,
    pub readiness: ReadinessService,
    pub autostatus: AutoStatusEngine,
    pub assignment: AssignmentService,
    pub worktrees: WorktreeManager,
    pub sessions: SessionManager,
    pub messaging: MessagingService,
    pub gc: GarbageCollector,
}

impl Services {
    /// Standard wiring over one store.
    pub fn new(
        store: ElementStore,
        worktrees: WorktreeManager,
        sessions: SessionManager,
    ) -> Self {
        Self {
            graph: DependencyGraph::new(store.clone()),
            readiness: ReadinessService::new(store.clone()),
            autostatus: AutoStatusEngine::new(store.clone()),
            assignment: AssignmentService::new(store.clone()),
            messaging: MessagingService::new(store.clone()),
            gc: GarbageCollector::new(store.clone()),
            store,
            worktrees,
            sessions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub tick_period: Duration,
    /// None disables reaping.
    pub max_session_duration: Option<Duration>,
    pub task_retry_budget: u32,
    pub gc_tick_interval: u64,
    pub gc_max_age_ms: i64,
    /// Base ref for task worktree branches.
    pub base_ref: String,
    /// Entity id the daemon acts as.
    pub actor: String,
    pub shutdown_grace: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(crate::constants::TICK_PERIOD_MS),
            max_session_duration: None,
            task_retry_budget: crate::constants::DEFAULT_TASK_RETRY_BUDGET,
            gc_tick_interval: crate::constants::GC_TICK_INTERVAL,
            gc_max_age_ms: crate::constants::GC_DEFAULT_MAX_AGE_MS,
            base_ref: "main".to_string(),
            actor: "el-system".to_string(),
            shutdown_grace: Duration::from_millis(crate::constants::SHUTDOWN_DEADLINE_MS),
        }
    }
}

struct DaemonState {
    tick_count: u64,
    reconciled: bool,
    /// Last evaluation instant per (steward, trigger expression).
    trigger_cursors: HashMap<(String, String), DateTime<Utc>>,
    loop_handle: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Clone)]
pub struct Daemon {
    services: Services,
    settings: DaemonSettings,
    state: Arc<Mutex<DaemonState>>,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(services: Services, settings: DaemonSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            services,
            settings,
            state: Arc::new(Mutex::new(DaemonState {
                tick_count: 0,
                reconciled: false,
                trigger_cursors: HashMap::new(),
                loop_handle: None,
            })),
            shutdown,
        }
    }

    /// Start the tick loop. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.loop_handle.is_some() {
            debug!("daemon already running");
            return Ok(());
        }
        let _ = self.shutdown.send(false);

        let daemon = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(daemon.settings.tick_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = daemon.tick().await {
                            error!("tick scaffolding failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("dispatch loop exited");
        });
        state.loop_handle = Some(handle);
        info!(period = ?self.settings.tick_period, "dispatch daemon started");
        Ok(())
    }

    /// Stop the loop: the in-flight tick finishes (bounded by the
    /// shutdown grace), then all running sessions are stopped
    /// gracefully. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let handle = {
            let mut state = self.state.lock().await;
            state.loop_handle.take()
        };
        let _ = self.shutdown.send(true);

        if let Some(handle) = handle {
            if tokio::time::timeout(self.settings.shutdown_grace, handle)
                .await
                .is_err()
            {
                warn!("tick did not finish within the shutdown grace");
            }
        }
        self.services.sessions.stop_all("daemon-shutdown").await?;
        info!("dispatch daemon stopped");
        Ok(())
    }

    /// One full tick. Public so operators and tests can single-step.
    pub async fn tick(&self) -> Result<()> {
        let tick_count = {
            let mut state = self.state.lock().await;
            state.tick_count += 1;
            state.tick_count
        };
        debug!(tick = tick_count, "tick begin");

        // 1. Reconcile once on the first tick.
        let needs_reconcile = {
            let mut state = self.state.lock().await;
            if state.reconciled {
                false
            } else {
                state.reconciled = true;
                true
            }
        };
        if needs_reconcile {
            let report = self.services.sessions.reconcile_on_startup().await?;
            if report.reconciled > 0 || !report.errors.is_empty() {
                info!(
                    reconciled = report.reconciled,
                    errors = report.errors.len(),
                    "startup reconcile"
                );
            }
        }

        // 2. Reap sessions over the duration ceiling.
        self.reap_stale_sessions().await?;

        // Aggregate statuses follow their children before dispatch
        // decisions are made on them.
        if let Err(e) = self.services.autostatus.sweep(&self.settings.actor).await {
            warn!("auto-status sweep failed: {e}");
        }

        // 3 + 4 + 5. Ready tasks to available workers.
        self.match_ready_tasks().await?;

        // 6. Drain sessions that terminated since last tick.
        self.drain_terminated_sessions().await?;

        // 7. Steward schedules.
        self.fire_steward_triggers().await?;

        // 8. Inbox delivery.
        self.process_inboxes().await?;

        // 9. Low-frequency GC.
        if tick_count % self.settings.gc_tick_interval == 0 {
            if let Err(e) = self
                .services
                .gc
                .garbage_collect(
                    GcOptions::max_age_ms(self.settings.gc_max_age_ms),
                    &self.settings.actor,
                )
                .await
            {
                warn!("gc pass failed: {e}");
            }
        }

        debug!(tick = tick_count, "tick end");
        Ok(())
    }

    async fn reap_stale_sessions(&self) -> Result<()> {
        let max_duration = match self.settings.max_session_duration {
            Some(d) => d,
            None => return Ok(()),
        };

        let running = self
            .services
            .sessions
            .list_sessions(None, None, Some(SessionStatus::Running))
            .await?;
        let now = Utc::now();
        for session in running {
            let started = session.started_at.unwrap_or(session.created_at);
            let age = (now - started).to_std().unwrap_or_default();
            if age > max_duration {
                warn!(session = %session.id, ?age, "session exceeded max duration, reaping");
                if let Err(e) = self
                    .services
                    .sessions
                    .stop_session(&session.id, true, Some("session-exceeded-max-duration"))
                    .await
                {
                    warn!(session = %session.id, "reap failed: {e}");
                }
            }
        }
        Ok(())
    }

    async fn match_ready_tasks(&self) -> Result<()> {
        let ready = self
            .services
            .readiness
            .ready_tasks(ReadinessQuery::default())
            .await?;
        if ready.is_empty() {
            return Ok(());
        }

        let mut workers = self.available_workers().await?;
        // Tasks matched this tick count against the concurrency cap.
        let mut matched_this_tick: HashMap<String, u32> = HashMap::new();

        for task in ready {
            // An in_progress task with a session record is either being
            // worked (live session) or awaiting the drain step's retry
            // decision (terminated session); either way it is not
            // matchable this tick.
            let in_progress = task
                .as_task()
                .map(|t| t.status == TaskStatus::InProgress)
                .unwrap_or(false);
            if in_progress && self.task_has_session_record(&task.id).await? {
                continue;
            }

            let worker_id = match self.pick_worker(&task, &workers, &matched_this_tick).await? {
                Some(id) => id,
                None => continue,
            };

            match self.dispatch(&task, &worker_id).await {
                Ok(()) => {
                    *matched_this_tick.entry(worker_id.clone()).or_insert(0) += 1;
                    workers.retain(|w| {
                        w.id != worker_id || self.worker_has_capacity(w, &matched_this_tick)
                    });
                }
                Err(e) => {
                    warn!(task = %task.id, worker = %worker_id, "dispatch failed: {e}");
                }
            }
        }
        Ok(())
    }

    /// Idle, active, non-rate-limited workers, least recently used
    /// first.
    async fn available_workers(&self) -> Result<Vec<Element>> {
        let entities = self
            .services
            .store
            .list(ElementFilter::of_type(ElementType::Entity))
            .await?;
        let now = Utc::now();

        let mut workers: Vec<(Element, Option<DateTime<Utc>>)> = Vec::new();
        for element in entities {
            let entity = match element.as_entity() {
                Some(e) => e,
                None => continue,
            };
            if entity.is_active == Some(false) {
                continue;
            }
            let profile = match AgentProfile::from_element(&element) {
                Some(p) => p,
                None => continue,
            };
            if profile.role != AgentRole::Worker
                || profile.session_status != AgentSessionStatus::Idle
            {
                continue;
            }
            if let Some(reset_at) = profile.rate_limit_reset_at {
                if reset_at > now {
                    continue;
                }
            }
            workers.push((element, profile.last_dispatched_at));
        }

        workers.sort_by_key(|(_, last)| last.unwrap_or(DateTime::<Utc>::MIN_UTC));
        Ok(workers.into_iter().map(|(element, _)| element).collect())
    }

    async fn pick_worker(
        &self,
        task: &Element,
        workers: &[Element],
        matched_this_tick: &HashMap<String, u32>,
    ) -> Result<Option<String>> {
        let assignee = task.as_task().and_then(|t| t.assignee.clone());

        match assignee {
            None => {
                for worker in workers {
                    if self.worker_has_capacity(worker, matched_this_tick)
                        && self.within_concurrency_cap(worker, matched_this_tick).await?
                    {
                        return Ok(Some(worker.id.clone()));
                    }
                }
                Ok(None)
            }
            Some(assignee_id) => {
                let assignee_el = match self.services.store.get(&assignee_id).await? {
                    Some(el) => el,
                    None => return Ok(None),
                };
                match &assignee_el.kind {
                    ElementKind::Team(team) => {
                        for worker in workers {
                            if team.members.contains(&worker.id)
                                && self.worker_has_capacity(worker, matched_this_tick)
                                && self
                                    .within_concurrency_cap(worker, matched_this_tick)
                                    .await?
                            {
                                return Ok(Some(worker.id.clone()));
                            }
                        }
                        Ok(None)
                    }
                    ElementKind::Entity(_) => {
                        // Direct assignee: skip while its session runs.
                        if self
                            .services
                            .sessions
                            .active_session(&assignee_id)
                            .await?
                            .is_some()
                        {
                            return Ok(None);
                        }
                        for worker in workers {
                            if worker.id == assignee_id
                                && self.worker_has_capacity(worker, matched_this_tick)
                                && self
                                    .within_concurrency_cap(worker, matched_this_tick)
                                    .await?
                            {
                                return Ok(Some(worker.id.clone()));
                            }
                        }
                        Ok(None)
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    fn worker_has_capacity(
        &self,
        worker: &Element,
        matched_this_tick: &HashMap<String, u32>,
    ) -> bool {
        let cap = AgentProfile::from_element(worker)
            .and_then(|p| p.max_concurrent_tasks)
            .unwrap_or(1);
        matched_this_tick.get(&worker.id).copied().unwrap_or(0) < cap
    }

    async fn within_concurrency_cap(
        &self,
        worker: &Element,
        matched_this_tick: &HashMap<String, u32>,
    ) -> Result<bool> {
        let cap = AgentProfile::from_element(worker)
            .and_then(|p| p.max_concurrent_tasks)
            .unwrap_or(1);

        let mut filter = ElementFilter::of_type(ElementType::Task);
        filter.status = Some("in_progress".to_string());
        let in_progress = self.services.store.list(filter).await?;
        let held = in_progress
            .iter()
            .filter(|t| {
                t.as_task()
                    .and_then(|d| d.assignee.as_deref())
                    .map(|a| a == worker.id)
                    .unwrap_or(false)
            })
            .count() as u32;

        Ok(held + matched_this_tick.get(&worker.id).copied().unwrap_or(0) < cap)
    }

    async fn task_has_session_record(&self, task_id: &str) -> Result<bool> {
        let sessions = self
            .services
            .sessions
            .list_sessions(None, None, None)
            .await?;
        Ok(sessions
            .iter()
            .any(|s| s.task_id.as_deref() == Some(task_id)))
    }

    /// One matched (task, worker) pair: worktree, claim, status flip,
    /// session, event. Compensates on late failure by reopening the
    /// task.
    async fn dispatch(&self, task: &Element, worker_id: &str) -> Result<()> {
        let actor = self.settings.actor.clone();

        // a. Worktree; a leftover path from a crashed attempt is
        // replaced.
        let worktree = match self
            .services
            .worktrees
            .create_worktree(&task.id, &self.settings.base_ref, false)
            .await
        {
            Ok(wt) => wt,
            Err(FoundryError::AlreadyExists(_)) => {
                warn!(task = %task.id, "stale worktree found, recreating");
                self.services.worktrees.remove_for_task(&task.id).await?;
                self.services
                    .worktrees
                    .create_worktree(&task.id, &self.settings.base_ref, true)
                    .await?
            }
            Err(e) => return Err(e),
        };

        // b. Claim / assign, with bounded busy retry.
        let assignee = task.as_task().and_then(|t| t.assignee.clone());
        let is_team_assignment = match &assignee {
            Some(id) => self
                .services
                .store
                .get(id)
                .await?
                .map(|el| el.as_team().is_some())
                .unwrap_or(false),
            None => false,
        };
        let task_id = task.id.as_str();
        let actor_ref = actor.as_str();
        let assignee_ref = assignee.as_deref();
        let services = &self.services;
        let claim_result = with_busy_retry(|| async move {
            if is_team_assignment {
                services
                    .assignment
                    .claim_task_from_team(task_id, worker_id, actor_ref)
                    .await
                    .map(|_| ())
            } else if assignee_ref != Some(worker_id) {
                services
                    .assignment
                    .reassign(task_id, worker_id, actor_ref)
                    .await
                    .map(|_| ())
            } else {
                Ok(())
            }
        })
        .await;
        if let Err(e) = claim_result {
            let _ = self.services.worktrees.remove_for_task(&task.id).await;
            return Err(e);
        }

        // c. Task → in_progress.
        let flip_result = self
            .services
            .store
            .update(&task.id, &actor, |element| {
                if let Some(task) = element.as_task_mut() {
                    task.status = TaskStatus::InProgress;
                }
                Ok(())
            })
            .await;
        if let Err(e) = flip_result {
            let _ = self.services.worktrees.remove_for_task(&task.id).await;
            return Err(e);
        }

        // d. Start or resume a session in the worktree.
        let prompt = self.build_task_prompt(task).await?;
        let options = StartOptions {
            worktree: Some(worktree.path.clone()),
            task_id: Some(task.id.clone()),
            initial_prompt: Some(prompt),
            ..Default::default()
        };
        let resumable = self
            .services
            .sessions
            .most_recent_resumable_session(worker_id)
            .await?
            .filter(|s| s.task_id.is_none());
        let session_result = match resumable {
            Some(previous) => {
                let provider = previous.provider_session_id.clone().unwrap_or_default();
                self.services
                    .sessions
                    .resume_session(worker_id, &provider, options)
                    .await
            }
            None => self.services.sessions.start_session(worker_id, options).await,
        };
        let started = match session_result {
            Ok(started) => started,
            Err(e) => {
                // Compensate: reopen the task so the next tick retries.
                let _ = self
                    .services
                    .store
                    .update(&task.id, &actor, |element| {
                        if let Some(task) = element.as_task_mut() {
                            task.status = TaskStatus::Open;
                        }
                        Ok(())
                    })
                    .await;
                let _ = self.services.worktrees.remove_for_task(&task.id).await;
                return Err(e);
            }
        };

        // e + f. Dispatch event and LRU bookkeeping.
        self.services
            .store
            .record_event(
                &task.id,
                EventType::TaskDispatched,
                &actor,
                None,
                Some(json!({
                    "workerId": worker_id,
                    "sessionId": started.session.id,
                    "worktree": worktree.path.to_string_lossy(),
                })),
            )
            .await?;
        self.services
            .store
            .update(worker_id, &actor, |element| {
                if let Some(mut profile) = AgentProfile::from_element(element) {
                    profile.last_dispatched_at = Some(Utc::now());
                    profile.write_to(element);
                }
                Ok(())
            })
            .await?;

        self.services
            .autostatus
            .run_for_parents_of(&task.id, &actor)
            .await?;

        info!(task = %task.id, worker = %worker_id, session = %started.session.id, "task dispatched");
        Ok(())
    }

    async fn build_task_prompt(&self, task: &Element) -> Result<String> {
        let data = task
            .as_task()
            .ok_or_else(|| FoundryError::InvalidInput(format!("{} is not a task", task.id)))?;
        let mut prompt = format!("Task {}: {}", task.id, data.title);
        if let Some(doc_ref) = &data.description_ref {
            if let Some(doc) = self.services.store.get(doc_ref).await? {
                if let Some(document) = doc.as_document() {
                    prompt.push_str("\n\n");
                    prompt.push_str(&document.content);
                }
            }
        }
        Ok(prompt)
    }

    async fn drain_terminated_sessions(&self) -> Result<()> {
        let terminated = self.services.sessions.take_undrained_terminated().await?;
        for session in terminated {
            let task_id = match &session.task_id {
                Some(id) => id.clone(),
                None => continue,
            };

            if let Err(e) = self.drain_one(&task_id, &session.id).await {
                warn!(task = %task_id, session = %session.id, "drain failed: {e}");
            }
        }
        Ok(())
    }

    async fn drain_one(&self, task_id: &str, session_id: &str) -> Result<()> {
        let actor = self.settings.actor.clone();
        let task = match self.services.store.get(task_id).await? {
            Some(t) => t,
            None => return Ok(()),
        };
        let status = match task.as_task() {
            Some(data) => data.status,
            None => return Ok(()),
        };

        if status == TaskStatus::InProgress {
            // The session ended without closing its task: retry until
            // the budget runs out, then tombstone.
            let attempts = task
                .metadata
                .get("dispatchAttempts")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32
                + 1;
            let budget = self.settings.task_retry_budget;
            let exhausted = attempts >= budget;

            self.services
                .store
                .update(task_id, &actor, move |element| {
                    element
                        .metadata
                        .insert("dispatchAttempts".to_string(), json!(attempts));
                    if let Some(task) = element.as_task_mut() {
                        task.status = if exhausted {
                            TaskStatus::Tombstone
                        } else {
                            TaskStatus::Open
                        };
                    }
                    Ok(())
                })
                .await?;
            if exhausted {
                warn!(task = %task_id, attempts, "retry budget exhausted, task tombstoned");
            } else {
                info!(task = %task_id, attempts, budget, "abnormal session exit, task reopened");
            }
        } else {
            debug!(task = %task_id, session = %session_id, status = ?status, "session drained");
        }

        // Worktree cleanup is best-effort.
        if let Err(e) = self.services.worktrees.remove_for_task(task_id).await {
            warn!(task = %task_id, "worktree cleanup failed: {e}");
        }

        self.services
            .autostatus
            .run_for_parents_of(task_id, &actor)
            .await?;
        Ok(())
    }

    async fn fire_steward_triggers(&self) -> Result<()> {
        let entities = self
            .services
            .store
            .list(ElementFilter::of_type(ElementType::Entity))
            .await?;
        let now = Utc::now();

        for element in entities {
            let profile = match AgentProfile::from_element(&element) {
                Some(p) => p,
                None => continue,
            };
            if profile.role != AgentRole::Steward || profile.triggers.is_empty() {
                continue;
            }
            if element.as_entity().map(|e| e.is_active == Some(false)).unwrap_or(true) {
                continue;
            }

            for trigger in &profile.triggers {
                let due = {
                    let mut state = self.state.lock().await;
                    let cursor = state
                        .trigger_cursors
                        .entry((element.id.clone(), trigger.clone()))
                        .or_insert(now);
                    let due = trigger_due(trigger, *cursor, now);
                    *cursor = now;
                    due
                };
                let fire_time = match due {
                    Some(t) => t,
                    None => continue,
                };

                if self
                    .services
                    .sessions
                    .active_session(&element.id)
                    .await?
                    .is_some()
                {
                    debug!(steward = %element.id, "steward busy, trigger skipped");
                    continue;
                }

                let options = StartOptions {
                    initial_prompt: Some(format!(
                        "Scheduled trigger '{trigger}' fired at {fire_time}"
                    )),
                    ..Default::default()
                };
                match self.services.sessions.start_session(&element.id, options).await {
                    Ok(started) => {
                        self.services
                            .store
                            .record_event(
                                &element.id,
                                EventType::StewardTriggered,
                                &self.settings.actor,
                                None,
                                Some(json!({
                                    "trigger": trigger,
                                    "firedAt": fire_time.to_rfc3339(),
                                    "sessionId": started.session.id,
                                })),
                            )
                            .await?;
                        info!(steward = %element.id, trigger, "steward trigger fired");
                    }
                    Err(e) => {
                        warn!(steward = %element.id, trigger, "steward spawn failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_inboxes(&self) -> Result<()> {
        let entities = self
            .services
            .store
            .list(ElementFilter::of_type(ElementType::Entity))
            .await?;

        for element in entities {
            let profile = match AgentProfile::from_element(&element) {
                Some(p) => p,
                None => continue,
            };
            if profile.session_status != AgentSessionStatus::Idle {
                continue;
            }

            let unread = self.services.messaging.unread_for(&element.id).await?;
            if unread.is_empty() {
                continue;
            }

            let mut prompt = format!("You have {} unread message(s):\n", unread.len());
            for item in &unread {
                if let Some(data) = item.as_inbox_item() {
                    if let Some(message) = self.services.store.get(&data.message_id).await? {
                        let body = self
                            .services
                            .messaging
                            .message_content(&message)
                            .await
                            .unwrap_or_default();
                        prompt.push_str(&format!("- [{}] {body}\n", data.channel_id));
                    }
                }
            }

            let options = StartOptions {
                initial_prompt: Some(prompt),
                ..Default::default()
            };
            let resumable = self
                .services
                .sessions
                .most_recent_resumable_session(&element.id)
                .await?
                .filter(|s| s.task_id.is_none());
            let spawn = match resumable {
                Some(previous) => {
                    let provider = previous.provider_session_id.clone().unwrap_or_default();
                    self.services
                        .sessions
                        .resume_session(&element.id, &provider, options)
                        .await
                }
                None => {
                    self.services
                        .sessions
                        .start_session(&element.id, options)
                        .await
                }
            };

            match spawn {
                Ok(_) => {
                    // Spawn succeeded: the items were delivered.
                    for item in &unread {
                        if let Err(e) = self
                            .services
                            .messaging
                            .mark_as_read(&item.id, &self.settings.actor)
                            .await
                        {
                            warn!(item = %item.id, "mark-as-read failed: {e}");
                        }
                    }
                    info!(agent = %element.id, items = unread.len(), "inbox delivered");
                }
                Err(e) => {
                    warn!(agent = %element.id, "inbox session spawn failed: {e}");
                }
            }
        }
        Ok(())
    }
}

/// Five-field cron expressions get a seconds column prepended; six- or
/// seven-field expressions pass through.
fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// The trigger's first fire time in (last, now], if any.
fn trigger_due(
    expression: &str,
    last: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let schedule = match Schedule::from_str(&normalize_cron(expression)) {
        Ok(s) => s,
        Err(e) => {
            warn!(expression, "invalid cron trigger: {e}");
            return None;
        }
    };
    schedule.after(&last).next().filter(|t| *t <= now)
}

/// Retry DATABASE_BUSY a bounded number of times with jittered backoff.
async fn with_busy_retry<T, F, Fut>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        match operation().await {
            Err(e) if e.is_retryable() && attempts < BUSY_RETRY_LIMIT => {
                attempts += 1;
                let jitter = rand::thread_rng().gen_range(0..=BUSY_RETRY_BACKOFF_MS);
                tokio::time::sleep(Duration::from_millis(
                    BUSY_RETRY_BACKOFF_MS * attempts as u64 + jitter,
                ))
                .await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentType, EntityData, EntityType, TaskData, TeamData};
    use chrono::TimeZone;
    use crate::session::SessionConfig;
    use crate::storage::Database;
    use crate::tests::test_helpers::{
        git_repo, shell_launcher, wait_until, worker_entity, ONE_SHOT_SUCCESS, WELL_BEHAVED,
    };
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn fixtures(script: &str) -> (TempDir, Services, Daemon, String) {
        let repo = git_repo().await;
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = ElementStore::new(db);

        let worktrees = WorktreeManager::new(repo.path());
        worktrees.init_workspace().await.unwrap();
        let sessions = SessionManager::new(
            store.clone(),
            shell_launcher(script),
            SessionConfig::default(),
        );
        let services = Services::new(store.clone(), worktrees, sessions);

        let system = store
            .create(Element::new(
                ElementKind::Entity(EntityData {
                    name: "system".to_string(),
                    entity_type: EntityType::System,
                    is_active: Some(true),
                }),
                "el-boot",
            ))
            .await
            .unwrap();

        let settings = DaemonSettings {
            actor: system.id.clone(),
            task_retry_budget: 2,
            ..DaemonSettings::default()
        };
        let daemon = Daemon::new(services.clone(), settings);
        (repo, services, daemon, system.id)
    }

    #[tokio::test]
    async fn dispatch_happy_path() {
        let (_repo, services, daemon, system) = fixtures(WELL_BEHAVED).await;

        let worker = worker_entity(&services.store, "drone-1", |_| {}).await;
        let mut data = TaskData::new("implement the thing");
        data.priority = 3;
        let task = services
            .store
            .create(Element::new(ElementKind::Task(data), &system))
            .await
            .unwrap();

        daemon.tick().await.unwrap();

        let task_after = services.store.require(&task.id).await.unwrap();
        let task_data = task_after.as_task().unwrap();
        assert_eq!(task_data.status, TaskStatus::InProgress);
        assert_eq!(task_data.assignee.as_deref(), Some(worker.id.as_str()));

        let worktree_path = services.worktrees.path_for_task(&task.id);
        assert!(worktree_path.exists());

        let active = services
            .sessions
            .active_session(&worker.id)
            .await
            .unwrap()
            .expect("worker session running");
        assert_eq!(active.task_id.as_deref(), Some(task.id.as_str()));

        let events = services.store.events_for(&task.id).await.unwrap();
        let dispatched = events
            .iter()
            .find(|e| e.event_type == EventType::TaskDispatched)
            .expect("task-dispatched event");
        assert_eq!(dispatched.actor, system);

        services.sessions.stop_all("test-done").await.unwrap();
    }

    #[tokio::test]
    async fn team_task_is_claimed_by_a_member() {
        let (_repo, services, daemon, system) = fixtures(WELL_BEHAVED).await;

        let member = worker_entity(&services.store, "member-1", |_| {}).await;
        let outsider = worker_entity(&services.store, "outsider", |_| {}).await;
        let team = services
            .store
            .create(Element::new(
                ElementKind::Team(TeamData {
                    name: "crew".to_string(),
                    members: BTreeSet::from([member.id.clone()]),
                }),
                &system,
            ))
            .await
            .unwrap();

        let mut data = TaskData::new("team job");
        data.assignee = Some(team.id.clone());
        let task = services
            .store
            .create(Element::new(ElementKind::Task(data), &system))
            .await
            .unwrap();

        daemon.tick().await.unwrap();

        let task_after = services.store.require(&task.id).await.unwrap();
        assert_eq!(
            task_after.as_task().unwrap().assignee.as_deref(),
            Some(member.id.as_str())
        );
        assert_eq!(
            task_after.metadata.get("claimedFromTeam"),
            Some(&json!(team.id))
        );
        assert!(services
            .sessions
            .active_session(&outsider.id)
            .await
            .unwrap()
            .is_none());

        services.sessions.stop_all("test-done").await.unwrap();
    }

    #[tokio::test]
    async fn abnormal_exit_reopens_then_tombstones() {
        let (_repo, services, daemon, system) = fixtures(WELL_BEHAVED).await;

        let worker = worker_entity(&services.store, "drone-1", |_| {}).await;
        let task = services
            .store
            .create(Element::new(
                ElementKind::Task(TaskData::new("doomed work")),
                &system,
            ))
            .await
            .unwrap();

        // Attempt 1: dispatch, then kill the session out from under the
        // task.
        daemon.tick().await.unwrap();
        let session = services
            .sessions
            .active_session(&worker.id)
            .await
            .unwrap()
            .unwrap();
        services
            .sessions
            .stop_session(&session.id, false, Some("crash"))
            .await
            .unwrap();

        daemon.tick().await.unwrap();
        let task_after = services.store.require(&task.id).await.unwrap();
        assert_eq!(task_after.as_task().unwrap().status, TaskStatus::Open);
        assert_eq!(task_after.metadata.get("dispatchAttempts"), Some(&json!(1)));
        assert!(!services.worktrees.path_for_task(&task.id).exists());

        // Attempt 2 (budget = 2): crash again, task tombstones.
        daemon.tick().await.unwrap();
        let session = services
            .sessions
            .active_session(&worker.id)
            .await
            .unwrap()
            .unwrap();
        services
            .sessions
            .stop_session(&session.id, false, Some("crash"))
            .await
            .unwrap();
        daemon.tick().await.unwrap();

        let task_after = services.store.require(&task.id).await.unwrap();
        assert_eq!(task_after.as_task().unwrap().status, TaskStatus::Tombstone);
    }

    #[tokio::test]
    async fn clean_exit_with_closed_task_is_left_closed() {
        let (_repo, services, daemon, system) = fixtures(ONE_SHOT_SUCCESS).await;

        let worker = worker_entity(&services.store, "drone-1", |_| {}).await;
        let task = services
            .store
            .create(Element::new(
                ElementKind::Task(TaskData::new("quick win")),
                &system,
            ))
            .await
            .unwrap();

        daemon.tick().await.unwrap();

        // The one-shot agent exits immediately; the "agent" closes the
        // task through the store, as a real worker would.
        let sessions = services.sessions.clone();
        let worker_id = worker.id.clone();
        wait_until(|| {
            let sessions = sessions.clone();
            let worker_id = worker_id.clone();
            async move {
                sessions
                    .active_session(&worker_id)
                    .await
                    .unwrap()
                    .is_none()
            }
        })
        .await;
        services
            .store
            .update(&task.id, &worker.id, |element| {
                if let Some(task) = element.as_task_mut() {
                    task.status = TaskStatus::Closed;
                }
                Ok(())
            })
            .await
            .unwrap();

        daemon.tick().await.unwrap();

        let task_after = services.store.require(&task.id).await.unwrap();
        assert_eq!(task_after.as_task().unwrap().status, TaskStatus::Closed);
        assert!(!services.worktrees.path_for_task(&task.id).exists());
    }

    #[tokio::test]
    async fn steward_trigger_fires_a_session() {
        let (_repo, services, daemon, _system) = fixtures(WELL_BEHAVED).await;

        let steward = worker_entity(&services.store, "curator", |profile| {
            profile.role = AgentRole::Steward;
            // Six-field expression: every second.
            profile.triggers = vec!["* * * * * *".to_string()];
        })
        .await;

        // First tick sets the cursor; the fire happens on a later tick.
        daemon.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        daemon.tick().await.unwrap();

        let active = services
            .sessions
            .active_session(&steward.id)
            .await
            .unwrap();
        assert!(active.is_some(), "steward session should be running");

        let events = services.store.events_for(&steward.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::StewardTriggered));

        services.sessions.stop_all("test-done").await.unwrap();
    }

    #[tokio::test]
    async fn unread_inbox_spawns_session_and_marks_read() {
        let (_repo, services, daemon, system) = fixtures(WELL_BEHAVED).await;

        let worker = worker_entity(&services.store, "drone-1", |_| {}).await;
        let channel = services
            .messaging
            .create_channel("ops", &system)
            .await
            .unwrap();
        services
            .messaging
            .post_message(
                &channel.id,
                &system,
                "please rotate the logs",
                ContentType::Text,
                vec![worker.id.clone()],
                Default::default(),
            )
            .await
            .unwrap();

        daemon.tick().await.unwrap();

        assert!(services
            .sessions
            .active_session(&worker.id)
            .await
            .unwrap()
            .is_some());
        assert!(services
            .messaging
            .unread_for(&worker.id)
            .await
            .unwrap()
            .is_empty());

        services.sessions.stop_all("test-done").await.unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (_repo, _services, daemon, _system) = fixtures(WELL_BEHAVED).await;

        daemon.start().await.unwrap();
        daemon.start().await.unwrap();
        daemon.stop().await.unwrap();
        daemon.stop().await.unwrap();
    }

    #[test]
    fn cron_normalization_and_due_windows() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 12 * * * *"), "0 12 * * * *");

        let last = Utc.with_ymd_and_hms(2026, 2, 20, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 20, 12, 0, 59).unwrap();
        // Hourly schedule: not due within the minute.
        assert!(trigger_due("0 * * * *", last, now).is_none());
        // Every-minute schedule: due.
        assert!(trigger_due("* * * * *", last, now).is_none());
        let now = Utc.with_ymd_and_hms(2026, 2, 20, 12, 1, 0).unwrap();
        assert!(trigger_due("* * * * *", last, now).is_some());
    }
}
