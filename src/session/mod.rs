//! External agent session lifecycle.
//!
//! A session is a live or terminated conversation with an external
//! agent process: `starting → running → (suspended ↔ running) →
//! terminated`. Transitions are driven by explicit operations; the
//! manager does not re-infer state beyond process-exit events. Each
//! session's state sits behind its own mutex, the in-memory map is
//! authoritative for live sessions, and every transition writes a
//! durable checkpoint row so a restarted daemon can reconcile.

pub mod events;
pub mod rate_limit;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{
    GRACEFUL_STOP_TIMEOUT_MS, SESSION_EVENT_BUFFER, SPAWN_HANDSHAKE_TIMEOUT_MS,
};
use crate::models::{AgentProfile, AgentRole, AgentSessionStatus, EventType};
use crate::storage::ElementStore;
use crate::{FoundryError, Result};

use events::{AgentEvent, AgentInput, SessionEvent};

// ---------------------------------------------------------------------
// Session record
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Starting,
    Running,
    Suspended,
    Terminated,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Starting | SessionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Terminated => "terminated",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "suspended" => Ok(SessionStatus::Suspended),
            "terminated" => Ok(SessionStatus::Terminated),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Headless,
    Interactive,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Headless => "headless",
            SessionMode::Interactive => "interactive",
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "headless" => Ok(SessionMode::Headless),
            "interactive" => Ok(SessionMode::Interactive),
            _ => Err(format!("unknown session mode: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    /// Process-local id.
    pub id: String,
    pub agent_id: String,
    pub agent_role: AgentRole,
    /// Opaque resume handle assigned by the external runtime.
    pub provider_session_id: Option<String>,
    /// Task this session was dispatched for, if any.
    pub task_id: Option<String>,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub working_directory: PathBuf,
    pub worktree: Option<PathBuf>,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<String>,
}

// ---------------------------------------------------------------------
// Process launching
// ---------------------------------------------------------------------

/// What to launch and how.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub working_directory: PathBuf,
    /// Resume an earlier provider session instead of starting fresh.
    pub resume_provider_session_id: Option<String>,
    pub initial_prompt: Option<String>,
    pub env: Vec<(String, String)>,
}

/// Launches the external agent binary. The indirection exists so tests
/// and the daemon share one spawn contract.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Child>;
}

/// Default launcher: the configured agent CLI with NDJSON pipes.
pub struct AgentCliLauncher {
    binary: String,
    base_args: Vec<String>,
}

impl AgentCliLauncher {
    pub fn new(binary: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            base_args,
        }
    }
}

#[async_trait]
impl ProcessLauncher for AgentCliLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Child> {
        let mut command = Command::new(&self.binary);
        command
            .args(&self.base_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(&spec.working_directory)
            .kill_on_drop(true);

        if let Some(provider_id) = &spec.resume_provider_session_id {
            command.args(["--resume", provider_id]);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command.spawn().map_err(|e| FoundryError::Agent {
            message: format!("failed to spawn agent process: {e}"),
        })
    }
}

// ---------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub working_directory: Option<PathBuf>,
    pub worktree: Option<PathBuf>,
    pub initial_prompt: Option<String>,
    pub task_id: Option<String>,
}

/// Returned by start/resume: the session plus a subscription to its
/// event stream.
#[derive(Debug)]
pub struct StartedSession {
    pub session: Session,
    pub events: broadcast::Receiver<SessionEvent>,
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub reconciled: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub graceful_stop_timeout: Duration,
    pub default_working_directory: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(SPAWN_HANDSHAKE_TIMEOUT_MS),
            graceful_stop_timeout: Duration::from_millis(GRACEFUL_STOP_TIMEOUT_MS),
            default_working_directory: PathBuf::from("."),
        }
    }
}

struct SessionHandle {
    state: Mutex<Session>,
    events: broadcast::Sender<SessionEvent>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
}

#[derive(Clone)]
pub struct SessionManager {
    store: ElementStore,
    launcher: Arc<dyn ProcessLauncher>,
    config: SessionConfig,
    sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
    /// Serializes session creation so the one-active-session-per-agent
    /// invariant holds under concurrent starts.
    creation_lock: Arc<Mutex<()>>,
}

impl SessionManager {
    pub fn new(
        store: ElementStore,
        launcher: Arc<dyn ProcessLauncher>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            launcher,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            creation_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Spawn a fresh session for an agent.
    pub async fn start_session(
        &self,
        agent_id: &str,
        options: StartOptions,
    ) -> Result<StartedSession> {
        self.spawn_session(agent_id, options, None).await
    }

    /// Reattach to an earlier provider session by id.
    pub async fn resume_session(
        &self,
        agent_id: &str,
        provider_session_id: &str,
        options: StartOptions,
    ) -> Result<StartedSession> {
        let started = self
            .spawn_session(agent_id, options, Some(provider_session_id.to_string()))
            .await?;
        self.store
            .record_event(
                agent_id,
                EventType::SessionResumed,
                agent_id,
                None,
                Some(serde_json::json!({
                    "sessionId": started.session.id,
                    "providerSessionId": provider_session_id,
                })),
            )
            .await?;
        Ok(started)
    }

    async fn spawn_session(
        &self,
        agent_id: &str,
        options: StartOptions,
        resume: Option<String>,
    ) -> Result<StartedSession> {
        let _guard = self.creation_lock.lock().await;

        let agent = self
            .store
            .get(agent_id)
            .await?
            .ok_or_else(|| FoundryError::NotFound(agent_id.to_string()))?;
        let profile = AgentProfile::from_element(&agent).ok_or_else(|| {
            FoundryError::InvalidInput(format!("{agent_id} is not an agent entity"))
        })?;

        if self.active_session(agent_id).await?.is_some() {
            return Err(FoundryError::ActiveSessionExists(agent_id.to_string()));
        }

        let working_directory = options
            .worktree
            .clone()
            .or(options.working_directory)
            .unwrap_or_else(|| self.config.default_working_directory.clone());

        let spec = LaunchSpec {
            working_directory: working_directory.clone(),
            resume_provider_session_id: resume.clone(),
            initial_prompt: options.initial_prompt.clone(),
            env: Vec::new(),
        };

        let mut child = self.launcher.launch(&spec).await?;
        let pid = child.id();
        let stdout = child.stdout.take().ok_or_else(|| FoundryError::Agent {
            message: "agent process has no stdout pipe".to_string(),
        })?;
        let stdin = child.stdin.take();

        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            agent_role: profile.role,
            provider_session_id: resume,
            task_id: options.task_id,
            mode: SessionMode::Headless,
            status: SessionStatus::Starting,
            working_directory,
            worktree: options.worktree,
            pid,
            created_at: Utc::now(),
            started_at: None,
            last_activity_at: None,
            ended_at: None,
            termination_reason: None,
        };
        self.checkpoint(&session).await?;

        let (tx, handshake_rx) = broadcast::channel(SESSION_EVENT_BUFFER);
        let consumer_rx = tx.subscribe();
        let supervisor_rx = tx.subscribe();

        let handle = Arc::new(SessionHandle {
            state: Mutex::new(session.clone()),
            events: tx.clone(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
        });
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::clone(&handle));

        // Reader: stdout → broadcast, then reap the child and announce
        // the exit.
        let pump_handle = Arc::clone(&handle);
        let pump_tx = tx.clone();
        tokio::spawn(async move {
            events::pump_events(stdout, pump_tx.clone()).await;
            let code = {
                let mut child_slot = pump_handle.child.lock().await;
                match child_slot.take() {
                    Some(mut child) => child.wait().await.ok().and_then(|s| s.code()),
                    None => None,
                }
            };
            let _ = pump_tx.send(SessionEvent::ProcessExited { code });
        });

        // Supervisor: state transitions driven by the event stream.
        let manager = self.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            manager.supervise(session_id, supervisor_rx).await;
        });

        // Handshake: block until the init event (or first event on
        // resume) arrives, bounded by the spawn timeout. The event is
        // applied here as well as in the supervisor so the returned
        // session is already running; the second application is a
        // no-op.
        match self.await_handshake(handshake_rx).await {
            Ok(first_event) => {
                self.on_agent_event(&session.id, &first_event).await;
            }
            Err(e) => {
                self.abort_starting(&session.id, "starting-failed").await;
                return Err(e);
            }
        }

        if let Some(prompt) = options.initial_prompt {
            self.write_input(&handle, &AgentInput::UserMessage { content: prompt })
                .await?;
        }

        self.set_agent_session_status(agent_id, AgentSessionStatus::Running, None)
            .await?;
        self.store
            .record_event(
                agent_id,
                EventType::SessionStarted,
                agent_id,
                None,
                Some(serde_json::json!({ "sessionId": session.id })),
            )
            .await?;

        let session = handle.state.lock().await.clone();
        info!(
            session = %session.id,
            agent = %agent_id,
            provider = ?session.provider_session_id,
            "session started"
        );
        Ok(StartedSession {
            session,
            events: consumer_rx,
        })
    }

    async fn await_handshake(
        &self,
        mut rx: broadcast::Receiver<SessionEvent>,
    ) -> Result<AgentEvent> {
        let deadline = tokio::time::Instant::now() + self.config.handshake_timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .map_err(|_| FoundryError::Timeout {
                    message: "agent process did not complete the init handshake".to_string(),
                })?;
            match event {
                Ok(SessionEvent::Event(event)) => return Ok(event),
                Ok(SessionEvent::ProcessExited { code }) => {
                    return Err(FoundryError::Agent {
                        message: format!("agent process exited during startup (code {code:?})"),
                    })
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(FoundryError::Agent {
                        message: "agent event stream closed during startup".to_string(),
                    })
                }
            }
        }
    }

    /// Event-driven state maintenance for one session.
    async fn supervise(&self, session_id: String, mut rx: broadcast::Receiver<SessionEvent>) {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Event(event)) => {
                    self.on_agent_event(&session_id, &event).await;
                }
                Ok(SessionEvent::ProcessExited { code }) => {
                    self.on_process_exited(&session_id, code).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %session_id, skipped, "supervisor lagged on event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn on_agent_event(&self, session_id: &str, event: &AgentEvent) {
        let handle = match self.handle(session_id).await {
            Some(h) => h,
            None => return,
        };

        let (agent_id, became_running) = {
            let mut state = handle.state.lock().await;
            state.last_activity_at = Some(Utc::now());
            if let AgentEvent::Init {
                provider_session_id,
            } = event
            {
                state.provider_session_id = Some(provider_session_id.clone());
            }
            let became_running = if state.status == SessionStatus::Starting {
                state.status = SessionStatus::Running;
                state.started_at = Some(Utc::now());
                true
            } else {
                false
            };
            let _ = self.checkpoint(&state).await;
            (state.agent_id.clone(), became_running)
        };

        if became_running {
            debug!(session = %session_id, agent = %agent_id, "session running");
        }

        // Rate-limit scan over message text.
        if let Some(text) = event.text() {
            if let Some(notice) = rate_limit::detect(&text, Utc::now()) {
                warn!(
                    session = %session_id,
                    agent = %agent_id,
                    reset_at = %notice.reset_at,
                    weekly = notice.weekly,
                    "rate limit detected, suspending session"
                );
                let _ = self
                    .set_agent_session_status(
                        &agent_id,
                        AgentSessionStatus::Suspended,
                        Some(notice.reset_at),
                    )
                    .await;
                let _ = self
                    .suspend_session(session_id, Some("rate-limited"))
                    .await;
            }
        }
    }

    async fn on_process_exited(&self, session_id: &str, code: Option<i32>) {
        let handle = match self.handle(session_id).await {
            Some(h) => h,
            None => return,
        };

        let (agent_id, newly_terminated) = {
            let mut state = handle.state.lock().await;
            match state.status {
                SessionStatus::Starting | SessionStatus::Running => {
                    state.status = SessionStatus::Terminated;
                    state.ended_at = Some(Utc::now());
                    state
                        .termination_reason
                        .get_or_insert_with(|| format!("process-exited({code:?})"));
                    let _ = self.checkpoint(&state).await;
                    (state.agent_id.clone(), true)
                }
                _ => (state.agent_id.clone(), false),
            }
        };

        if newly_terminated {
            info!(session = %session_id, agent = %agent_id, ?code, "session process exited");
            let _ = self
                .set_agent_session_status(&agent_id, AgentSessionStatus::Idle, None)
                .await;
            let _ = self
                .store
                .record_event(
                    &agent_id,
                    EventType::SessionTerminated,
                    &agent_id,
                    None,
                    Some(serde_json::json!({ "sessionId": session_id, "code": code })),
                )
                .await;
        }
    }

    /// Stop a session. Graceful: shutdown request, bounded wait, then
    /// force kill. Idempotent on terminated sessions.
    pub async fn stop_session(
        &self,
        session_id: &str,
        graceful: bool,
        reason: Option<&str>,
    ) -> Result<Session> {
        let handle = self
            .handle(session_id)
            .await
            .ok_or_else(|| FoundryError::SessionNotFound(session_id.to_string()))?;

        let had_process = {
            let mut state = handle.state.lock().await;
            if state.status == SessionStatus::Terminated {
                return Ok(state.clone());
            }
            let had_process = state.status.is_active();
            state.status = SessionStatus::Terminated;
            state.ended_at = Some(Utc::now());
            state.termination_reason = Some(reason.unwrap_or("stopped").to_string());
            self.checkpoint(&state).await?;
            had_process
        };

        if had_process {
            self.end_process(&handle, graceful).await;
        }

        let state = handle.state.lock().await.clone();
        self.set_agent_session_status(&state.agent_id, AgentSessionStatus::Idle, None)
            .await?;
        self.store
            .record_event(
                &state.agent_id,
                EventType::SessionTerminated,
                &state.agent_id,
                None,
                Some(serde_json::json!({
                    "sessionId": session_id,
                    "reason": state.termination_reason,
                })),
            )
            .await?;
        info!(session = %session_id, graceful, "session stopped");
        Ok(state)
    }

    /// End the OS process but keep the provider session id so a later
    /// resume can continue the conversation.
    pub async fn suspend_session(
        &self,
        session_id: &str,
        reason: Option<&str>,
    ) -> Result<Session> {
        let handle = self
            .handle(session_id)
            .await
            .ok_or_else(|| FoundryError::SessionNotFound(session_id.to_string()))?;

        {
            let mut state = handle.state.lock().await;
            if !state.status.is_active() {
                return Err(FoundryError::InvalidInput(format!(
                    "session {session_id} is not active ({})",
                    state.status.as_str()
                )));
            }
            state.status = SessionStatus::Suspended;
            state.termination_reason = reason.map(|r| r.to_string());
            self.checkpoint(&state).await?;
        }

        self.end_process(&handle, true).await;

        let state = handle.state.lock().await.clone();
        self.set_agent_session_status(&state.agent_id, AgentSessionStatus::Suspended, None)
            .await?;
        self.store
            .record_event(
                &state.agent_id,
                EventType::SessionSuspended,
                &state.agent_id,
                None,
                Some(serde_json::json!({
                    "sessionId": session_id,
                    "reason": reason,
                    "providerSessionId": state.provider_session_id,
                })),
            )
            .await?;
        info!(session = %session_id, ?reason, "session suspended");
        Ok(state)
    }

    /// Send input to a running session.
    pub async fn message_session(&self, session_id: &str, message: &str) -> Result<()> {
        let handle = self
            .handle(session_id)
            .await
            .ok_or_else(|| FoundryError::SessionNotFound(session_id.to_string()))?;
        {
            let state = handle.state.lock().await;
            if state.status != SessionStatus::Running {
                return Err(FoundryError::InvalidInput(format!(
                    "session {session_id} is not running"
                )));
            }
        }
        self.write_input(
            &handle,
            &AgentInput::UserMessage {
                content: message.to_string(),
            },
        )
        .await
    }

    /// Signal a running session to interrupt its current turn.
    pub async fn interrupt_session(&self, session_id: &str) -> Result<()> {
        let handle = self
            .handle(session_id)
            .await
            .ok_or_else(|| FoundryError::SessionNotFound(session_id.to_string()))?;
        {
            let state = handle.state.lock().await;
            if state.status != SessionStatus::Running {
                return Err(FoundryError::InvalidInput(format!(
                    "session {session_id} is not running"
                )));
            }
        }
        self.write_input(&handle, &AgentInput::Interrupt).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        if let Some(handle) = self.handle(session_id).await {
            return Ok(Some(handle.state.lock().await.clone()));
        }
        // Fall back to the checkpoint rows for sessions from earlier
        // daemon runs.
        let id = session_id.to_string();
        self.store
            .database()
            .execute(move |conn| query_session_row(conn, &id))
            .await
    }

    /// The agent's session in starting or running state, if any.
    pub async fn active_session(&self, agent_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            let state = handle.state.lock().await;
            if state.agent_id == agent_id && state.status.is_active() {
                return Ok(Some(state.clone()));
            }
        }
        Ok(None)
    }

    /// Sessions matching the filter, from the durable checkpoint rows.
    pub async fn list_sessions(
        &self,
        agent_id: Option<&str>,
        role: Option<AgentRole>,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>> {
        let agent_id = agent_id.map(|s| s.to_string());
        self.store
            .database()
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at ASC"
                ))?;
                let mapped = stmt.query_map([], session_from_row)?;
                let mut sessions = Vec::new();
                for item in mapped {
                    let session = item?;
                    if let Some(agent) = &agent_id {
                        if &session.agent_id != agent {
                            continue;
                        }
                    }
                    if let Some(role) = role {
                        if session.agent_role != role {
                            continue;
                        }
                    }
                    if let Some(status) = status {
                        if session.status != status {
                            continue;
                        }
                    }
                    sessions.push(session);
                }
                Ok(sessions)
            })
            .await
    }

    /// Latest session for the agent that still has a provider id and is
    /// not terminated (suspended, or orphaned running after a crash).
    pub async fn most_recent_resumable_session(
        &self,
        agent_id: &str,
    ) -> Result<Option<Session>> {
        let agent_id = agent_id.to_string();
        self.store
            .database()
            .execute(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE agent_id = ?1
                           AND provider_session_id IS NOT NULL
                           AND status != 'terminated'
                         ORDER BY created_at DESC LIMIT 1"
                    ),
                    [&agent_id],
                    session_from_row,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    /// Terminated sessions not yet seen by the daemon's drain step.
    /// Marks them drained.
    pub async fn take_undrained_terminated(&self) -> Result<Vec<Session>> {
        self.store
            .database()
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE status = 'terminated' AND drained = 0
                     ORDER BY ended_at ASC"
                ))?;
                let sessions: Vec<Session> = stmt
                    .query_map([], session_from_row)?
                    .collect::<rusqlite::Result<_>>()?;
                for session in &sessions {
                    conn.execute(
                        "UPDATE sessions SET drained = 1 WHERE id = ?1",
                        [&session.id],
                    )?;
                }
                Ok(sessions)
            })
            .await
    }

    /// On daemon start: mark checkpointed starting/running sessions
    /// whose OS process is gone as terminated/"reconciled".
    pub async fn reconcile_on_startup(&self) -> Result<ReconcileReport> {
        let stale = self
            .store
            .database()
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE status IN ('starting', 'running')"
                ))?;
                let sessions: Vec<Session> = stmt
                    .query_map([], session_from_row)?
                    .collect::<rusqlite::Result<_>>()?;
                Ok(sessions)
            })
            .await?;

        let mut reconciled = 0;
        let mut errors = Vec::new();
        for mut session in stale {
            // Live in-memory sessions belong to this process; only
            // orphans from a previous run are reconciled.
            if self.handle(&session.id).await.is_some() {
                continue;
            }
            let alive = match session.pid {
                Some(pid) => pid_alive(pid).await,
                None => false,
            };
            if alive {
                continue;
            }

            session.status = SessionStatus::Terminated;
            session.ended_at = Some(Utc::now());
            session.termination_reason = Some("reconciled".to_string());
            if let Err(e) = self.checkpoint(&session).await {
                errors.push(format!("session {}: {e}", session.id));
                continue;
            }
            if let Err(e) = self
                .set_agent_session_status(&session.agent_id, AgentSessionStatus::Idle, None)
                .await
            {
                errors.push(format!("agent {}: {e}", session.agent_id));
            }
            reconciled += 1;
            info!(session = %session.id, agent = %session.agent_id, "session reconciled");
        }

        Ok(ReconcileReport { reconciled, errors })
    }

    /// Stop every active session, gracefully, for daemon shutdown.
    pub async fn stop_all(&self, reason: &str) -> Result<()> {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut ids = Vec::new();
            for (id, handle) in sessions.iter() {
                if handle.state.lock().await.status.is_active() {
                    ids.push(id.clone());
                }
            }
            ids
        };
        for id in ids {
            if let Err(e) = self.stop_session(&id, true, Some(reason)).await {
                warn!(session = %id, "failed to stop session during shutdown: {e}");
            }
        }
        Ok(())
    }

    // -- internals ----------------------------------------------------

    async fn handle(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn write_input(&self, handle: &SessionHandle, input: &AgentInput) -> Result<()> {
        let mut stdin_slot = handle.stdin.lock().await;
        let stdin = stdin_slot.as_mut().ok_or_else(|| FoundryError::Agent {
            message: "session stdin is closed".to_string(),
        })?;
        let mut line = serde_json::to_string(input)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| FoundryError::Agent {
                message: format!("failed to write to agent stdin: {e}"),
            })?;
        stdin.flush().await.map_err(|e| FoundryError::Agent {
            message: format!("failed to flush agent stdin: {e}"),
        })?;
        Ok(())
    }

    /// Shared teardown: ask nicely, wait, then kill.
    async fn end_process(&self, handle: &SessionHandle, graceful: bool) {
        if graceful {
            // Shutdown request plus stdin close; well-behaved agents
            // exit on either.
            {
                let mut stdin_slot = handle.stdin.lock().await;
                if let Some(stdin) = stdin_slot.as_mut() {
                    let mut line = serde_json::to_string(&AgentInput::Shutdown)
                        .unwrap_or_else(|_| "{\"type\":\"shutdown\"}".to_string());
                    line.push('\n');
                    let _ = stdin.write_all(line.as_bytes()).await;
                    let _ = stdin.flush().await;
                }
                *stdin_slot = None;
            }

            let deadline = tokio::time::Instant::now() + self.config.graceful_stop_timeout;
            loop {
                {
                    let child_slot = handle.child.lock().await;
                    if child_slot.is_none() {
                        return; // reaped by the pump task
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            warn!("graceful stop timed out, escalating to kill");
        } else {
            let mut stdin_slot = handle.stdin.lock().await;
            *stdin_slot = None;
        }

        let mut child_slot = handle.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            let _ = child.kill().await;
        }
    }

    async fn abort_starting(&self, session_id: &str, reason: &str) {
        if let Some(handle) = self.handle(session_id).await {
            {
                let mut state = handle.state.lock().await;
                state.status = SessionStatus::Terminated;
                state.ended_at = Some(Utc::now());
                state.termination_reason = Some(reason.to_string());
                let _ = self.checkpoint(&state).await;
            }
            self.end_process(&handle, false).await;
        }
    }

    /// Write a checkpoint row directly; crash-recovery tests use this
    /// to fabricate rows from a previous daemon run.
    #[cfg(test)]
    pub(crate) async fn checkpoint_for_tests(&self, session: &Session) -> Result<()> {
        self.checkpoint(session).await
    }

    async fn checkpoint(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.store
            .database()
            .execute(move |conn| upsert_session_row(conn, &session))
            .await
    }

    async fn set_agent_session_status(
        &self,
        agent_id: &str,
        status: AgentSessionStatus,
        rate_limit_reset_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.store
            .update(agent_id, agent_id, move |element| {
                if let Some(mut profile) = AgentProfile::from_element(element) {
                    profile.session_status = status;
                    if rate_limit_reset_at.is_some() {
                        profile.rate_limit_reset_at = rate_limit_reset_at;
                    }
                    profile.write_to(element);
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Checkpoint rows
// ---------------------------------------------------------------------

const SESSION_COLUMNS: &str = "id, agent_id, agent_role, provider_session_id, mode, status, \
                               working_directory, worktree, task_id, pid, created_at, \
                               started_at, last_activity_at, ended_at, termination_reason";

fn upsert_session_row(conn: &rusqlite::Connection, session: &Session) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (id, agent_id, agent_role, provider_session_id, mode, status,
                               working_directory, worktree, task_id, pid, created_at,
                               started_at, last_activity_at, ended_at, termination_reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
            provider_session_id = excluded.provider_session_id,
            status = excluded.status,
            pid = excluded.pid,
            started_at = excluded.started_at,
            last_activity_at = excluded.last_activity_at,
            ended_at = excluded.ended_at,
            termination_reason = excluded.termination_reason",
        rusqlite::params![
            session.id,
            session.agent_id,
            serde_json::to_string(&session.agent_role)?.trim_matches('"'),
            session.provider_session_id,
            session.mode.as_str(),
            session.status.as_str(),
            session.working_directory.to_string_lossy(),
            session.worktree.as_ref().map(|p| p.to_string_lossy().to_string()),
            session.task_id,
            session.pid,
            session.created_at.to_rfc3339(),
            session.started_at.map(|t| t.to_rfc3339()),
            session.last_activity_at.map(|t| t.to_rfc3339()),
            session.ended_at.map(|t| t.to_rfc3339()),
            session.termination_reason,
        ],
    )?;
    Ok(())
}

fn query_session_row(conn: &rusqlite::Connection, id: &str) -> Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
        [id],
        session_from_row,
    )
    .optional()
    .map_err(Into::into)
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let role_raw: String = row.get(2)?;
    let mode_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let working_directory: String = row.get(6)?;
    let worktree: Option<String> = row.get(7)?;

    Ok(Session {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        agent_role: serde_json::from_value(serde_json::Value::String(role_raw))
            .unwrap_or(AgentRole::Worker),
        provider_session_id: row.get(3)?,
        mode: mode_raw.parse().unwrap_or(SessionMode::Headless),
        status: status_raw.parse().unwrap_or(SessionStatus::Terminated),
        working_directory: PathBuf::from(working_directory),
        worktree: worktree.map(PathBuf::from),
        task_id: row.get(8)?,
        pid: row.get(9)?,
        created_at: parse_ts(row.get::<_, String>(10)?),
        started_at: row.get::<_, Option<String>>(11)?.map(parse_ts),
        last_activity_at: row.get::<_, Option<String>>(12)?.map(parse_ts),
        ended_at: row.get::<_, Option<String>>(13)?.map(parse_ts),
        termination_reason: row.get(14)?,
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

async fn pid_alive(pid: u32) -> bool {
    match Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
