use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::constants::{ELEMENT_ID_PREFIX, ELEMENT_ID_SLUG_LENGTH};

/// The common base record for every typed entity in the store.
///
/// Foundry stores one row per element; the `kind` carries the
/// type-specific payload as a tagged variant. References between
/// elements are always by id, never by embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub kind: ElementKind,
}

/// Type-specific payload of an element.
///
/// Dependencies and events are records in their own right (separate
/// tables) and never appear as element rows; see [`Dependency`] and
/// [`Event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ElementKind {
    Task(TaskData),
    Workflow(WorkflowData),
    Plan(PlanData),
    Entity(EntityData),
    Team(TeamData),
    Channel(ChannelData),
    Message(MessageData),
    Document(DocumentData),
    Library(LibraryData),
    Playbook(PlaybookData),
    InboxItem(InboxItemData),
}

/// Closed tag enum mirroring [`ElementKind`], used in filters and the
/// `el_type` storage column. `Dependency` and `Event` complete the tag
/// space for audit payloads but never occur as element rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElementType {
    Task,
    Workflow,
    Plan,
    Entity,
    Team,
    Channel,
    Message,
    Document,
    Library,
    Playbook,
    Dependency,
    Event,
    InboxItem,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Task => "task",
            ElementType::Workflow => "workflow",
            ElementType::Plan => "plan",
            ElementType::Entity => "entity",
            ElementType::Team => "team",
            ElementType::Channel => "channel",
            ElementType::Message => "message",
            ElementType::Document => "document",
            ElementType::Library => "library",
            ElementType::Playbook => "playbook",
            ElementType::Dependency => "dependency",
            ElementType::Event => "event",
            ElementType::InboxItem => "inbox-item",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "task" => Ok(ElementType::Task),
            "workflow" => Ok(ElementType::Workflow),
            "plan" => Ok(ElementType::Plan),
            "entity" => Ok(ElementType::Entity),
            "team" => Ok(ElementType::Team),
            "channel" => Ok(ElementType::Channel),
            "message" => Ok(ElementType::Message),
            "document" => Ok(ElementType::Document),
            "library" => Ok(ElementType::Library),
            "playbook" => Ok(ElementType::Playbook),
            "dependency" => Ok(ElementType::Dependency),
            "event" => Ok(ElementType::Event),
            "inbox-item" => Ok(ElementType::InboxItem),
            _ => Err(format!("unknown element type: {s}")),
        }
    }
}

// ---------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------

/// Lifecycle status of a task. Terminal = closed or tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
    Deferred,
    Tombstone,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Closed | TaskStatus::Tombstone)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Closed => "closed",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Tombstone => "tombstone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Bug,
    Feature,
    Task,
    Chore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskData {
    pub title: String,
    pub status: TaskStatus,
    /// 1..=5, 1 = critical. Lower dispatches first.
    pub priority: u8,
    /// 1..=5 estimated effort.
    pub complexity: u8,
    pub task_type: TaskType,
    /// Entity or team id. Team assignment makes the task claimable by
    /// any member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Document id holding the long-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_ref: Option<String>,
    /// Not ready until this instant is reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
}

impl TaskData {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            status: TaskStatus::Open,
            priority: 3,
            complexity: 3,
            task_type: TaskType::Task,
            assignee: None,
            description_ref: None,
            scheduled_for: None,
            external_ref: None,
        }
    }
}

// ---------------------------------------------------------------------
// Workflow / Plan
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowData {
    pub title: String,
    pub status: WorkflowStatus,
    /// Ephemeral workflows are excluded from export and eligible for GC.
    #[serde(default)]
    pub ephemeral: bool,
    /// Variable values resolved at instantiation time.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl WorkflowData {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            status: WorkflowStatus::Pending,
            ephemeral: false,
            variables: Map::new(),
            playbook_id: None,
            started_at: None,
            finished_at: None,
            failure_reason: None,
            cancel_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Active,
    Completed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Active => "active",
            PlanStatus::Completed => "completed",
            PlanStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanData {
    pub title: String,
    pub status: PlanStatus,
}

// ---------------------------------------------------------------------
// Entity / Team
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Human,
    Agent,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Director,
    Worker,
    Steward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    Ephemeral,
    Persistent,
}

/// Session status as mirrored on an agent entity. Distinct from the
/// session manager's per-session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSessionStatus {
    Idle,
    Running,
    Suspended,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityData {
    /// Slug: letters, digits, hyphens, underscores.
    pub name: String,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

/// Agent-specific fields, stored under `metadata.agent` on the entity
/// element so that non-agent entities carry no dead weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_mode: Option<WorkerMode>,
    pub session_status: AgentSessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<u32>,
    /// Cron expressions for steward agents.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<String>,
    /// Set when a rate-limit message was detected; the agent is not
    /// dispatchable until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    /// Dispatch ordering hint: least-recently-used workers go first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_dispatched_at: Option<DateTime<Utc>>,
}

impl AgentProfile {
    pub fn worker() -> Self {
        Self {
            role: AgentRole::Worker,
            worker_mode: Some(WorkerMode::Ephemeral),
            session_status: AgentSessionStatus::Idle,
            channel_id: None,
            max_concurrent_tasks: Some(1),
            triggers: Vec::new(),
            rate_limit_reset_at: None,
            last_dispatched_at: None,
        }
    }

    /// Read the agent profile out of an entity's metadata, if present.
    pub fn from_element(element: &Element) -> Option<Self> {
        let raw = element.metadata.get("agent")?;
        serde_json::from_value(raw.clone()).ok()
    }

    /// Write the profile back under `metadata.agent`.
    pub fn write_to(&self, element: &mut Element) {
        if let Ok(value) = serde_json::to_value(self) {
            element.metadata.insert("agent".to_string(), value);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamData {
    pub name: String,
    #[serde(default)]
    pub members: BTreeSet<String>,
}

// ---------------------------------------------------------------------
// Channel / Message / Inbox
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// A message appended to a channel. The body lives in a document with
/// the system category `message-content`; the message row references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub channel_id: String,
    pub author_id: String,
    pub content_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxSource {
    Direct,
    Mention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Unread,
    Read,
    Archived,
}

/// Binds (recipient, message, channel). At most one per
/// (recipient, message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItemData {
    pub recipient_id: String,
    pub message_id: String,
    pub channel_id: String,
    pub source: InboxSource,
    pub status: InboxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------
// Document / Library
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Markdown,
    Text,
    Json,
}

/// System document categories excluded from external sync.
pub const SYSTEM_DOC_CATEGORIES: &[&str] = &["task-description", "message-content"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    pub content_type: ContentType,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryData {
    pub name: String,
}

// ---------------------------------------------------------------------
// Playbook
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Task,
    Function,
}

/// Declared variable of a playbook. Required variables with no default
/// must be supplied at instantiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// One step of a playbook template. `{{name}}` placeholders in the
/// string fields are substituted from resolved variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name, unique within the playbook; `depends_on` refers to it.
    pub name: String,
    pub kind: StepKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Function steps only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Condition over variables; steps whose condition evaluates false
    /// are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parent playbook id for inheritance; deeper fields win.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSpec>,
    /// Workflows instantiated from this playbook default to ephemeral.
    #[serde(default)]
    pub ephemeral: bool,
}

// ---------------------------------------------------------------------
// Dependency
// ---------------------------------------------------------------------

/// Edge direction convention: (blocked, blocker) means "blocked must
/// wait for blocker to finish".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    Blocks,
    ParentChild,
    Awaits,
    RelatesTo,
}

impl DependencyType {
    /// Blocking types participate in cycle detection and readiness;
    /// relates-to is informational and bidirectional.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, DependencyType::RelatesTo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::ParentChild => "parent-child",
            DependencyType::Awaits => "awaits",
            DependencyType::RelatesTo => "relates-to",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "blocks" => Ok(DependencyType::Blocks),
            "parent-child" => Ok(DependencyType::ParentChild),
            "awaits" => Ok(DependencyType::Awaits),
            "relates-to" => Ok(DependencyType::RelatesTo),
            _ => Err(format!("unknown dependency type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub blocked_id: String,
    pub blocker_id: String,
    pub dep_type: DependencyType,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

// ---------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    StatusChanged,
    DependencyAdded,
    DependencyRemoved,
    Claimed,
    Assigned,
    PlanTaskAdded,
    PlanTaskRemoved,
    TaskDispatched,
    HandoffOccurred,
    MessagePosted,
    InboxRead,
    SessionStarted,
    SessionSuspended,
    SessionResumed,
    SessionTerminated,
    StewardTriggered,
    GcRemoved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
            EventType::StatusChanged => "status-changed",
            EventType::DependencyAdded => "dependency-added",
            EventType::DependencyRemoved => "dependency-removed",
            EventType::Claimed => "claimed",
            EventType::Assigned => "assigned",
            EventType::PlanTaskAdded => "plan-task-added",
            EventType::PlanTaskRemoved => "plan-task-removed",
            EventType::TaskDispatched => "task-dispatched",
            EventType::HandoffOccurred => "handoff-occurred",
            EventType::MessagePosted => "message-posted",
            EventType::InboxRead => "inbox-read",
            EventType::SessionStarted => "session-started",
            EventType::SessionSuspended => "session-suspended",
            EventType::SessionResumed => "session-resumed",
            EventType::SessionTerminated => "session-terminated",
            EventType::StewardTriggered => "steward-triggered",
            EventType::GcRemoved => "gc-removed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(EventType::Created),
            "updated" => Ok(EventType::Updated),
            "deleted" => Ok(EventType::Deleted),
            "status-changed" => Ok(EventType::StatusChanged),
            "dependency-added" => Ok(EventType::DependencyAdded),
            "dependency-removed" => Ok(EventType::DependencyRemoved),
            "claimed" => Ok(EventType::Claimed),
            "assigned" => Ok(EventType::Assigned),
            "plan-task-added" => Ok(EventType::PlanTaskAdded),
            "plan-task-removed" => Ok(EventType::PlanTaskRemoved),
            "task-dispatched" => Ok(EventType::TaskDispatched),
            "handoff-occurred" => Ok(EventType::HandoffOccurred),
            "message-posted" => Ok(EventType::MessagePosted),
            "inbox-read" => Ok(EventType::InboxRead),
            "session-started" => Ok(EventType::SessionStarted),
            "session-suspended" => Ok(EventType::SessionSuspended),
            "session-resumed" => Ok(EventType::SessionResumed),
            "session-terminated" => Ok(EventType::SessionTerminated),
            "steward-triggered" => Ok(EventType::StewardTriggered),
            "gc-removed" => Ok(EventType::GcRemoved),
            _ => Err(format!("unknown event type: {s}")),
        }
    }
}

/// Append-only audit record. Events are the source of truth for
/// history; element rows hold only current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub element_id: String,
    pub event_type: EventType,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Element construction and accessors
// ---------------------------------------------------------------------

/// Allocate a fresh top-level element id: `el-` + random hex slug.
pub fn new_element_id() -> String {
    let slug = uuid::Uuid::new_v4().simple().to_string();
    format!("{ELEMENT_ID_PREFIX}{}", &slug[..ELEMENT_ID_SLUG_LENGTH])
}

impl Element {
    /// Build a new element with a freshly allocated id.
    pub fn new(kind: ElementKind, created_by: impl Into<String>) -> Self {
        Self::with_id(new_element_id(), kind, created_by)
    }

    /// Build a new element with a caller-chosen id (hierarchical child
    /// ids come from the store's child counter).
    pub fn with_id(id: impl Into<String>, kind: ElementKind, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            created_by: created_by.into(),
            tags: BTreeSet::new(),
            metadata: Map::new(),
            kind,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn element_type(&self) -> ElementType {
        match &self.kind {
            ElementKind::Task(_) => ElementType::Task,
            ElementKind::Workflow(_) => ElementType::Workflow,
            ElementKind::Plan(_) => ElementType::Plan,
            ElementKind::Entity(_) => ElementType::Entity,
            ElementKind::Team(_) => ElementType::Team,
            ElementKind::Channel(_) => ElementType::Channel,
            ElementKind::Message(_) => ElementType::Message,
            ElementKind::Document(_) => ElementType::Document,
            ElementKind::Library(_) => ElementType::Library,
            ElementKind::Playbook(_) => ElementType::Playbook,
            ElementKind::InboxItem(_) => ElementType::InboxItem,
        }
    }

    /// Status as stored in the `status` filter column, for the kinds
    /// that carry one.
    pub fn status_str(&self) -> Option<&'static str> {
        match &self.kind {
            ElementKind::Task(t) => Some(t.status.as_str()),
            ElementKind::Workflow(w) => Some(w.status.as_str()),
            ElementKind::Plan(p) => Some(p.status.as_str()),
            ElementKind::InboxItem(i) => Some(match i.status {
                InboxStatus::Unread => "unread",
                InboxStatus::Read => "read",
                InboxStatus::Archived => "archived",
            }),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskData> {
        match &self.kind {
            ElementKind::Task(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_task_mut(&mut self) -> Option<&mut TaskData> {
        match &mut self.kind {
            ElementKind::Task(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_workflow(&self) -> Option<&WorkflowData> {
        match &self.kind {
            ElementKind::Workflow(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_workflow_mut(&mut self) -> Option<&mut WorkflowData> {
        match &mut self.kind {
            ElementKind::Workflow(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_plan(&self) -> Option<&PlanData> {
        match &self.kind {
            ElementKind::Plan(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_plan_mut(&mut self) -> Option<&mut PlanData> {
        match &mut self.kind {
            ElementKind::Plan(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityData> {
        match &self.kind {
            ElementKind::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_team(&self) -> Option<&TeamData> {
        match &self.kind {
            ElementKind::Team(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&DocumentData> {
        match &self.kind {
            ElementKind::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_playbook(&self) -> Option<&PlaybookData> {
        match &self.kind {
            ElementKind::Playbook(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_inbox_item(&self) -> Option<&InboxItemData> {
        match &self.kind {
            ElementKind::InboxItem(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_inbox_item_mut(&mut self) -> Option<&mut InboxItemData> {
        match &mut self.kind {
            ElementKind::InboxItem(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageData> {
        match &self.kind {
            ElementKind::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&ChannelData> {
        match &self.kind {
            ElementKind::Channel(c) => Some(c),
            _ => None,
        }
    }
}

/// Filter for element listings.
#[derive(Debug, Clone, Default)]
pub struct ElementFilter {
    pub element_type: Option<ElementType>,
    /// All listed tags must be present.
    pub tags: Vec<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ElementFilter {
    pub fn of_type(element_type: ElementType) -> Self {
        Self {
            element_type: Some(element_type),
            ..Default::default()
        }
    }
}
