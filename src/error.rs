use thiserror::Error;

/// Convenience type alias for Results with FoundryError
pub type Result<T> = std::result::Result<T, FoundryError>;

/// Main error type for Foundry Core
///
/// Every failure that crosses a service boundary is one of these
/// variants. Validation and conflict errors are terminal for the call;
/// `DatabaseBusy` is the only retryable variant.
#[derive(Error, Debug)]
pub enum FoundryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("duplicate dependency: {blocked} <- {blocker} ({dep_type})")]
    DuplicateDependency {
        blocked: String,
        blocker: String,
        dep_type: String,
    },

    #[error("dependency not found: {blocked} <- {blocker} ({dep_type})")]
    DependencyNotFound {
        blocked: String,
        blocker: String,
        dep_type: String,
    },

    #[error("element {0} still has dependents")]
    HasDependents(String),

    #[error("task {task_id} already assigned to {assignee}")]
    AlreadyAssigned { task_id: String, assignee: String },

    #[error("agent {0} already has an active session")]
    ActiveSessionExists(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {session_id} does not belong to agent {agent_id}")]
    WrongAgent {
        session_id: String,
        agent_id: String,
    },

    #[error("sync conflict on {element_id}: {message}")]
    SyncConflict {
        element_id: String,
        message: String,
    },

    #[error("database busy: {0}")]
    DatabaseBusy(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("git error: {message}")]
    Git { message: String },

    #[error("agent process error: {message}")]
    Agent { message: String },

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for FoundryError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                FoundryError::DatabaseBusy(err.to_string())
            }
            _ => FoundryError::DatabaseError(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for FoundryError {
    fn from(err: tokio::task::JoinError) -> Self {
        FoundryError::DatabaseError(format!("background task failed: {err}"))
    }
}

impl FoundryError {
    /// True for errors that may succeed on retry without any state change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FoundryError::DatabaseBusy(_))
    }
}
