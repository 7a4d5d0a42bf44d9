//! System-wide constants for Foundry Core.

/// Default dispatch tick period. 2s keeps dispatch latency low without
/// hammering the store between ticks.
pub const TICK_PERIOD_MS: u64 = 2_000;

/// Cycle detection BFS depth bound. Traversals deeper than this report
/// `depth_limit_reached` and are treated as acyclic.
pub const CYCLE_CHECK_MAX_DEPTH: usize = 100;

/// Element id prefix shared by every stored record.
pub const ELEMENT_ID_PREFIX: &str = "el-";

/// Random slug length for freshly allocated element ids. 12 hex chars
/// keeps collision probability negligible at this system's scale.
pub const ELEMENT_ID_SLUG_LENGTH: usize = 12;

/// How long to wait for the `init` event after spawning an agent process
/// before aborting the session as starting-failed.
pub const SPAWN_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Grace period for a stopping session between the shutdown request and
/// the forced kill.
pub const GRACEFUL_STOP_TIMEOUT_MS: u64 = 10_000;

/// Deadline for the in-flight tick when the daemon is asked to stop.
pub const SHUTDOWN_DEADLINE_MS: u64 = 30_000;

/// Buffered events per session before the slowest consumer starts
/// losing the oldest ones.
pub const SESSION_EVENT_BUFFER: usize = 256;

/// Dispatch retry budget: abnormal session exits reopen the task this
/// many times before it is tombstoned.
pub const DEFAULT_TASK_RETRY_BUDGET: u32 = 3;

/// GC runs every Nth tick rather than every tick.
pub const GC_TICK_INTERVAL: u64 = 150;

/// Default maximum age before a finished ephemeral workflow is collected.
pub const GC_DEFAULT_MAX_AGE_MS: i64 = 7 * 24 * 3600 * 1000;

/// Bounded retry count for DATABASE_BUSY at the daemon layer.
pub const BUSY_RETRY_LIMIT: u32 = 3;

/// Base backoff between DATABASE_BUSY retries, jittered up to 2x.
pub const BUSY_RETRY_BACKOFF_MS: u64 = 50;

/// Fallback suspension when a rate-limit reset time fails to parse.
pub const RATE_LIMIT_FALLBACK_SECS: i64 = 3_600;

/// Fallback suspension for weekly-limit phrasing.
pub const RATE_LIMIT_WEEKLY_FALLBACK_SECS: i64 = 6 * 3_600;
