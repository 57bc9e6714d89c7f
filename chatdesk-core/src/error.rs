// ABOUTME: Typed error kinds for every core routing contract
// ABOUTME: Callers match on these; user-facing text is rendered by the command processor

use crate::room::RoomPhase;
use thiserror::Error;

/// Errors produced by the routing core. None of these are process-fatal:
/// the worst steady state is a room parked in `pending_distribution` with
/// the no-agents signal active.
#[derive(Error, Debug)]
pub enum AcdError {
    /// Unknown queue, room, agent, or membership.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A queue with this identifier already exists.
    #[error("queue name already in use: {0}")]
    DuplicateName(String),

    /// The room id is already registered.
    #[error("room already registered: {0}")]
    AlreadyRegistered(String),

    /// A state-machine transition was attempted from the wrong phase.
    /// Never silently coerced; the caller decides how to surface it.
    #[error("invalid transition for {room_id}: {from} -> {attempted}")]
    InvalidTransition {
        room_id: String,
        from: RoomPhase,
        attempted: &'static str,
    },

    /// The agent has no membership in the named queue.
    #[error("{agent_id} is not a member of queue {queue_id}")]
    NotMember { agent_id: String, queue_id: String },

    /// The agent already holds their full complement of open rooms. Raised
    /// inside the assignment transaction, where the count is authoritative.
    #[error("{agent_id} is at their concurrent conversation limit")]
    AgentAtCapacity { agent_id: String },

    /// The sender's role is below the verb's required role.
    #[error("you are not allowed to use `{verb}` (requires {required})")]
    Forbidden { verb: String, required: String },

    /// Verb not in the command table. Non-fatal; reported into the room.
    #[error("unrecognized command `{0}`")]
    UnknownCommand(String),

    /// The bridge serving this line is degraded or down. Distribution for
    /// the line is suspended, existing assignments are left alone.
    #[error("bridge for line {line_id} is unavailable")]
    BridgeUnavailable { line_id: String },

    /// An emitted transport action (invite/send/power-level) failed. The
    /// state transition it followed is already committed and stays.
    #[error("side effect failed: {action}: {detail}")]
    SideEffectFailed { action: &'static str, detail: String },

    /// Malformed or missing command arguments.
    #[error("{0}")]
    Usage(String),

    /// SQLite fault underneath a store.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, AcdError>;

impl AcdError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}
