// ABOUTME: Per-conversation lifecycle: room roles, phases, and assignment history
// ABOUTME: Transitions are atomic conditional updates; conflicting transitions get InvalidTransition

use crate::error::{AcdError, Result};
use crate::store::{now, Database};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a protocol room is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomRole {
    /// Agent/supervisor management room for one line.
    Control,
    /// Per-queue coordination room.
    Queue,
    /// The end-user conversation.
    Customer,
}

impl RoomRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Queue => "queue",
            Self::Customer => "customer",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "control" => Some(Self::Control),
            "queue" => Some(Self::Queue),
            "customer" => Some(Self::Customer),
            _ => None,
        }
    }
}

/// Customer room phase. Registration lands a room directly in
/// `PendingDistribution`; `Created` is the resting phase of control and
/// queue rooms, which have no distribution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    Created,
    PendingDistribution,
    Assigned,
    Closed,
}

impl RoomPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PendingDistribution => "pending_distribution",
            Self::Assigned => "assigned",
            Self::Closed => "closed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "pending_distribution" => Some(Self::PendingDistribution),
            "assigned" => Some(Self::Assigned),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoomPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an assignment came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignMethod {
    /// Picked by the distribution engine's normal eligibility scan.
    Distributed,
    /// Produced by a transfer re-entering distribution.
    Transferred,
    /// Direct assignment (`pm`, `force-assign`, or timeout escalation).
    Forced,
}

impl AssignMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Distributed => "distributed",
            Self::Transferred => "transferred",
            Self::Forced => "forced",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "distributed" => Some(Self::Distributed),
            "transferred" => Some(Self::Transferred),
            "forced" => Some(Self::Forced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub role: RoomRole,
    pub line_id: Option<String>,
    pub queue_id: Option<String>,
    pub phase: RoomPhase,
    /// Method the next assignment will be recorded with (reset to
    /// `distributed` on registration, `transferred` after a transfer).
    pub pending_method: AssignMethod,
    pub customer: Option<String>,
    pub created_at: String,
    pub phase_changed_at: String,
}

/// Binding of an agent to a customer room. Superseded on transfer, never
/// deleted; the non-superseded row is the live one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub room_id: String,
    pub agent_id: String,
    pub method: AssignMethod,
    pub assigned_at: String,
    pub superseded_at: Option<String>,
}

const ROOM_COLS: &str =
    "room_id, role, line_id, queue_id, phase, pending_method, customer, created_at, phase_changed_at";
const ASSIGNMENT_COLS: &str = "id, room_id, agent_id, method, assigned_at, superseded_at";

/// Owner of `Room` and `Assignment` state. Every transition reads and
/// writes phase in one conditional statement, so concurrent conflicting
/// transitions lose with `InvalidTransition` instead of overwriting.
#[derive(Clone)]
pub struct RoomStateMachine {
    db: Database,
}

impl RoomStateMachine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register an inbound customer conversation. The room enters
    /// `pending_distribution` immediately.
    pub fn register_customer_room(
        &self,
        room_id: &str,
        line_id: &str,
        initial_queue_id: &str,
        customer: Option<&str>,
    ) -> Result<Room> {
        let db = self.db.lock();
        let ts = now();
        let n = db.execute(
            "INSERT OR IGNORE INTO rooms
             (room_id, role, line_id, queue_id, phase, pending_method, customer, created_at, phase_changed_at)
             VALUES (?1, 'customer', ?2, ?3, 'pending_distribution', 'distributed', ?4, ?5, ?5)",
            params![room_id, line_id, initial_queue_id, customer, ts],
        )?;
        if n == 0 {
            return Err(AcdError::AlreadyRegistered(room_id.to_string()));
        }
        drop(db);
        tracing::info!(room_id, line_id, queue_id = initial_queue_id, "customer room registered");
        self.get_room(room_id)
    }

    /// Register a control or queue room. These never enter distribution.
    pub fn register_service_room(
        &self,
        room_id: &str,
        role: RoomRole,
        line_id: Option<&str>,
        queue_id: Option<&str>,
    ) -> Result<Room> {
        let db = self.db.lock();
        let ts = now();
        let n = db.execute(
            "INSERT OR IGNORE INTO rooms
             (room_id, role, line_id, queue_id, phase, pending_method, customer, created_at, phase_changed_at)
             VALUES (?1, ?2, ?3, ?4, 'created', 'distributed', NULL, ?5, ?5)",
            params![room_id, role.as_str(), line_id, queue_id, ts],
        )?;
        if n == 0 {
            return Err(AcdError::AlreadyRegistered(room_id.to_string()));
        }
        drop(db);
        self.get_room(room_id)
    }

    /// `pending_distribution` -> `assigned`, creating the assignment row in
    /// the same transaction. When `cap` is given, the agent's open-room
    /// count is re-verified inside the transaction: eligibility scans run
    /// outside it, so two rooms distributing concurrently could otherwise
    /// both take the same agent's last slot. `None` bypasses the check
    /// (direct assignment).
    pub fn mark_assigned(
        &self,
        room_id: &str,
        agent_id: &str,
        method: AssignMethod,
        cap: Option<u32>,
    ) -> Result<Assignment> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        if let Some(cap) = cap {
            let open: i64 = tx.query_row(
                "SELECT COUNT(*) FROM assignments s
                 JOIN rooms r ON r.room_id = s.room_id
                 WHERE s.agent_id = ?1 AND s.superseded_at IS NULL
                   AND r.phase = 'assigned'",
                params![agent_id],
                |row| row.get(0),
            )?;
            if open as u64 >= cap as u64 {
                return Err(AcdError::AgentAtCapacity {
                    agent_id: agent_id.to_string(),
                });
            }
        }
        let ts = now();
        let n = tx.execute(
            "UPDATE rooms SET phase = 'assigned', phase_changed_at = ?2
             WHERE room_id = ?1 AND phase = 'pending_distribution'",
            params![room_id, ts],
        )?;
        if n == 0 {
            let from = current_phase(&tx, room_id)?
                .ok_or_else(|| AcdError::not_found("room", room_id))?;
            return Err(AcdError::InvalidTransition {
                room_id: room_id.to_string(),
                from,
                attempted: "assigned",
            });
        }
        let assignment = Assignment {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            agent_id: agent_id.to_string(),
            method,
            assigned_at: ts,
            superseded_at: None,
        };
        tx.execute(
            "INSERT INTO assignments (id, room_id, agent_id, method, assigned_at, superseded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                assignment.id,
                assignment.room_id,
                assignment.agent_id,
                assignment.method.as_str(),
                assignment.assigned_at,
            ],
        )?;
        tx.commit()?;
        tracing::info!(room_id, agent_id, method = method.as_str(), "room assigned");
        Ok(assignment)
    }

    /// `assigned` -> `pending_distribution` against the target queue. The
    /// live assignment is marked superseded, preserving history.
    pub fn request_transfer(
        &self,
        room_id: &str,
        target_queue_id: &str,
        by_whom: &str,
    ) -> Result<()> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let ts = now();
        let n = tx.execute(
            "UPDATE rooms SET phase = 'pending_distribution', queue_id = ?2,
                    pending_method = 'transferred', phase_changed_at = ?3
             WHERE room_id = ?1 AND phase = 'assigned'",
            params![room_id, target_queue_id, ts],
        )?;
        if n == 0 {
            let from = current_phase(&tx, room_id)?
                .ok_or_else(|| AcdError::not_found("room", room_id))?;
            return Err(AcdError::InvalidTransition {
                room_id: room_id.to_string(),
                from,
                attempted: "pending_distribution",
            });
        }
        tx.execute(
            "UPDATE assignments SET superseded_at = ?2
             WHERE room_id = ?1 AND superseded_at IS NULL",
            params![room_id, ts],
        )?;
        tx.commit()?;
        tracing::info!(room_id, target_queue_id, by_whom, "transfer requested");
        Ok(())
    }

    /// Close from any non-closed phase. Idempotent: closing a closed room
    /// is a no-op. The final assignment stays non-superseded as the
    /// historical record of who handled the conversation.
    pub fn close(&self, room_id: &str, reason: &str) -> Result<()> {
        let db = self.db.lock();
        let n = db.execute(
            "UPDATE rooms SET phase = 'closed', phase_changed_at = ?2
             WHERE room_id = ?1 AND phase != 'closed'",
            params![room_id, now()],
        )?;
        if n == 0 {
            let exists: bool = db
                .query_row(
                    "SELECT 1 FROM rooms WHERE room_id = ?1",
                    params![room_id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if !exists {
                return Err(AcdError::not_found("room", room_id));
            }
            return Ok(());
        }
        tracing::info!(room_id, reason, "room closed");
        Ok(())
    }

    pub fn get_phase(&self, room_id: &str) -> Result<RoomPhase> {
        let db = self.db.lock();
        current_phase(&db, room_id)?.ok_or_else(|| AcdError::not_found("room", room_id))
    }

    pub fn get_room(&self, room_id: &str) -> Result<Room> {
        let db = self.db.lock();
        let mut stmt =
            db.prepare(&format!("SELECT {ROOM_COLS} FROM rooms WHERE room_id = ?1"))?;
        stmt.query_row(params![room_id], row_to_room)
            .optional()?
            .ok_or_else(|| AcdError::not_found("room", room_id))
    }

    /// Pending rooms of a queue, oldest pending first — the order the
    /// engine sweeps them in when availability changes.
    pub fn pending_rooms_for_queue(&self, queue_id: &str) -> Result<Vec<Room>> {
        self.pending_rooms_where("queue_id = ?1", queue_id)
    }

    /// Pending rooms behind one bridge line, for recovery sweeps.
    pub fn pending_rooms_for_line(&self, line_id: &str) -> Result<Vec<Room>> {
        self.pending_rooms_where("line_id = ?1", line_id)
    }

    fn pending_rooms_where(&self, cond: &str, arg: &str) -> Result<Vec<Room>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {ROOM_COLS} FROM rooms
             WHERE phase = 'pending_distribution' AND {cond}
             ORDER BY phase_changed_at ASC, room_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![arg], row_to_room)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The live (non-superseded) assignment, if any.
    pub fn current_assignment(&self, room_id: &str) -> Result<Option<Assignment>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {ASSIGNMENT_COLS} FROM assignments
             WHERE room_id = ?1 AND superseded_at IS NULL
             ORDER BY assigned_at DESC LIMIT 1"
        ))?;
        let row = stmt
            .query_row(params![room_id], row_to_assignment)
            .optional()?;
        Ok(row)
    }

    /// Full distribution history for a room, oldest first.
    pub fn assignment_history(&self, room_id: &str) -> Result<Vec<Assignment>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {ASSIGNMENT_COLS} FROM assignments
             WHERE room_id = ?1 ORDER BY assigned_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![room_id], row_to_assignment)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Agents whose assignment in this room was superseded within the
    /// cool-down window. Excluded from re-selection so a transfer does not
    /// bounce straight back.
    pub fn recently_superseded_agents(
        &self,
        room_id: &str,
        window_secs: u64,
    ) -> Result<Vec<String>> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(window_secs as i64))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT DISTINCT agent_id FROM assignments
             WHERE room_id = ?1 AND superseded_at IS NOT NULL AND superseded_at > ?2",
        )?;
        let rows = stmt
            .query_map(params![room_id, cutoff], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn current_phase(conn: &rusqlite::Connection, room_id: &str) -> Result<Option<RoomPhase>> {
    let phase: Option<String> = conn
        .query_row(
            "SELECT phase FROM rooms WHERE room_id = ?1",
            params![room_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(phase.and_then(|p| RoomPhase::parse(&p)))
}

fn row_to_room(row: &rusqlite::Row<'_>) -> std::result::Result<Room, rusqlite::Error> {
    let role: String = row.get(1)?;
    let phase: String = row.get(4)?;
    let pending: String = row.get(5)?;
    Ok(Room {
        room_id: row.get(0)?,
        role: RoomRole::parse(&role).unwrap_or(RoomRole::Customer),
        line_id: row.get(2)?,
        queue_id: row.get(3)?,
        phase: RoomPhase::parse(&phase).unwrap_or(RoomPhase::Closed),
        pending_method: AssignMethod::parse(&pending).unwrap_or(AssignMethod::Distributed),
        customer: row.get(6)?,
        created_at: row.get(7)?,
        phase_changed_at: row.get(8)?,
    })
}

fn row_to_assignment(row: &rusqlite::Row<'_>) -> std::result::Result<Assignment, rusqlite::Error> {
    let method: String = row.get(3)?;
    Ok(Assignment {
        id: row.get(0)?,
        room_id: row.get(1)?,
        agent_id: row.get(2)?,
        method: AssignMethod::parse(&method).unwrap_or(AssignMethod::Distributed),
        assigned_at: row.get(4)?,
        superseded_at: row.get(5)?,
    })
}
