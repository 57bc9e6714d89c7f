// ABOUTME: Queue manager: queue CRUD, agent records, membership lifecycle, eligibility
// ABOUTME: Owns Queue and Membership; the membership store beneath it is dumb persistence

use crate::error::{AcdError, Result};
use crate::store::{now, Database, Membership, MembershipState, MembershipStore};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Distribution policy of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Pick the eligible agent with the oldest last-assigned timestamp.
    LeastRecentlyAssigned,
    /// Rotate through eligible agents by id, continuing after the cursor.
    RoundRobin,
}

impl QueuePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeastRecentlyAssigned => "least-recently-assigned",
            Self::RoundRobin => "round-robin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "least-recently-assigned" => Some(Self::LeastRecentlyAssigned),
            "round-robin" => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

/// Agent presence, mutated by login/logout/pause commands and external
/// presence signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
    Paused,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Paused => "paused",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub display_name: Option<String>,
    pub presence: Presence,
    pub pause_reason: Option<String>,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    /// Globally unique; doubles as the name humans type in commands.
    pub queue_id: String,
    pub name: String,
    pub description: Option<String>,
    pub policy: QueuePolicy,
    pub max_wait_secs: Option<u64>,
    /// Per-queue coordination room, if one has been attached.
    pub room_id: Option<String>,
    pub archived: bool,
    pub created_at: String,
}

/// Fields accepted by `update_queue`. `None` leaves the column alone.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct QueueUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub policy: Option<QueuePolicy>,
    pub max_wait_secs: Option<u64>,
    pub room_id: Option<String>,
}

const QUEUE_COLS: &str =
    "queue_id, name, description, policy, max_wait_secs, room_id, archived, created_at";

#[derive(Clone)]
pub struct QueueManager {
    db: Database,
    memberships: MembershipStore,
    /// Per-agent cap on concurrent customer rooms. Default 1.
    concurrency_cap: u32,
}

impl QueueManager {
    pub fn new(db: Database, concurrency_cap: u32) -> Self {
        let memberships = MembershipStore::new(db.clone());
        Self {
            db,
            memberships,
            concurrency_cap,
        }
    }

    pub fn concurrency_cap(&self) -> u32 {
        self.concurrency_cap
    }

    pub fn membership_store(&self) -> &MembershipStore {
        &self.memberships
    }

    // ------------------------------------------------------------------
    // Queue CRUD
    // ------------------------------------------------------------------

    /// Create a queue. The id is the normalized name, which must be unique.
    pub fn create_queue(
        &self,
        name: &str,
        description: Option<&str>,
        policy: QueuePolicy,
    ) -> Result<Queue> {
        let queue_id = normalize_queue_id(name);
        if queue_id.is_empty() {
            return Err(AcdError::Usage("queue name must not be empty".to_string()));
        }
        let db = self.db.lock();
        let n = db.execute(
            "INSERT OR IGNORE INTO queues (queue_id, name, description, policy, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![queue_id, name, description, policy.as_str(), now()],
        )?;
        if n == 0 {
            return Err(AcdError::DuplicateName(queue_id));
        }
        drop(db);
        tracing::info!(queue_id, policy = policy.as_str(), "queue created");
        self.get_queue(&queue_id)
    }

    pub fn update_queue(&self, queue_id: &str, fields: QueueUpdate) -> Result<Queue> {
        // Existence check first so an empty update still reports NotFound.
        let current = self.get_queue(queue_id)?;
        let db = self.db.lock();
        db.execute(
            "UPDATE queues SET name = ?2, description = ?3, policy = ?4,
                    max_wait_secs = ?5, room_id = ?6
             WHERE queue_id = ?1",
            params![
                queue_id,
                fields.name.as_deref().unwrap_or(&current.name),
                fields
                    .description
                    .as_deref()
                    .or(current.description.as_deref()),
                fields.policy.unwrap_or(current.policy).as_str(),
                fields.max_wait_secs.or(current.max_wait_secs),
                fields.room_id.as_deref().or(current.room_id.as_deref()),
            ],
        )?;
        drop(db);
        self.get_queue(queue_id)
    }

    /// Archive instead of delete; memberships and history stay.
    pub fn archive_queue(&self, queue_id: &str) -> Result<()> {
        let db = self.db.lock();
        let n = db.execute(
            "UPDATE queues SET archived = 1 WHERE queue_id = ?1",
            params![queue_id],
        )?;
        if n == 0 {
            return Err(AcdError::not_found("queue", queue_id));
        }
        tracing::info!(queue_id, "queue archived");
        Ok(())
    }

    pub fn get_queue(&self, queue_id: &str) -> Result<Queue> {
        let db = self.db.lock();
        let mut stmt =
            db.prepare(&format!("SELECT {QUEUE_COLS} FROM queues WHERE queue_id = ?1"))?;
        stmt.query_row(params![queue_id], row_to_queue)
            .optional()?
            .ok_or_else(|| AcdError::not_found("queue", queue_id))
    }

    pub fn list_queues(&self) -> Result<Vec<Queue>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {QUEUE_COLS} FROM queues WHERE archived = 0 ORDER BY queue_id ASC"
        ))?;
        let rows = stmt
            .query_map([], row_to_queue)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Membership lifecycle
    // ------------------------------------------------------------------

    /// Idempotent: an existing membership is returned unchanged. A fresh
    /// one starts `active`; the agent record is created on first join with
    /// presence `online`.
    pub fn add_member(&self, queue_id: &str, agent_id: &str) -> Result<Membership> {
        self.get_queue(queue_id)?;
        if let Some(existing) = self.memberships.get(agent_id, queue_id)? {
            return Ok(existing);
        }
        self.ensure_agent(agent_id)?;
        let membership = Membership {
            agent_id: agent_id.to_string(),
            queue_id: queue_id.to_string(),
            state: MembershipState::Active,
            joined_at: now(),
            paused_at: None,
            pause_reason: None,
        };
        self.memberships.put(&membership)?;
        tracing::info!(agent_id, queue_id, "agent joined queue");
        Ok(membership)
    }

    /// Removing a membership never touches assignments the agent already
    /// holds; those rooms stay with the agent until closed or transferred.
    pub fn remove_member(&self, queue_id: &str, agent_id: &str) -> Result<()> {
        if !self.memberships.delete(agent_id, queue_id)? {
            return Err(AcdError::NotMember {
                agent_id: agent_id.to_string(),
                queue_id: queue_id.to_string(),
            });
        }
        tracing::info!(agent_id, queue_id, "agent left queue");
        Ok(())
    }

    pub fn set_member_state(
        &self,
        queue_id: &str,
        agent_id: &str,
        state: MembershipState,
        pause_reason: Option<&str>,
    ) -> Result<Membership> {
        let mut membership =
            self.memberships
                .get(agent_id, queue_id)?
                .ok_or_else(|| AcdError::NotMember {
                    agent_id: agent_id.to_string(),
                    queue_id: queue_id.to_string(),
                })?;
        membership.state = state;
        match state {
            MembershipState::Paused => {
                membership.paused_at = Some(now());
                membership.pause_reason = pause_reason.map(|r| r.to_string());
            }
            MembershipState::Active => {
                membership.paused_at = None;
                membership.pause_reason = None;
            }
        }
        self.memberships.put(&membership)?;
        tracing::info!(agent_id, queue_id, state = state.as_str(), "membership state changed");
        Ok(membership)
    }

    pub fn get_membership(&self, queue_id: &str, agent_id: &str) -> Result<Option<Membership>> {
        self.memberships.get(agent_id, queue_id)
    }

    pub fn queue_members(&self, queue_id: &str) -> Result<Vec<Membership>> {
        self.get_queue(queue_id)?;
        self.memberships.for_queue(queue_id)
    }

    pub fn agent_queues(&self, agent_id: &str) -> Result<Vec<String>> {
        Ok(self
            .memberships
            .for_agent(agent_id)?
            .into_iter()
            .map(|m| m.queue_id)
            .collect())
    }

    // ------------------------------------------------------------------
    // Agents and presence
    // ------------------------------------------------------------------

    pub(crate) fn ensure_agent(&self, agent_id: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT OR IGNORE INTO agents (agent_id, presence, created_at)
             VALUES (?1, 'online', ?2)",
            params![agent_id, now()],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT agent_id, display_name, presence, pause_reason, active, created_at
             FROM agents WHERE agent_id = ?1",
        )?;
        stmt.query_row(params![agent_id], row_to_agent)
            .optional()?
            .ok_or_else(|| AcdError::not_found("agent", agent_id))
    }

    pub fn set_presence(
        &self,
        agent_id: &str,
        presence: Presence,
        pause_reason: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock();
        let n = db.execute(
            "UPDATE agents SET presence = ?2, pause_reason = ?3 WHERE agent_id = ?1",
            params![agent_id, presence.as_str(), pause_reason],
        )?;
        if n == 0 {
            return Err(AcdError::not_found("agent", agent_id));
        }
        tracing::info!(agent_id, presence = presence.as_str(), "presence changed");
        Ok(())
    }

    /// Deactivate without deleting; history keeps referencing the id.
    pub fn deactivate_agent(&self, agent_id: &str) -> Result<()> {
        let db = self.db.lock();
        let n = db.execute(
            "UPDATE agents SET active = 0, presence = 'offline' WHERE agent_id = ?1",
            params![agent_id],
        )?;
        if n == 0 {
            return Err(AcdError::not_found("agent", agent_id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Eligibility
    // ------------------------------------------------------------------

    /// Agents currently distributable for a queue: membership `active`,
    /// presence `online`, not deactivated, and holding fewer open customer
    /// rooms than the cap. Ordered least-recently-assigned first (never
    /// assigned sorts before everyone), ties broken by agent id ascending.
    pub fn list_active_agents(&self, queue_id: &str) -> Result<Vec<String>> {
        self.list_eligible_agents(queue_id, self.concurrency_cap)
    }

    /// Same scan with an explicit cap, used by escalation's relaxed pick.
    pub fn list_eligible_agents(&self, queue_id: &str, cap: u32) -> Result<Vec<String>> {
        self.get_queue(queue_id)?;
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT m.agent_id, la.last_assigned
             FROM memberships m
             JOIN agents a ON a.agent_id = m.agent_id
             LEFT JOIN (
                 SELECT agent_id, MAX(assigned_at) AS last_assigned
                 FROM assignments GROUP BY agent_id
             ) la ON la.agent_id = m.agent_id
             WHERE m.queue_id = ?1
               AND m.state = 'active'
               AND a.presence = 'online'
               AND a.active = 1
               AND (
                 SELECT COUNT(*) FROM assignments s
                 JOIN rooms r ON r.room_id = s.room_id
                 WHERE s.agent_id = m.agent_id
                   AND s.superseded_at IS NULL
                   AND r.phase = 'assigned'
               ) < ?2
             ORDER BY la.last_assigned IS NOT NULL, la.last_assigned ASC, m.agent_id ASC",
        )?;
        let rows = stmt
            .query_map(params![queue_id, cap], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Round-robin cursor: the agent id assigned most recently under this
    /// queue's rotation.
    pub fn rr_cursor(&self, queue_id: &str) -> Result<Option<String>> {
        let db = self.db.lock();
        let cursor: Option<String> = db
            .query_row(
                "SELECT rr_cursor FROM queues WHERE queue_id = ?1",
                params![queue_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(cursor)
    }

    pub fn set_rr_cursor(&self, queue_id: &str, agent_id: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "UPDATE queues SET rr_cursor = ?2 WHERE queue_id = ?1",
            params![queue_id, agent_id],
        )?;
        Ok(())
    }
}

/// Lowercase, spaces collapsed to dashes. "Sales Team" -> "sales-team".
fn normalize_queue_id(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

fn row_to_queue(row: &rusqlite::Row<'_>) -> std::result::Result<Queue, rusqlite::Error> {
    let policy: String = row.get(3)?;
    let max_wait: Option<i64> = row.get(4)?;
    Ok(Queue {
        queue_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        policy: QueuePolicy::parse(&policy).unwrap_or(QueuePolicy::LeastRecentlyAssigned),
        max_wait_secs: max_wait.map(|v| v.max(0) as u64),
        room_id: row.get(5)?,
        archived: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> std::result::Result<Agent, rusqlite::Error> {
    let presence: String = row.get(2)?;
    Ok(Agent {
        agent_id: row.get(0)?,
        display_name: row.get(1)?,
        presence: Presence::parse(&presence).unwrap_or(Presence::Offline),
        pause_reason: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{AssignMethod, RoomStateMachine};

    fn manager() -> QueueManager {
        QueueManager::new(Database::open_in_memory().unwrap(), 1)
    }

    #[test]
    fn duplicate_queue_name_is_rejected() {
        let qm = manager();
        qm.create_queue("Sales", None, QueuePolicy::LeastRecentlyAssigned)
            .unwrap();
        let err = qm
            .create_queue("sales", Some("again"), QueuePolicy::RoundRobin)
            .unwrap_err();
        assert!(matches!(err, AcdError::DuplicateName(_)));
    }

    #[test]
    fn update_unknown_queue_is_not_found() {
        let qm = manager();
        let err = qm.update_queue("nope", QueueUpdate::default()).unwrap_err();
        assert!(matches!(err, AcdError::NotFound { .. }));
    }

    #[test]
    fn add_member_is_idempotent() {
        let qm = manager();
        qm.create_queue("sales", None, QueuePolicy::LeastRecentlyAssigned)
            .unwrap();
        let first = qm.add_member("sales", "a1").unwrap();
        // Pause, then re-add: the existing membership comes back untouched.
        qm.set_member_state("sales", "a1", MembershipState::Paused, Some("brb"))
            .unwrap();
        let second = qm.add_member("sales", "a1").unwrap();
        assert_eq!(second.state, MembershipState::Paused);
        assert_eq!(first.joined_at, second.joined_at);
        assert_eq!(qm.queue_members("sales").unwrap().len(), 1);
    }

    #[test]
    fn set_member_state_requires_membership() {
        let qm = manager();
        qm.create_queue("sales", None, QueuePolicy::LeastRecentlyAssigned)
            .unwrap();
        let err = qm
            .set_member_state("sales", "ghost", MembershipState::Active, None)
            .unwrap_err();
        assert!(matches!(err, AcdError::NotMember { .. }));
    }

    #[test]
    fn eligibility_filters_paused_and_offline() {
        let qm = manager();
        qm.create_queue("sales", None, QueuePolicy::LeastRecentlyAssigned)
            .unwrap();
        qm.add_member("sales", "a1").unwrap();
        qm.add_member("sales", "a2").unwrap();
        qm.add_member("sales", "a3").unwrap();
        qm.set_member_state("sales", "a2", MembershipState::Paused, None)
            .unwrap();
        qm.set_presence("a3", Presence::Offline, None).unwrap();

        assert_eq!(qm.list_active_agents("sales").unwrap(), vec!["a1"]);
    }

    #[test]
    fn concurrency_cap_excludes_busy_agents() {
        let db = Database::open_in_memory().unwrap();
        let qm = QueueManager::new(db.clone(), 1);
        let sm = RoomStateMachine::new(db);
        qm.create_queue("sales", None, QueuePolicy::LeastRecentlyAssigned)
            .unwrap();
        qm.add_member("sales", "a1").unwrap();

        sm.register_customer_room("!r1", "line1", "sales", None).unwrap();
        sm.mark_assigned("!r1", "a1", AssignMethod::Distributed, None).unwrap();
        assert!(qm.list_active_agents("sales").unwrap().is_empty());

        // Raising the cap lets the same agent through again.
        assert_eq!(qm.list_eligible_agents("sales", 2).unwrap(), vec!["a1"]);

        // Closing the room releases the slot.
        sm.close("!r1", "resolved").unwrap();
        assert_eq!(qm.list_active_agents("sales").unwrap(), vec!["a1"]);
    }

    #[test]
    fn least_recently_assigned_ordering() {
        let db = Database::open_in_memory().unwrap();
        let qm = QueueManager::new(db.clone(), 5);
        let sm = RoomStateMachine::new(db);
        qm.create_queue("sales", None, QueuePolicy::LeastRecentlyAssigned)
            .unwrap();
        for agent in ["a1", "a2", "a3"] {
            qm.add_member("sales", agent).unwrap();
        }

        // a1 assigned first, then a2; a3 never assigned.
        sm.register_customer_room("!r1", "line1", "sales", None).unwrap();
        sm.mark_assigned("!r1", "a1", AssignMethod::Distributed, None).unwrap();
        sm.register_customer_room("!r2", "line1", "sales", None).unwrap();
        sm.mark_assigned("!r2", "a2", AssignMethod::Distributed, None).unwrap();

        // Never-assigned first, then oldest assignment.
        assert_eq!(
            qm.list_active_agents("sales").unwrap(),
            vec!["a3", "a1", "a2"]
        );
    }

    #[test]
    fn remove_member_leaves_assignments_alone() {
        let db = Database::open_in_memory().unwrap();
        let qm = QueueManager::new(db.clone(), 1);
        let sm = RoomStateMachine::new(db);
        qm.create_queue("sales", None, QueuePolicy::LeastRecentlyAssigned)
            .unwrap();
        qm.add_member("sales", "a1").unwrap();
        sm.register_customer_room("!r1", "line1", "sales", None).unwrap();
        sm.mark_assigned("!r1", "a1", AssignMethod::Distributed, None).unwrap();

        qm.remove_member("sales", "a1").unwrap();
        let live = sm.current_assignment("!r1").unwrap().unwrap();
        assert_eq!(live.agent_id, "a1");
        assert!(matches!(
            qm.remove_member("sales", "a1").unwrap_err(),
            AcdError::NotMember { .. }
        ));
    }
}
