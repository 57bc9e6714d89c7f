// ABOUTME: SQLite persistence shared by the queue manager and room state machine
// ABOUTME: Owns schema creation plus the raw membership get/put/delete surface

use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared SQLite handle. All core stores clone this; the connection mutex is
/// what makes each individual statement atomic, and multi-statement
/// transitions run inside explicit transactions while holding the guard.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init_schema(&conn)?;
        tracing::info!(db = %path.as_ref().display(), "chatdesk database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests and available to embedders.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT PRIMARY KEY,
                display_name TEXT,
                presence TEXT NOT NULL DEFAULT 'online',
                pause_reason TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS queues (
                queue_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                policy TEXT NOT NULL DEFAULT 'least-recently-assigned',
                max_wait_secs INTEGER,
                room_id TEXT,
                rr_cursor TEXT,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS memberships (
                agent_id TEXT NOT NULL,
                queue_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'active',
                joined_at TEXT NOT NULL,
                paused_at TEXT,
                pause_reason TEXT,
                PRIMARY KEY (agent_id, queue_id)
            );
            CREATE INDEX IF NOT EXISTS idx_memberships_queue ON memberships(queue_id);
            CREATE TABLE IF NOT EXISTS rooms (
                room_id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                line_id TEXT,
                queue_id TEXT,
                phase TEXT NOT NULL,
                pending_method TEXT NOT NULL DEFAULT 'distributed',
                customer TEXT,
                created_at TEXT NOT NULL,
                phase_changed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rooms_phase ON rooms(phase);
            CREATE TABLE IF NOT EXISTS assignments (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                method TEXT NOT NULL,
                assigned_at TEXT NOT NULL,
                superseded_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_assignments_room ON assignments(room_id);
            CREATE INDEX IF NOT EXISTS idx_assignments_agent ON assignments(agent_id);",
        )?;
        Ok(())
    }
}

/// RFC 3339 timestamp in UTC with a fixed-width microsecond fraction, the
/// format every store column uses. Lexicographic order on these strings
/// matches chronological order, which the eligibility queries rely on.
pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Membership state: `active` members are distributable, `paused` ones stay
/// in the queue but receive nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    Active,
    Paused,
}

impl MembershipState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for MembershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent's membership in one queue. At most one row per (agent, queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub agent_id: String,
    pub queue_id: String,
    pub state: MembershipState,
    pub joined_at: String,
    pub paused_at: Option<String>,
    pub pause_reason: Option<String>,
}

/// Pure persistence beneath the queue manager: keyed get/put/delete plus a
/// by-queue index. No business rules live here.
#[derive(Clone)]
pub struct MembershipStore {
    db: Database,
}

impl MembershipStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, agent_id: &str, queue_id: &str) -> Result<Option<Membership>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT agent_id, queue_id, state, joined_at, paused_at, pause_reason
             FROM memberships WHERE agent_id = ?1 AND queue_id = ?2",
        )?;
        let row = stmt
            .query_row(params![agent_id, queue_id], row_to_membership)
            .optional()?;
        Ok(row)
    }

    /// Upsert on the (agent, queue) primary key.
    pub fn put(&self, membership: &Membership) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO memberships (agent_id, queue_id, state, joined_at, paused_at, pause_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id, queue_id) DO UPDATE SET
                state = excluded.state,
                paused_at = excluded.paused_at,
                pause_reason = excluded.pause_reason",
            params![
                membership.agent_id,
                membership.queue_id,
                membership.state.as_str(),
                membership.joined_at,
                membership.paused_at,
                membership.pause_reason,
            ],
        )?;
        Ok(())
    }

    /// Returns true when a row was actually removed.
    pub fn delete(&self, agent_id: &str, queue_id: &str) -> Result<bool> {
        let db = self.db.lock();
        let n = db.execute(
            "DELETE FROM memberships WHERE agent_id = ?1 AND queue_id = ?2",
            params![agent_id, queue_id],
        )?;
        Ok(n > 0)
    }

    pub fn for_queue(&self, queue_id: &str) -> Result<Vec<Membership>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT agent_id, queue_id, state, joined_at, paused_at, pause_reason
             FROM memberships WHERE queue_id = ?1 ORDER BY agent_id ASC",
        )?;
        let rows = stmt
            .query_map(params![queue_id], row_to_membership)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn for_agent(&self, agent_id: &str) -> Result<Vec<Membership>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT agent_id, queue_id, state, joined_at, paused_at, pause_reason
             FROM memberships WHERE agent_id = ?1 ORDER BY queue_id ASC",
        )?;
        let rows = stmt
            .query_map(params![agent_id], row_to_membership)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_membership(row: &rusqlite::Row<'_>) -> std::result::Result<Membership, rusqlite::Error> {
    let state: String = row.get(2)?;
    Ok(Membership {
        agent_id: row.get(0)?,
        queue_id: row.get(1)?,
        state: MembershipState::parse(&state).unwrap_or(MembershipState::Paused),
        joined_at: row.get(3)?,
        paused_at: row.get(4)?,
        pause_reason: row.get(5)?,
    })
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(agent: &str, queue: &str) -> Membership {
        Membership {
            agent_id: agent.to_string(),
            queue_id: queue.to_string(),
            state: MembershipState::Active,
            joined_at: now(),
            paused_at: None,
            pause_reason: None,
        }
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let store = MembershipStore::new(Database::open_in_memory().unwrap());
        assert!(store.get("a1", "sales").unwrap().is_none());

        store.put(&membership("a1", "sales")).unwrap();
        let got = store.get("a1", "sales").unwrap().unwrap();
        assert_eq!(got.state, MembershipState::Active);

        assert!(store.delete("a1", "sales").unwrap());
        assert!(!store.delete("a1", "sales").unwrap());
    }

    #[test]
    fn put_is_an_upsert_on_the_pair_key() {
        let store = MembershipStore::new(Database::open_in_memory().unwrap());
        let mut m = membership("a1", "sales");
        store.put(&m).unwrap();
        m.state = MembershipState::Paused;
        m.pause_reason = Some("lunch".to_string());
        store.put(&m).unwrap();

        let all = store.for_queue("sales").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, MembershipState::Paused);
        assert_eq!(all[0].pause_reason.as_deref(), Some("lunch"));
    }

    #[test]
    fn queue_index_is_ordered_by_agent() {
        let store = MembershipStore::new(Database::open_in_memory().unwrap());
        store.put(&membership("b", "q")).unwrap();
        store.put(&membership("a", "q")).unwrap();
        store.put(&membership("a", "other")).unwrap();

        let ids: Vec<_> = store
            .for_queue("q")
            .unwrap()
            .into_iter()
            .map(|m| m.agent_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
