// ABOUTME: Distribution engine: picks agents for pending rooms, handles transfers,
// ABOUTME: timeout escalation with cancellable timers, and bridge-health gating

use crate::error::{AcdError, Result};
use crate::locks::LockTable;
use crate::metrics;
use crate::queue::{QueueManager, QueuePolicy};
use crate::room::{AssignMethod, Assignment, RoomPhase, RoomStateMachine};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Side effects the engine emits. Implementations talk to the transport
/// layer; failures are reported, never rolled back — the engine tracks
/// intended routing, not delivery.
#[async_trait]
pub trait DistributionNotifier: Send + Sync {
    /// Ask the transport to invite the agent into the customer room.
    async fn invite_agent(&self, room_id: &str, agent_id: &str) -> Result<()>;

    /// No eligible agent right now; consumed by a menu-bot or notifier.
    async fn no_agents_available(&self, room_id: &str, queue_id: &str);

    /// Max-wait elapsed while still pending; broadcast to the queue room.
    async fn escalation_alert(&self, room_id: &str, queue_id: &str);
}

/// Bridge health as seen by the engine. Lines whose bridge is degraded or
/// down are excluded from new distribution; existing assignments stand.
pub trait BridgeHealth: Send + Sync {
    fn line_available(&self, line_id: &str) -> bool;
}

/// Health source that never gates anything; useful when no bridges are
/// wired in (tests, pure-provisioning deployments).
pub struct AlwaysAvailable;

impl BridgeHealth for AlwaysAvailable {
    fn line_available(&self, _line_id: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// Concurrent customer rooms per agent before they stop being eligible.
    pub concurrency_cap: u32,
    /// Window after a transfer during which the superseded agent is not
    /// re-selected for the same room.
    pub transfer_cooldown_secs: u64,
    /// Max wait before escalation, for queues that set none of their own.
    pub default_max_wait_secs: u64,
    /// Whether escalation attempts a forced assignment after alerting.
    pub escalate_force_assign: bool,
    /// Forced picks ignore the concurrency cap entirely...
    pub escalation_ignores_cap: bool,
    /// ...or merely relax it by this many rooms (used when the above is
    /// false). Default: slack of 1.
    pub escalation_cap_slack: u32,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 1,
            transfer_cooldown_secs: 300,
            default_max_wait_secs: 120,
            escalate_force_assign: true,
            escalation_ignores_cap: false,
            escalation_cap_slack: 1,
        }
    }
}

/// For every room in `pending_distribution`, pick exactly one eligible
/// agent or leave the room pending until the next availability event. All
/// room mutation happens under that room's keyed lock; the escalation
/// timer per pending room is cancelled on any exit from the phase.
pub struct DistributionEngine {
    queues: QueueManager,
    rooms: RoomStateMachine,
    locks: Arc<LockTable>,
    notifier: Arc<dyn DistributionNotifier>,
    bridges: Arc<dyn BridgeHealth>,
    timers: Mutex<HashMap<String, AbortHandle>>,
    config: DistributionConfig,
}

impl DistributionEngine {
    pub fn new(
        queues: QueueManager,
        rooms: RoomStateMachine,
        locks: Arc<LockTable>,
        notifier: Arc<dyn DistributionNotifier>,
        bridges: Arc<dyn BridgeHealth>,
        config: DistributionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues,
            rooms,
            locks,
            notifier,
            bridges,
            timers: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn rooms(&self) -> &RoomStateMachine {
        &self.rooms
    }

    /// Attempt to assign a pending room. Returns `Ok(None)` when the room
    /// is no longer pending or no agent is eligible (the room then waits
    /// for the next availability event, with the escalation timer armed).
    pub async fn distribute(self: &Arc<Self>, room_id: &str) -> Result<Option<Assignment>> {
        let _guard = self.locks.acquire(room_id).await;
        self.distribute_locked(room_id).await
    }

    async fn distribute_locked(self: &Arc<Self>, room_id: &str) -> Result<Option<Assignment>> {
        let room = self.rooms.get_room(room_id)?;
        if room.phase != RoomPhase::PendingDistribution {
            return Ok(None);
        }
        let queue_id = room
            .queue_id
            .clone()
            .ok_or_else(|| AcdError::not_found("queue for room", room_id))?;

        if let Some(line_id) = &room.line_id {
            if !self.bridges.line_available(line_id) {
                tracing::warn!(room_id, line_id, "bridge unavailable, room stays pending");
                self.arm_timer(room_id, &queue_id);
                return Ok(None);
            }
        }

        let queue = self.queues.get_queue(&queue_id)?;
        let cooling = self
            .rooms
            .recently_superseded_agents(room_id, self.config.transfer_cooldown_secs)?;
        let candidates: Vec<String> = self
            .queues
            .list_active_agents(&queue_id)?
            .into_iter()
            .filter(|a| !cooling.contains(a))
            .collect();

        let ordered = match queue.policy {
            QueuePolicy::LeastRecentlyAssigned => candidates,
            QueuePolicy::RoundRobin => {
                rotation_order(candidates, self.queues.rr_cursor(&queue_id)?)
            }
        };

        let method = room.pending_method;
        let mut assigned = None;
        for agent_id in &ordered {
            match self
                .rooms
                .mark_assigned(room_id, agent_id, method, Some(self.config.concurrency_cap))
            {
                Ok(a) => {
                    assigned = Some(a);
                    break;
                }
                // Another room took this agent's last slot between the
                // eligibility scan and here; try the next candidate.
                Err(AcdError::AgentAtCapacity { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        let Some(assignment) = assigned else {
            tracing::debug!(room_id, queue_id, "no eligible agents, room stays pending");
            metrics::record_no_agents(&queue_id);
            self.notifier.no_agents_available(room_id, &queue_id).await;
            self.arm_timer(room_id, &queue_id);
            return Ok(None);
        };

        if queue.policy == QueuePolicy::RoundRobin {
            self.queues.set_rr_cursor(&queue_id, &assignment.agent_id)?;
        }
        self.cancel_timer(room_id);
        metrics::record_distribution(method.as_str());
        self.record_wait(&room.phase_changed_at);

        self.emit_invite(room_id, &assignment.agent_id).await;
        Ok(Some(assignment))
    }

    /// Transfer to another queue and immediately re-enter distribution
    /// against it. The superseded agent cools down before re-selection.
    pub async fn transfer_room(
        self: &Arc<Self>,
        room_id: &str,
        target_queue_id: &str,
        by_whom: &str,
    ) -> Result<Option<Assignment>> {
        self.queues.get_queue(target_queue_id)?;
        let (released, result) = {
            let _guard = self.locks.acquire(room_id).await;
            let released = self
                .rooms
                .current_assignment(room_id)?
                .map(|a| a.agent_id);
            self.rooms.request_transfer(room_id, target_queue_id, by_whom)?;
            self.arm_timer(room_id, target_queue_id);
            let result = self.distribute_locked(room_id).await?;
            (released, result)
        };
        // The old agent's slot is free again; their other queues may have
        // rooms waiting.
        if let Some(agent_id) = released {
            self.retry_agent_queues(&agent_id).await;
        }
        Ok(result)
    }

    /// Direct assignment to a named agent (`pm`), bypassing eligibility.
    /// From `assigned`, the current assignment is superseded first.
    pub async fn assign_direct(
        self: &Arc<Self>,
        room_id: &str,
        agent_id: &str,
        by_whom: &str,
    ) -> Result<Assignment> {
        let _guard = self.locks.acquire(room_id).await;
        let room = self.rooms.get_room(room_id)?;
        match room.phase {
            RoomPhase::PendingDistribution => {}
            RoomPhase::Assigned => {
                let target = room.queue_id.as_deref().unwrap_or("");
                self.rooms.request_transfer(room_id, target, by_whom)?;
            }
            from => {
                return Err(AcdError::InvalidTransition {
                    room_id: room_id.to_string(),
                    from,
                    attempted: "assigned",
                })
            }
        }
        self.queues.ensure_agent(agent_id)?;
        let assignment = self
            .rooms
            .mark_assigned(room_id, agent_id, AssignMethod::Forced, None)?;
        self.cancel_timer(room_id);
        metrics::record_distribution(AssignMethod::Forced.as_str());
        tracing::info!(room_id, agent_id, by_whom, "direct assignment");
        self.emit_invite(room_id, agent_id).await;
        Ok(assignment)
    }

    /// Forced pick for a pending room with the relaxed cap — the manual
    /// counterpart of timeout escalation.
    pub async fn force_assign(self: &Arc<Self>, room_id: &str, by_whom: &str) -> Result<Assignment> {
        let _guard = self.locks.acquire(room_id).await;
        let room = self.rooms.get_room(room_id)?;
        if room.phase != RoomPhase::PendingDistribution {
            return Err(AcdError::InvalidTransition {
                room_id: room_id.to_string(),
                from: room.phase,
                attempted: "assigned",
            });
        }
        let queue_id = room
            .queue_id
            .clone()
            .ok_or_else(|| AcdError::not_found("queue for room", room_id))?;
        let mut assigned = None;
        for agent_id in self.relaxed_candidates(room_id, &queue_id)? {
            match self.rooms.mark_assigned(
                room_id,
                &agent_id,
                AssignMethod::Forced,
                Some(self.relaxed_cap()),
            ) {
                Ok(a) => {
                    assigned = Some(a);
                    break;
                }
                Err(AcdError::AgentAtCapacity { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        let assignment =
            assigned.ok_or_else(|| AcdError::not_found("eligible agent", queue_id.clone()))?;
        self.cancel_timer(room_id);
        metrics::record_distribution(AssignMethod::Forced.as_str());
        tracing::info!(room_id, agent_id = %assignment.agent_id, by_whom, "forced assignment");
        self.emit_invite(room_id, &assignment.agent_id).await;
        Ok(assignment)
    }

    /// Close a room, cancel its escalation timer, and hand the freed agent
    /// slot to whatever is waiting in their queues.
    pub async fn close_room(self: &Arc<Self>, room_id: &str, reason: &str) -> Result<()> {
        let released = {
            let _guard = self.locks.acquire(room_id).await;
            self.cancel_timer(room_id);
            let released = self
                .rooms
                .current_assignment(room_id)?
                .map(|a| a.agent_id);
            self.rooms.close(room_id, reason)?;
            released
        };
        if let Some(agent_id) = released {
            self.retry_agent_queues(&agent_id).await;
        }
        Ok(())
    }

    /// An agent joined, resumed, or logged in: sweep the queue's pending
    /// rooms, oldest first. Event-driven; nothing polls.
    pub async fn on_agent_available(self: &Arc<Self>, queue_id: &str) {
        let pending = match self.rooms.pending_rooms_for_queue(queue_id) {
            Ok(rooms) => rooms,
            Err(e) => {
                tracing::error!(queue_id, error = %e, "pending sweep failed");
                return;
            }
        };
        for room in pending {
            if let Err(e) = self.distribute(&room.room_id).await {
                tracing::error!(room_id = %room.room_id, error = %e, "re-distribution failed");
            }
        }
    }

    /// Bridge status change. Recovery sweeps the line's pending rooms;
    /// degradation only logs — pending rooms stay parked and existing
    /// assignments are untouched.
    pub async fn on_bridge_status(self: &Arc<Self>, line_id: &str, available: bool) {
        if !available {
            tracing::warn!(line_id, "line excluded from distribution");
            return;
        }
        tracing::info!(line_id, "line recovered, re-attempting pending rooms");
        let pending = match self.rooms.pending_rooms_for_line(line_id) {
            Ok(rooms) => rooms,
            Err(e) => {
                tracing::error!(line_id, error = %e, "pending sweep failed");
                return;
            }
        };
        for room in pending {
            if let Err(e) = self.distribute(&room.room_id).await {
                tracing::error!(room_id = %room.room_id, error = %e, "re-distribution failed");
            }
        }
    }

    async fn retry_agent_queues(self: &Arc<Self>, agent_id: &str) {
        let queue_ids = match self.queues.agent_queues(agent_id) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(agent_id, error = %e, "queue lookup failed");
                return;
            }
        };
        for queue_id in queue_ids {
            self.on_agent_available(&queue_id).await;
        }
    }

    // ------------------------------------------------------------------
    // Escalation timers
    // ------------------------------------------------------------------

    fn max_wait(&self, queue_id: &str) -> Duration {
        let secs = self
            .queues
            .get_queue(queue_id)
            .ok()
            .and_then(|q| q.max_wait_secs)
            .unwrap_or(self.config.default_max_wait_secs);
        Duration::from_secs(secs)
    }

    /// Arm the escalation timer for a pending room, if not already armed.
    /// The timer is cancelled whenever the room leaves
    /// `pending_distribution` by any path.
    fn arm_timer(self: &Arc<Self>, room_id: &str, queue_id: &str) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if timers.contains_key(room_id) {
            return;
        }
        let wait = self.max_wait(queue_id);
        let engine = Arc::clone(self);
        let room = room_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            engine.escalate(&room).await;
        });
        timers.insert(room_id.to_string(), handle.abort_handle());
    }

    fn cancel_timer(&self, room_id: &str) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = timers.remove(room_id) {
            handle.abort();
        }
    }

    fn relaxed_cap(&self) -> u32 {
        if self.config.escalation_ignores_cap {
            u32::MAX
        } else {
            self.config.concurrency_cap + self.config.escalation_cap_slack
        }
    }

    fn relaxed_candidates(&self, room_id: &str, queue_id: &str) -> Result<Vec<String>> {
        let cooling = self
            .rooms
            .recently_superseded_agents(room_id, self.config.transfer_cooldown_secs)?;
        Ok(self
            .queues
            .list_eligible_agents(queue_id, self.relaxed_cap())?
            .into_iter()
            .filter(|a| !cooling.contains(a))
            .collect())
    }

    async fn escalate(self: &Arc<Self>, room_id: &str) {
        {
            let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
            timers.remove(room_id);
        }
        let _guard = self.locks.acquire(room_id).await;
        let room = match self.rooms.get_room(room_id) {
            Ok(room) => room,
            Err(_) => return,
        };
        // A stale timer must never fire after assignment; the abort on
        // cancel handles the common case, this guard the race.
        if room.phase != RoomPhase::PendingDistribution {
            return;
        }
        let Some(queue_id) = room.queue_id.clone() else {
            return;
        };
        tracing::warn!(room_id, queue_id, "max wait elapsed, escalating");
        metrics::record_escalation(&queue_id);
        self.notifier.escalation_alert(room_id, &queue_id).await;

        if !self.config.escalate_force_assign {
            return;
        }
        let candidates = match self.relaxed_candidates(room_id, &queue_id) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(room_id, error = %e, "escalation scan failed");
                return;
            }
        };
        for agent_id in candidates {
            match self.rooms.mark_assigned(
                room_id,
                &agent_id,
                AssignMethod::Forced,
                Some(self.relaxed_cap()),
            ) {
                Ok(_) => {
                    metrics::record_distribution(AssignMethod::Forced.as_str());
                    tracing::info!(room_id, agent_id, "escalation forced assignment");
                    self.emit_invite(room_id, &agent_id).await;
                    return;
                }
                Err(AcdError::AgentAtCapacity { .. }) => continue,
                Err(e) => {
                    tracing::error!(room_id, error = %e, "escalation assignment failed");
                    return;
                }
            }
        }
        tracing::warn!(room_id, queue_id, "escalation found no agent even relaxed");
    }

    // ------------------------------------------------------------------

    /// Fire the invite side effect. Failure is logged and counted, never
    /// rolled back: the committed assignment is the routing intent, and
    /// the notifier implementation owns retry.
    async fn emit_invite(&self, room_id: &str, agent_id: &str) {
        if let Err(e) = self.notifier.invite_agent(room_id, agent_id).await {
            metrics::record_side_effect_failure("invite");
            tracing::warn!(room_id, agent_id, error = %e, "agent invite failed");
        }
    }

    fn record_wait(&self, pending_since: &str) {
        if let Ok(since) = chrono::DateTime::parse_from_rfc3339(pending_since) {
            let waited = chrono::Utc::now().signed_duration_since(since);
            if let Ok(waited) = waited.to_std() {
                metrics::record_pending_wait(waited);
            }
        }
    }
}

/// Round-robin try order: agent ids ascending, starting just after the
/// cursor and wrapping back to the smallest id.
fn rotation_order(mut candidates: Vec<String>, cursor: Option<String>) -> Vec<String> {
    candidates.sort();
    if let Some(cursor) = cursor {
        let split = candidates
            .iter()
            .position(|a| a.as_str() > cursor.as_str())
            .unwrap_or(0);
        candidates.rotate_left(split);
    }
    candidates
}
