// ABOUTME: Command processor: closed verb table with role gating, dispatching to
// ABOUTME: the queue manager, distribution engine, and room state machine

use crate::commands::Command;
use crate::distribution::DistributionEngine;
use crate::error::{AcdError, Result};
use crate::locks::LockTable;
use crate::metrics;
use crate::queue::{Presence, QueuePolicy, QueueUpdate};
use crate::store::MembershipState;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Operator roles, lowest first. A verb executes when the caller's role is
/// at least the verb's required role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Agent,
    Supervisor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Supervisor => "supervisor",
            Self::Admin => "admin",
        }
    }
}

/// Maps user ids to roles from configuration: explicit admin and
/// supervisor lists, and a user-id prefix that marks agents.
#[derive(Debug, Clone)]
pub struct RoleResolver {
    admins: HashSet<String>,
    supervisors: HashSet<String>,
    agent_prefix: String,
}

impl RoleResolver {
    pub fn new(
        admins: impl IntoIterator<Item = String>,
        supervisors: impl IntoIterator<Item = String>,
        agent_prefix: impl Into<String>,
    ) -> Self {
        Self {
            admins: admins.into_iter().collect(),
            supervisors: supervisors.into_iter().collect(),
            agent_prefix: agent_prefix.into(),
        }
    }

    /// `None` means the sender is no operator at all (a customer); their
    /// text is never treated as a command payload.
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.admins.contains(user_id) {
            Some(Role::Admin)
        } else if self.supervisors.contains(user_id) {
            Some(Role::Supervisor)
        } else if !self.agent_prefix.is_empty() && user_id.starts_with(&self.agent_prefix) {
            Some(Role::Agent)
        } else {
            None
        }
    }
}

/// Every verb the processor knows. Closed set: dispatch is a match, not a
/// reflection lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    QueueCreate,
    QueueEdit,
    QueueList,
    QueueInfo,
    QueueAdd,
    QueueRemove,
    QueuePause,
    QueueResume,
    Login,
    Logout,
    Transfer,
    Resolve,
    Pm,
    ForceAssign,
    BrCmd,
    Help,
}

impl Verb {
    pub const ALL: [Verb; 16] = [
        Verb::QueueCreate,
        Verb::QueueEdit,
        Verb::QueueList,
        Verb::QueueInfo,
        Verb::QueueAdd,
        Verb::QueueRemove,
        Verb::QueuePause,
        Verb::QueueResume,
        Verb::Login,
        Verb::Logout,
        Verb::Transfer,
        Verb::Resolve,
        Verb::Pm,
        Verb::ForceAssign,
        Verb::BrCmd,
        Verb::Help,
    ];

    /// Resolve verb and the number of leading args it consumed (the
    /// `queue` family spends one on the subcommand).
    fn resolve(cmd: &Command) -> Result<(Verb, usize)> {
        let verb = match cmd.name.as_str() {
            "queue" => match cmd.arg(0) {
                Some("create") => Verb::QueueCreate,
                Some("edit") => Verb::QueueEdit,
                Some("list") => Verb::QueueList,
                Some("info") => Verb::QueueInfo,
                Some("add") => Verb::QueueAdd,
                Some("remove") => Verb::QueueRemove,
                Some("pause") => Verb::QueuePause,
                Some("resume") => Verb::QueueResume,
                other => {
                    let sub = other.unwrap_or("");
                    return Err(AcdError::UnknownCommand(format!("queue {sub}").trim().into()));
                }
            },
            "login" => Verb::Login,
            "logout" => Verb::Logout,
            "transfer" => Verb::Transfer,
            "resolve" => Verb::Resolve,
            "pm" => Verb::Pm,
            "force-assign" => Verb::ForceAssign,
            "br-cmd" => Verb::BrCmd,
            "help" => Verb::Help,
            other => return Err(AcdError::UnknownCommand(other.to_string())),
        };
        let offset = if cmd.name == "queue" { 1 } else { 0 };
        Ok((verb, offset))
    }

    pub fn required_role(self) -> Role {
        match self {
            Verb::QueueCreate | Verb::QueueEdit | Verb::BrCmd => Role::Admin,
            Verb::QueueList
            | Verb::QueueInfo
            | Verb::QueueAdd
            | Verb::QueueRemove
            | Verb::Pm
            | Verb::ForceAssign => Role::Supervisor,
            Verb::QueuePause
            | Verb::QueueResume
            | Verb::Login
            | Verb::Logout
            | Verb::Transfer
            | Verb::Resolve
            | Verb::Help => Role::Agent,
        }
    }

    pub fn usage(self) -> &'static str {
        match self {
            Verb::QueueCreate => "queue create <name> [description...]",
            Verb::QueueEdit => "queue edit <queue> <name|description|policy|max-wait> <value...>",
            Verb::QueueList => "queue list",
            Verb::QueueInfo => "queue info <queue>",
            Verb::QueueAdd => "queue add <queue> <agent>",
            Verb::QueueRemove => "queue remove <queue> <agent>",
            Verb::QueuePause => "queue pause <queue> [agent] [reason...]",
            Verb::QueueResume => "queue resume <queue> [agent]",
            Verb::Login => "login [agent]",
            Verb::Logout => "logout [agent]",
            Verb::Transfer => "transfer [room] <queue>",
            Verb::Resolve => "resolve [room] [reason...]",
            Verb::Pm => "pm [room] <agent>",
            Verb::ForceAssign => "force-assign [room]",
            Verb::BrCmd => "br-cmd <bridge command...>",
            Verb::Help => "help",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Verb::QueueCreate => "Create a queue",
            Verb::QueueEdit => "Edit a queue field",
            Verb::QueueList => "List queues",
            Verb::QueueInfo => "Show a queue and its members",
            Verb::QueueAdd => "Add an agent to a queue",
            Verb::QueueRemove => "Remove an agent from a queue",
            Verb::QueuePause => "Pause a queue membership",
            Verb::QueueResume => "Resume a paused membership",
            Verb::Login => "Mark an agent online",
            Verb::Logout => "Mark an agent offline",
            Verb::Transfer => "Transfer a conversation to another queue",
            Verb::Resolve => "Close a conversation",
            Verb::Pm => "Assign a conversation directly to an agent",
            Verb::ForceAssign => "Force-assign a pending conversation",
            Verb::BrCmd => "Forward a command to the room's bridge",
            Verb::Help => "Show this help",
        }
    }
}

/// Opaque passthrough for `br-cmd`: the payload goes to the bridge
/// adapter verbatim and its response comes back verbatim.
#[async_trait]
pub trait BridgeCommander: Send + Sync {
    async fn run_command(&self, line_id: &str, raw: &str) -> Result<String>;
}

/// Commander for deployments without bridges wired in.
pub struct NoBridges;

#[async_trait]
impl BridgeCommander for NoBridges {
    async fn run_command(&self, line_id: &str, _raw: &str) -> Result<String> {
        Err(AcdError::BridgeUnavailable {
            line_id: line_id.to_string(),
        })
    }
}

/// Where a command came from.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub sender: String,
    pub room_id: String,
    /// Bridge line of the issuing room, when known; `br-cmd` needs it.
    pub line_id: Option<String>,
}

/// Parses nothing itself (see [`crate::commands`]); authorizes a parsed
/// command and dispatches it. Owns no state — a pure dispatcher over the
/// queue manager, room state machine, and distribution engine. Commands
/// from the same room serialize; different rooms run concurrently.
pub struct CommandProcessor {
    engine: Arc<DistributionEngine>,
    roles: RoleResolver,
    bridges: Arc<dyn BridgeCommander>,
    /// Keys are prefixed so they never collide with the engine's room
    /// locks (the engine re-locks rooms internally).
    locks: LockTable,
}

impl CommandProcessor {
    pub fn new(
        engine: Arc<DistributionEngine>,
        roles: RoleResolver,
        bridges: Arc<dyn BridgeCommander>,
    ) -> Self {
        Self {
            engine,
            roles,
            bridges,
            locks: LockTable::new(),
        }
    }

    /// Run one command to completion and produce the reply to render into
    /// the issuing room. Errors become human-readable text here — nothing
    /// is ever dropped silently.
    pub async fn handle(&self, ctx: &CommandContext, cmd: &Command) -> String {
        match self.handle_inner(ctx, cmd).await {
            Ok(reply) => reply,
            Err(e) => render_error(&e),
        }
    }

    async fn handle_inner(&self, ctx: &CommandContext, cmd: &Command) -> Result<String> {
        let (verb, offset) = Verb::resolve(cmd)?;
        metrics::record_command(&cmd.name);

        let role = self.roles.role_of(&ctx.sender).ok_or(AcdError::Forbidden {
            verb: cmd.name.clone(),
            required: verb.required_role().as_str().to_string(),
        })?;
        if role < verb.required_role() {
            return Err(AcdError::Forbidden {
                verb: cmd.name.clone(),
                required: verb.required_role().as_str().to_string(),
            });
        }

        // One command per room at a time; the engine's own room locks use
        // un-prefixed keys, so this cannot deadlock against them.
        let _guard = self.locks.acquire(&format!("cmd:{}", ctx.room_id)).await;
        self.execute(ctx, role, verb, cmd, offset).await
    }

    async fn execute(
        &self,
        ctx: &CommandContext,
        role: Role,
        verb: Verb,
        cmd: &Command,
        at: usize,
    ) -> Result<String> {
        let queues = self.engine.queues();
        match verb {
            Verb::QueueCreate => {
                let name = required(cmd, at, verb)?;
                let description = cmd.rest(at + 1);
                let queue =
                    queues.create_queue(name, description.as_deref(), QueuePolicy::LeastRecentlyAssigned)?;
                Ok(format!("Queue `{}` created", queue.queue_id))
            }
            Verb::QueueEdit => {
                let queue_id = required(cmd, at, verb)?;
                let field = required(cmd, at + 1, verb)?;
                let value = cmd
                    .rest(at + 2)
                    .ok_or_else(|| usage(verb))?;
                let mut update = QueueUpdate::default();
                match field {
                    "name" => update.name = Some(value),
                    "description" => update.description = Some(value),
                    "policy" => {
                        update.policy = Some(QueuePolicy::parse(&value).ok_or_else(|| {
                            AcdError::Usage(format!("unknown policy `{value}`"))
                        })?)
                    }
                    "max-wait" => {
                        update.max_wait_secs = Some(value.parse().map_err(|_| {
                            AcdError::Usage(format!("max-wait must be seconds, got `{value}`"))
                        })?)
                    }
                    other => {
                        return Err(AcdError::Usage(format!("unknown field `{other}`")));
                    }
                }
                let queue = queues.update_queue(queue_id, update)?;
                Ok(format!("Queue `{}` updated", queue.queue_id))
            }
            Verb::QueueList => {
                let all = queues.list_queues()?;
                if all.is_empty() {
                    return Ok("No queues yet. Create one with `queue create <name>`.".to_string());
                }
                let mut out = String::from("Queues:\n");
                for queue in all {
                    let members = queues.queue_members(&queue.queue_id)?.len();
                    out.push_str(&format!(
                        "- `{}` ({}, {} member{})\n",
                        queue.queue_id,
                        queue.policy.as_str(),
                        members,
                        if members == 1 { "" } else { "s" },
                    ));
                }
                Ok(out)
            }
            Verb::QueueInfo => {
                let queue_id = required(cmd, at, verb)?;
                let queue = queues.get_queue(queue_id)?;
                let members = queues.queue_members(queue_id)?;
                let mut out = format!(
                    "Queue `{}` — policy {}, max wait {}\n",
                    queue.queue_id,
                    queue.policy.as_str(),
                    queue
                        .max_wait_secs
                        .map(|s| format!("{s}s"))
                        .unwrap_or_else(|| "default".to_string()),
                );
                if let Some(description) = &queue.description {
                    out.push_str(description);
                    out.push('\n');
                }
                for member in members {
                    out.push_str(&format!("- {} ({})\n", member.agent_id, member.state));
                }
                Ok(out)
            }
            Verb::QueueAdd => {
                let queue_id = required(cmd, at, verb)?;
                let agent_id = required(cmd, at + 1, verb)?;
                queues.add_member(queue_id, agent_id)?;
                self.engine.on_agent_available(queue_id).await;
                Ok(format!("{agent_id} added to `{queue_id}`"))
            }
            Verb::QueueRemove => {
                let queue_id = required(cmd, at, verb)?;
                let agent_id = required(cmd, at + 1, verb)?;
                queues.remove_member(queue_id, agent_id)?;
                Ok(format!("{agent_id} removed from `{queue_id}`"))
            }
            Verb::QueuePause => {
                let queue_id = required(cmd, at, verb)?;
                let (agent_id, reason) = self.target_and_tail(ctx, role, cmd, at + 1)?;
                queues.set_member_state(
                    queue_id,
                    &agent_id,
                    MembershipState::Paused,
                    reason.as_deref(),
                )?;
                Ok(match reason {
                    Some(r) => format!("{agent_id} paused in `{queue_id}`: {r}"),
                    None => format!("{agent_id} paused in `{queue_id}`"),
                })
            }
            Verb::QueueResume => {
                let queue_id = required(cmd, at, verb)?;
                let (agent_id, _) = self.target_and_tail(ctx, role, cmd, at + 1)?;
                queues.set_member_state(queue_id, &agent_id, MembershipState::Active, None)?;
                self.engine.on_agent_available(queue_id).await;
                Ok(format!("{agent_id} resumed in `{queue_id}`"))
            }
            Verb::Login => {
                let (agent_id, _) = self.target_and_tail(ctx, role, cmd, at)?;
                queues.ensure_agent(&agent_id)?;
                queues.set_presence(&agent_id, Presence::Online, None)?;
                for queue_id in queues.agent_queues(&agent_id)? {
                    self.engine.on_agent_available(&queue_id).await;
                }
                Ok(format!("{agent_id} is online"))
            }
            Verb::Logout => {
                let (agent_id, _) = self.target_and_tail(ctx, role, cmd, at)?;
                queues.set_presence(&agent_id, Presence::Offline, None)?;
                Ok(format!("{agent_id} is offline"))
            }
            Verb::Transfer => {
                let (room_id, queue_id) = match (cmd.arg(at), cmd.arg(at + 1)) {
                    (Some(room), Some(queue)) => (room.to_string(), queue.to_string()),
                    (Some(queue), None) => (ctx.room_id.clone(), queue.to_string()),
                    _ => return Err(usage(verb)),
                };
                match self
                    .engine
                    .transfer_room(&room_id, &queue_id, &ctx.sender)
                    .await?
                {
                    Some(assignment) => Ok(format!(
                        "Transferred to `{queue_id}`, assigned to {}",
                        assignment.agent_id
                    )),
                    None => Ok(format!(
                        "Transferred to `{queue_id}`, waiting for an available agent"
                    )),
                }
            }
            Verb::Resolve => {
                let (room_id, reason_at) = match cmd.arg(at) {
                    Some(arg) if arg.starts_with('!') => (arg.to_string(), at + 1),
                    _ => (ctx.room_id.clone(), at),
                };
                let reason = cmd.rest(reason_at).unwrap_or_else(|| "resolved".to_string());
                self.engine.close_room(&room_id, &reason).await?;
                Ok(format!("Conversation {room_id} closed"))
            }
            Verb::Pm => {
                let (room_id, agent_id) = match (cmd.arg(at), cmd.arg(at + 1)) {
                    (Some(room), Some(agent)) => (room.to_string(), agent.to_string()),
                    (Some(agent), None) => (ctx.room_id.clone(), agent.to_string()),
                    _ => return Err(usage(verb)),
                };
                let assignment = self
                    .engine
                    .assign_direct(&room_id, &agent_id, &ctx.sender)
                    .await?;
                Ok(format!("Assigned directly to {}", assignment.agent_id))
            }
            Verb::ForceAssign => {
                let room_id = cmd.arg(at).unwrap_or(&ctx.room_id).to_string();
                let assignment = self.engine.force_assign(&room_id, &ctx.sender).await?;
                Ok(format!("Force-assigned to {}", assignment.agent_id))
            }
            Verb::BrCmd => {
                let line_id = ctx
                    .line_id
                    .clone()
                    .ok_or_else(|| AcdError::Usage("this room has no bridge line".to_string()))?;
                if cmd.raw_args.is_empty() {
                    return Err(usage(verb));
                }
                let response = self.bridges.run_command(&line_id, &cmd.raw_args).await?;
                Ok(response)
            }
            Verb::Help => Ok(help_text()),
        }
    }

    /// Optional `[agent]` argument followed by free text. Targets look
    /// like user ids (`@agent1:host`); anything else belongs to the tail.
    /// Only supervisors and admins may target someone other than
    /// themselves.
    fn target_and_tail(
        &self,
        ctx: &CommandContext,
        role: Role,
        cmd: &Command,
        at: usize,
    ) -> Result<(String, Option<String>)> {
        let (target, tail_at) = match cmd.arg(at) {
            Some(arg) if is_user_id(arg) => (arg.to_string(), at + 1),
            _ => (ctx.sender.clone(), at),
        };
        if target != ctx.sender && role < Role::Supervisor {
            return Err(AcdError::Forbidden {
                verb: cmd.name.clone(),
                required: Role::Supervisor.as_str().to_string(),
            });
        }
        Ok((target, cmd.rest(tail_at)))
    }
}

fn is_user_id(s: &str) -> bool {
    s.starts_with('@') && s.contains(':')
}

fn required<'c>(cmd: &'c Command, index: usize, verb: Verb) -> Result<&'c str> {
    cmd.arg(index).ok_or_else(|| usage(verb))
}

fn usage(verb: Verb) -> AcdError {
    AcdError::Usage(format!("usage: {}", verb.usage()))
}

fn help_text() -> String {
    let mut out = String::from("Available commands:\n");
    for verb in Verb::ALL {
        out.push_str(&format!(
            "- `{}` — {} (role: {})\n",
            verb.usage(),
            verb.describe(),
            verb.required_role().as_str(),
        ));
    }
    out
}

fn render_error(e: &AcdError) -> String {
    match e {
        AcdError::UnknownCommand(verb) => {
            format!("Unrecognized command `{verb}` — use `help` for the command list")
        }
        other => format!("⚠️ {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::parse_message;
    use crate::distribution::{
        AlwaysAvailable, DistributionConfig, DistributionNotifier,
    };
    use crate::queue::QueueManager;
    use crate::room::RoomStateMachine;
    use crate::store::Database;

    struct SilentNotifier;

    #[async_trait]
    impl DistributionNotifier for SilentNotifier {
        async fn invite_agent(&self, _room_id: &str, _agent_id: &str) -> Result<()> {
            Ok(())
        }
        async fn no_agents_available(&self, _room_id: &str, _queue_id: &str) {}
        async fn escalation_alert(&self, _room_id: &str, _queue_id: &str) {}
    }

    fn processor() -> CommandProcessor {
        let db = Database::open_in_memory().unwrap();
        let engine = DistributionEngine::new(
            QueueManager::new(db.clone(), 1),
            RoomStateMachine::new(db),
            Arc::new(LockTable::new()),
            Arc::new(SilentNotifier),
            Arc::new(AlwaysAvailable),
            DistributionConfig {
                default_max_wait_secs: 3600,
                ..Default::default()
            },
        );
        let roles = RoleResolver::new(
            ["@admin:host".to_string()],
            ["@sup:host".to_string()],
            "@agent",
        );
        CommandProcessor::new(engine, roles, Arc::new(NoBridges))
    }

    fn ctx(sender: &str) -> CommandContext {
        CommandContext {
            sender: sender.to_string(),
            room_id: "!control:host".to_string(),
            line_id: None,
        }
    }

    async fn run(p: &CommandProcessor, sender: &str, text: &str) -> String {
        let cmd = parse_message(text, "acd").as_command().unwrap().clone();
        p.handle(&ctx(sender), &cmd).await
    }

    #[tokio::test]
    async fn unknown_verbs_are_reported_not_dropped() {
        let p = processor();
        let reply = run(&p, "@admin:host", "acd frobnicate now").await;
        assert!(reply.contains("Unrecognized command `frobnicate`"));
    }

    #[tokio::test]
    async fn role_gating_is_a_visible_error() {
        let p = processor();
        let reply = run(&p, "@agent1:host", "acd queue create sales").await;
        assert!(reply.contains("not allowed"), "got: {reply}");
        // Customers (no role) are refused too.
        let reply = run(&p, "@wa_573001:host", "acd login").await;
        assert!(reply.contains("not allowed"), "got: {reply}");
    }

    #[tokio::test]
    async fn queue_crud_round_trip() {
        let p = processor();
        let reply = run(&p, "@admin:host", "acd queue create Sales ventas LATAM").await;
        assert!(reply.contains("`sales` created"), "got: {reply}");
        let reply = run(&p, "@admin:host", "acd queue create sales").await;
        assert!(reply.contains("already in use"), "got: {reply}");

        run(&p, "@admin:host", "acd queue edit sales max-wait 60").await;
        let info = run(&p, "@sup:host", "acd queue info sales").await;
        assert!(info.contains("max wait 60s"), "got: {info}");

        let list = run(&p, "@sup:host", "acd queue list").await;
        assert!(list.contains("`sales`"));
    }

    #[tokio::test]
    async fn membership_commands_drive_presence_and_state() {
        let p = processor();
        run(&p, "@admin:host", "acd queue create sales").await;
        let reply = run(&p, "@sup:host", "acd queue add sales @agent1:host").await;
        assert!(reply.contains("added"), "got: {reply}");

        // Agent pauses themselves with a reason.
        let reply = run(&p, "@agent1:host", "acd queue pause sales lunch break").await;
        assert!(reply.contains("paused"), "got: {reply}");
        assert!(reply.contains("lunch break"), "got: {reply}");

        // An agent cannot pause someone else.
        run(&p, "@sup:host", "acd queue add sales @agent2:host").await;
        let reply = run(&p, "@agent1:host", "acd queue pause sales @agent2:host").await;
        assert!(reply.contains("not allowed"), "got: {reply}");

        // A supervisor can.
        let reply = run(&p, "@sup:host", "acd queue pause sales @agent2:host").await;
        assert!(reply.contains("@agent2:host paused"), "got: {reply}");

        let reply = run(&p, "@agent1:host", "acd queue resume sales").await;
        assert!(reply.contains("resumed"), "got: {reply}");

        let reply = run(&p, "@agent1:host", "acd logout").await;
        assert!(reply.contains("offline"), "got: {reply}");
        let reply = run(&p, "@agent1:host", "acd login").await;
        assert!(reply.contains("online"), "got: {reply}");
    }

    #[tokio::test]
    async fn transfer_command_reaches_the_engine() {
        let p = processor();
        run(&p, "@admin:host", "acd queue create sales").await;
        run(&p, "@admin:host", "acd queue create support").await;
        run(&p, "@sup:host", "acd queue add sales @agent1:host").await;

        p.engine
            .rooms()
            .register_customer_room("!cust:host", "line1", "sales", None)
            .unwrap();
        p.engine.distribute("!cust:host").await.unwrap().unwrap();

        // Transfer to a queue with nobody in it parks the room.
        let reply = run(&p, "@agent1:host", "acd transfer !cust:host support").await;
        assert!(reply.contains("waiting for an available agent"), "got: {reply}");

        // Transferring again is invalid from pending.
        let reply = run(&p, "@agent1:host", "acd transfer !cust:host support").await;
        assert!(reply.contains("invalid transition"), "got: {reply}");
    }

    #[tokio::test]
    async fn resolve_closes_the_conversation() {
        use crate::room::RoomPhase;

        let p = processor();
        run(&p, "@admin:host", "acd queue create sales").await;
        run(&p, "@sup:host", "acd queue add sales @agent1:host").await;
        p.engine
            .rooms()
            .register_customer_room("!cust:host", "line1", "sales", None)
            .unwrap();
        p.engine.distribute("!cust:host").await.unwrap().unwrap();

        let reply = run(&p, "@agent1:host", "acd resolve !cust:host customer happy").await;
        assert!(reply.contains("closed"), "got: {reply}");
        assert_eq!(
            p.engine.rooms().get_phase("!cust:host").unwrap(),
            RoomPhase::Closed
        );
        // The handling agent stays on record.
        let live = p
            .engine
            .rooms()
            .current_assignment("!cust:host")
            .unwrap()
            .unwrap();
        assert_eq!(live.agent_id, "@agent1:host");

        // Customers cannot close their own conversation.
        let reply = run(&p, "@wa_5730011:host", "acd resolve !cust:host").await;
        assert!(reply.contains("not allowed"), "got: {reply}");
    }

    #[tokio::test]
    async fn pm_and_force_assign_are_supervisor_tools() {
        let p = processor();
        run(&p, "@admin:host", "acd queue create sales").await;
        p.engine
            .rooms()
            .register_customer_room("!cust:host", "line1", "sales", None)
            .unwrap();

        let reply = run(&p, "@agent1:host", "acd pm !cust:host @agent9:host").await;
        assert!(reply.contains("not allowed"), "got: {reply}");

        let reply = run(&p, "@sup:host", "acd pm !cust:host @agent9:host").await;
        assert!(reply.contains("Assigned directly to @agent9:host"), "got: {reply}");
    }

    #[tokio::test]
    async fn br_cmd_requires_a_line() {
        let p = processor();
        let reply = run(&p, "@admin:host", "acd br-cmd login --phone 57300").await;
        assert!(reply.contains("no bridge line"), "got: {reply}");
    }

    #[tokio::test]
    async fn help_lists_every_verb() {
        let p = processor();
        let help = run(&p, "@agent1:host", "acd help").await;
        for verb in Verb::ALL {
            assert!(help.contains(verb.usage()), "missing {:?}", verb);
        }
    }
}
