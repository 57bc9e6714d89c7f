// ABOUTME: End-to-end routing tests driving the core through chat commands
// ABOUTME: Covers the full conversation lifecycle from registration to close

use async_trait::async_trait;
use chatdesk_core::{
    parse_message, AlwaysAvailable, CommandContext, CommandProcessor, Database,
    DistributionConfig, DistributionEngine, DistributionNotifier, LockTable, NoBridges,
    QueueManager, Result, RoleResolver, RoomPhase, RoomStateMachine,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingNotifier {
    invites: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DistributionNotifier for RecordingNotifier {
    async fn invite_agent(&self, room_id: &str, agent_id: &str) -> Result<()> {
        self.invites
            .lock()
            .unwrap()
            .push((room_id.to_string(), agent_id.to_string()));
        Ok(())
    }

    async fn no_agents_available(&self, _room_id: &str, _queue_id: &str) {}

    async fn escalation_alert(&self, _room_id: &str, _queue_id: &str) {}
}

struct Fixture {
    engine: Arc<DistributionEngine>,
    processor: CommandProcessor,
    notifier: Arc<RecordingNotifier>,
}

fn fixture(config: DistributionConfig) -> Fixture {
    let db = Database::open_in_memory().expect("in-memory database");
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = DistributionEngine::new(
        QueueManager::new(db.clone(), config.concurrency_cap),
        RoomStateMachine::new(db),
        Arc::new(LockTable::new()),
        notifier.clone(),
        Arc::new(AlwaysAvailable),
        config,
    );
    let roles = RoleResolver::new(
        ["@admin:acd.local".to_string()],
        ["@sup:acd.local".to_string()],
        "@agent",
    );
    let processor = CommandProcessor::new(engine.clone(), roles, Arc::new(NoBridges));
    Fixture {
        engine,
        processor,
        notifier,
    }
}

async fn command(f: &Fixture, sender: &str, text: &str) -> String {
    let cmd = parse_message(text, "acd")
        .as_command()
        .unwrap_or_else(|| panic!("not a command: {text}"))
        .clone();
    let ctx = CommandContext {
        sender: sender.to_string(),
        room_id: "!control:acd.local".to_string(),
        line_id: None,
    };
    f.processor.handle(&ctx, &cmd).await
}

#[tokio::test]
async fn conversation_lifecycle_from_registration_to_close() {
    let f = fixture(DistributionConfig {
        default_max_wait_secs: 3600,
        ..Default::default()
    });

    // Operators set up a queue and staff it over chat.
    command(&f, "@admin:acd.local", "acd queue create Sales").await;
    command(&f, "@sup:acd.local", "acd queue add sales @agent1:acd.local").await;

    // A customer writes in over the WhatsApp line; the intake layer
    // registers the portal and asks for distribution.
    f.engine
        .rooms()
        .register_customer_room("!wa-573001:acd.local", "wa-main", "sales", None)
        .unwrap();
    let assignment = f
        .engine
        .distribute("!wa-573001:acd.local")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assignment.agent_id, "@agent1:acd.local");
    assert_eq!(
        f.notifier.invites.lock().unwrap().as_slice(),
        &[(
            "!wa-573001:acd.local".to_string(),
            "@agent1:acd.local".to_string()
        )]
    );

    // The agent resolves the conversation over chat; the room closes and
    // stays closed.
    let reply = command(
        &f,
        "@agent1:acd.local",
        "acd resolve !wa-573001:acd.local customer happy",
    )
    .await;
    assert!(reply.contains("closed"), "got: {reply}");
    assert_eq!(
        f.engine.rooms().get_phase("!wa-573001:acd.local").unwrap(),
        RoomPhase::Closed
    );
    // The final assignment stands as the room's record.
    let live = f
        .engine
        .rooms()
        .current_assignment("!wa-573001:acd.local")
        .unwrap()
        .unwrap();
    assert_eq!(live.agent_id, "@agent1:acd.local");
}

#[tokio::test]
async fn transfer_between_queues_over_chat() {
    let f = fixture(DistributionConfig {
        default_max_wait_secs: 3600,
        transfer_cooldown_secs: 3600,
        concurrency_cap: 5,
        ..Default::default()
    });

    command(&f, "@admin:acd.local", "acd queue create sales").await;
    command(&f, "@admin:acd.local", "acd queue create support").await;
    command(&f, "@sup:acd.local", "acd queue add sales @agent1:acd.local").await;
    command(&f, "@sup:acd.local", "acd queue add support @agent2:acd.local").await;

    f.engine
        .rooms()
        .register_customer_room("!cust:acd.local", "wa-main", "sales", None)
        .unwrap();
    f.engine.distribute("!cust:acd.local").await.unwrap().unwrap();

    // Wrong queue: the assigned agent sends it to support. The support
    // agent picks it up immediately.
    let reply = command(
        &f,
        "@agent1:acd.local",
        "acd transfer !cust:acd.local support",
    )
    .await;
    assert!(
        reply.contains("assigned to @agent2:acd.local"),
        "got: {reply}"
    );

    let history = f
        .engine
        .rooms()
        .assignment_history("!cust:acd.local")
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].superseded_at.is_some());
}

#[tokio::test]
async fn paused_agent_gets_no_new_rooms_until_resume() {
    let f = fixture(DistributionConfig {
        default_max_wait_secs: 3600,
        ..Default::default()
    });

    command(&f, "@admin:acd.local", "acd queue create sales").await;
    command(&f, "@sup:acd.local", "acd queue add sales @agent1:acd.local").await;
    command(&f, "@agent1:acd.local", "acd queue pause sales lunch").await;

    f.engine
        .rooms()
        .register_customer_room("!cust:acd.local", "wa-main", "sales", None)
        .unwrap();
    assert!(f.engine.distribute("!cust:acd.local").await.unwrap().is_none());
    assert_eq!(
        f.engine.rooms().get_phase("!cust:acd.local").unwrap(),
        RoomPhase::PendingDistribution
    );

    // Resuming over chat sweeps the parked room.
    command(&f, "@agent1:acd.local", "acd queue resume sales").await;
    assert_eq!(
        f.engine.rooms().get_phase("!cust:acd.local").unwrap(),
        RoomPhase::Assigned
    );
}

#[tokio::test]
async fn fairness_rotates_across_conversations() {
    let f = fixture(DistributionConfig {
        default_max_wait_secs: 3600,
        concurrency_cap: 10,
        ..Default::default()
    });

    command(&f, "@admin:acd.local", "acd queue create sales").await;
    for agent in ["@agent1:acd.local", "@agent2:acd.local"] {
        command(&f, "@sup:acd.local", &format!("acd queue add sales {agent}")).await;
    }

    let mut picks = Vec::new();
    for i in 0..4 {
        let room = format!("!cust{i}:acd.local");
        f.engine
            .rooms()
            .register_customer_room(&room, "wa-main", "sales", None)
            .unwrap();
        picks.push(f.engine.distribute(&room).await.unwrap().unwrap().agent_id);
    }
    // Least-recently-assigned alternates between the two agents.
    assert_eq!(
        picks,
        vec![
            "@agent1:acd.local",
            "@agent2:acd.local",
            "@agent1:acd.local",
            "@agent2:acd.local"
        ]
    );
}

#[tokio::test]
async fn routing_state_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routing.db");

    {
        let db = Database::open(&path).unwrap();
        let queues = QueueManager::new(db.clone(), 1);
        let rooms = RoomStateMachine::new(db);
        queues
            .create_queue("sales", None, chatdesk_core::QueuePolicy::LeastRecentlyAssigned)
            .unwrap();
        queues.add_member("sales", "@agent1:acd.local").unwrap();
        rooms
            .register_customer_room("!cust:acd.local", "wa-main", "sales", None)
            .unwrap();
    }

    // A restarted process sees the same queues, members, and pending room.
    let db = Database::open(&path).unwrap();
    let queues = QueueManager::new(db.clone(), 1);
    let rooms = RoomStateMachine::new(db);
    assert_eq!(
        queues.list_active_agents("sales").unwrap(),
        vec!["@agent1:acd.local"]
    );
    assert_eq!(
        rooms.get_phase("!cust:acd.local").unwrap(),
        RoomPhase::PendingDistribution
    );
    assert_eq!(rooms.pending_rooms_for_queue("sales").unwrap().len(), 1);
}

#[tokio::test]
async fn closing_a_room_hands_the_slot_to_the_waiting_one() {
    let f = fixture(DistributionConfig {
        default_max_wait_secs: 3600,
        ..Default::default()
    });

    command(&f, "@admin:acd.local", "acd queue create sales").await;
    command(&f, "@sup:acd.local", "acd queue add sales @agent1:acd.local").await;

    f.engine
        .rooms()
        .register_customer_room("!first:acd.local", "wa-main", "sales", None)
        .unwrap();
    f.engine
        .rooms()
        .register_customer_room("!second:acd.local", "wa-main", "sales", None)
        .unwrap();
    assert!(f.engine.distribute("!first:acd.local").await.unwrap().is_some());
    assert!(f.engine.distribute("!second:acd.local").await.unwrap().is_none());

    f.engine.close_room("!first:acd.local", "resolved").await.unwrap();
    assert_eq!(
        f.engine.rooms().get_phase("!second:acd.local").unwrap(),
        RoomPhase::Assigned
    );
}
