// ABOUTME: Main entry point for the chat distributor appservice
// ABOUTME: Initializes logging, config, stores, bridges, Matrix client, and the API server

use anyhow::{Context, Result};
use chatdesk::bridge::mautrix::MautrixBridge;
use chatdesk::bridge::registry::BridgeRegistry;
use chatdesk::bridge::BridgeAdapter;
use chatdesk::config::Config;
use chatdesk::handler::Intake;
use chatdesk::matrix::{self, MatrixEdge, MatrixNotifier};
use chatdesk::server;
use chatdesk_core::{
    CommandProcessor, Database, DistributionEngine, LockTable, QueueManager, RoleResolver,
    RoomStateMachine,
};
use clap::Parser;
use matrix_sdk::{
    config::SyncSettings,
    ruma::events::room::{member::SyncRoomMemberEvent, message::SyncRoomMessageEvent},
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "chatdesk", about = "Automatic chat distributor for Matrix")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n╔══════════════════════════════════════════════════════════╗");
        eprintln!("║ PANIC! Distributor crashed with the following error:    ║");
        eprintln!("╚══════════════════════════════════════════════════════════╝\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,matrix_sdk_crypto::backups=error,matrix_sdk_crypto::session_manager::sessions=error".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting chatdesk");

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Arc::new(Config::load_from(&cli.config)?);

    tracing::info!(
        homeserver = %config.homeserver.url,
        user_id = %config.homeserver.user_id,
        admins = config.acd.admins.len(),
        bridges = config.bridges.len(),
        provisioning_port = config.provisioning.port,
        "Configuration loaded"
    );

    // Routing stores
    let db = Database::open(&config.storage.database_path)
        .context("Failed to open routing database")?;
    let distribution = config.distribution_config();
    let queues = QueueManager::new(db.clone(), distribution.concurrency_cap);
    let rooms = RoomStateMachine::new(db);
    tracing::info!(path = %config.storage.database_path, "Routing database ready");

    // Matrix client
    let client =
        matrix::create_client(&config.homeserver.url, &config.storage.crypto_store_path).await?;
    matrix::login(
        &client,
        &config.homeserver.user_id,
        config.homeserver.password.as_deref(),
        config.homeserver.access_token.as_deref(),
        &config.homeserver.device_name,
    )
    .await?;
    let edge = MatrixEdge::new(client.clone());

    // Bridge lines
    let mut adapters: Vec<Arc<dyn BridgeAdapter>> = Vec::new();
    let mut management: HashMap<String, Arc<MautrixBridge>> = HashMap::new();
    for (line_id, bridge_config) in &config.bridges {
        let adapter = MautrixBridge::new(line_id, bridge_config.clone(), edge.clone());
        management.insert(bridge_config.management_room.clone(), adapter.clone());
        adapters.push(adapter);
        tracing::info!(line_id, bot = %bridge_config.bot_user_id, "bridge line configured");
    }
    let registry = BridgeRegistry::new(adapters);

    // Distribution engine and command processor
    let notifier = Arc::new(MatrixNotifier::new(edge.clone(), queues.clone()));
    let engine = DistributionEngine::new(
        queues,
        rooms,
        Arc::new(LockTable::new()),
        notifier,
        registry.clone(),
        distribution,
    );
    registry.spawn_status_poll(engine.clone());

    let roles = RoleResolver::new(
        config.acd.admins.iter().cloned(),
        config.acd.supervisors.iter().cloned(),
        config.acd.agent_prefix.clone(),
    );
    let processor = CommandProcessor::new(engine.clone(), roles, registry.clone());

    let intake = Intake::new(
        Arc::clone(&config),
        engine.clone(),
        processor,
        edge,
        management,
        config.homeserver.user_id.clone(),
    );

    // Event intake
    let message_intake = Arc::clone(&intake);
    client.add_event_handler(move |event: SyncRoomMessageEvent, room| {
        let intake = Arc::clone(&message_intake);
        async move {
            let Some(original) = event.as_original() else {
                return;
            };
            if let Err(e) = intake.handle_message(room, original.clone()).await {
                tracing::error!(error = %e, "Error handling message");
            }
        }
    });

    let member_intake = Arc::clone(&intake);
    client.add_event_handler(move |event: SyncRoomMemberEvent, room| {
        let intake = Arc::clone(&member_intake);
        async move {
            let Some(original) = event.as_original() else {
                return;
            };
            if let Err(e) = intake.handle_member(room, original.clone()).await {
                tracing::error!(error = %e, "Error handling member event");
            }
        }
    });

    tracing::info!("Event handlers registered");

    // Provisioning server in the background
    let api_engine = engine.clone();
    let api_registry = registry.clone();
    let api_config = Arc::clone(&config);
    tokio::spawn(async move {
        if let Err(e) = server::serve(
            &api_config.provisioning.host,
            api_config.provisioning.port,
            api_config.provisioning.api_key.clone(),
            api_engine,
            api_registry,
        )
        .await
        {
            tracing::error!(error = %e, "Provisioning server failed");
        }
    });

    // Initial sync, then the continuous loop
    tracing::info!("Performing initial sync...");
    let response = client
        .sync_once(SyncSettings::default())
        .await
        .context("Initial sync failed")?;
    tracing::info!("Initial sync complete");

    let settings = SyncSettings::default().token(response.next_batch);
    tracing::info!("Starting continuous sync loop");
    client.sync(settings).await?;

    Ok(())
}
