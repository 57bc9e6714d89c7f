// ABOUTME: Transport-agnostic routing core for the chat distributor
// ABOUTME: Queues, room lifecycle, distribution, and command handling over SQLite

pub mod commands;
pub mod distribution;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod room;
pub mod store;

pub use error::{AcdError, Result};

// Re-export the types transports wire together
pub use commands::{parse_message, Command, ParseResult};
pub use distribution::{
    AlwaysAvailable, BridgeHealth, DistributionConfig, DistributionEngine, DistributionNotifier,
};
pub use locks::LockTable;
pub use processor::{
    BridgeCommander, CommandContext, CommandProcessor, NoBridges, Role, RoleResolver, Verb,
};
pub use queue::{Agent, Presence, Queue, QueueManager, QueuePolicy, QueueUpdate};
pub use room::{AssignMethod, Assignment, Room, RoomPhase, RoomRole, RoomStateMachine};
pub use store::{Database, Membership, MembershipState, MembershipStore};
