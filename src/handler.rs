// ABOUTME: Inbound Matrix event intake: detects customer portals, intercepts
// ABOUTME: commands before conversation content, and closes abandoned rooms

use anyhow::Result;
use chatdesk_core::{
    AcdError, CommandContext, CommandProcessor, DistributionEngine, ParseResult,
};
use matrix_sdk::{
    room::Room,
    ruma::events::room::member::OriginalSyncRoomMemberEvent,
    ruma::events::room::message::OriginalSyncRoomMessageEvent,
    RoomState,
};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::bridge::mautrix::MautrixBridge;
use crate::bridge::BridgeAdapter;
use crate::config::Config;
use crate::matrix::MatrixEdge;
use crate::render::chunk_message;

const MAX_REPLY_CHUNK: usize = 4000;

/// Everything the event callbacks need, wired once at startup.
pub struct Intake {
    config: Arc<Config>,
    engine: Arc<DistributionEngine>,
    processor: CommandProcessor,
    edge: MatrixEdge,
    /// Management room id -> the bridge bot driven through it.
    management: HashMap<String, Arc<MautrixBridge>>,
    /// Customer puppet prefix -> line id, longest prefix first.
    puppet_lines: Vec<(String, String)>,
    own_user_id: String,
    phone_re: Regex,
}

impl Intake {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<DistributionEngine>,
        processor: CommandProcessor,
        edge: MatrixEdge,
        management: HashMap<String, Arc<MautrixBridge>>,
        own_user_id: String,
    ) -> Arc<Self> {
        let mut puppet_lines: Vec<(String, String)> = config
            .bridges
            .iter()
            .map(|(line_id, bridge)| (bridge.user_prefix.clone(), line_id.clone()))
            .collect();
        puppet_lines.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Arc::new(Self {
            config,
            engine,
            processor,
            edge,
            management,
            puppet_lines,
            own_user_id,
            phone_re: Regex::new(r"(\d{6,15})").expect("static regex"),
        })
    }

    pub async fn handle_message(
        &self,
        room: Room,
        event: OriginalSyncRoomMessageEvent,
    ) -> Result<()> {
        if room.state() != RoomState::Joined {
            return Ok(());
        }
        let sender = event.sender.as_str();
        if sender == self.own_user_id {
            return Ok(());
        }
        let room_id = room.room_id().as_str().to_string();
        let body = event.content.body().to_string();

        // Bridge bot replies in a management room feed that line's adapter.
        if let Some(adapter) = self.management.get(&room_id) {
            adapter.on_management_message(sender, &body).await;
            return Ok(());
        }

        // Customer puppets never issue commands; their first message is
        // what turns the room into a registered portal.
        if let Some(line_id) = self.line_for_puppet(sender) {
            self.on_customer_message(&room, &room_id, &line_id, sender)
                .await;
            return Ok(());
        }

        match chatdesk_core::parse_message(&body, &self.config.acd.command_prefix) {
            ParseResult::Command(cmd) => {
                let line_id = self
                    .engine
                    .rooms()
                    .get_room(&room_id)
                    .ok()
                    .and_then(|r| r.line_id);
                let ctx = CommandContext {
                    sender: sender.to_string(),
                    room_id: room_id.clone(),
                    line_id,
                };
                let line_id = ctx.line_id.clone();
                let reply = self.processor.handle(&ctx, &cmd).await;
                for chunk in chunk_message(&reply, MAX_REPLY_CHUNK) {
                    if let Err(e) = self.send_reply(&room_id, line_id.as_deref(), &chunk).await {
                        tracing::error!(room_id, error = %e, "command reply failed");
                    }
                }
            }
            ParseResult::Message(_) | ParseResult::Ignore => {}
        }
        Ok(())
    }

    /// Replies into bridged rooms go out through the line's adapter so the
    /// relay carries them to the customer side; service rooms take the
    /// direct path.
    async fn send_reply(
        &self,
        room_id: &str,
        line_id: Option<&str>,
        body: &str,
    ) -> chatdesk_core::Result<()> {
        if let Some(line_id) = line_id {
            if let Some(adapter) = self.management.values().find(|a| a.line_id() == line_id) {
                return adapter.send_message(room_id, body).await;
            }
        }
        self.edge.send_markdown(room_id, body).await
    }

    async fn on_customer_message(
        &self,
        room: &Room,
        room_id: &str,
        line_id: &str,
        sender: &str,
    ) {
        let Some(queue_id) = self
            .config
            .bridges
            .get(line_id)
            .and_then(|b| b.default_queue.clone())
        else {
            tracing::warn!(line_id, room_id, "line has no default queue, portal ignored");
            return;
        };
        match self
            .engine
            .rooms()
            .register_customer_room(room_id, line_id, &queue_id, Some(sender))
        {
            Ok(_) => {
                tracing::info!(room_id, line_id, queue_id, "customer portal registered");
                self.setup_portal(room, room_id, line_id, sender).await;
            }
            Err(AcdError::AlreadyRegistered(_)) => {}
            Err(e) => {
                tracing::error!(room_id, error = %e, "portal registration failed");
                return;
            }
        }
        if let Err(e) = self.engine.distribute(room_id).await {
            tracing::error!(room_id, error = %e, "distribution failed");
        }
    }

    /// First-contact room setup: relay so agent replies reach the customer
    /// under the line's identity, and a human-readable room name.
    async fn setup_portal(&self, room: &Room, room_id: &str, line_id: &str, sender: &str) {
        if let Some(adapter) = self
            .management
            .values()
            .find(|a| a.line_id() == line_id)
        {
            if let Err(e) = adapter.set_relay(room_id).await {
                tracing::warn!(room_id, line_id, error = %e, "set-relay failed");
            }
        }
        let display = room
            .get_member(&event_sender(sender))
            .await
            .ok()
            .flatten()
            .and_then(|m| m.display_name().map(|d| d.to_string()));
        let name = portal_name(&self.phone_re, display.as_deref(), sender);
        if let Err(e) = self.edge.set_room_name(room_id, &name).await {
            tracing::warn!(room_id, error = %e, "room naming failed");
        }
    }

    pub async fn handle_member(
        &self,
        room: Room,
        event: OriginalSyncRoomMemberEvent,
    ) -> Result<()> {
        use matrix_sdk::ruma::events::room::member::MembershipState as Ms;
        if !matches!(event.content.membership, Ms::Leave | Ms::Ban) {
            return Ok(());
        }
        let room_id = room.room_id().as_str();
        let who = event.state_key.as_str();

        // Only customer portals close on abandonment.
        let Ok(record) = self.engine.rooms().get_room(room_id) else {
            return Ok(());
        };
        let customer_left = record
            .customer
            .as_deref()
            .map(|c| c == who)
            .unwrap_or_else(|| self.line_for_puppet(who).is_some());
        if !customer_left {
            return Ok(());
        }
        tracing::info!(room_id, who, "customer left, closing conversation");
        if let Err(e) = self.engine.close_room(room_id, "customer left").await {
            tracing::error!(room_id, error = %e, "close on abandonment failed");
        }
        Ok(())
    }

    fn line_for_puppet(&self, user_id: &str) -> Option<String> {
        self.puppet_lines
            .iter()
            .find(|(prefix, _)| user_id.starts_with(prefix.as_str()))
            .map(|(_, line_id)| line_id.clone())
    }

}

/// "Maria (573001112233)" from a displayname and a puppet mxid, falling
/// back to whichever half exists.
fn portal_name(phone_re: &Regex, display: Option<&str>, user_id: &str) -> String {
    let localpart = user_id
        .strip_prefix('@')
        .and_then(|rest| rest.split(':').next())
        .unwrap_or(user_id);
    let phone = phone_re.captures(localpart).map(|c| c[1].to_string());
    match (display, phone) {
        (Some(d), Some(p)) => format!("{d} ({p})"),
        (Some(d), None) => d.to_string(),
        (None, Some(p)) => p,
        (None, None) => localpart.to_string(),
    }
}

fn event_sender(sender: &str) -> matrix_sdk::ruma::OwnedUserId {
    sender.parse().expect("sender ids from events are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_names_combine_display_and_phone() {
        let re = Regex::new(r"(\d{6,15})").unwrap();
        assert_eq!(
            portal_name(&re, Some("Maria"), "@wa_573001112233:example.com"),
            "Maria (573001112233)"
        );
        assert_eq!(
            portal_name(&re, None, "@wa_573001112233:example.com"),
            "573001112233"
        );
        assert_eq!(portal_name(&re, Some("Maria"), "@ig_maria:example.com"), "Maria");
        assert_eq!(portal_name(&re, None, "@ig_maria:example.com"), "ig_maria");
    }
}
