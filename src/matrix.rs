// ABOUTME: Matrix client initialization, authentication, and the side-effect surface
// ABOUTME: the routing core emits into: invites, notices, kicks, power levels

use anyhow::{Context, Result};
use async_trait::async_trait;
use chatdesk_core::{AcdError, DistributionNotifier, QueueManager};
use matrix_sdk::{
    ruma::{events::room::message::RoomMessageEventContent, Int, OwnedRoomId, OwnedUserId},
    Client, Room,
};
use std::path::Path;
use std::time::Duration;

use crate::render::markdown_to_html;

pub async fn create_client(homeserver: &str, crypto_store: &str) -> Result<Client> {
    let client = Client::builder()
        .homeserver_url(homeserver)
        .sqlite_store(Path::new(crypto_store), None)
        .build()
        .await
        .context("Failed to create Matrix client")?;

    tracing::info!("Matrix client created successfully");

    Ok(client)
}

pub async fn login(
    client: &Client,
    user_id: &str,
    password: Option<&str>,
    access_token: Option<&str>,
    device_name: &str,
) -> Result<()> {
    if let Some(token) = access_token {
        tracing::info!("Logging in with access token");
        let user_id: OwnedUserId = user_id.parse()?;
        let session = matrix_sdk::AuthSession::Matrix(matrix_sdk::authentication::matrix::MatrixSession {
            meta: matrix_sdk::SessionMeta {
                user_id,
                device_id: device_name.to_string().into(),
            },
            tokens: matrix_sdk::SessionTokens {
                access_token: token.to_string(),
                refresh_token: None,
            },
        });
        client.restore_session(session).await?;
    } else if let Some(pwd) = password {
        tracing::info!("Logging in with password");
        client
            .matrix_auth()
            .login_username(user_id, pwd)
            .device_id(device_name)
            .send()
            .await
            .context("Failed to log in")?;
    } else {
        anyhow::bail!("Either MATRIX_PASSWORD or MATRIX_ACCESS_TOKEN is required");
    }

    tracing::info!(user_id = %client.user_id().unwrap(), "Logged in successfully");

    Ok(())
}

const SIDE_EFFECT_ATTEMPTS: u32 = 3;

/// Transport actions the core requests. Each is attempted a bounded number
/// of times with backoff; a final failure is reported as `SideEffectFailed`
/// and never rolls back the state transition that triggered it.
#[derive(Clone)]
pub struct MatrixEdge {
    client: Client,
}

impl MatrixEdge {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn room(&self, room_id: &str) -> chatdesk_core::Result<Room> {
        let owned: OwnedRoomId = room_id
            .parse()
            .map_err(|_| AcdError::not_found("room", room_id))?;
        self.client
            .get_room(&owned)
            .ok_or_else(|| AcdError::not_found("room", room_id))
    }

    pub async fn invite(&self, room_id: &str, user_id: &str) -> chatdesk_core::Result<()> {
        let room = self.room(room_id)?;
        let user: OwnedUserId = user_id
            .parse()
            .map_err(|_| AcdError::not_found("user", user_id))?;
        with_retry("invite", || async {
            room.invite_user_by_id(&user).await.map_err(|e| e.to_string())
        })
        .await
    }

    /// Send a markdown-formatted message into a room.
    pub async fn send_markdown(&self, room_id: &str, body: &str) -> chatdesk_core::Result<()> {
        let room = self.room(room_id)?;
        let html = markdown_to_html(body);
        with_retry("send", || async {
            room.send(RoomMessageEventContent::text_html(body, &html))
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await
    }

    pub async fn kick(
        &self,
        room_id: &str,
        user_id: &str,
        reason: &str,
    ) -> chatdesk_core::Result<()> {
        let room = self.room(room_id)?;
        let user: OwnedUserId = user_id
            .parse()
            .map_err(|_| AcdError::not_found("user", user_id))?;
        with_retry("kick", || async {
            room.kick_user(&user, Some(reason)).await.map_err(|e| e.to_string())
        })
        .await
    }

    pub async fn set_room_name(&self, room_id: &str, name: &str) -> chatdesk_core::Result<()> {
        let room = self.room(room_id)?;
        with_retry("set-name", || async {
            room.set_name(name.to_string())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await
    }

    /// User ids currently joined to a room.
    pub async fn joined_member_ids(&self, room_id: &str) -> chatdesk_core::Result<Vec<String>> {
        let room = self.room(room_id)?;
        let members = room
            .members(matrix_sdk::RoomMemberships::JOIN)
            .await
            .map_err(|e| AcdError::SideEffectFailed {
                action: "members",
                detail: e.to_string(),
            })?;
        Ok(members
            .into_iter()
            .map(|m| m.user_id().to_string())
            .collect())
    }

    /// Raise or lower one user's power level, leaving the rest of the
    /// room's levels as they are.
    pub async fn set_power_level(
        &self,
        room_id: &str,
        user_id: &str,
        level: i64,
    ) -> chatdesk_core::Result<()> {
        let room = self.room(room_id)?;
        let user: OwnedUserId = user_id
            .parse()
            .map_err(|_| AcdError::not_found("user", user_id))?;
        let level = Int::new(level).unwrap_or_default();
        with_retry("power-level", || async {
            room.update_power_levels(vec![(&*user, level)])
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await
    }
}

async fn with_retry<F, Fut>(action: &'static str, f: F) -> chatdesk_core::Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<(), String>>,
{
    let mut last = String::new();
    for attempt in 1..=SIDE_EFFECT_ATTEMPTS {
        match f().await {
            Ok(()) => return Ok(()),
            Err(detail) => {
                tracing::warn!(action, attempt, error = %detail, "transport action failed");
                last = detail;
            }
        }
        if attempt < SIDE_EFFECT_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
        }
    }
    Err(AcdError::SideEffectFailed {
        action,
        detail: last,
    })
}

/// The engine's notifier backed by the Matrix edge. Alerts land in the
/// queue's coordination room when one is attached, otherwise they are only
/// logged and counted.
pub struct MatrixNotifier {
    edge: MatrixEdge,
    queues: QueueManager,
}

impl MatrixNotifier {
    pub fn new(edge: MatrixEdge, queues: QueueManager) -> Self {
        Self { edge, queues }
    }

    async fn notify_queue_room(&self, queue_id: &str, body: &str) {
        let room_id = match self.queues.get_queue(queue_id) {
            Ok(queue) => queue.room_id,
            Err(e) => {
                tracing::error!(queue_id, error = %e, "queue lookup for notice failed");
                return;
            }
        };
        let Some(room_id) = room_id else {
            tracing::debug!(queue_id, "queue has no coordination room, notice skipped");
            return;
        };
        if let Err(e) = self.edge.send_markdown(&room_id, body).await {
            tracing::warn!(queue_id, room_id, error = %e, "queue notice failed");
        }
    }
}

#[async_trait]
impl DistributionNotifier for MatrixNotifier {
    async fn invite_agent(&self, room_id: &str, agent_id: &str) -> chatdesk_core::Result<()> {
        self.edge.invite(room_id, agent_id).await
    }

    async fn no_agents_available(&self, room_id: &str, queue_id: &str) {
        self.notify_queue_room(
            queue_id,
            &format!("No agents available for `{queue_id}`; conversation {room_id} is waiting."),
        )
        .await;
    }

    async fn escalation_alert(&self, room_id: &str, queue_id: &str) {
        self.notify_queue_room(
            queue_id,
            &format!(
                "⏰ Conversation {room_id} exceeded the maximum wait for `{queue_id}` and is being escalated."
            ),
        )
        .await;
    }
}
