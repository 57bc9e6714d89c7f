// ABOUTME: Drives a mautrix-style bridge bot through its command prefix in a
// ABOUTME: management room: login QR, logout, set-relay, opaque passthrough

use async_trait::async_trait;
use chatdesk_core::{AcdError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use super::{BridgeAdapter, BridgeStatus, LoginEvent, LoginStream};
use crate::config::BridgeConfig;
use crate::matrix::MatrixEdge;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// A bridge bot reachable over Matrix: commands are plain messages in its
/// management room, responses are the bot's replies there. The inbound
/// half arrives through [`MautrixBridge::on_management_message`], fed by
/// the event intake.
pub struct MautrixBridge {
    line_id: String,
    config: BridgeConfig,
    edge: MatrixEdge,
    /// Serializes command/response exchanges; the bot replies in order.
    turn: Mutex<()>,
    responses: Mutex<mpsc::Receiver<String>>,
    response_tx: mpsc::Sender<String>,
    /// Live login streams waiting for QR and outcome events.
    login_waiters: std::sync::Mutex<Vec<mpsc::Sender<LoginEvent>>>,
}

impl MautrixBridge {
    pub fn new(line_id: &str, config: BridgeConfig, edge: MatrixEdge) -> Arc<Self> {
        let (response_tx, responses) = mpsc::channel(64);
        Arc::new(Self {
            line_id: line_id.to_string(),
            config,
            edge,
            turn: Mutex::new(()),
            responses: Mutex::new(responses),
            response_tx,
            login_waiters: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn bot_user_id(&self) -> &str {
        &self.config.bot_user_id
    }

    pub fn management_room(&self) -> &str {
        &self.config.management_room
    }

    /// A message the bridge bot sent into its management room. Login-shaped
    /// content feeds live login streams; everything else queues as a
    /// command response.
    pub async fn on_management_message(&self, sender: &str, body: &str) {
        if sender != self.config.bot_user_id {
            return;
        }
        if let Some(event) = classify_login_event(body) {
            let mut waiters = self.login_waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.retain(|tx| tx.try_send(event.clone()).is_ok());
            if !waiters.is_empty() {
                return;
            }
        }
        if self.response_tx.try_send(body.to_string()).is_err() {
            tracing::warn!(line_id = %self.line_id, "bridge response queue full, dropping");
        }
    }

    async fn send_command(&self, raw: &str) -> Result<()> {
        let body = format!("{} {}", self.config.command_prefix, raw);
        self.edge
            .send_markdown(&self.config.management_room, &body)
            .await
    }

    async fn exchange(&self, raw: &str, timeout: Duration) -> Result<String> {
        let _turn = self.turn.lock().await;
        let mut responses = self.responses.lock().await;
        // Drop replies left over from earlier exchanges.
        while responses.try_recv().is_ok() {}
        self.send_command(raw).await?;
        match tokio::time::timeout(timeout, responses.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            _ => Err(AcdError::BridgeUnavailable {
                line_id: self.line_id.clone(),
            }),
        }
    }
}

fn classify_login_event(body: &str) -> Option<LoginEvent> {
    let lower = body.to_lowercase();
    if body.starts_with("data:image") || body.contains("mxc://") {
        return Some(LoginEvent::QrCode {
            code: body.trim().to_string(),
        });
    }
    if lower.contains("successfully logged in") {
        return Some(LoginEvent::Success {
            detail: body.trim().to_string(),
        });
    }
    if lower.contains("login failed") || lower.contains("timed out") {
        return Some(LoginEvent::Failure {
            reason: body.trim().to_string(),
        });
    }
    None
}

#[async_trait]
impl BridgeAdapter for MautrixBridge {
    fn line_id(&self) -> &str {
        &self.line_id
    }

    async fn login(&self, agent_id: &str) -> Result<LoginStream> {
        let (tx, rx) = mpsc::channel(16);
        self.login_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        tracing::info!(line_id = %self.line_id, agent_id, "starting bridge login");
        self.send_command("login qr").await?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn logout(&self, agent_id: &str) -> Result<()> {
        tracing::info!(line_id = %self.line_id, agent_id, "bridge logout");
        self.send_command("logout").await?;
        Ok(())
    }

    async fn set_relay(&self, room_id: &str) -> Result<()> {
        // mautrix bridges take set-relay in the portal room itself.
        let body = format!("{} set-relay", self.config.command_prefix);
        self.edge.send_markdown(room_id, &body).await
    }

    async fn send_message(&self, room_id: &str, body: &str) -> Result<()> {
        self.edge.send_markdown(room_id, body).await
    }

    async fn run_command(&self, raw: &str) -> Result<String> {
        self.exchange(raw, RESPONSE_TIMEOUT).await
    }

    async fn status(&self) -> BridgeStatus {
        match self.exchange("ping", PING_TIMEOUT).await {
            Ok(reply) => {
                let lower = reply.to_lowercase();
                if lower.contains("not logged in") || lower.contains("not connected") {
                    BridgeStatus::Degraded
                } else {
                    BridgeStatus::Connected
                }
            }
            Err(_) => BridgeStatus::Down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_codes_and_outcomes_are_classified() {
        assert!(matches!(
            classify_login_event("data:image/png;base64,AAAA"),
            Some(LoginEvent::QrCode { .. })
        ));
        assert!(matches!(
            classify_login_event("Successfully logged in as +57 300 111"),
            Some(LoginEvent::Success { .. })
        ));
        assert!(matches!(
            classify_login_event("Login failed: QR timed out"),
            Some(LoginEvent::Failure { .. })
        ));
        assert!(classify_login_event("You're already logged in").is_none());
    }
}
