// ABOUTME: Bridge adapter seam: the surface the distributor uses to drive
// ABOUTME: external chat bridges without knowing their wire protocols

pub mod mautrix;
pub mod registry;

use async_trait::async_trait;
use chatdesk_core::Result;
use futures_util::Stream;
use std::pin::Pin;

/// Health of one bridge line. `Degraded` and `Down` both gate new
/// distribution; the split exists for operators reading status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Connected,
    Degraded,
    Down,
}

impl BridgeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    pub fn is_available(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Events emitted while an agent links their device to a bridge line.
/// Relayed verbatim to the provisioning WebSocket client.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoginEvent {
    /// A QR code to scan, as the bridge delivered it (usually a data URI
    /// or an mxc URL).
    QrCode { code: String },
    Success { detail: String },
    Failure { reason: String },
}

pub type LoginStream = Pin<Box<dyn Stream<Item = LoginEvent> + Send>>;

/// One external chat bridge line. Implementations speak only the bridge's
/// management-command surface; no wire encoding here.
#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    fn line_id(&self) -> &str;

    /// Start a device-link login for the agent; the stream yields QR codes
    /// and the final outcome.
    async fn login(&self, agent_id: &str) -> Result<LoginStream>;

    async fn logout(&self, agent_id: &str) -> Result<()>;

    /// Point the bridge's relay at a customer room so agent messages reach
    /// the customer under the line's identity.
    async fn set_relay(&self, room_id: &str) -> Result<()>;

    /// Deliver text into one of this line's rooms; the relay forwards it
    /// to the customer.
    async fn send_message(&self, room_id: &str, body: &str) -> Result<()>;

    /// Opaque command passthrough; the response comes back verbatim.
    async fn run_command(&self, raw: &str) -> Result<String>;

    async fn status(&self) -> BridgeStatus;
}
