// ABOUTME: Registry of bridge adapters keyed by line id, with a cached health
// ABOUTME: map kept fresh by a poll task that feeds the distribution engine

use async_trait::async_trait;
use chatdesk_core::{
    AcdError, BridgeCommander, BridgeHealth, DistributionEngine, Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BridgeAdapter, BridgeStatus};

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// All configured bridge lines. Handed around explicitly; nothing global.
/// The engine's synchronous health checks read the cached status, which the
/// poll task refreshes.
pub struct BridgeRegistry {
    adapters: HashMap<String, Arc<dyn BridgeAdapter>>,
    health: Mutex<HashMap<String, BridgeStatus>>,
}

impl BridgeRegistry {
    pub fn new(adapters: Vec<Arc<dyn BridgeAdapter>>) -> Arc<Self> {
        let mut map = HashMap::new();
        let mut health = HashMap::new();
        for adapter in adapters {
            // Lines start optimistic; the first poll corrects the record.
            health.insert(adapter.line_id().to_string(), BridgeStatus::Connected);
            map.insert(adapter.line_id().to_string(), adapter);
        }
        Arc::new(Self {
            adapters: map,
            health: Mutex::new(health),
        })
    }

    pub fn get(&self, line_id: &str) -> Result<Arc<dyn BridgeAdapter>> {
        self.adapters
            .get(line_id)
            .cloned()
            .ok_or_else(|| AcdError::not_found("bridge line", line_id))
    }

    pub fn line_ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn status_of(&self, line_id: &str) -> Option<BridgeStatus> {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(line_id)
            .copied()
    }

    /// Poll every line's status on an interval. Status flips are pushed to
    /// the engine so parked rooms re-enter distribution on recovery.
    pub fn spawn_status_poll(self: &Arc<Self>, engine: Arc<DistributionEngine>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATUS_POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                for (line_id, adapter) in &registry.adapters {
                    let status = adapter.status().await;
                    let previous = {
                        let mut health =
                            registry.health.lock().unwrap_or_else(|e| e.into_inner());
                        health.insert(line_id.clone(), status)
                    };
                    if previous.map(BridgeStatus::is_available)
                        != Some(status.is_available())
                    {
                        tracing::info!(
                            line_id,
                            status = status.as_str(),
                            "bridge status changed"
                        );
                        engine
                            .on_bridge_status(line_id, status.is_available())
                            .await;
                    }
                }
            }
        });
    }
}

impl BridgeHealth for BridgeRegistry {
    fn line_available(&self, line_id: &str) -> bool {
        // Unknown lines don't gate; rooms can predate configuration.
        self.status_of(line_id)
            .map(BridgeStatus::is_available)
            .unwrap_or(true)
    }
}

#[async_trait]
impl BridgeCommander for BridgeRegistry {
    async fn run_command(&self, line_id: &str, raw: &str) -> Result<String> {
        self.get(line_id)?.run_command(raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LoginStream;

    struct StaticAdapter {
        line_id: String,
        status: BridgeStatus,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl StaticAdapter {
        fn up(line_id: &str) -> Arc<Self> {
            Arc::new(Self {
                line_id: line_id.to_string(),
                status: BridgeStatus::Connected,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BridgeAdapter for StaticAdapter {
        fn line_id(&self) -> &str {
            &self.line_id
        }

        async fn login(&self, _agent_id: &str) -> Result<LoginStream> {
            Err(AcdError::BridgeUnavailable {
                line_id: self.line_id.clone(),
            })
        }

        async fn logout(&self, _agent_id: &str) -> Result<()> {
            Ok(())
        }

        async fn set_relay(&self, _room_id: &str) -> Result<()> {
            Ok(())
        }

        async fn send_message(&self, room_id: &str, body: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((room_id.to_string(), body.to_string()));
            Ok(())
        }

        async fn run_command(&self, raw: &str) -> Result<String> {
            Ok(format!("ran: {raw}"))
        }

        async fn status(&self) -> BridgeStatus {
            self.status
        }
    }

    #[tokio::test]
    async fn unknown_lines_do_not_gate_distribution() {
        let registry = BridgeRegistry::new(vec![]);
        assert!(registry.line_available("legacy-line"));
        assert!(registry.get("legacy-line").is_err());
    }

    #[tokio::test]
    async fn commands_route_by_line_id() {
        let registry =
            BridgeRegistry::new(vec![StaticAdapter::up("wa-main") as Arc<dyn BridgeAdapter>]);
        let reply = registry.run_command("wa-main", "ping").await.unwrap();
        assert_eq!(reply, "ran: ping");
        assert!(registry.line_available("wa-main"));
    }

    #[tokio::test]
    async fn adapters_deliver_messages_into_their_rooms() {
        let adapter = StaticAdapter::up("wa-main");
        let registry = BridgeRegistry::new(vec![adapter.clone() as Arc<dyn BridgeAdapter>]);
        registry
            .get("wa-main")
            .unwrap()
            .send_message("!portal:host", "un agente te atenderá en breve")
            .await
            .unwrap();
        assert_eq!(
            adapter.sent.lock().unwrap().as_slice(),
            &[(
                "!portal:host".to_string(),
                "un agente te atenderá en breve".to_string()
            )]
        );
    }
}
