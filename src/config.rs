// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates required fields and provides sensible defaults for optional ones

use anyhow::{Context, Result};
use chatdesk_core::DistributionConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub homeserver: HomeserverConfig,
    #[serde(default)]
    pub acd: AcdConfig,
    #[serde(default)]
    pub distribution: DistributionSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    /// Bridge lines keyed by line id, e.g. `[bridges.wa-main]`.
    #[serde(default)]
    pub bridges: BTreeMap<String, BridgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeserverConfig {
    pub url: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcdConfig {
    /// Command prefix in control and customer rooms.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub supervisors: Vec<String>,
    /// User ids starting with this prefix are agents.
    #[serde(default = "default_agent_prefix")]
    pub agent_prefix: String,
}

impl Default for AcdConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            admins: Vec::new(),
            supervisors: Vec::new(),
            agent_prefix: default_agent_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSection {
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: u32,
    #[serde(default = "default_transfer_cooldown_secs")]
    pub transfer_cooldown_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    pub default_max_wait_secs: u64,
    #[serde(default = "default_true")]
    pub escalate_force_assign: bool,
    #[serde(default)]
    pub escalation_ignores_cap: bool,
    #[serde(default = "default_cap_slack")]
    pub escalation_cap_slack: u32,
}

impl Default for DistributionSection {
    fn default() -> Self {
        Self {
            concurrency_cap: default_concurrency_cap(),
            transfer_cooldown_secs: default_transfer_cooldown_secs(),
            default_max_wait_secs: default_max_wait_secs(),
            escalate_force_assign: true,
            escalation_ignores_cap: false,
            escalation_cap_slack: default_cap_slack(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_crypto_store_path")]
    pub crypto_store_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            crypto_store_path: default_crypto_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default = "default_provisioning_port")]
    pub port: u16,
    #[serde(default = "default_provisioning_host")]
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            port: default_provisioning_port(),
            host: default_provisioning_host(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// The bridge bot's mxid, e.g. `@whatsappbot:example.com`. Rooms it
    /// creates are customer portals for this line.
    pub bot_user_id: String,
    /// Prefix of the puppet user ids the bridge ghosts customers under,
    /// e.g. `@wa_`.
    pub user_prefix: String,
    /// The bridge bot's own command prefix, e.g. `!wa`.
    pub command_prefix: String,
    /// Management room where the bridge bot accepts commands.
    pub management_room: String,
    /// Queue new conversations on this line enter by default.
    pub default_queue: Option<String>,
}

fn default_device_name() -> String {
    "chatdesk".to_string()
}

fn default_command_prefix() -> String {
    "acd".to_string()
}

fn default_agent_prefix() -> String {
    "@agent".to_string()
}

fn default_concurrency_cap() -> u32 {
    1
}

fn default_transfer_cooldown_secs() -> u64 {
    300
}

fn default_max_wait_secs() -> u64 {
    120
}

fn default_cap_slack() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_database_path() -> String {
    "./chatdesk.db".to_string()
}

fn default_crypto_store_path() -> String {
    "./crypto_store".to_string()
}

fn default_provisioning_port() -> u16 {
    29666
}

fn default_provisioning_host() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    /// Load configuration from config.toml with environment variable overrides
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config {
                homeserver: HomeserverConfig {
                    url: String::new(),
                    user_id: String::new(),
                    password: None,
                    access_token: None,
                    device_name: default_device_name(),
                },
                acd: AcdConfig::default(),
                distribution: DistributionSection::default(),
                storage: StorageConfig::default(),
                provisioning: ProvisioningConfig::default(),
                bridges: BTreeMap::new(),
            }
        };

        // Override with environment variables if present
        if let Ok(val) = std::env::var("HOMESERVER_URL") {
            config.homeserver.url = val;
        }
        if let Ok(val) = std::env::var("MATRIX_USER_ID") {
            config.homeserver.user_id = val;
        }
        if let Ok(val) = std::env::var("MATRIX_PASSWORD") {
            config.homeserver.password = Some(val);
        }
        if let Ok(val) = std::env::var("MATRIX_ACCESS_TOKEN") {
            config.homeserver.access_token = Some(val);
        }
        if let Ok(val) = std::env::var("MATRIX_DEVICE_NAME") {
            config.homeserver.device_name = val;
        }
        if let Ok(val) = std::env::var("ACD_ADMINS") {
            config.acd.admins = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("ACD_SUPERVISORS") {
            config.acd.supervisors = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("ACD_COMMAND_PREFIX") {
            config.acd.command_prefix = val;
        }
        if let Ok(val) = std::env::var("DATABASE_PATH") {
            config.storage.database_path = val;
        }
        if let Ok(val) = std::env::var("PROVISIONING_PORT") {
            config.provisioning.port = val.parse().with_context(|| {
                format!("PROVISIONING_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("PROVISIONING_HOST") {
            config.provisioning.host = val;
        }
        if let Ok(val) = std::env::var("PROVISIONING_API_KEY") {
            config.provisioning.api_key = Some(val);
        }

        // Validate required fields
        if config.homeserver.url.trim().is_empty() {
            anyhow::bail!(
                "homeserver.url is required (set in config.toml or HOMESERVER_URL env var)"
            );
        }
        if config.homeserver.user_id.trim().is_empty() {
            anyhow::bail!(
                "homeserver.user_id is required (set in config.toml or MATRIX_USER_ID env var)"
            );
        }
        if config.homeserver.password.is_none() && config.homeserver.access_token.is_none() {
            anyhow::bail!("Either homeserver.password or homeserver.access_token is required");
        }

        config.acd.admins.retain(|s| !s.trim().is_empty());
        if config.acd.admins.is_empty() {
            anyhow::bail!("acd.admins must contain at least one user ID");
        }
        for user in config.acd.admins.iter().chain(&config.acd.supervisors) {
            if !user.starts_with('@') || !user.contains(':') {
                anyhow::bail!("Invalid Matrix user ID in acd config: {}", user);
            }
        }

        for (line_id, bridge) in &config.bridges {
            if bridge.bot_user_id.trim().is_empty() || bridge.user_prefix.trim().is_empty() {
                anyhow::bail!(
                    "bridges.{} needs both bot_user_id and user_prefix",
                    line_id
                );
            }
        }

        Ok(config)
    }

    /// The engine's view of the distribution section.
    pub fn distribution_config(&self) -> DistributionConfig {
        DistributionConfig {
            concurrency_cap: self.distribution.concurrency_cap,
            transfer_cooldown_secs: self.distribution.transfer_cooldown_secs,
            default_max_wait_secs: self.distribution.default_max_wait_secs,
            escalate_force_assign: self.distribution.escalate_force_assign,
            escalation_ignores_cap: self.distribution.escalation_ignores_cap,
            escalation_cap_slack: self.distribution.escalation_cap_slack,
        }
    }
}
