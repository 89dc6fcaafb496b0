//! Config schema for the gateway: session lifecycle, bridge, storage, conversations.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    pub whatsapp: WhatsAppConfig,
    pub bridge: BridgeConfig,
    pub storage: StorageConfig,
    pub conversation: ConversationConfig,
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Reconnect attempts allowed per credential lifetime before giving up.
    pub max_reconnect_retries: u32,
    /// Delay before reconnecting after any disconnect other than "restart required".
    pub reconnect_interval_ms: u64,
    /// Upper bound on a single connect attempt.
    pub connect_timeout_secs: u64,
    /// Upper bound on an interactive pairing attempt.
    pub pairing_timeout_secs: u64,
    /// Attempts for a credential write before the session is flagged degraded.
    pub persist_attempts: u32,
    pub persist_retry_ms: u64,
    /// Capacity of each session's ordered event queue.
    pub event_queue_capacity: usize,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            max_reconnect_retries: 5,
            reconnect_interval_ms: 0,
            connect_timeout_secs: 60,
            pairing_timeout_secs: 60,
            persist_attempts: 3,
            persist_retry_ms: 200,
            event_queue_capacity: 256,
        }
    }
}

impl WhatsAppConfig {
    /// Apply `RECONNECT_INTERVAL` / `MAX_RECONNECT_RETRIES` from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ms) = lookup("RECONNECT_INTERVAL").and_then(|v| v.trim().parse().ok()) {
            self.reconnect_interval_ms = ms;
        }
        if let Some(max) = lookup("MAX_RECONNECT_RETRIES").and_then(|v| v.trim().parse().ok()) {
            self.max_reconnect_retries = max;
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }

    pub fn persist_retry(&self) -> Duration {
        Duration::from_millis(self.persist_retry_ms)
    }
}

/// Where the network bridge listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7700/session".into(),
        }
    }
}

/// Durable storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the credential database. Defaults to `~/.herald/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Conversation tracking and the binary's canned reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Reply sent to every inbound message when non-empty.
    pub auto_reply: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
            auto_reply: String::new(),
        }
    }
}

impl ConversationConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: HeraldConfig = toml::from_str(
            r#"
            [whatsapp]
            max_reconnect_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.whatsapp.max_reconnect_retries, 2);
        assert_eq!(cfg.whatsapp.reconnect_interval_ms, 0);
        assert_eq!(cfg.whatsapp.pairing_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.bridge.url, "ws://127.0.0.1:7700/session");
        assert!(cfg.storage.data_dir.is_none());
    }

    #[test]
    fn env_overrides_reconnection_fields() {
        let mut cfg = WhatsAppConfig::default();
        cfg.apply_overrides(|name| match name {
            "RECONNECT_INTERVAL" => Some("1500".into()),
            "MAX_RECONNECT_RETRIES" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(cfg.reconnect_interval(), Duration::from_millis(1500));
        assert_eq!(cfg.max_reconnect_retries, 5);
    }

    #[test]
    fn sweep_interval_never_zero() {
        let cfg = ConversationConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));
    }
}
