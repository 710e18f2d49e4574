use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{PartitionKey, Role};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub fleet: FleetConfig,
    pub worker: WorkerConfig,
    pub backoff: BackoffConfig,
    pub feed: FeedConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FleetConfig {
    /// Number of workers; falls back to the available parallelism when unset.
    pub size: Option<usize>,
    pub max_size: usize,
    pub stagger_delay_ms: u64,
    pub respawn_cooldown_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    pub role_table: Vec<Role>,
    pub partitions: Vec<String>,
    pub sample_probability: f64,
    pub action_cooldown_ms: u64,
    pub strike_jitter_ms: u64,
    pub reservation_timeout_ms: u64,
    pub analyst_refresh_ms: u64,
    pub status_port_base: Option<u16>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackoffConfig {
    pub transient_base_ms: u64,
    pub rate_limited_sleep_ms: u64,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    pub min_activity_value_wei: String,
    pub account_address: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayConfig {
    pub rpc_pool: Vec<String>,
    pub request_timeout_ms: u64,
    pub stall_timeout_ms: u64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut settings = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::Environment::with_prefix("FLEET").separator("__"));

        // Override feed URL from environment if present
        if let Ok(ws_url) = std::env::var("BASE_WSS") {
            settings = settings.set_override("feed.ws_url", ws_url)?;
        }

        if let Ok(address) = std::env::var("ACCOUNT_ADDRESS") {
            settings = settings.set_override("feed.account_address", address)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }
}

impl FleetConfig {
    pub fn resolved_size(&self) -> usize {
        let size = self.size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        size.clamp(1, self.max_size.max(1))
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    pub fn respawn_cooldown(&self) -> Duration {
        Duration::from_millis(self.respawn_cooldown_ms)
    }
}

impl WorkerConfig {
    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        self.partitions.iter().map(|p| PartitionKey::new(p.as_str())).collect()
    }

    pub fn action_cooldown(&self) -> Duration {
        Duration::from_millis(self.action_cooldown_ms)
    }

    pub fn strike_jitter(&self) -> Duration {
        Duration::from_millis(self.strike_jitter_ms)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }

    pub fn analyst_refresh(&self) -> Duration {
        Duration::from_millis(self.analyst_refresh_ms)
    }
}

impl BackoffConfig {
    pub fn transient_base(&self) -> Duration {
        Duration::from_millis(self.transient_base_ms)
    }

    pub fn rate_limited_sleep(&self) -> Duration {
        Duration::from_millis(self.rate_limited_sleep_ms)
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_fleet_config(size: Option<usize>) -> FleetConfig {
        FleetConfig {
            size,
            max_size: 48,
            stagger_delay_ms: 1500,
            respawn_cooldown_ms: 3000,
        }
    }

    #[test]
    fn test_fleet_size_is_capped() {
        let config = create_test_fleet_config(Some(64));
        assert_eq!(config.resolved_size(), 48);

        let config = create_test_fleet_config(Some(0));
        assert_eq!(config.resolved_size(), 1);
    }

    #[test]
    fn test_fleet_size_defaults_to_parallelism() {
        let config = create_test_fleet_config(None);
        let size = config.resolved_size();
        assert!(size >= 1 && size <= 48);
    }

    #[test]
    fn test_role_table_deserializes_lowercase() {
        let roles: Vec<Role> =
            serde_json::from_str(r#"["listener", "striker", "striker", "analyst"]"#).unwrap();
        assert_eq!(
            roles,
            vec![Role::Listener, Role::Striker, Role::Striker, Role::Analyst]
        );
    }
}
