use crate::error::AmqpError;
use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct ZoneConfig {
    pub name: String,
    #[serde(default)]
    pub primary: bool,
    pub servers: Vec<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub zones: Vec<ZoneConfig>,
    #[serde(default = "default_max_channels")]
    pub max_channels: u16,
    #[serde(default = "default_consumer_workers")]
    pub consumer_workers: usize,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_correlation_shards")]
    pub correlation_shards: usize,
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: usize,
}

fn default_max_channels() -> u16 {
    50
}

fn default_consumer_workers() -> usize {
    4
}

fn default_query_timeout_ms() -> u64 {
    2000
}

fn default_dispatch_timeout_ms() -> u64 {
    500
}

fn default_sweep_interval_ms() -> u64 {
    100
}

fn default_reconnect_min_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_max_retries() -> usize {
    3
}

fn default_correlation_shards() -> usize {
    64
}

fn default_dispatch_queue() -> usize {
    1024
}

impl Config {
    /// Loads the config from `AMQP_CONF`, or `/etc/nebula/amqp.conf`.
    pub fn new() -> Result<Config> {
        let path = std::env::var("AMQP_CONF")
            .unwrap_or_else(|_| "/etc/nebula/amqp.conf".to_string());
        let contents = fs::read_to_string(&path)?;
        let config = Config::from_toml(&contents)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// A config with a single primary zone and default tunables.
    pub fn single_zone(name: &str, servers: &[&str]) -> Config {
        Config {
            zones: vec![ZoneConfig {
                name: name.to_string(),
                primary: true,
                servers: servers.iter().map(|s| s.to_string()).collect(),
            }],
            max_channels: default_max_channels(),
            consumer_workers: default_consumer_workers(),
            query_timeout_ms: default_query_timeout_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_retries: default_max_retries(),
            correlation_shards: default_correlation_shards(),
            dispatch_queue: default_dispatch_queue(),
        }
    }

    pub fn validate(&mut self) -> Result<(), AmqpError> {
        if self.zones.is_empty() {
            return Err(AmqpError::Config("no zones configured".to_string()));
        }
        if self.max_channels == 0 {
            return Err(AmqpError::Config(
                "max_channels needs to be at least 1".to_string(),
            ));
        }
        if self.correlation_shards == 0 || self.dispatch_queue == 0 {
            return Err(AmqpError::Config(
                "correlation_shards and dispatch_queue can't be 0".to_string(),
            ));
        }
        if self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(AmqpError::Config(
                "reconnect_min_ms is larger than reconnect_max_ms".to_string(),
            ));
        }
        match self.zones.iter().filter(|z| z.primary).count() {
            0 => self.zones[0].primary = true,
            1 => {}
            _ => {
                return Err(AmqpError::Config(
                    "more than one primary zone".to_string(),
                ))
            }
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
