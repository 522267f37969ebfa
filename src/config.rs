use crate::mqtt::MqttConfig;
use anyhow::{bail, Context, Result};
use ritarbms_lib::filter::Limits;
use ritarbms_lib::protocol::{Address, MAX_ADDRESS};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// How to reach the RS485 bus the batteries answer on.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "connection_type", rename_all = "lowercase")]
pub enum Connection {
    /// RS485-to-ethernet gateway speaking raw TCP.
    Ethernet {
        rs485gate_ip: String,
        rs485gate_port: u16,
        #[serde(
            default = "Config::default_connection_timeout",
            with = "humantime_serde"
        )]
        connection_timeout: Duration,
    },
    /// Directly attached serial adapter.
    Serial {
        serial_port: String,
        /// Defaults to 9600 baud when omitted.
        serial_baudrate: Option<u32>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub connection: Connection,
    #[serde(default = "Config::default_num_batteries")]
    pub num_batteries: u8,
    #[serde(default = "Config::default_battery_model")]
    pub battery_model: String,
    /// Pause between poll cycles in daemon mode.
    #[serde(default = "Config::default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Timeout for one query/reply exchange.
    #[serde(default = "Config::default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Delay between consecutive queries on the shared bus.
    #[serde(default = "Config::default_queries_delay", with = "humantime_serde")]
    pub queries_delay: Duration,
    /// Extra pause before moving on to the next battery.
    #[serde(
        default = "Config::default_next_battery_delay",
        with = "humantime_serde"
    )]
    pub next_battery_delay: Duration,
    #[serde(default)]
    pub limits: Limits,
    pub mqtt: Option<MqttConfig>,
}

impl Config {
    fn default_connection_timeout() -> Duration {
        Duration::from_secs(3)
    }

    fn default_num_batteries() -> u8 {
        1
    }

    fn default_battery_model() -> String {
        "BAT-5KWH-51.2V".into()
    }

    fn default_poll_interval() -> Duration {
        Duration::from_secs(15)
    }

    fn default_read_timeout() -> Duration {
        Duration::from_secs(3)
    }

    fn default_queries_delay() -> Duration {
        Duration::from_millis(100)
    }

    fn default_next_battery_delay() -> Duration {
        Duration::from_millis(500)
    }

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        if config.num_batteries == 0 || config.num_batteries > MAX_ADDRESS {
            bail!(
                "num_batteries must be between 1 and {MAX_ADDRESS}, got {}",
                config.num_batteries
            );
        }
        Ok(config)
    }

    /// Bus addresses of the configured batteries, in poll order.
    pub fn addresses(&self) -> Result<Vec<Address>> {
        (1..=self.num_batteries)
            .map(|n| {
                Address::new(n)
                    .ok_or(ritarbms_lib::Error::AddressOutOfRange(n))
                    .map_err(Into::into)
            })
            .collect()
    }
}
