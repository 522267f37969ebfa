use anyhow::{Context, Result};
use ritarbms_lib::pipeline::TelemetryRecord;
use ritarbms_lib::protocol::Address;
use rumqttc::{Client, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "MqttConfig::default_broker")]
    broker: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    /// Root of the Home Assistant discovery tree.
    #[serde(default = "MqttConfig::default_discovery_prefix")]
    discovery_prefix: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: i32,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
}

impl MqttConfig {
    fn default_broker() -> String {
        "core-mosquitto".into()
    }

    fn default_port() -> u16 {
        1883
    }

    fn default_discovery_prefix() -> String {
        "homeassistant".into()
    }

    fn default_qos() -> i32 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("ritarbms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let mut options = MqttOptions::new(
            config.client_id.as_str(),
            config.broker.as_str(),
            config.port,
        );
        options.set_keep_alive(config.keep_alive_interval);
        if let Some(username) = &config.username {
            options.set_credentials(
                username.as_str(),
                config.password.clone().unwrap_or_default(),
            );
        }

        log::info!(
            "Connecting to MQTT broker {}:{} as client {}",
            config.broker,
            config.port,
            config.client_id
        );
        let (client, mut connection) = Client::new(options, 64);

        // The connection event loop must be polled for publishes to go out;
        // it also performs the reconnects.
        std::thread::spawn(move || {
            for notification in connection.iter() {
                match notification {
                    Ok(event) => log::trace!("MQTT event: {event:?}"),
                    Err(err) => {
                        log::warn!("MQTT connection error: {err}");
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        });

        Ok(Self { client, config })
    }

    fn qos(&self) -> QoS {
        match self.config.qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        log::debug!("Publishing to MQTT: Topic='{topic}', Payload='{payload}'");
        self.client
            .publish(topic, self.qos(), true, payload)
            .with_context(|| format!("Failed to publish message to MQTT topic: {topic}"))?;
        Ok(())
    }

    /// Publishes one battery's record as Home Assistant discovery configs
    /// plus per-sensor state topics.
    pub fn publish_record(
        &mut self,
        address: Address,
        record: &TelemetryRecord,
        model: &str,
    ) -> Result<()> {
        let index = address.get();
        let base = format!("{}/sensor/ritar_{index}", self.config.discovery_prefix);
        let device = json!({
            "identifiers": [format!("ritar_{index}")],
            "name": format!("Ritar Battery {index}"),
            "model": model,
            "manufacturer": "Ritar",
        });

        let mut publish = |suffix: &str,
                           name: &str,
                           device_class: Option<&str>,
                           unit: Option<&str>,
                           state_class: Option<&str>,
                           value: serde_json::Value|
         -> Result<()> {
            let config_topic = format!("{base}/{suffix}/config");
            let state_topic = format!("{base}/{suffix}");
            let mut config_payload = json!({
                "name": name,
                "state_topic": state_topic,
                "unique_id": format!("ritar_{index}_{suffix}"),
                "object_id": format!("ritar_{index}_{suffix}"),
                "device_class": device_class,
                "unit_of_measurement": unit,
                "value_template": "{{ value_json.state }}",
                "device": device,
            });
            if let Some(state_class) = state_class {
                config_payload["state_class"] = json!(state_class);
            }
            self.publish(&config_topic, &config_payload.to_string())?;
            self.publish(&state_topic, &json!({ "state": value }).to_string())
        };

        publish(
            "voltage",
            "Voltage",
            Some("voltage"),
            Some("V"),
            None,
            json!(record.voltage),
        )?;
        publish("soc", "SOC", Some("battery"), Some("%"), None, json!(record.soc))?;
        publish(
            "current",
            "Current",
            Some("current"),
            Some("A"),
            None,
            json!(record.current),
        )?;
        publish(
            "power",
            "Power",
            Some("power"),
            Some("W"),
            None,
            json!(record.power),
        )?;
        if let Some(cycle) = record.cycle {
            publish(
                "cycle",
                "Cycle Count",
                None,
                None,
                Some("total_increasing"),
                json!(cycle),
            )?;
        }
        if let Some(cells) = &record.cells {
            for (i, cell) in cells.iter().enumerate() {
                publish(
                    &format!("cell_{}", i + 1),
                    &format!("Cell {}", i + 1),
                    Some("voltage"),
                    Some("mV"),
                    None,
                    json!(cell),
                )?;
            }
        }
        if let Some(temps) = &record.temps {
            for (i, temperature) in temps.iter().enumerate() {
                publish(
                    &format!("temp_{}", i + 1),
                    &format!("Temp {}", i + 1),
                    Some("temperature"),
                    Some("°C"),
                    None,
                    json!(temperature),
                )?;
            }
        }
        if let (Some(mos), Some(env)) = (record.mos_temp, record.env_temp) {
            publish(
                "temp_mos",
                "T MOS",
                Some("temperature"),
                Some("°C"),
                None,
                json!(mos),
            )?;
            publish(
                "temp_env",
                "T ENV",
                Some("temperature"),
                Some("°C"),
                None,
                json!(env),
            )?;
        }
        Ok(())
    }
}
