use anyhow::{Context, Result};
use log::{error, info, warn};
use ritarbms_lib::gateway::Gateway;
use ritarbms_lib::pipeline::{Pipeline, RawFrames, TelemetryRecord};
use ritarbms_lib::protocol::{
    BatteryQueries, BlockReading, CellVoltages, ExtraTemperatures, Temperatures,
};
use std::time::Duration;

use crate::commandline::DaemonOutput;
use crate::config::Config;
use crate::mqtt::MqttPublisher;

/// Gathers the four reply frames for one battery.
///
/// Any failed exchange yields an absent frame; the extra temperature query
/// is only worth sending once the main temperature frame arrived.
pub fn poll_battery(gateway: &mut Gateway, queries: &BatteryQueries) -> RawFrames {
    let block = gateway.fetch(&queries.block, BlockReading::reply_size());
    let cells = gateway.fetch(&queries.cells, CellVoltages::reply_size());
    let temperature = gateway.fetch(&queries.temperature, Temperatures::reply_size());
    let extra_temperature = if temperature.is_some() {
        gateway.fetch(&queries.extra_temperature, ExtraTemperatures::reply_size())
    } else {
        None
    };
    RawFrames {
        block,
        cells,
        temperature,
        extra_temperature,
    }
}

fn print_record(battery: &BatteryQueries, record: &TelemetryRecord) {
    let address = battery.address;
    let cycle = record
        .cycle
        .map_or_else(|| "n/a".to_string(), |c| c.to_string());
    println!(
        "Battery {address} SOC: {} V, Charged: {} %, Cycles: {cycle}, Current: {} A, Power: {} W",
        record.voltage, record.soc, record.current, record.power
    );
    if let Some(cells) = &record.cells {
        let cells: Vec<String> = cells
            .iter()
            .map(|cell| cell.map_or_else(|| "-".to_string(), |v| v.to_string()))
            .collect();
        println!("Battery {address} Cells: {}", cells.join(", "));
    }
    if let Some(temps) = &record.temps {
        let temps: Vec<String> = temps.iter().map(f64::to_string).collect();
        println!("Battery {address} Temps: {}°C", temps.join(", "));
    }
    if let (Some(mos), Some(env)) = (record.mos_temp, record.env_temp) {
        println!("Battery {address} MOS Temp: {mos}°C, ENV Temp: {env}°C");
    }
}

/// Runs one poll cycle over all configured batteries.
pub fn poll_cycle(
    gateway: &mut Gateway,
    queries: &[BatteryQueries],
    config: &Config,
    pipeline: &mut Pipeline,
    mut publisher: Option<&mut MqttPublisher>,
) {
    println!(
        "--- Poll cycle at {} ---",
        chrono::Local::now().to_rfc3339()
    );
    for (n, battery) in queries.iter().enumerate() {
        if n > 0 {
            std::thread::sleep(config.next_battery_delay);
        }
        let frames = poll_battery(gateway, battery);
        match pipeline.process(battery.address, &frames) {
            Ok(record) => {
                print_record(battery, &record);
                if let Some(publisher) = publisher.as_deref_mut() {
                    if let Err(err) =
                        publisher.publish_record(battery.address, &record, &config.battery_model)
                    {
                        error!("Battery {}: failed to publish record: {err:?}", battery.address);
                    }
                }
            }
            Err(gate) => warn!(
                "Battery {}: withholding record this cycle - {gate}",
                battery.address
            ),
        }
    }
}

/// Daemon mode: poll all batteries forever on a fixed period.
///
/// The periodic re-invocation is the only retry mechanism; a battery that
/// produced nothing this cycle simply gets polled again on the next one.
pub fn run(
    mut gateway: Gateway,
    config: &Config,
    output: DaemonOutput,
    interval: Duration,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={interval:?}");

    let mut publisher = match &output {
        DaemonOutput::Console => None,
        DaemonOutput::Mqtt => {
            let mqtt_config = config
                .mqtt
                .clone()
                .context("MQTT output selected but the config file has no 'mqtt' section")?;
            Some(MqttPublisher::new(mqtt_config).context("Failed to create MQTT publisher")?)
        }
    };

    let queries: Vec<BatteryQueries> = config
        .addresses()?
        .into_iter()
        .map(BatteryQueries::new)
        .collect();
    let mut pipeline = Pipeline::new(config.limits.clone());

    loop {
        std::thread::sleep(interval);
        poll_cycle(
            &mut gateway,
            &queries,
            config,
            &mut pipeline,
            publisher.as_mut(),
        );
    }
}
