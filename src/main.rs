use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod config;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};
use config::{Config, Connection};
use ritarbms_lib::gateway::Gateway;
use ritarbms_lib::pipeline::Pipeline;
use ritarbms_lib::protocol::{
    Address, BatteryQueries, BlockReading, CellVoltages, ExtraTemperatures, Temperatures,
};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn open_gateway(config: &Config) -> Result<Gateway> {
    match &config.connection {
        Connection::Ethernet {
            rs485gate_ip,
            rs485gate_port,
            connection_timeout,
        } => Gateway::open_tcp(rs485gate_ip, *rs485gate_port, *connection_timeout)
            .with_context(|| format!("Cannot connect to '{rs485gate_ip}:{rs485gate_port}'")),
        Connection::Serial {
            serial_port,
            serial_baudrate,
        } => Gateway::open_serial(serial_port, *serial_baudrate)
            .with_context(|| format!("Cannot open serial port '{serial_port}'")),
    }
}

fn battery_address(battery: u8) -> Result<Address> {
    Address::new(battery)
        .ok_or(ritarbms_lib::Error::AddressOutOfRange(battery))
        .map_err(Into::into)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = Config::load(&args.config)?;
    let mut gateway = open_gateway(&config)?;
    gateway.set_timeout(args.timeout.unwrap_or(config.read_timeout))?;
    gateway.set_delay(args.delay.unwrap_or(config.queries_delay));

    match args.command {
        CliCommands::Block { battery } => {
            let address = battery_address(battery)?;
            let rx_buffer = gateway
                .exchange(&BlockReading::request(address), BlockReading::reply_size())
                .with_context(|| "Cannot get block reading")?;
            match BlockReading::decode(&rx_buffer) {
                Some(reading) => println!("Block: {reading:?}"),
                None => println!("Block: undecodable frame"),
            }
        }
        CliCommands::Cells { battery } => {
            let address = battery_address(battery)?;
            let rx_buffer = gateway
                .exchange(&CellVoltages::request(address), CellVoltages::reply_size())
                .with_context(|| "Cannot get cell voltages")?;
            match CellVoltages::decode(&rx_buffer, address) {
                Some(cells) => println!("Cell voltages (mV): {cells:?}"),
                None => println!("Cell voltages: undecodable frame"),
            }
        }
        CliCommands::Temperatures { battery } => {
            let address = battery_address(battery)?;
            let rx_buffer = gateway
                .exchange(&Temperatures::request(address), Temperatures::reply_size())
                .with_context(|| "Cannot get temperatures")?;
            match Temperatures::decode(&rx_buffer) {
                Some(temperatures) => println!("Temperatures (°C): {temperatures:?}"),
                None => println!("Temperatures: undecodable frame"),
            }
        }
        CliCommands::ExtraTemperatures { battery } => {
            let address = battery_address(battery)?;
            let rx_buffer = gateway
                .exchange(
                    &ExtraTemperatures::request(address),
                    ExtraTemperatures::reply_size(),
                )
                .with_context(|| "Cannot get extra temperatures")?;
            match ExtraTemperatures::decode(&rx_buffer) {
                Some((mos, env)) => println!("MOS: {mos}°C, ENV: {env}°C"),
                None => println!("Extra temperatures: undecodable frame"),
            }
        }
        CliCommands::Poll => {
            let queries: Vec<BatteryQueries> = config
                .addresses()?
                .into_iter()
                .map(BatteryQueries::new)
                .collect();
            let mut pipeline = Pipeline::new(config.limits.clone());
            daemon::poll_cycle(&mut gateway, &queries, &config, &mut pipeline, None);
        }
        CliCommands::Daemon { output, interval } => {
            daemon::run(
                gateway,
                &config,
                output,
                interval.unwrap_or(config.poll_interval),
            )?;
        }
    }

    Ok(())
}
