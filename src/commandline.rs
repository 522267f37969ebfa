use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show pack voltage, current, SOC, cycle count and derived power for one battery
    Block {
        /// Battery address on the bus (1-14)
        battery: u8,
    },
    /// Show the 16 raw cell voltages (mV) for one battery
    Cells {
        /// Battery address on the bus (1-14)
        battery: u8,
    },
    /// Show the probe temperatures for one battery
    Temperatures {
        /// Battery address on the bus (1-14)
        battery: u8,
    },
    /// Show the MOS and environment temperatures for one battery
    ExtraTemperatures {
        /// Battery address on the bus (1-14)
        battery: u8,
    },
    /// Run one full decode/filter/reconcile cycle over all configured batteries
    Poll,
    /// Periodically poll all batteries and publish the resulting records
    Daemon {
        /// Output destination for the telemetry records
        #[command(subcommand)]
        output: DaemonOutput,
        /// Poll interval (e.g., "15s", "1m"); overrides the config file
        #[clap(long, short, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously poll and print the records to the standard output (console).
    Console,
    /// Continuously poll and publish the records to an MQTT broker
    /// (Home Assistant discovery plus state topics).
    Mqtt,
}

const fn about_text() -> &'static str {
    "ritar bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Path to the YAML configuration file
    #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_FILE)]
    pub config: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for a single query/reply exchange (e.g., "500ms", "3s");
    /// overrides the config file
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,

    // Some USB - RS485 dongles need at least 10ms to switch between TX and RX.
    /// Delay between consecutive queries on the shared bus (e.g., "50ms",
    /// "100ms"); overrides the config file
    #[arg(value_parser = humantime::parse_duration, long)]
    pub delay: Option<Duration>,
}
