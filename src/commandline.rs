use crate::mqtt::MqttConfig;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use save_vtr_lib::{protocol, tokio_common};
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(s: &str) -> Result<u8, String> {
    let address =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    if (1..=tokio_common::DEVICE_ADDRESS_MAX).contains(&address) {
        Ok(address)
    } else {
        Err(format!(
            "Address {address} is outside 1..={}",
            tokio_common::DEVICE_ADDRESS_MAX
        ))
    }
}

fn parse_degree_celsius(s: &str) -> Result<f32, String> {
    let value = s
        .parse::<f32>()
        .map_err(|e| format!("Invalid temperature value format: {e}"))?;
    protocol::tenths_encode(value).map_err(|e| e.to_string())?;
    Ok(value)
}

fn parse_fan_mode(s: &str) -> Result<protocol::FanMode, String> {
    s.parse::<protocol::FanMode>().map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliConnection {
    /// Connect to the ventilation unit via Modbus TCP.
    Tcp {
        /// The IP address or hostname and port of the Modbus TCP gateway.
        /// Example: "192.168.1.100:502".
        address: String,

        /// Commands for the connected unit.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// Connect to the ventilation unit via Modbus RTU (Serial).
    Rtu {
        /// Serial port device name.
        /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
        #[arg(short, long, default_value_t = default_device_name())]
        device: String,

        /// Baud rate for serial communication.
        /// Must match the baud rate configured on the unit.
        #[arg(long, default_value_t = tokio_common::DEFAULT_BAUD_RATE)]
        baud_rate: u32,

        /// The Modbus RTU slave id of the unit (1 to 247).
        #[arg(short, long, default_value_t = tokio_common::DEFAULT_DEVICE_ADDRESS, value_parser = parse_address)]
        address: u8,

        /// Commands for the connected unit.
        #[command(subcommand)]
        command: CliCommands,
    },
}

impl CliConnection {
    pub fn command(&self) -> &CliCommands {
        match self {
            CliConnection::Tcp { command, .. } | CliConnection::Rtu { command, .. } => command,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print every published snapshot to the standard output (console).
    Console,
    /// Publish every snapshot to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: poll values and alarms on their own intervals.
    /// Output can be directed to stdout or an MQTT broker.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval of the value poll (e.g., "10s", "1m").
        /// Overrides the configuration file.
        #[arg(value_parser = humantime::parse_duration, short, long, verbatim_doc_comment)]
        fast_interval: Option<Duration>,

        /// Interval of the alarm scan (e.g., "5m").
        /// Overrides the configuration file.
        #[arg(value_parser = humantime::parse_duration, short, long, verbatim_doc_comment)]
        slow_interval: Option<Duration>,

        /// Specifies the output.
        #[command(subcommand)]
        output: DaemonOutput,
    },

    /// Read and display temperatures, heat demand, air flows and fan mode.
    Read,

    /// Read and display all alarms, alarm flags and counters.
    ReadAlarms,

    /// Read and display all values and alarms.
    ReadAll,

    /// Set the temperature setpoint.
    SetSetpoint {
        /// Setpoint in degrees Celsius (°C), in steps of 0.1 °C.
        #[arg(value_parser = parse_degree_celsius, allow_negative_numbers = true)]
        value: f32,
    },

    /// Request a fan mode.
    /// One of AUTO, MANUAL, CROWDED, REFRESH, FIREPLACE, AWAY, HOLIDAY.
    /// COOKERHOOD is reported by the unit but cannot be requested.
    #[clap(verbatim_doc_comment)]
    SetFanMode {
        #[arg(value_parser = parse_fan_mode)]
        mode: protocol::FanMode,
    },
}

const fn about_text() -> &'static str {
    "SAVE VTR CLI - Monitor and control Systemair SAVE VTR ventilation units via Modbus RTU/TCP."
}

#[derive(Parser, Debug)]
#[command(name="vtrctl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Specifies the connection method and device-specific commands.
    #[command(subcommand)]
    pub connection: CliConnection,

    /// YAML file with engine timing and an optional register map.
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    /// Modbus I/O timeout for read/write operations.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "200ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Minimum delay between multiple Modbus commands sent to the same device.
    /// Important for Modbus RTU, especially with USB-to-RS485 converters that need time
    /// to switch between transmitting (TX) and receiving (RX) modes.
    /// Examples: "50ms", "100ms".
    #[arg(global = true, long, default_value = "50ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub delay: Duration,

    /// Wait between starting a poll and publishing its values.
    /// Overrides the configuration file.
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub settle: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_accept_hex_and_reject_broadcast() {
        assert_eq!(parse_address("0x0A"), Ok(10));
        assert_eq!(parse_address("247"), Ok(247));
        assert!(parse_address("0").is_err());
        assert!(parse_address("248").is_err());
    }

    #[test]
    fn setpoint_must_fit_tenths() {
        assert_eq!(parse_degree_celsius("21.5"), Ok(21.5));
        assert!(parse_degree_celsius("5000").is_err());
        assert!(parse_degree_celsius("warm").is_err());
    }

    #[test]
    fn negative_setpoint_is_not_a_flag() {
        let args = CliArgs::try_parse_from(["vtrctl", "tcp", "127.0.0.1:502", "set-setpoint", "-2.5"])
            .unwrap();
        assert_eq!(
            args.connection,
            CliConnection::Tcp {
                address: "127.0.0.1:502".into(),
                command: CliCommands::SetSetpoint { value: -2.5 },
            }
        );
    }

    #[test]
    fn fan_mode_names() {
        let args = CliArgs::try_parse_from(["vtrctl", "rtu", "-a", "2", "set-fan-mode", "away"])
            .unwrap();
        assert_matches::assert_matches!(
            args.connection,
            CliConnection::Rtu {
                address: 2,
                command: CliCommands::SetFanMode {
                    mode: protocol::FanMode::Away
                },
                ..
            }
        );
        assert!(parse_fan_mode("turbo").is_err());
    }
}
