//! SAVE VTR CLI
//!
//! A command-line interface (CLI) application for Systemair SAVE VTR
//! ventilation units using Modbus RTU (serial) or Modbus TCP.
//!
//! This tool allows users to:
//! - Read temperatures, heat demand, air flows and the fan mode.
//! - Read the alarm table, alarm flags and the filter warning counter.
//! - Set the temperature setpoint and request a fan mode.
//! - Run in a continuous daemon mode that polls values and alarms on their own
//!   intervals and either prints them to the console or publishes them to an
//!   MQTT broker.
//!
//! The CLI leverages the `save_vtr_lib` crate for the register map, the command
//! queue and the device task.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use save_vtr_lib::{
    device::{Device, DeviceHandle},
    register_map::Cadence,
    state::DeviceState,
    tokio_transport::ModbusTransport,
};
use std::{panic, sync::Arc, time::Duration};

mod commandline;
mod config;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

/// Calculates the minimum recommended delay for Modbus RTU based on baud rate.
/// This is typically 3.5 character times.
fn minimum_rtu_delay(baud_rate: u32) -> Duration {
    // Modbus character time is usually computed with 11 bits per character.
    let bits_per_char = 11.0;
    let rate = baud_rate as f64;
    if rate == 0.0 {
        return Duration::from_millis(16);
    }

    let char_time_secs = bits_per_char / rate;
    let inter_frame_delay_secs = 3.5 * char_time_secs;
    let delay_micros = (inter_frame_delay_secs * 1_000_000.0) as u64;

    // Fixed minimum silence for baud rates above 19200.
    const PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS: u64 = 1_750;
    Duration::from_micros(delay_micros.max(PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS))
}

/// Checks if the user-provided RTU delay is sufficient; if not, uses the calculated minimum.
fn check_rtu_delay(user_delay: Duration, baud_rate: u32) -> Duration {
    let min_rtu_delay = minimum_rtu_delay(baud_rate);
    if user_delay < min_rtu_delay {
        warn!(
            "User-defined RTU delay of {user_delay:?} is below the recommended minimum of {min_rtu_delay:?} for {baud_rate} baud. Using minimum."
        );
        min_rtu_delay
    } else {
        user_delay
    }
}

/// Opens the Modbus connection described by the command-line arguments.
async fn create_context<'a>(
    connection: &'a commandline::CliConnection,
    delay: &mut Duration,
) -> Result<(tokio_modbus::client::Context, &'a commandline::CliCommands)> {
    match connection {
        commandline::CliConnection::Tcp {
            address: tcp_address_str,
            command,
        } => {
            let socket_addr = tcp_address_str
                .parse()
                .with_context(|| format!("Invalid TCP address format: '{tcp_address_str}'"))?;
            info!("Attempting to connect via TCP to {socket_addr}...");
            let ctx = tokio_modbus::client::tcp::connect(socket_addr)
                .await
                .with_context(|| {
                    format!("Failed to connect to Modbus TCP device at {socket_addr}")
                })?;
            Ok((ctx, command))
        }
        commandline::CliConnection::Rtu {
            device,
            baud_rate,
            address,
            command,
        } => {
            info!(
                "Attempting to connect via RTU to device {device} (Address: {address}, Baud: {baud_rate})..."
            );
            *delay = check_rtu_delay(*delay, *baud_rate);
            let builder = save_vtr_lib::tokio_common::serial_port_builder(device, *baud_rate);
            let port = tokio_serial::SerialStream::open(&builder)
                .with_context(|| format!("Cannot open serial port {device}"))?;
            let ctx = tokio_modbus::client::rtu::attach_slave(port, tokio_modbus::Slave(*address));
            Ok((ctx, command))
        }
    }
}

/// Polls values and alarms once. The returned state holds both.
pub(crate) async fn refresh_all(handle: &DeviceHandle) -> Result<DeviceState> {
    handle
        .refresh(Cadence::Fast)
        .await
        .context("Cannot read values")?;
    handle
        .refresh(Cadence::Slow)
        .await
        .context("Cannot read alarms")
}

fn print_alarms(state: &DeviceState) {
    fn or_na<T: ToString>(value: Option<T>) -> String {
        value.map_or_else(|| "n/a".to_string(), |value| value.to_string())
    }
    println!("Alarms:");
    for alarm in &state.alarms {
        println!("  {:<32} {}", alarm.name, or_na(alarm.state));
    }
    println!("Alarm flags:");
    for flag in &state.flags {
        println!("  {:<32} {}", flag.name, or_na(flag.value));
    }
    println!("Counters:");
    for counter in &state.counters {
        println!("  {:<32} {}", counter.name, or_na(counter.value));
    }
}

async fn run_console(handle: &DeviceHandle) -> Result<()> {
    let mut snapshots = handle.subscribe();
    let state = refresh_all(handle).await?;
    snapshots.borrow_and_update();
    println!("{state}\n");
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = snapshots.borrow_and_update().clone();
                debug!("Daemon: cycle {} published", state.cycle);
                println!("{state}\n");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
        }
    }
    Ok(())
}

async fn execute(command: &commandline::CliCommands, handle: &DeviceHandle) -> Result<()> {
    match command {
        commandline::CliCommands::Daemon { output, .. } => {
            info!("Starting daemon mode: output={output:?}");
            match output {
                commandline::DaemonOutput::Console => run_console(handle).await?,
                commandline::DaemonOutput::Mqtt { config_file } => {
                    mqtt::run_daemon(handle, config_file).await?
                }
            }
        }
        commandline::CliCommands::Read => {
            info!("Executing: Read Values");
            let state = handle
                .refresh(Cadence::Fast)
                .await
                .context("Cannot read values")?;
            println!("{state}");
        }
        commandline::CliCommands::ReadAlarms => {
            info!("Executing: Read Alarms");
            let state = handle
                .refresh(Cadence::Slow)
                .await
                .context("Cannot read alarms")?;
            print_alarms(&state);
        }
        commandline::CliCommands::ReadAll => {
            info!("Executing: Read All Values");
            let state = refresh_all(handle).await?;
            println!("{state}");
            print_alarms(&state);
        }
        commandline::CliCommands::SetSetpoint { value } => {
            info!("Executing: Set Setpoint to {value} °C");
            handle
                .request_setpoint(*value)
                .await
                .with_context(|| format!("Failed to set setpoint to {value} °C"))?;
            let state = handle
                .refresh(Cadence::Fast)
                .await
                .context("Cannot read back setpoint")?;
            match state.setpoint {
                Some(reported) => println!("Setpoint set. The unit reports {reported:.1} °C."),
                None => println!("Setpoint sent. The unit did not report it back."),
            }
        }
        commandline::CliCommands::SetFanMode { mode } => {
            info!("Executing: Set Fan Mode to {mode}");
            handle
                .request_fan_mode(*mode)
                .await
                .with_context(|| format!("Failed to request fan mode {mode}"))?;
            let state = handle
                .refresh(Cadence::Fast)
                .await
                .context("Cannot read back fan mode")?;
            match state.fan_mode {
                Some(reported) => {
                    println!("Fan mode {mode} requested. The unit reports {reported}.")
                }
                None => println!("Fan mode {mode} requested. The unit did not report its mode."),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "SAVE VTR CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Engine settings: config file, then command-line overrides
    let config = match &args.config {
        Some(path) => config::Config::load(path)?,
        None => config::Config::default(),
    };
    let mut engine = config.engine;
    if let Some(settle) = args.settle {
        engine.settle_delay = settle;
    }
    if let commandline::CliCommands::Daemon {
        fast_interval,
        slow_interval,
        ..
    } = args.connection.command()
    {
        engine.fast_interval = fast_interval.unwrap_or(engine.fast_interval);
        engine.slow_interval = slow_interval.unwrap_or(engine.slow_interval);
    }

    // 3. Connect and start the device task
    let mut delay = args.delay;
    let (ctx, command) = create_context(&args.connection, &mut delay).await?;
    let mut transport = ModbusTransport::new(ctx);
    transport.set_timeout(args.timeout);
    transport.set_delay(delay);
    let exchange = args.timeout + delay;
    if engine.command_timeout < exchange {
        warn!(
            "Command timeout {:?} is shorter than Modbus timeout plus delay, using {exchange:?}",
            engine.command_timeout
        );
        engine.command_timeout = exchange;
    }

    let (mut device, handle) = Device::new(config.register_map(), engine);
    device.attach(Arc::new(transport));
    let task = tokio::spawn(device.run());

    // 4. Execute the command
    let result = execute(command, &handle).await;
    drop(handle);
    task.await.context("Device task failed")?;
    result
}
