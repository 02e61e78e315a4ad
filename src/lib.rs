//! A library for monitoring and controlling Systemair SAVE VTR ventilation
//! units via Modbus.
//!
//! The unit exposes its state as 16-bit registers behind a single
//! half-duplex link. This crate turns those registers into a typed
//! [`state::DeviceState`] and setpoint / fan mode requests into register
//! writes, while making sure only one request is on the wire at a time.
//!
//! ## Building blocks
//!
//! - [`protocol`]: Register encodings and their decoding rules.
//! - [`register_map`]: Which register feeds which value. The built-in map can
//!   be replaced by a YAML file (feature `serde`).
//! - [`queue`]: Serialises reads and writes against the [`transport::Transport`],
//!   with control writes ahead of poll reads.
//! - [`poller`] and [`control`]: Poll cycles and control requests.
//! - [`device`]: A tokio task tying everything together.
//! - [`tokio_transport`]: The transport over `tokio-modbus` (features
//!   `tokio-rtu` and `tokio-tcp`).
//!
//! ## Quick Start
//!
//! ```no_run
//! use save_vtr_lib::{
//!     device::{Device, EngineConfig},
//!     register_map::{Cadence, RegisterMap},
//!     tokio_transport::ModbusTransport,
//! };
//! use std::sync::Arc;
//! use tokio_modbus::Slave;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket_addr = "192.168.1.100:502".parse()?;
//!     let ctx = tokio_modbus::client::tcp::connect_slave(socket_addr, Slave(1)).await?;
//!
//!     let (mut device, handle) = Device::new(RegisterMap::save_vtr(), EngineConfig::default());
//!     device.attach(Arc::new(ModbusTransport::new(ctx)));
//!     tokio::spawn(device.run());
//!
//!     let state = handle.refresh(Cadence::Fast).await?;
//!     println!("{state}");
//!
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod control;
pub mod device;
pub mod poller;
pub mod protocol;
pub mod queue;
pub mod register_map;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

#[cfg_attr(docsrs, doc(cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))))]
#[cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))]
pub mod tokio_common;

#[cfg_attr(docsrs, doc(cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))))]
#[cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))]
pub mod tokio_transport;
