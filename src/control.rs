//! Turns setpoint and fan mode requests into priority writes.
//!
//! Requests are validated before they reach the queue: a rejected request
//! leaves the queue and the state untouched. An accepted setpoint is stored
//! in the state right away, the fan mode only once the device reports it.
use crate::command::Command;
use crate::protocol::{self, FanMode, Value};
use crate::queue::{self, CommandQueue};
use crate::register_map::{self, Field, RegisterMap};
use crate::state::DeviceState;
use log::*;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No transport attached")]
    NotAttached,

    #[error("Rejected write: {0}")]
    RejectedWrite(#[from] RejectedWrite),
}

/// Why a write was refused before submission.
#[derive(Debug, thiserror::Error)]
pub enum RejectedWrite {
    #[error("Fan mode {0} can only be reported by the device")]
    ReadOnlyMode(FanMode),

    #[error(transparent)]
    Register(#[from] register_map::Error),

    #[error(transparent)]
    Value(#[from] protocol::Error),
}

impl From<queue::Error> for Error {
    fn from(err: queue::Error) -> Self {
        match err {
            queue::Error::NotAttached => Self::NotAttached,
        }
    }
}

impl From<register_map::Error> for Error {
    fn from(err: register_map::Error) -> Self {
        Self::RejectedWrite(err.into())
    }
}

impl From<protocol::Error> for Error {
    fn from(err: protocol::Error) -> Self {
        Self::RejectedWrite(err.into())
    }
}

#[derive(Debug, Clone)]
pub struct Controller {
    map: Arc<RegisterMap>,
}

impl Controller {
    pub fn new(map: Arc<RegisterMap>) -> Self {
        Self { map }
    }

    /// Queues a write of the setpoint in °C and assumes it in `state`.
    pub fn request_setpoint(
        &self,
        value: f32,
        queue: &mut CommandQueue,
        state: &mut DeviceState,
    ) -> Result<(), Error> {
        let raw = self
            .submit(Field::Setpoint, Value::Tenths(value), queue)
            .inspect_err(|err| warn!("Setpoint {value} not set: {err}"))?;
        state.assume_setpoint(raw);
        info!("Requested setpoint {value:.1} °C");
        Ok(())
    }

    /// Queues a write of the fan mode request register.
    pub fn request_fan_mode(&self, mode: FanMode, queue: &mut CommandQueue) -> Result<(), Error> {
        let result = if mode.is_writable() {
            self.submit(Field::FanModeRequest, Value::FanMode(mode), queue)
        } else {
            Err(RejectedWrite::ReadOnlyMode(mode).into())
        };
        result.inspect_err(|err| warn!("Fan mode {mode} not set: {err}"))?;
        info!("Requested fan mode {mode}");
        Ok(())
    }

    fn submit(&self, field: Field, value: Value, queue: &mut CommandQueue) -> Result<u16, Error> {
        let register = self.map.writable(field)?;
        let raw = protocol::encode(register.encoding, &value)?;
        queue.submit_priority(Command::write(register, raw))?;
        Ok(raw)
    }
}
