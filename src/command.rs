//! A single queued register access and its outcome.
//!
//! Completion is delivered as data: a finished [`Command`] comes back as a
//! [`Completion`] carrying the decoded value or the error, and the register
//! descriptor inside the command tells the receiver which field it belongs to.
use crate::protocol::{self, RegisterClass, Value};
use crate::register_map::RegisterDescriptor;
use crate::transport::{Request, TransportError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    /// Write the contained raw word.
    Write(u16),
}

impl Direction {
    /// Returns `true` for reads.
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read)
    }
}

/// Lifecycle of a command inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Waiting in one of the queue lanes.
    Pending,
    /// Sent to the transport, waiting for the answer.
    InFlight,
    Succeeded,
    Failed,
    TimedOut,
}

impl CommandState {
    /// Returns `true` once the command left the queue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Cannot decode response: {0}")]
    Decode(#[from] protocol::Error),
}

/// One read or write of a single register.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    register: RegisterDescriptor,
    direction: Direction,
}

impl Command {
    /// A read of `register`.
    pub fn read(register: &RegisterDescriptor) -> Self {
        Self {
            register: register.clone(),
            direction: Direction::Read,
        }
    }

    /// A write of an already encoded word.
    pub fn write(register: &RegisterDescriptor, raw: u16) -> Self {
        Self {
            register: register.clone(),
            direction: Direction::Write(raw),
        }
    }

    /// The register this command accesses.
    pub fn register(&self) -> &RegisterDescriptor {
        &self.register
    }

    pub fn address(&self) -> u16 {
        self.register.address
    }

    pub fn class(&self) -> RegisterClass {
        self.register.class
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Raw word of a write command.
    pub fn write_payload(&self) -> Option<u16> {
        match self.direction {
            Direction::Read => None,
            Direction::Write(raw) => Some(raw),
        }
    }

    /// The request handed to the transport.
    pub fn request(&self) -> Request {
        Request {
            address: self.register.address,
            class: self.register.class,
            direction: self.direction,
        }
    }
}

/// A command that reached a terminal state.
///
/// Successful reads carry the decoded value, successful writes carry `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub command: Command,
    pub result: Result<Option<Value>, CommandError>,
}

impl Completion {
    /// The terminal state the command ended in.
    pub fn state(&self) -> CommandState {
        match &self.result {
            Ok(_) => CommandState::Succeeded,
            Err(CommandError::Timeout(_)) => CommandState::TimedOut,
            Err(_) => CommandState::Failed,
        }
    }
}
