//! The seam to the physical link.
//!
//! The engine never touches bytes on the wire. It hands a [`Request`] to a
//! [`Transport`] and gets back a [`PendingResponse`] that resolves once the
//! device answered, the link failed, or the transport gave up. Framing, CRC
//! and connection handling belong to the implementation, see
//! `tokio_transport::ModbusTransport`.
use crate::command::Direction;
use crate::protocol::RegisterClass;
use std::fmt;
use tokio::sync::oneshot;

/// Classified failure of a single request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The device answered with an exception.
    #[error("Device rejected the request: {0}")]
    Nack(String),

    /// The link failed or the device did not answer in time.
    #[error("Link fault: {0}")]
    Link(String),

    /// The request cannot be expressed on this transport.
    #[error("Unsupported request: {0}")]
    Unsupported(String),

    /// The transport dropped the request without answering.
    #[error("Request dropped by the transport")]
    Dropped,
}

/// One register access as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub address: u16,
    pub class: RegisterClass,
    pub direction: Direction,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Read => write!(f, "read {} register {}", self.class, self.address),
            Direction::Write(raw) => {
                write!(f, "write {raw} to {} register {}", self.class, self.address)
            }
        }
    }
}

/// Raw payload of a successful request, big-endian register words.
/// Writes answer with an empty payload.
pub type Response = Result<Vec<u8>, TransportError>;

/// Resolves to the [`Response`] of a sent request.
pub type PendingResponse = oneshot::Receiver<Response>;

/// A half-duplex command/response link to the device.
///
/// `send` must not block: it starts the exchange and returns immediately.
/// Implementations answer every request exactly once through the returned
/// receiver; dropping the sender counts as [`TransportError::Dropped`].
pub trait Transport: Send + Sync + fmt::Debug {
    fn send(&self, request: Request) -> PendingResponse;
}
