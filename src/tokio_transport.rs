//! [`Transport`] over a `tokio-modbus` client context, RTU or TCP.
//!
//! Each request runs on its own task that locks the shared context, so the
//! same context can serve other users between requests. The lock is held
//! for the configured bus delay after every exchange; slow USB to RS485
//! adapters need that time to turn the line around.
//!
//! An exchange ends when the device answers, when the I/O timeout expires, or
//! when the receiver of the response is dropped, e.g. because the command
//! queue gave up on it. A device that never answers therefore cannot keep
//! the context locked.
use crate::command::Direction;
use crate::protocol::RegisterClass;
use crate::queue;
use crate::tokio_common::map_tokio_result;
use crate::transport::{PendingResponse, Request, Transport, TransportError};
use log::*;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, Writer};

/// Default bound on a single exchange on the wire.
pub const DEFAULT_IO_TIMEOUT: Duration = queue::DEFAULT_COMMAND_TIMEOUT;

#[derive(Clone)]
pub struct ModbusTransport {
    ctx: Arc<Mutex<Context>>,
    io_timeout: Option<Duration>,
    delay: Duration,
}

impl fmt::Debug for ModbusTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusTransport")
            .field("io_timeout", &self.io_timeout)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl ModbusTransport {
    /// Creates a transport from a connected `tokio-modbus` context.
    pub fn new(ctx: Context) -> Self {
        Self::from_shared(Arc::new(Mutex::new(ctx)))
    }

    /// Creates a transport from a shared `tokio-modbus` context.
    pub fn from_shared(ctx: Arc<Mutex<Context>>) -> Self {
        Self {
            ctx,
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            delay: Duration::ZERO,
        }
    }

    /// Clones the shared `tokio-modbus` context.
    pub fn clone_shared(&self) -> Arc<Mutex<Context>> {
        self.ctx.clone()
    }

    /// Bounds a single exchange on the wire. The command queue applies its
    /// own timeout on top of this one.
    pub fn set_timeout(&mut self, timeout: impl Into<Option<Duration>>) {
        self.io_timeout = timeout.into();
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    /// Quiet time enforced on the bus after every exchange.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    async fn execute(ctx: &mut Context, request: Request) -> Result<Vec<u8>, TransportError> {
        let words = match (request.class, request.direction) {
            (RegisterClass::Input, Direction::Read) => {
                map_tokio_result(ctx.read_input_registers(request.address, 1).await)?
            }
            (RegisterClass::Holding, Direction::Read) => {
                map_tokio_result(ctx.read_holding_registers(request.address, 1).await)?
            }
            (RegisterClass::Holding, Direction::Write(raw)) => {
                map_tokio_result(ctx.write_single_register(request.address, raw).await)?;
                Vec::new()
            }
            (RegisterClass::Input, Direction::Write(_)) => {
                return Err(TransportError::Unsupported(request.to_string()));
            }
        };
        Ok(payload(&words))
    }

    async fn execute_bounded(
        ctx: &mut Context,
        request: Request,
        io_timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let Some(io_timeout) = io_timeout else {
            return Self::execute(ctx, request).await;
        };
        tokio::time::timeout(io_timeout, Self::execute(ctx, request))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Link(format!(
                    "No response within {io_timeout:?}"
                )))
            })
    }
}

impl Transport for ModbusTransport {
    fn send(&self, request: Request) -> PendingResponse {
        let (mut sender, receiver) = oneshot::channel();
        let shared = self.ctx.clone();
        let io_timeout = self.io_timeout;
        let delay = self.delay;
        tokio::spawn(async move {
            let mut ctx = tokio::select! {
                ctx = shared.lock() => ctx,
                _ = sender.closed() => {
                    trace!("{request} abandoned before it was sent");
                    return;
                }
            };
            let response = tokio::select! {
                response = Self::execute_bounded(&mut ctx, request, io_timeout) => Some(response),
                _ = sender.closed() => None,
            };
            match response {
                Some(response) => {
                    if let Err(err) = &response {
                        debug!("{request} failed: {err}");
                    }
                    if sender.send(response).is_err() {
                        trace!("Response to {request} arrived after it was abandoned");
                    }
                }
                None => debug!("{request} abandoned while waiting for the device"),
            }
            tokio::time::sleep(delay).await;
        });
        receiver
    }
}

/// Big-endian bytes of the register words.
fn payload(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_be_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandState};
    use crate::queue::CommandQueue;
    use crate::register_map::{Field, RegisterMap};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_modbus::client::Client;
    use tokio_modbus::slave::{Slave, SlaveContext};

    /// Answers every holding register read with 21.5 °C, except the first
    /// call, which never returns.
    #[derive(Debug)]
    struct StallOnce {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Client for StallOnce {
        async fn call(
            &mut self,
            request: tokio_modbus::Request<'_>,
        ) -> tokio_modbus::Result<tokio_modbus::Response> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            match request {
                tokio_modbus::Request::ReadHoldingRegisters(_, count) => Ok(Ok(
                    tokio_modbus::Response::ReadHoldingRegisters(vec![215; count as usize]),
                )),
                _ => Ok(Err(tokio_modbus::ExceptionCode::IllegalFunction)),
            }
        }

        async fn disconnect(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SlaveContext for StallOnce {
        fn set_slave(&mut self, _slave: Slave) {}
    }

    fn stalling() -> (ModbusTransport, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let client: Box<dyn Client> = Box::new(StallOnce {
            calls: calls.clone(),
        });
        (ModbusTransport::new(Context::from(client)), calls)
    }

    fn read_setpoint() -> Request {
        Request {
            address: 2000,
            class: RegisterClass::Holding,
            direction: Direction::Read,
        }
    }

    #[test]
    fn payload_is_big_endian() {
        assert_eq!(payload(&[0x00D7]), vec![0x00, 0xD7]);
        assert_eq!(payload(&[0xFFF6, 0x0102]), vec![0xFF, 0xF6, 0x01, 0x02]);
        assert!(payload(&[]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_is_bounded_by_the_io_timeout() {
        let (transport, calls) = stalling();
        assert_eq!(transport.timeout(), Some(DEFAULT_IO_TIMEOUT));

        let first = transport.send(read_setpoint()).await.unwrap();
        assert_matches!(first, Err(TransportError::Link(..)));
        let second = transport.send(read_setpoint()).await.unwrap();
        assert_eq!(second, Ok(vec![0x00, 0xD7]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_exchange_frees_the_bus() {
        let (mut transport, calls) = stalling();
        transport.set_timeout(None);

        let first = transport.send(read_setpoint());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(first);

        let second = tokio::time::timeout(Duration::from_secs(1), transport.send(read_setpoint()))
            .await
            .expect("bus still locked");
        assert_eq!(second.unwrap(), Ok(vec![0x00, 0xD7]));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_recovers_after_one_hung_exchange() {
        let (mut transport, calls) = stalling();
        transport.set_timeout(None);
        let map = RegisterMap::save_vtr();
        let setpoint = map.find(Field::Setpoint).unwrap();
        let mut queue =
            CommandQueue::with_transport(Arc::new(transport), queue::DEFAULT_COMMAND_TIMEOUT);
        for _ in 0..5 {
            queue.submit(Command::read(setpoint)).unwrap();
        }

        let mut states = Vec::new();
        while !queue.is_idle() {
            states.push(queue.next_completion().await.state());
        }
        assert_eq!(
            states,
            vec![
                CommandState::TimedOut,
                CommandState::Succeeded,
                CommandState::Succeeded,
                CommandState::Succeeded,
                CommandState::Succeeded,
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
