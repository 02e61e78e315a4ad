//! Serialises commands onto the single half-duplex transport.
//!
//! The queue holds two FIFO lanes, control writes in front of poll reads, and
//! at most one command in flight. A command leaves the in-flight slot only
//! when it reaches a terminal state: answered, failed or timed out. Only then
//! is the next command sent, so responses can never be attributed to the
//! wrong request. Failed commands are reported and dropped; retrying is up to
//! whoever submitted them.
//!
//! The queue does not run on its own. Drive it either with [`CommandQueue::tick`]
//! from a timer or by awaiting [`CommandQueue::next_completion`].
use crate::command::{Command, CommandError, CommandState, Completion, Direction};
use crate::protocol;
use crate::transport::{PendingResponse, Response, Transport, TransportError};
use log::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::error::{RecvError, TryRecvError};
use tokio::time::Instant;

/// Default bound on how long a command may stay in flight.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("No transport attached")]
    NotAttached,
}

/// Counters of commands retired by the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

#[derive(Debug)]
struct InFlight {
    command: Command,
    deadline: Instant,
    response: PendingResponse,
}

#[derive(Debug)]
pub struct CommandQueue {
    transport: Option<Arc<dyn Transport>>,
    priority: VecDeque<Command>,
    pending: VecDeque<Command>,
    in_flight: Option<InFlight>,
    timeout: Duration,
    stats: QueueStats,
}

impl CommandQueue {
    /// Creates a queue without a transport. Submissions are refused until
    /// [`Self::attach`] is called.
    pub fn new(timeout: Duration) -> Self {
        Self {
            transport: None,
            priority: VecDeque::new(),
            pending: VecDeque::new(),
            in_flight: None,
            timeout,
            stats: QueueStats::default(),
        }
    }

    pub fn with_transport(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        let mut queue = Self::new(timeout);
        queue.attach(transport);
        queue
    }

    pub fn attach(&mut self, transport: Arc<dyn Transport>) {
        self.transport = Some(transport);
    }

    /// Detaches the transport. A command already in flight still completes.
    pub fn detach(&mut self) -> Option<Arc<dyn Transport>> {
        self.transport.take()
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Changes the timeout for commands dispatched from now on.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Appends a command behind everything already queued.
    pub fn submit(&mut self, command: Command) -> Result<(), Error> {
        self.admit(&command)?;
        self.pending.push_back(command);
        Ok(())
    }

    /// Queues a command ahead of all normal commands, behind earlier priority
    /// commands and behind the command in flight.
    pub fn submit_priority(&mut self, command: Command) -> Result<(), Error> {
        self.admit(&command)?;
        self.priority.push_back(command);
        Ok(())
    }

    fn admit(&self, command: &Command) -> Result<(), Error> {
        if !self.is_attached() {
            debug!("Dropping {}: no transport attached", command.request());
            return Err(Error::NotAttached);
        }
        trace!("Queued {}", command.request());
        Ok(())
    }

    pub fn in_flight(&self) -> Option<&Command> {
        self.in_flight.as_ref().map(|flight| &flight.command)
    }

    /// Number of commands waiting, not counting the one in flight.
    pub fn pending_len(&self) -> usize {
        self.priority.len() + self.pending.len()
    }

    /// Returns `true` when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending_len() == 0
    }

    /// Iterates over the waiting commands in dispatch order.
    pub fn pending(&self) -> impl Iterator<Item = &Command> {
        self.priority.iter().chain(self.pending.iter())
    }

    /// State of a read of `address` the queue still holds: [`CommandState::InFlight`],
    /// [`CommandState::Pending`], or `None` once it retired.
    pub fn read_state(&self, address: u16) -> Option<CommandState> {
        let reads = |command: &Command| command.direction().is_read() && command.address() == address;
        if self.in_flight().is_some_and(reads) {
            Some(CommandState::InFlight)
        } else if self.pending().any(reads) {
            Some(CommandState::Pending)
        } else {
            None
        }
    }

    /// Returns `true` if a read of `address` is waiting or in flight.
    pub fn is_read_queued(&self, address: u16) -> bool {
        self.read_state(address).is_some()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Advances the queue without waiting.
    ///
    /// Retires the command in flight if it was answered or its deadline
    /// passed, then sends the next waiting command if the slot is free.
    /// Returns the retired command, if any.
    pub fn tick(&mut self) -> Option<Completion> {
        let completion = self.poll_in_flight(Instant::now());
        if self.in_flight.is_none() {
            self.dispatch_next();
        }
        completion
    }

    /// Waits until the next command reaches a terminal state.
    ///
    /// Pending forever while the queue is empty or detached. Dropping the
    /// future does not lose a response: the in-flight command stays in place
    /// and the next call continues waiting for it.
    pub async fn next_completion(&mut self) -> Completion {
        if self.in_flight.is_none() && !self.dispatch_next() {
            return std::future::pending().await;
        }
        let Some(flight) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };
        let result = match tokio::time::timeout_at(flight.deadline, &mut flight.response).await {
            Ok(response) => Self::classify(response),
            Err(_) => Err(CommandError::Timeout(self.timeout)),
        };
        match self.in_flight.take() {
            Some(flight) => self.retire(flight.command, result),
            None => std::future::pending().await,
        }
    }

    fn poll_in_flight(&mut self, now: Instant) -> Option<Completion> {
        let flight = self.in_flight.as_mut()?;
        let result = match flight.response.try_recv() {
            Ok(response) => Self::classify(Ok(response)),
            Err(TryRecvError::Closed) => Err(CommandError::Transport(TransportError::Dropped)),
            Err(TryRecvError::Empty) if now >= flight.deadline => {
                Err(CommandError::Timeout(self.timeout))
            }
            Err(TryRecvError::Empty) => return None,
        };
        let flight = self.in_flight.take()?;
        Some(self.retire(flight.command, result))
    }

    fn classify(response: Result<Response, RecvError>) -> Result<Vec<u8>, CommandError> {
        match response {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(TransportError::Dropped.into()),
        }
    }

    fn dispatch_next(&mut self) -> bool {
        let Some(transport) = self.transport.clone() else {
            return false;
        };
        let Some(command) = self
            .priority
            .pop_front()
            .or_else(|| self.pending.pop_front())
        else {
            return false;
        };
        let request = command.request();
        trace!("Sending {request}");
        let response = transport.send(request);
        self.stats.dispatched += 1;
        self.in_flight = Some(InFlight {
            command,
            deadline: Instant::now() + self.timeout,
            response,
        });
        true
    }

    fn retire(&mut self, command: Command, raw: Result<Vec<u8>, CommandError>) -> Completion {
        let result = raw.and_then(|payload| match command.direction() {
            Direction::Read => protocol::decode(command.register().encoding, &payload)
                .map(Some)
                .map_err(CommandError::from),
            Direction::Write(_) => Ok(None),
        });
        match &result {
            Ok(_) => self.stats.succeeded += 1,
            Err(CommandError::Timeout(_)) => self.stats.timed_out += 1,
            Err(_) => self.stats.failed += 1,
        }
        if let Err(err) = &result {
            warn!("Cannot {} ({}): {err}", command.request(), command.register().name);
        }
        Completion { command, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;
    use crate::register_map::{Field, RegisterMap};
    use crate::testing::{small_map, ScriptedTransport};
    use assert_matches::assert_matches;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn queue(transport: &ScriptedTransport) -> CommandQueue {
        CommandQueue::with_transport(Arc::new(transport.clone()), TIMEOUT)
    }

    fn read(map: &RegisterMap, field: Field) -> Command {
        Command::read(map.find(field).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn detached_queue_refuses_commands() {
        let map = small_map();
        let mut queue = CommandQueue::new(TIMEOUT);
        assert_matches!(
            queue.submit(read(&map, Field::Setpoint)),
            Err(Error::NotAttached)
        );
        assert_matches!(
            queue.submit_priority(read(&map, Field::Setpoint)),
            Err(Error::NotAttached)
        );
        assert!(queue.tick().is_none());
        assert!(queue.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn reads_are_decoded_in_submission_order() {
        let map = small_map();
        let transport = ScriptedTransport::new();
        transport.reply_word(2001, 215);
        transport.reply_word(2000, 0xFFF6);
        let mut queue = queue(&transport);

        queue.submit(read(&map, Field::RoomTemperature)).unwrap();
        queue.submit(read(&map, Field::Setpoint)).unwrap();

        assert!(queue.tick().is_none());
        let first = queue.tick().unwrap();
        assert_eq!(first.command.address(), 2001);
        assert_eq!(first.result, Ok(Some(Value::Tenths(21.5))));
        let second = queue.tick().unwrap();
        assert_eq!(second.command.address(), 2000);
        assert_eq!(second.result, Ok(Some(Value::Tenths(-1.0))));
        assert!(queue.is_idle());
        assert_eq!(queue.stats().succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_one_command_in_flight() {
        let map = small_map();
        let transport = ScriptedTransport::new();
        let mut queue = queue(&transport);

        for register in map.registers() {
            queue.submit(Command::read(register)).unwrap();
        }
        let setpoint = map.writable(Field::Setpoint).unwrap();
        let mut completed = 0;
        let mut step = 0;
        while !queue.is_idle() {
            queue.tick();
            assert!(transport.open() <= 1);
            assert_eq!(queue.in_flight().is_some(), transport.open() == 1);

            // Interleave priority writes with the running batch.
            if step % 3 == 0 {
                queue
                    .submit_priority(Command::write(setpoint, 200 + step))
                    .unwrap();
            }
            if step % 2 == 0 {
                tokio::time::advance(TIMEOUT).await;
            } else if transport.release(Ok(vec![0, 1])).is_some() {
                completed += 1;
            }
            assert!(transport.open() <= 1);
            step += 1;
        }
        assert!(completed > 0);
        let stats = queue.stats();
        assert_eq!(stats.dispatched, transport.sent().len() as u64);
        assert_eq!(
            stats.dispatched,
            stats.succeeded + stats.failed + stats.timed_out
        );
    }

    #[tokio::test(start_paused = true)]
    async fn priority_commands_skip_waiting_reads_but_not_the_one_in_flight() {
        let map = small_map();
        let transport = ScriptedTransport::new();
        let mut queue = queue(&transport);

        queue.submit(read(&map, Field::RoomTemperature)).unwrap();
        queue.submit(read(&map, Field::Setpoint)).unwrap();
        queue.tick();
        assert_eq!(queue.in_flight().map(Command::address), Some(2001));

        let request = map.writable(Field::FanModeRequest).unwrap();
        queue.submit_priority(Command::write(request, 6)).unwrap();
        queue.submit_priority(Command::write(request, 2)).unwrap();
        assert_eq!(queue.in_flight().map(Command::address), Some(2001));

        let order: Vec<_> = queue.pending().map(Command::write_payload).collect();
        assert_eq!(order, vec![Some(6), Some(2), None]);

        transport.release(Ok(vec![0, 200]));
        let completion = queue.tick().unwrap();
        assert_eq!(completion.command.address(), 2001);
        assert_eq!(queue.in_flight().and_then(Command::write_payload), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_command_releases_the_queue_within_one_tick() {
        let map = small_map();
        let transport = ScriptedTransport::new();
        transport.reply_word(2000, 210);
        let mut queue = queue(&transport);

        queue.submit(read(&map, Field::RoomTemperature)).unwrap();
        queue.submit(read(&map, Field::Setpoint)).unwrap();
        queue.tick();
        assert_eq!(queue.in_flight().map(Command::address), Some(2001));

        tokio::time::advance(TIMEOUT - Duration::from_millis(1)).await;
        assert!(queue.tick().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let completion = queue.tick().unwrap();
        assert_eq!(completion.state(), CommandState::TimedOut);
        assert_matches!(completion.result, Err(CommandError::Timeout(TIMEOUT)));
        assert_eq!(queue.in_flight().map(Command::address), Some(2000));
        assert_eq!(transport.sent().len(), 2);

        // The late answer of the timed out read is never attributed.
        transport.release(Ok(vec![0, 99]));
        let completion = queue.tick().unwrap();
        assert_eq!(completion.command.address(), 2000);
        assert_eq!(completion.result, Ok(Some(Value::Tenths(21.0))));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_classified_and_do_not_halt_the_queue() {
        let map = small_map();
        let transport = ScriptedTransport::new();
        transport.fail(2001, TransportError::Nack("illegal data address".into()));
        transport.reply(2000, Ok(vec![0x01]));
        transport.reply_word(2148, 40);
        let mut queue = queue(&transport);

        queue.submit(read(&map, Field::RoomTemperature)).unwrap();
        queue.submit(read(&map, Field::Setpoint)).unwrap();
        queue.submit(read(&map, Field::HeatDemand)).unwrap();

        let mut completions = Vec::new();
        while !queue.is_idle() {
            completions.extend(queue.tick());
        }
        assert_eq!(completions.len(), 3);
        assert_matches!(
            &completions[0].result,
            Err(CommandError::Transport(TransportError::Nack(..)))
        );
        assert_matches!(
            &completions[1].result,
            Err(CommandError::Decode(protocol::Error::PayloadTooShort(1)))
        );
        assert_eq!(completions[1].state(), CommandState::Failed);
        assert_eq!(completions[2].result, Ok(Some(Value::Raw(40))));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_response_fails_the_command() {
        #[derive(Debug)]
        struct Forgetful;
        impl Transport for Forgetful {
            fn send(&self, _request: crate::transport::Request) -> PendingResponse {
                tokio::sync::oneshot::channel().1
            }
        }

        let map = small_map();
        let mut queue = CommandQueue::with_transport(Arc::new(Forgetful), TIMEOUT);
        queue.submit(read(&map, Field::Setpoint)).unwrap();
        queue.tick();
        let completion = queue.tick().unwrap();
        assert_matches!(
            completion.result,
            Err(CommandError::Transport(TransportError::Dropped))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn next_completion_waits_for_answer_or_deadline() {
        let map = small_map();
        let transport = ScriptedTransport::new();
        transport.reply_word(2148, 55);
        let mut queue = queue(&transport);

        queue.submit(read(&map, Field::RoomTemperature)).unwrap();
        queue.submit(read(&map, Field::HeatDemand)).unwrap();

        let start = Instant::now();
        let completion = queue.next_completion().await;
        assert_eq!(completion.state(), CommandState::TimedOut);
        assert_eq!(start.elapsed(), TIMEOUT);

        let completion = queue.next_completion().await;
        assert_eq!(completion.result, Ok(Some(Value::Raw(55))));
        assert!(queue.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_complete_without_value() {
        let map = small_map();
        let transport = ScriptedTransport::new();
        transport.reply(2000, Ok(Vec::new()));
        let mut queue = queue(&transport);

        let setpoint = map.writable(Field::Setpoint).unwrap();
        queue.submit_priority(Command::write(setpoint, 215)).unwrap();
        let completion = queue.next_completion().await;
        assert_eq!(completion.result, Ok(None));
        assert_eq!(
            transport.sent()[0].direction,
            Direction::Write(215)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn read_queued_lookup() {
        let map = small_map();
        let transport = ScriptedTransport::new();
        let mut queue = queue(&transport);

        queue.submit(read(&map, Field::RoomTemperature)).unwrap();
        queue.submit(read(&map, Field::Setpoint)).unwrap();
        assert_eq!(queue.read_state(2001), Some(CommandState::Pending));
        queue.tick();
        assert_eq!(queue.read_state(2001), Some(CommandState::InFlight));
        assert_eq!(queue.read_state(2000), Some(CommandState::Pending));
        assert!(queue.is_read_queued(2001));
        assert!(queue.is_read_queued(2000));
        assert!(!queue.is_read_queued(2148));

        let setpoint = map.writable(Field::Setpoint).unwrap();
        queue.submit_priority(Command::write(setpoint, 215)).unwrap();
        assert_eq!(queue.read_state(2000), Some(CommandState::Pending));

        tokio::time::advance(TIMEOUT).await;
        let completion = queue.tick().unwrap();
        assert!(completion.state().is_terminal());
        assert_eq!(queue.read_state(2001), None);
    }
}
