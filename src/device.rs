//! The task that owns one device.
//!
//! [`Device`] runs the queue, the poll cycles and the control requests on a
//! single task. Fast and slow cycles are started by tokio intervals, the
//! settle delay by a sleep, and control requests arrive through the
//! [`DeviceHandle`]. Published snapshots are distributed through a
//! [`tokio::sync::watch`] channel, so readers always see the last complete
//! cycle and never the state in between.
//!
//! ```no_run
//! use save_vtr_lib::device::{Device, EngineConfig};
//! use save_vtr_lib::register_map::{Cadence, RegisterMap};
//! # async fn demo(transport: std::sync::Arc<dyn save_vtr_lib::transport::Transport>)
//! # -> Result<(), save_vtr_lib::device::Error> {
//! let (mut device, handle) = Device::new(RegisterMap::save_vtr(), EngineConfig::default());
//! device.attach(transport);
//! tokio::spawn(device.run());
//!
//! let state = handle.refresh(Cadence::Fast).await?;
//! println!("{state}");
//! handle.request_setpoint(21.5).await?;
//! # Ok(())
//! # }
//! ```
use crate::control::{self, Controller};
use crate::poller::{self, Poller};
use crate::protocol::FanMode;
use crate::queue::{self, CommandQueue};
use crate::register_map::{Cadence, RegisterMap};
use crate::state::DeviceState;
use crate::transport::Transport;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Device task stopped")]
    Stopped,

    #[error(transparent)]
    Control(#[from] control::Error),
}

/// Timing of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Longest time a command may stay in flight.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub command_timeout: Duration,
    /// Wait between starting a cycle and publishing its snapshot.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub settle_delay: Duration,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub fast_interval: Duration,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub slow_interval: Duration,
    /// Control requests buffered before [`DeviceHandle`] calls wait.
    pub request_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout: queue::DEFAULT_COMMAND_TIMEOUT,
            settle_delay: poller::DEFAULT_SETTLE_DELAY,
            fast_interval: Duration::from_secs(30),
            slow_interval: Duration::from_secs(5 * 60),
            request_capacity: 16,
        }
    }
}

#[derive(Debug)]
enum Message {
    Setpoint(f32, oneshot::Sender<Result<(), control::Error>>),
    FanMode(FanMode, oneshot::Sender<Result<(), control::Error>>),
    Refresh(Cadence, oneshot::Sender<DeviceState>),
}

type Waiter = oneshot::Sender<DeviceState>;

#[derive(Debug)]
pub struct Device {
    queue: CommandQueue,
    poller: Poller,
    controller: Controller,
    config: EngineConfig,
    requests: mpsc::Receiver<Message>,
    snapshots: watch::Sender<DeviceState>,
    /// Refresh callers waiting for the next cycle to start.
    waiting: Vec<Waiter>,
    /// Refresh callers served by the active cycle.
    armed: Vec<Waiter>,
    /// Refresh callers whose cycle was published with reads still queued.
    draining: Vec<Waiter>,
}

impl Device {
    /// Creates a device without transport and the handle to control it.
    pub fn new(map: RegisterMap, config: EngineConfig) -> (Self, DeviceHandle) {
        let map = Arc::new(map);
        let poller = Poller::new(map.clone(), config.settle_delay);
        let (snapshots, snapshot_receiver) = watch::channel(poller.snapshot());
        let (request_sender, requests) = mpsc::channel(config.request_capacity.max(1));
        let device = Self {
            queue: CommandQueue::new(config.command_timeout),
            poller,
            controller: Controller::new(map),
            config,
            requests,
            snapshots,
            waiting: Vec::new(),
            armed: Vec::new(),
            draining: Vec::new(),
        };
        let handle = DeviceHandle {
            requests: request_sender,
            snapshots: snapshot_receiver,
        };
        (device, handle)
    }

    pub fn attach(&mut self, transport: Arc<dyn Transport>) {
        self.queue.attach(transport);
    }

    pub fn detach(&mut self) -> Option<Arc<dyn Transport>> {
        self.queue.detach()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs until every [`DeviceHandle`] is dropped.
    ///
    /// The first timed cycles start one interval after the call; use
    /// [`DeviceHandle::refresh`] to poll right away.
    pub async fn run(mut self) {
        let mut fast = interval(self.config.fast_interval);
        let mut slow = interval(self.config.slow_interval);
        debug!(
            "Device task started: fast {:?}, slow {:?}, settle {:?}",
            self.config.fast_interval, self.config.slow_interval, self.config.settle_delay
        );
        loop {
            let settle = self.poller.settle_deadline();
            tokio::select! {
                _ = fast.tick() => self.poller.schedule(Cadence::Fast),
                _ = slow.tick() => self.poller.schedule(Cadence::Slow),
                _ = time::sleep_until(settle.unwrap_or_else(Instant::now)), if settle.is_some() => {
                    self.publish();
                }
                completion = self.queue.next_completion() => {
                    self.poller.apply(&completion);
                    self.release_drained();
                }
                message = self.requests.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
            self.start_cycle();
        }
        debug!("Device task stopped: all handles dropped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Setpoint(value, reply) => {
                let result = self.controller.request_setpoint(
                    value,
                    &mut self.queue,
                    self.poller.state_mut(),
                );
                if result.is_ok() {
                    let setpoint = self.poller.state().setpoint;
                    self.snapshots
                        .send_modify(|snapshot| snapshot.setpoint = setpoint);
                }
                let _ = reply.send(result);
            }
            Message::FanMode(mode, reply) => {
                let result = self.controller.request_fan_mode(mode, &mut self.queue);
                let _ = reply.send(result);
            }
            Message::Refresh(Cadence::Never, reply) => {
                let _ = reply.send(self.poller.snapshot());
            }
            Message::Refresh(cadence, reply) => {
                self.poller.schedule(cadence);
                self.waiting.push(reply);
            }
        }
    }

    fn start_cycle(&mut self) {
        if let Some(submitted) = self.poller.start_cycle(&mut self.queue) {
            trace!("Cycle started with {submitted} reads");
            self.armed.append(&mut self.waiting);
        }
    }

    fn publish(&mut self) {
        self.poller.finish_cycle(&mut self.snapshots);
        self.draining.append(&mut self.armed);
        self.release_drained();
    }

    fn release_drained(&mut self) {
        if self.draining.is_empty() || !self.queue.is_idle() {
            return;
        }
        let state = self.poller.snapshot();
        for waiter in self.draining.drain(..) {
            let _ = waiter.send(state.clone());
        }
    }
}

fn interval(period: Duration) -> time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Cloneable access to a running [`Device`].
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    requests: mpsc::Sender<Message>,
    snapshots: watch::Receiver<DeviceState>,
}

impl DeviceHandle {
    /// Requests a new setpoint in °C. Returns once the write is queued; the
    /// snapshot carries the new setpoint from then on until a poll reads the
    /// value back from the unit.
    pub async fn request_setpoint(&self, value: f32) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.send(Message::Setpoint(value, reply)).await?;
        response.await.map_err(|_| Error::Stopped)??;
        Ok(())
    }

    /// Requests a fan mode. Returns once the write is queued.
    pub async fn request_fan_mode(&self, mode: FanMode) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.send(Message::FanMode(mode, reply)).await?;
        response.await.map_err(|_| Error::Stopped)??;
        Ok(())
    }

    /// Polls the registers of `cadence` now and returns the state once the
    /// cycle is published and all its reads have retired.
    pub async fn refresh(&self, cadence: Cadence) -> Result<DeviceState, Error> {
        let (reply, response) = oneshot::channel();
        self.send(Message::Refresh(cadence, reply)).await?;
        response.await.map_err(|_| Error::Stopped)
    }

    /// The last published snapshot.
    pub fn snapshot(&self) -> DeviceState {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.snapshots.clone()
    }

    async fn send(&self, message: Message) -> Result<(), Error> {
        self.requests
            .send(message)
            .await
            .map_err(|_| Error::Stopped)
    }
}
