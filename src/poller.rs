//! Poll cycles: batches of reads followed by a settle delay.
//!
//! A cycle submits the reads of every due cadence, then waits a fixed settle
//! delay and publishes whatever [`DeviceState`] the completed reads produced.
//! Reads still outstanding at that point keep their previous value in the
//! published snapshot and land in the next one.
//!
//! While a cycle is settling, further due cadences are remembered and start
//! together once the current cycle is published. Registers whose read is
//! still queued from an earlier cycle are not submitted again.
use crate::command::{Command, Completion};
use crate::queue::{self, CommandQueue};
use crate::register_map::{Cadence, RegisterMap};
use crate::state::DeviceState;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Default wait between submitting a batch and publishing the snapshot.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Receives the snapshot at the end of every poll cycle.
pub trait Publish {
    fn publish(&mut self, state: &DeviceState);
}

impl Publish for watch::Sender<DeviceState> {
    fn publish(&mut self, state: &DeviceState) {
        self.send_replace(state.clone());
    }
}

#[derive(Debug)]
pub struct Poller {
    map: Arc<RegisterMap>,
    state: DeviceState,
    settle_delay: Duration,
    settle_deadline: Option<Instant>,
    due_fast: bool,
    due_slow: bool,
}

impl Poller {
    pub fn new(map: Arc<RegisterMap>, settle_delay: Duration) -> Self {
        Self {
            state: DeviceState::new(&map),
            map,
            settle_delay,
            settle_deadline: None,
            due_fast: false,
            due_slow: false,
        }
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Marks a cadence as due. It starts with the next cycle.
    pub fn schedule(&mut self, cadence: Cadence) {
        match cadence {
            Cadence::Fast => self.due_fast = true,
            Cadence::Slow => self.due_slow = true,
            Cadence::Never => {}
        }
    }

    pub fn is_due(&self) -> bool {
        self.due_fast || self.due_slow
    }

    /// Returns `true` between the start of a cycle and its publication.
    pub fn is_cycle_active(&self) -> bool {
        self.settle_deadline.is_some()
    }

    pub fn settle_deadline(&self) -> Option<Instant> {
        self.settle_deadline
    }

    /// Starts a cycle for every due cadence.
    ///
    /// Returns the number of reads submitted, or `None` if nothing is due or
    /// the previous cycle has not been published yet. Without a transport no
    /// read is submitted, but the cycle still runs and publishes the
    /// unchanged state.
    pub fn start_cycle(&mut self, queue: &mut CommandQueue) -> Option<usize> {
        if self.is_cycle_active() || !self.is_due() {
            return None;
        }
        let mut cadences = Vec::with_capacity(2);
        if std::mem::take(&mut self.due_fast) {
            cadences.push(Cadence::Fast);
        }
        if std::mem::take(&mut self.due_slow) {
            cadences.push(Cadence::Slow);
        }

        let mut submitted = 0;
        let mut skipped = 0;
        'submit: for cadence in &cadences {
            for register in self.map.polled(*cadence) {
                if queue.is_read_queued(register.address) {
                    skipped += 1;
                    continue;
                }
                match queue.submit(Command::read(register)) {
                    Ok(()) => submitted += 1,
                    Err(queue::Error::NotAttached) => break 'submit,
                }
            }
        }
        if skipped > 0 {
            debug!("Skipped {skipped} registers still queued from an earlier cycle");
        }
        trace!("Started {cadences:?} cycle with {submitted} reads");
        self.settle_deadline = Some(Instant::now() + self.settle_delay);
        Some(submitted)
    }

    /// Folds a completed command into the state. Returns `true` if a value
    /// was stored; failures leave the state untouched.
    pub fn apply(&mut self, completion: &Completion) -> bool {
        match &completion.result {
            Ok(Some(value)) => {
                self.state
                    .apply(completion.command.register(), *value, self.map.airflow_factor())
            }
            Ok(None) | Err(_) => false,
        }
    }

    /// Publishes the cycle if its settle delay has expired.
    pub fn settle(&mut self, publisher: &mut impl Publish) -> bool {
        match self.settle_deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.finish_cycle(publisher);
                true
            }
            _ => false,
        }
    }

    /// Ends the active cycle and publishes the snapshot.
    pub fn finish_cycle(&mut self, publisher: &mut impl Publish) {
        if self.settle_deadline.take().is_none() {
            return;
        }
        self.state.cycle += 1;
        trace!("Publishing cycle {}", self.state.cycle);
        publisher.publish(&self.state);
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    pub fn snapshot(&self) -> DeviceState {
        self.state.clone()
    }
}
