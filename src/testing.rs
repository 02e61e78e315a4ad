//! In-memory transport for unit tests.
use crate::protocol::{Encoding, EnumTable, RegisterClass};
use crate::register_map::{Cadence, Field, RegisterDescriptor, RegisterMap};
use crate::transport::{PendingResponse, Request, Response, Transport, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Answers requests from a per-address script.
///
/// Addresses without a scripted reply are held open until [`Self::release`]
/// answers them, which lets tests force timeouts and observe in-flight
/// commands.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedTransport {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    replies: HashMap<u16, Response>,
    sent: Vec<Request>,
    held: Vec<(Request, oneshot::Sender<Response>)>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply_word(&self, address: u16, word: u16) {
        self.reply(address, Ok(word.to_be_bytes().to_vec()));
    }

    pub fn fail(&self, address: u16, error: TransportError) {
        self.reply(address, Err(error));
    }

    pub fn reply(&self, address: u16, response: Response) {
        self.inner.lock().unwrap().replies.insert(address, response);
    }

    /// Removes the scripted reply so the next request to `address` is held.
    pub fn hold(&self, address: u16) {
        self.inner.lock().unwrap().replies.remove(&address);
    }

    pub fn sent(&self) -> Vec<Request> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Number of requests sent but not answered yet.
    pub fn open(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .held
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .count()
    }

    /// Answers the oldest held request still awaited. Returns the request
    /// answered.
    pub fn release(&self, response: Response) -> Option<Request> {
        let mut inner = self.inner.lock().unwrap();
        inner.held.retain(|(_, sender)| !sender.is_closed());
        if inner.held.is_empty() {
            return None;
        }
        let (request, sender) = inner.held.remove(0);
        let _ = sender.send(response);
        Some(request)
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: Request) -> PendingResponse {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.sent.push(request);
        match inner.replies.get(&request.address).cloned() {
            Some(response) => {
                let _ = sender.send(response);
            }
            None => inner.held.push((request, sender)),
        }
        receiver
    }
}

/// Small map with seven fast registers, one alarm and a writable setpoint
/// and mode request.
pub(crate) fn small_map() -> RegisterMap {
    use RegisterClass::{Holding, Input};
    let fast = |name: &str, address, class, encoding, field| {
        RegisterDescriptor::new(name, address, class, encoding, field, Cadence::Fast)
    };
    RegisterMap::new(
        vec![
            fast("room", 2001, Holding, Encoding::SignedTenths, Field::RoomTemperature),
            fast("setpoint", 2000, Holding, Encoding::SignedTenths, Field::Setpoint),
            fast("outdoor", 12101, Holding, Encoding::SignedTenths, Field::OutdoorAirTemperature),
            fast("supply", 12102, Holding, Encoding::SignedTenths, Field::SupplyAirTemperature),
            fast("heat demand", 2148, Input, Encoding::RawU16, Field::HeatDemand),
            fast("supply flow", 14000, Input, Encoding::RawU16, Field::SupplyAirFlow),
            fast(
                "fan mode",
                1160,
                Input,
                Encoding::Enum8(EnumTable::STATUS),
                Field::FanMode,
            ),
            RegisterDescriptor::new(
                "fan mode request",
                1161,
                Holding,
                Encoding::Enum8(EnumTable::REQUEST),
                Field::FanModeRequest,
                Cadence::Never,
            ),
            RegisterDescriptor::new(
                "alarm_fire",
                15536,
                Input,
                Encoding::AlarmTriState,
                Field::Alarm,
                Cadence::Slow,
            ),
        ],
        3.0,
    )
    .unwrap()
}
