//! The aggregated view of the device.
//!
//! Every field holds the last value a read confirmed, or `None` until the
//! first successful read. A failed read never clears a field.
use crate::protocol::{tenths_decode, AlarmState, FanMode, Value};
use crate::register_map::{Field, RegisterDescriptor, RegisterMap};
use log::*;
use std::fmt;

/// Fan output as reported by the device and the derived volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirFlow {
    /// Fan output in percent.
    pub percent: f32,
    /// Air volume in m³/h.
    pub volume: f32,
}

impl AirFlow {
    pub fn from_percent(percent: f32, factor: f32) -> Self {
        Self {
            percent,
            volume: percent * factor,
        }
    }
}

impl fmt::Display for AirFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0} % ({:.0} m³/h)", self.percent, self.volume)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEntry {
    pub name: String,
    pub address: u16,
    pub state: Option<AlarmState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlagEntry {
    pub name: String,
    pub address: u16,
    pub value: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CounterEntry {
    pub name: String,
    pub address: u16,
    pub value: Option<u16>,
}

/// Snapshot of the device as seen by the last completed reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub room_temperature: Option<f32>,
    pub setpoint: Option<f32>,
    pub outdoor_air_temperature: Option<f32>,
    pub supply_air_temperature: Option<f32>,
    pub extract_air_temperature: Option<f32>,
    /// Heater output in percent.
    pub heat_demand: Option<f32>,
    pub supply_air_flow: Option<AirFlow>,
    pub extract_air_flow: Option<AirFlow>,
    pub fan_mode: Option<FanMode>,
    /// Tri-state alarms in register map order.
    pub alarms: Vec<AlarmEntry>,
    pub flags: Vec<FlagEntry>,
    pub counters: Vec<CounterEntry>,
    /// Number of published poll cycles.
    pub cycle: u64,
}

impl DeviceState {
    /// Creates an empty state with one table row per alarm, flag and counter
    /// register of `map`.
    pub fn new(map: &RegisterMap) -> Self {
        Self {
            alarms: map
                .feeding(Field::Alarm)
                .map(|register| AlarmEntry {
                    name: register.name.clone(),
                    address: register.address,
                    state: None,
                })
                .collect(),
            flags: map
                .feeding(Field::AlarmFlag)
                .map(|register| FlagEntry {
                    name: register.name.clone(),
                    address: register.address,
                    value: None,
                })
                .collect(),
            counters: map
                .feeding(Field::Counter)
                .map(|register| CounterEntry {
                    name: register.name.clone(),
                    address: register.address,
                    value: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn alarm(&self, name: &str) -> Option<&AlarmEntry> {
        self.alarms.iter().find(|alarm| alarm.name == name)
    }

    /// Alarms currently active or cleared with the error still present.
    pub fn raised_alarms(&self) -> impl Iterator<Item = &AlarmEntry> {
        self.alarms
            .iter()
            .filter(|alarm| alarm.state.is_some_and(|state| state.is_raised()))
    }

    pub fn flag(&self, name: &str) -> Option<&FlagEntry> {
        self.flags.iter().find(|flag| flag.name == name)
    }

    pub fn counter(&self, name: &str) -> Option<&CounterEntry> {
        self.counters.iter().find(|counter| counter.name == name)
    }

    /// Stores the setpoint a write is about to set, rounded the way the
    /// device stores it.
    pub(crate) fn assume_setpoint(&mut self, raw: u16) {
        self.setpoint = Some(tenths_decode(raw));
    }

    /// Stores a decoded value. Returns `false` if the value does not fit the
    /// field the register feeds.
    pub(crate) fn apply(
        &mut self,
        register: &RegisterDescriptor,
        value: Value,
        airflow_factor: f32,
    ) -> bool {
        let applied = match (register.field, value) {
            (Field::FanMode, Value::FanMode(mode)) => {
                self.fan_mode = Some(mode);
                true
            }
            (Field::Alarm, Value::Alarm(state)) => {
                let entry = row(&mut self.alarms, register, |name, address| AlarmEntry {
                    name,
                    address,
                    state: None,
                });
                entry.state = Some(state);
                true
            }
            (Field::AlarmFlag, Value::Flag(flag)) => {
                let entry = row(&mut self.flags, register, |name, address| FlagEntry {
                    name,
                    address,
                    value: None,
                });
                entry.value = Some(flag);
                true
            }
            (Field::Counter, Value::Raw(raw)) => {
                let entry = row(&mut self.counters, register, |name, address| CounterEntry {
                    name,
                    address,
                    value: None,
                });
                entry.value = Some(raw);
                true
            }
            (Field::SupplyAirFlow | Field::ExtractAirFlow, value) => match value.as_f32() {
                Some(percent) => {
                    let flow = Some(AirFlow::from_percent(percent, airflow_factor));
                    if register.field == Field::SupplyAirFlow {
                        self.supply_air_flow = flow;
                    } else {
                        self.extract_air_flow = flow;
                    }
                    true
                }
                None => false,
            },
            (field, value) => match (self.scalar(field), value.as_f32()) {
                (Some(slot), Some(number)) => {
                    *slot = Some(number);
                    true
                }
                _ => false,
            },
        };
        if applied {
            debug!("{} ({}) = {value}", register.name, register.address);
        } else {
            warn!(
                "Ignoring {value} from {} ({}): does not fit {}",
                register.name, register.address, register.field
            );
        }
        applied
    }

    fn scalar(&mut self, field: Field) -> Option<&mut Option<f32>> {
        match field {
            Field::RoomTemperature => Some(&mut self.room_temperature),
            Field::Setpoint => Some(&mut self.setpoint),
            Field::OutdoorAirTemperature => Some(&mut self.outdoor_air_temperature),
            Field::SupplyAirTemperature => Some(&mut self.supply_air_temperature),
            Field::ExtractAirTemperature => Some(&mut self.extract_air_temperature),
            Field::HeatDemand => Some(&mut self.heat_demand),
            _ => None,
        }
    }
}

trait Row {
    fn address(&self) -> u16;
}

impl Row for AlarmEntry {
    fn address(&self) -> u16 {
        self.address
    }
}

impl Row for FlagEntry {
    fn address(&self) -> u16 {
        self.address
    }
}

impl Row for CounterEntry {
    fn address(&self) -> u16 {
        self.address
    }
}

/// Finds the table row of `register`, appending one if the table was built
/// from a different map.
fn row<'a, T: Row>(
    table: &'a mut Vec<T>,
    register: &RegisterDescriptor,
    create: impl FnOnce(String, u16) -> T,
) -> &'a mut T {
    let index = match table
        .iter()
        .position(|row| row.address() == register.address)
    {
        Some(index) => index,
        None => {
            table.push(create(register.name.clone(), register.address));
            table.len() - 1
        }
    };
    &mut table[index]
}

struct Maybe<'a, T>(&'a Option<T>);

impl<T: fmt::Display> fmt::Display for Maybe<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => fmt::Display::fmt(value, f),
            None => f.write_str("n/a"),
        }
    }
}

struct Celsius<'a>(&'a Option<f32>);

impl fmt::Display for Celsius<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value:.1} °C"),
            None => f.write_str("n/a"),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Room temperature:        {}", Celsius(&self.room_temperature))?;
        writeln!(f, "Setpoint:                {}", Celsius(&self.setpoint))?;
        writeln!(f, "Outdoor air temperature: {}", Celsius(&self.outdoor_air_temperature))?;
        writeln!(f, "Supply air temperature:  {}", Celsius(&self.supply_air_temperature))?;
        writeln!(f, "Extract air temperature: {}", Celsius(&self.extract_air_temperature))?;
        match self.heat_demand {
            Some(percent) => writeln!(f, "Heat demand:             {percent:.0} %")?,
            None => writeln!(f, "Heat demand:             n/a")?,
        }
        writeln!(f, "Supply air flow:         {}", Maybe(&self.supply_air_flow))?;
        writeln!(f, "Extract air flow:        {}", Maybe(&self.extract_air_flow))?;
        write!(f, "Fan mode:                {}", Maybe(&self.fan_mode))?;
        let raised: Vec<_> = self.raised_alarms().map(|alarm| alarm.name.as_str()).collect();
        if !raised.is_empty() {
            write!(f, "\nRaised alarms:           {}", raised.join(", "))?;
        }
        Ok(())
    }
}
