//! The register catalogue of one device model.
//!
//! A [`RegisterMap`] is configuration data: the list of registers the engine
//! polls or writes, each tagged with the [`Field`] of the device state it
//! feeds and the [`Cadence`] it is polled at. Maps of different firmware
//! revisions differ only in addresses and enum bases, so a deployment picks
//! a map instead of a code path. [`RegisterMap::save_vtr`] is the built-in
//! map; any other map can be loaded from YAML with the `serde` feature.
use crate::protocol::{Encoding, EnumTable, RegisterClass};
use std::fmt;

/// Nominal supply/extract flow in m³/h per percent of fan output.
pub const DEFAULT_AIRFLOW_FACTOR: f32 = 3.0;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Register {address} is declared with conflicting encodings")]
    ConflictingEncoding { address: u16 },

    #[error("Register {address} has enum base {base}, the largest usable base is {max}", max = EnumTable::MAX_BASE)]
    InvalidEnumTable { address: u16, base: u16 },

    #[error("Field {0} is mapped to more than one register")]
    DuplicateField(Field),

    #[error("Field {0} is not mapped to any register")]
    Unmapped(Field),

    #[error("Register {name} ({address}) is not writable")]
    NotWritable { name: String, address: u16 },

    #[error("Cannot read register map: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "serde")]
    #[error("Invalid register map: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The device state field a register feeds.
///
/// Alarm, flag and counter registers may appear many times; every other field
/// is mapped at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Field {
    RoomTemperature,
    Setpoint,
    OutdoorAirTemperature,
    SupplyAirTemperature,
    ExtractAirTemperature,
    HeatDemand,
    SupplyAirFlow,
    ExtractAirFlow,
    FanMode,
    FanModeRequest,
    Alarm,
    AlarmFlag,
    Counter,
}

impl Field {
    /// Returns `true` for fields that may be mapped to a single register only.
    pub fn is_unique(&self) -> bool {
        !matches!(self, Self::Alarm | Self::AlarmFlag | Self::Counter)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RoomTemperature => "room_temperature",
            Self::Setpoint => "setpoint",
            Self::OutdoorAirTemperature => "outdoor_air_temperature",
            Self::SupplyAirTemperature => "supply_air_temperature",
            Self::ExtractAirTemperature => "extract_air_temperature",
            Self::HeatDemand => "heat_demand",
            Self::SupplyAirFlow => "supply_air_flow",
            Self::ExtractAirFlow => "extract_air_flow",
            Self::FanMode => "fan_mode",
            Self::FanModeRequest => "fan_mode_request",
            Self::Alarm => "alarm",
            Self::AlarmFlag => "alarm_flag",
            Self::Counter => "counter",
        };
        f.write_str(name)
    }
}

/// How often a register is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Cadence {
    /// Read on every update tick.
    Fast,
    /// Read on the coarse alarm scan.
    Slow,
    /// Never read; write-only registers.
    #[default]
    Never,
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Slow => write!(f, "slow"),
            Self::Never => write!(f, "never"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegisterDescriptor {
    /// Name used in logs, alarm tables and MQTT topics.
    pub name: String,
    /// Zero-based protocol address.
    pub address: u16,
    pub class: RegisterClass,
    pub encoding: Encoding,
    /// The device state field this register feeds.
    pub field: Field,
    #[cfg_attr(feature = "serde", serde(default))]
    pub cadence: Cadence,
}

impl RegisterDescriptor {
    /// Describes one register. Validation happens in [`RegisterMap::new`].
    pub fn new(
        name: impl Into<String>,
        address: u16,
        class: RegisterClass,
        encoding: Encoding,
        field: Field,
        cadence: Cadence,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            class,
            encoding,
            field,
            cadence,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.class.is_writable()
    }
}

/// Validated register catalogue. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RegisterMapConfig"))]
pub struct RegisterMap {
    registers: Vec<RegisterDescriptor>,
    airflow_factor: f32,
}

impl RegisterMap {
    /// Builds a map, rejecting registers that share an address with a
    /// different class or encoding, unique fields mapped twice and enum
    /// tables without a code for every mode.
    pub fn new(registers: Vec<RegisterDescriptor>, airflow_factor: f32) -> Result<Self, Error> {
        for (index, register) in registers.iter().enumerate() {
            if let Encoding::Enum8(table) = register.encoding {
                if !table.is_valid() {
                    return Err(Error::InvalidEnumTable {
                        address: register.address,
                        base: table.base,
                    });
                }
            }
            for other in &registers[index + 1..] {
                if other.address == register.address
                    && (other.class != register.class || other.encoding != register.encoding)
                {
                    return Err(Error::ConflictingEncoding {
                        address: register.address,
                    });
                }
                if register.field.is_unique() && other.field == register.field {
                    return Err(Error::DuplicateField(register.field));
                }
            }
        }
        Ok(Self {
            registers,
            airflow_factor,
        })
    }

    /// All registers in map order.
    pub fn registers(&self) -> &[RegisterDescriptor] {
        &self.registers
    }

    /// Registers read at the given cadence, in map order.
    pub fn polled(&self, cadence: Cadence) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers
            .iter()
            .filter(move |register| register.cadence == cadence)
    }

    /// Registers feeding the given field, in map order.
    pub fn feeding(&self, field: Field) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers
            .iter()
            .filter(move |register| register.field == field)
    }

    /// The first register feeding `field`.
    pub fn find(&self, field: Field) -> Option<&RegisterDescriptor> {
        self.feeding(field).next()
    }

    /// The register at `address`. Shared addresses return the first entry.
    pub fn by_address(&self, address: u16) -> Option<&RegisterDescriptor> {
        self.registers
            .iter()
            .find(|register| register.address == address)
    }

    /// Returns the register to write for `field`, if it exists and accepts writes.
    pub fn writable(&self, field: Field) -> Result<&RegisterDescriptor, Error> {
        let register = self.find(field).ok_or(Error::Unmapped(field))?;
        if register.is_writable() {
            Ok(register)
        } else {
            Err(Error::NotWritable {
                name: register.name.clone(),
                address: register.address,
            })
        }
    }

    /// Air flow volume in m³/h per percent of fan output.
    pub fn airflow_factor(&self) -> f32 {
        self.airflow_factor
    }

    /// The register map of the SAVE VTR units this crate was built against.
    ///
    /// Addresses are zero-based protocol addresses, i.e. one less than the
    /// register numbers of the vendor's register list. Firmware revisions are
    /// known to move the setpoint and to shift the mode request codes, so
    /// verify them against the documentation of the installed unit and load a
    /// custom map where they differ.
    pub fn save_vtr() -> Self {
        use Cadence::{Fast, Never, Slow};
        use RegisterClass::{Holding, Input};

        let fast = |name, address, class, encoding, field| {
            RegisterDescriptor::new(name, address, class, encoding, field, Fast)
        };
        #[rustfmt::skip]
        let mut registers = vec![
            fast("room temperature", 2001, Holding, Encoding::SignedTenths, Field::RoomTemperature),
            fast("setpoint", 2000, Holding, Encoding::SignedTenths, Field::Setpoint),
            fast("outdoor air temperature", 12101, Holding, Encoding::SignedTenths, Field::OutdoorAirTemperature),
            fast("supply air temperature", 12102, Holding, Encoding::SignedTenths, Field::SupplyAirTemperature),
            fast("extract air temperature", 12543, Holding, Encoding::SignedTenths, Field::ExtractAirTemperature),
            fast("heat demand", 2148, Input, Encoding::RawU16, Field::HeatDemand),
            fast("supply air flow", 14000, Input, Encoding::RawU16, Field::SupplyAirFlow),
            fast("extract air flow", 14001, Input, Encoding::RawU16, Field::ExtractAirFlow),
            fast("fan mode", 1160, Input, Encoding::Enum8(EnumTable::STATUS), Field::FanMode),
            RegisterDescriptor::new(
                "fan mode request",
                1161,
                Holding,
                Encoding::Enum8(EnumTable::REQUEST),
                Field::FanModeRequest,
                Never,
            ),
        ];
        registers.extend(SAVE_VTR_ALARMS.iter().map(|(name, address)| {
            RegisterDescriptor::new(*name, *address, Input, Encoding::AlarmTriState, Field::Alarm, Slow)
        }));
        registers.extend(SAVE_VTR_ALARM_FLAGS.iter().map(|(name, address)| {
            RegisterDescriptor::new(*name, *address, Input, Encoding::Bitflag, Field::AlarmFlag, Slow)
        }));
        registers.extend(SAVE_VTR_COUNTERS.iter().map(|(name, address)| {
            RegisterDescriptor::new(*name, *address, Input, Encoding::RawU16, Field::Counter, Slow)
        }));

        Self {
            registers,
            airflow_factor: DEFAULT_AIRFLOW_FACTOR,
        }
    }
}

#[rustfmt::skip]
const SAVE_VTR_ALARMS: [(&str, u16); 32] = [
    ("alarm_saf_ctrl", 15001),
    ("alarm_eaf_ctrl", 15008),
    ("alarm_frost_prot", 15015),
    ("alarm_defrosting", 15022),
    ("alarm_saf_rpm", 15029),
    ("alarm_eaf_rpm", 15036),
    ("alarm_fpt", 15057),
    ("alarm_oat", 15064),
    ("alarm_sat", 15071),
    ("alarm_rat", 15078),
    ("alarm_eat", 15085),
    ("alarm_ect", 15092),
    ("alarm_eft", 15099),
    ("alarm_oht", 15106),
    ("alarm_emt", 15113),
    ("alarm_rgs", 15120),
    ("alarm_bys", 15127),
    ("alarm_secondary_air", 15134),
    ("alarm_filter", 15141),
    ("alarm_extra_controller", 15148),
    ("alarm_external_stop", 15155),
    ("alarm_rh", 15162),
    ("alarm_co2", 15169),
    ("alarm_low_sat", 15176),
    ("alarm_byf", 15183),
    ("alarm_manual_override_outputs", 15501),
    ("alarm_pdm_rhs", 15508),
    ("alarm_pdm_eat", 15515),
    ("alarm_manual_fan_stop", 15522),
    ("alarm_overheat_temperature", 15529),
    ("alarm_fire", 15536),
    ("alarm_filter_warning", 15543),
];

#[rustfmt::skip]
const SAVE_VTR_ALARM_FLAGS: [(&str, u16); 5] = [
    ("filter_alarm_was_detected", 7006),
    ("output_alarm", 14002),
    ("alarm_type_a", 15900),
    ("alarm_type_b", 15901),
    ("alarm_type_c", 15902),
];

const SAVE_VTR_COUNTERS: [(&str, u16); 1] = [("filter_warning_duration", 15548)];

#[cfg(feature = "serde")]
fn default_airflow_factor() -> f32 {
    DEFAULT_AIRFLOW_FACTOR
}

/// Unvalidated form of a [`RegisterMap`] as written in YAML.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisterMapConfig {
    #[serde(default = "default_airflow_factor")]
    pub airflow_factor: f32,
    pub registers: Vec<RegisterDescriptor>,
}

#[cfg(feature = "serde")]
impl TryFrom<RegisterMapConfig> for RegisterMap {
    type Error = Error;

    fn try_from(config: RegisterMapConfig) -> Result<Self, Self::Error> {
        RegisterMap::new(config.registers, config.airflow_factor)
    }
}

#[cfg(feature = "serde")]
impl RegisterMap {
    /// Parses and validates a map from YAML.
    ///
    /// ```yaml
    /// airflow_factor: 3.0
    /// registers:
    ///   - name: setpoint
    ///     address: 2000
    ///     class: holding
    ///     encoding: { kind: signed_tenths }
    ///     field: setpoint
    ///     cadence: fast
    ///   - name: fan mode request
    ///     address: 1161
    ///     class: holding
    ///     encoding: { kind: enum8, base: 1 }
    ///     field: fan_mode_request
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        let config: RegisterMapConfig = serde_yaml::from_str(yaml)?;
        config.try_into()
    }

    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let file = std::fs::File::open(path)?;
        let config: RegisterMapConfig = serde_yaml::from_reader(file)?;
        config.try_into()
    }
}
