//! Register encodings of the SAVE VTR unit and the codec between raw register
//! payloads and typed values.
//!
//! Every monitored register is a single 16-bit word transferred big-endian.
//! How the word is interpreted depends on its [`Encoding`]:
//!
//! | Encoding                  | Raw word            | Value                          |
//! |---------------------------|---------------------|--------------------------------|
//! | [`Encoding::RawU16`]      | `0..=65535`         | [`Value::Raw`], no scaling     |
//! | [`Encoding::SignedTenths`]| two's complement    | [`Value::Tenths`], `raw / 10`  |
//! | [`Encoding::Enum8`]       | `base + index`      | [`Value::FanMode`]             |
//! | [`Encoding::Bitflag`]     | `0` or non-zero     | [`Value::Flag`]                |
//! | [`Encoding::AlarmTriState`]| `0..=3`            | [`Value::Alarm`]               |
use std::fmt;

/// The errors produced while decoding or encoding a register word.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The payload holds fewer bytes than one register word.
    #[error("Register payload too short: got {0} bytes, expected 2")]
    PayloadTooShort(usize),

    /// The value cannot be represented as signed tenths.
    #[error("Value {0} is outside the signed tenths range -3276.8..=3276.7")]
    TenthsOutOfRange(f32),

    /// The value does not belong to the encoding it should be written with.
    #[error("Value {value} cannot be encoded as {encoding}")]
    Mismatch { encoding: Encoding, value: Value },

    /// The table base leaves no 16-bit code for the mode.
    #[error("Fan mode {mode} has no code in a table based at {base}")]
    CodeOutOfRange { mode: FanMode, base: u16 },
}

/// The kind of a register, which decides the Modbus function used to access it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RegisterClass {
    /// Read-only input register.
    Input,
    /// Read/write holding register.
    Holding,
}

impl RegisterClass {
    /// Returns `true` if the device accepts writes to registers of this class.
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Holding)
    }
}

impl fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Holding => write!(f, "holding"),
        }
    }
}

/// Operating mode of the ventilation unit.
///
/// The discriminant is the position of the mode in the device's mode table.
/// The numeric code on the wire is this position plus the [`EnumTable`]
/// base of the register, which differs between the status and the request
/// register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum FanMode {
    #[default]
    Auto = 0,
    Manual = 1,
    Crowded = 2,
    Refresh = 3,
    Fireplace = 4,
    Away = 5,
    Holiday = 6,
    /// Reported while the cooker hood input is active. Cannot be requested.
    CookerHood = 7,
}

impl FanMode {
    /// All modes in table order.
    pub const ALL: [FanMode; 8] = [
        FanMode::Auto,
        FanMode::Manual,
        FanMode::Crowded,
        FanMode::Refresh,
        FanMode::Fireplace,
        FanMode::Away,
        FanMode::Holiday,
        FanMode::CookerHood,
    ];

    /// Returns `false` for modes the device reports but refuses to be set to.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::CookerHood)
    }

    /// Upper-case name, as accepted by [`str::parse`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Manual => "MANUAL",
            Self::Crowded => "CROWDED",
            Self::Refresh => "REFRESH",
            Self::Fireplace => "FIREPLACE",
            Self::Away => "AWAY",
            Self::Holiday => "HOLIDAY",
            Self::CookerHood => "COOKERHOOD",
        }
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown fan mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown fan mode '{0}'")]
pub struct UnknownFanMode(pub String);

impl std::str::FromStr for FanMode {
    type Err = UnknownFanMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_uppercase();
        FanMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| UnknownFanMode(s.to_string()))
    }
}

/// Mapping between [`FanMode`] and the numeric code of one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EnumTable {
    /// Code of [`FanMode::Auto`]; every following mode is one higher.
    pub base: u16,
}

impl EnumTable {
    /// Table of the mode status register (`0` = Auto).
    pub const STATUS: EnumTable = EnumTable { base: 0 };
    /// Table of the mode request register (`1` = Auto, `0` = no request).
    pub const REQUEST: EnumTable = EnumTable { base: 1 };
    /// Largest base that still leaves a code for every mode.
    pub const MAX_BASE: u16 = u16::MAX - (FanMode::ALL.len() as u16 - 1);

    /// Returns `true` if every mode has a code in this table.
    pub fn is_valid(&self) -> bool {
        self.base <= Self::MAX_BASE
    }

    /// Looks up a raw code. Codes outside the table decode to the default
    /// mode because the device reports transitional codes while switching.
    pub fn lookup(&self, raw: u16) -> FanMode {
        raw.checked_sub(self.base)
            .and_then(|index| FanMode::ALL.get(index as usize))
            .copied()
            .unwrap_or_default()
    }

    /// Returns `true` if `raw` is a code of this table.
    pub fn contains(&self, raw: u16) -> bool {
        raw.checked_sub(self.base)
            .is_some_and(|index| (index as usize) < FanMode::ALL.len())
    }

    /// Wire code of `mode`, or `None` if the base leaves no room for it.
    pub fn code(&self, mode: FanMode) -> Option<u16> {
        self.base.checked_add(mode as u16)
    }
}

/// Lifecycle state reported by a tri-state alarm register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmState {
    Inactive,
    Active,
    Waiting,
    ClearedErrorActive,
    /// A code outside `0..=3`, kept as received.
    Unknown(u16),
}

impl AlarmState {
    /// Maps a raw word, keeping codes outside `0..=3` as [`AlarmState::Unknown`].
    pub fn from_code(raw: u16) -> Self {
        match raw {
            0 => Self::Inactive,
            1 => Self::Active,
            2 => Self::Waiting,
            3 => Self::ClearedErrorActive,
            other => Self::Unknown(other),
        }
    }

    /// The raw word of this state.
    pub fn code(&self) -> u16 {
        match *self {
            Self::Inactive => 0,
            Self::Active => 1,
            Self::Waiting => 2,
            Self::ClearedErrorActive => 3,
            Self::Unknown(raw) => raw,
        }
    }

    /// Returns `true` while the alarm needs attention.
    pub fn is_raised(&self) -> bool {
        matches!(self, Self::Active | Self::ClearedErrorActive)
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "Inactive"),
            Self::Active => write!(f, "Active"),
            Self::Waiting => write!(f, "Waiting"),
            Self::ClearedErrorActive => write!(f, "Cleared error active"),
            Self::Unknown(raw) => write!(f, "Unknown ({raw})"),
        }
    }
}

/// Interpretation rule of a register word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Encoding {
    RawU16,
    SignedTenths,
    Enum8(EnumTable),
    Bitflag,
    AlarmTriState,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RawU16 => write!(f, "raw u16"),
            Self::SignedTenths => write!(f, "signed tenths"),
            Self::Enum8(table) => write!(f, "enum (base {})", table.base),
            Self::Bitflag => write!(f, "bitflag"),
            Self::AlarmTriState => write!(f, "alarm state"),
        }
    }
}

/// A decoded register value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Unscaled word of a [`Encoding::RawU16`] register.
    Raw(u16),
    /// Physical value of a [`Encoding::SignedTenths`] register, e.g. °C.
    Tenths(f32),
    FanMode(FanMode),
    Flag(bool),
    Alarm(AlarmState),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Value::Raw(raw) => Some(raw as f32),
            Value::Tenths(value) => Some(value),
            Value::Flag(flag) => Some(if flag { 1.0 } else { 0.0 }),
            Value::FanMode(_) | Value::Alarm(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Raw(raw) => write!(f, "{raw}"),
            Value::Tenths(value) => write!(f, "{value:.1}"),
            Value::FanMode(mode) => write!(f, "{mode}"),
            Value::Flag(flag) => write!(f, "{flag}"),
            Value::Alarm(state) => write!(f, "{state}"),
        }
    }
}

pub const TENTHS_MIN: f32 = -3276.8;
pub const TENTHS_MAX: f32 = 3276.7;

/// Decodes a two's complement word in tenths, e.g. `0xFFF6` to `-1.0`.
pub fn tenths_decode(raw: u16) -> f32 {
    raw as i16 as f32 / 10.0
}

/// Encodes a value as signed tenths, rounding to the nearest tenth.
pub fn tenths_encode(value: f32) -> Result<u16, Error> {
    if !(TENTHS_MIN..=TENTHS_MAX).contains(&value) {
        return Err(Error::TenthsOutOfRange(value));
    }
    Ok((value * 10.0).round() as i16 as u16)
}

/// Extracts the register word from a big-endian payload.
pub fn word(payload: &[u8]) -> Result<u16, Error> {
    match payload {
        [high, low, ..] => Ok(u16::from_be_bytes([*high, *low])),
        _ => Err(Error::PayloadTooShort(payload.len())),
    }
}

/// Decodes a register payload with the given encoding.
///
/// Only a payload shorter than one word fails; unknown codes of enumerated
/// encodings are mapped as documented on [`EnumTable::lookup`] and
/// [`AlarmState::Unknown`].
pub fn decode(encoding: Encoding, payload: &[u8]) -> Result<Value, Error> {
    let raw = word(payload)?;
    Ok(match encoding {
        Encoding::RawU16 => Value::Raw(raw),
        Encoding::SignedTenths => Value::Tenths(tenths_decode(raw)),
        Encoding::Enum8(table) => Value::FanMode(table.lookup(raw)),
        Encoding::Bitflag => Value::Flag(raw != 0),
        Encoding::AlarmTriState => Value::Alarm(AlarmState::from_code(raw)),
    })
}

/// Encodes a value into the register word for the given encoding.
pub fn encode(encoding: Encoding, value: &Value) -> Result<u16, Error> {
    match (encoding, *value) {
        (Encoding::RawU16, Value::Raw(raw)) => Ok(raw),
        (Encoding::SignedTenths, Value::Tenths(value)) => tenths_encode(value),
        (Encoding::Enum8(table), Value::FanMode(mode)) => {
            table.code(mode).ok_or(Error::CodeOutOfRange {
                mode,
                base: table.base,
            })
        }
        (Encoding::Bitflag, Value::Flag(flag)) => Ok(flag as u16),
        (Encoding::AlarmTriState, Value::Alarm(state)) => Ok(state.code()),
        (encoding, value) => Err(Error::Mismatch { encoding, value }),
    }
}
