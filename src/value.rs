use crate::registers::{Kind, RegisterEntry};

/// NTC5K thermistor readings in °C, indexed by the raw register byte.
///
/// Several indices share a value; the tail saturates at 100 °C.
pub static NTC5K_TEMPERATURES: [i8; 256] = [
    -74, -70, -66, -62, -59, -56, -54, -52, -50, -48, -47, -46, -44, -43, -42, -41, //
    -40, -39, -38, -37, -36, -35, -34, -33, -33, -32, -31, -30, -30, -29, -28, -28, //
    -27, -27, -26, -25, -25, -24, -24, -23, -23, -22, -22, -21, -21, -20, -20, -19, //
    -19, -19, -18, -18, -17, -17, -16, -16, -16, -15, -15, -14, -14, -14, -13, -13, //
    -12, -12, -12, -11, -11, -11, -10, -10, -9, -9, -9, -8, -8, -8, -7, -7, //
    -7, -6, -6, -6, -5, -5, -5, -4, -4, -4, -3, -3, -3, -2, -2, -2, //
    -1, -1, -1, -1, 0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3, //
    4, 4, 4, 5, 5, 5, 5, 6, 6, 6, 7, 7, 7, 8, 8, 8, //
    9, 9, 9, 10, 10, 10, 11, 11, 11, 12, 12, 12, 13, 13, 13, 14, //
    14, 14, 15, 15, 15, 16, 16, 16, 17, 17, 18, 18, 18, 19, 19, 19, //
    20, 20, 21, 21, 21, 22, 22, 22, 23, 23, 24, 24, 24, 25, 25, 26, //
    26, 27, 27, 27, 28, 28, 29, 29, 30, 30, 31, 31, 32, 32, 33, 33, //
    34, 34, 35, 35, 36, 36, 37, 37, 38, 38, 39, 40, 40, 41, 41, 42, //
    43, 43, 44, 45, 45, 46, 47, 48, 48, 49, 50, 51, 52, 53, 53, 54, //
    55, 56, 57, 59, 60, 61, 62, 63, 65, 66, 68, 69, 71, 73, 75, 77, //
    79, 81, 82, 86, 90, 93, 97, 100, 100, 100, 100, 100, 100, 100, 100, 100, //
];

/// `(raw code, fan speed level)`.
pub static FAN_SPEEDS: [(u8, u8); 8] =
    [(1, 1), (3, 2), (7, 3), (15, 4), (31, 5), (63, 6), (127, 7), (255, 8)];

const SCALED_DECIMAL_FACTOR: i32 = 3;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("raw byte {0} has no entry in the temperature table")]
    TemperatureIndex(u8),
    #[error("raw byte {0:#04x} is not a known fan speed code")]
    UnknownFanSpeedCode(u8),
    #[error("{value} cannot be represented as a {kind} register value")]
    NotRepresentable { value: Value, kind: Kind },
    #[error("{value} is outside of the allowed range {minimum}..={maximum}")]
    OutOfRange { value: Value, minimum: i32, maximum: i32 },
    #[error("cannot write a bit without a prior read of register {0:#04x}")]
    BitWithoutPriorRead(u8),
    #[error("could not parse {text:?} as a {kind} value")]
    Parse { text: String, kind: Kind },
}

/// A decoded register value, in domain units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    Celsius(i16),
    FanSpeed(u8),
    Flag(bool),
    Number(i32),
}

impl Value {
    pub fn parse(kind: Kind, text: &str) -> Result<Value, Error> {
        let text = text.trim();
        let error = || Error::Parse { text: text.to_string(), kind };
        match kind {
            Kind::Temperature => text.parse().map(Value::Celsius).map_err(|_| error()),
            Kind::FanSpeed => text.parse().map(Value::FanSpeed).map_err(|_| error()),
            Kind::Bit(_) => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Ok(Value::Flag(true)),
                "0" | "false" | "off" => Ok(Value::Flag(false)),
                _ => Err(error()),
            },
            Kind::Decimal | Kind::ScaledDecimal => {
                text.parse().map(Value::Number).map_err(|_| error())
            }
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match *self {
            Value::Flag(flag) => Some(flag),
            Value::Number(0) => Some(false),
            Value::Number(1) => Some(true),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> i32 {
        match *self {
            Value::Celsius(v) => v.into(),
            Value::FanSpeed(v) => v.into(),
            Value::Flag(v) => v.into(),
            Value::Number(v) => v,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Celsius(v) => write!(f, "{v}"),
            Value::FanSpeed(v) => write!(f, "{v}"),
            Value::Flag(v) => f.write_str(if *v { "on" } else { "off" }),
            Value::Number(v) => write!(f, "{v}"),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::Celsius(v) => serializer.serialize_i16(v),
            Value::FanSpeed(v) => serializer.serialize_u8(v),
            Value::Flag(v) => serializer.serialize_bool(v),
            Value::Number(v) => serializer.serialize_i32(v),
        }
    }
}

pub fn decode(entry: &RegisterEntry, raw: u8) -> Result<Value, Error> {
    Ok(match entry.kind {
        Kind::Temperature => {
            let celsius = NTC5K_TEMPERATURES
                .get(usize::from(raw))
                .ok_or(Error::TemperatureIndex(raw))?;
            Value::Celsius((*celsius).into())
        }
        Kind::FanSpeed => FAN_SPEEDS
            .iter()
            .find(|(code, _)| *code == raw)
            .map(|&(_, level)| Value::FanSpeed(level))
            .ok_or(Error::UnknownFanSpeedCode(raw))?,
        Kind::Bit(offset) => Value::Flag((raw >> offset) & 1 == 1),
        Kind::Decimal => Value::Number(raw.into()),
        Kind::ScaledDecimal => Value::Number(i32::from(raw) / SCALED_DECIMAL_FACTOR),
    })
}

/// Produce the raw byte to write for `value`.
///
/// Bit flags share their byte with other variables, so `current` must carry the last byte read
/// from the register. Only the flag's own bit is changed.
pub fn encode(entry: &RegisterEntry, value: Value, current: Option<u8>) -> Result<u8, Error> {
    let not_representable = || Error::NotRepresentable { value, kind: entry.kind };
    if let Kind::Bit(offset) = entry.kind {
        let flag = value.as_flag().ok_or_else(not_representable)?;
        let current = current.ok_or(Error::BitWithoutPriorRead(entry.address))?;
        let mask = 1u8 << offset;
        return Ok(if flag { current | mask } else { current & !mask });
    }

    let number = match (entry.kind, value) {
        (_, Value::Flag(_)) => return Err(not_representable()),
        (Kind::Temperature, Value::FanSpeed(_)) => return Err(not_representable()),
        (Kind::FanSpeed, Value::Celsius(_)) => return Err(not_representable()),
        (Kind::Decimal | Kind::ScaledDecimal, Value::Celsius(_) | Value::FanSpeed(_)) => {
            return Err(not_representable());
        }
        _ => value.as_integer(),
    };
    check_limits(entry, value, number)?;

    match entry.kind {
        Kind::Temperature => NTC5K_TEMPERATURES
            .iter()
            .position(|&celsius| i32::from(celsius) == number)
            .and_then(|index| u8::try_from(index).ok())
            .ok_or_else(not_representable),
        Kind::FanSpeed => FAN_SPEEDS
            .iter()
            .find(|&&(_, level)| i32::from(level) == number)
            .map(|&(code, _)| code)
            .ok_or_else(not_representable),
        Kind::Decimal => u8::try_from(number).map_err(|_| not_representable()),
        Kind::ScaledDecimal => number
            .checked_mul(SCALED_DECIMAL_FACTOR)
            .and_then(|raw| u8::try_from(raw).ok())
            .ok_or_else(not_representable),
        Kind::Bit(_) => Err(not_representable()),
    }
}

fn check_limits(entry: &RegisterEntry, value: Value, number: i32) -> Result<(), Error> {
    let minimum = entry.minimum.map_or(i32::MIN, i32::from);
    let maximum = entry.maximum.map_or(i32::MAX, i32::from);
    if (minimum..=maximum).contains(&number) {
        Ok(())
    } else {
        Err(Error::OutOfRange { value, minimum, maximum })
    }
}

/// Human readable description of the `fault_number` register.
pub fn fault_text(code: u8) -> &'static str {
    match code {
        5 => "Supply air sensor fault",
        6 => "CO2 Alarm",
        7 => "Outdoor air sensor fault",
        8 => "Exhaust air sensor fault",
        9 => "Water coil frost warning",
        10 => "Extract air sensor fault",
        _ => "-",
    }
}
