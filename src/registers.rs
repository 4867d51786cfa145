use std::borrow::Cow;

/// Register that must never be written.
///
/// Writing it from a remote control can leave the mainboard in a state that damages the unit.
pub const WRITE_PROTECTED_ADDRESS: u8 = 0x06;

/// How the raw register byte maps onto a domain value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// Index into the NTC5K thermistor table, in °C.
    Temperature,
    /// Bit pattern with one bit set per fan speed level.
    FanSpeed,
    /// A single flag, packed into the byte at the given bit offset.
    Bit(u8),
    Decimal,
    /// Decimal value stored as three raw units per domain unit.
    ScaledDecimal,
}

impl Kind {
    pub const fn bit_offset(&self) -> Option<u8> {
        match *self {
            Kind::Bit(offset) => Some(offset),
            _ => None,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Kind::Temperature => f.write_str("temperature"),
            Kind::FanSpeed => f.write_str("fanspeed"),
            Kind::Bit(offset) => f.write_fmt(format_args!("bit {offset}")),
            Kind::Decimal => f.write_str("decimal"),
            Kind::ScaledDecimal => f.write_str("decimal/3"),
        }
    }
}

impl serde::Serialize for Kind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Mode(u8);

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 & Self::R.0 == 0 { "-" } else { "R" })?;
        f.write_str(if self.0 & Self::W.0 == 0 { "-" } else { "W" })?;
        Ok(())
    }
}

impl Mode {
    pub const R: Self = Self(1 << 0);
    pub const W: Self = Self(1 << 1);
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    const R_: Self = Self::R;

    pub const fn is_readable(&self) -> bool {
        self.0 & Self::R.0 != 0
    }

    pub const fn is_writable(&self) -> bool {
        self.0 & Self::W.0 != 0
    }
}

/// A named variable on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterEntry {
    pub name: &'static str,
    pub address: u8,
    pub kind: Kind,
    pub mode: Mode,
    /// Smallest value accepted for writes, in domain units.
    pub minimum: Option<i16>,
    /// Largest value accepted for writes, in domain units.
    pub maximum: Option<i16>,
    pub description: &'static str,
}

macro_rules! for_each_register {
    ($m:ident) => {
        $m! {
            "fanspeed": 0x29, FanSpeed, RW, min = 1, max = 8,
                "Current fan speed level";
            "initial_fanspeed": 0xA9, FanSpeed, RW, min = 1, max = 8,
                "Fan speed level after switching on";
            "max_fanspeed": 0xA5, FanSpeed, RW, min = 1, max = 8,
                "Maximum settable fan speed level";
            "temperature_outdoor_air": 0x32, Temperature, R_,
                "Outdoor air temperature (NTC5K sensor)";
            "temperature_supply_air": 0x35, Temperature, R_,
                "Supply air temperature (NTC5K sensor)";
            "temperature_extract_air": 0x34, Temperature, R_,
                "Extract air temperature (NTC5K sensor)";
            "temperature_exhaust_air": 0x33, Temperature, R_,
                "Exhaust air temperature (NTC5K sensor)";
            "powerstate": 0xA3, Bit(0), RW,
                "Remote LED 1: unit powered on. Remotes do not switch back on by themselves";
            "co2_indicator": 0xA3, Bit(1), RW,
                "Remote LED 2: CO2 warning";
            "rh_indicator": 0xA3, Bit(2), RW,
                "Remote LED 3: humidity warning";
            "winter_mode": 0xA3, Bit(3), RW,
                "Remote LED 4: 0=summer mode with bypass, 1=winter mode with heat recovery";
            "clean_filter": 0xA3, Bit(4), R_,
                "Remote icon 1: clean filter warning";
            "post_heating_on": 0xA3, Bit(5), R_,
                "Remote icon 2: pre-/post-heating active";
            "fault_detected": 0xA3, Bit(6), R_,
                "Remote icon 3: fault detected";
            "service_requested": 0xA3, Bit(7), R_,
                "Remote icon 4: service requested";
            "bypass_setpoint": 0xAF, Temperature, RW,
                "Summer mode: open the bypass above this outdoor temperature";
            "preheat_setpoint": 0xA7, Temperature, RW,
                "Activation temperature for pre-/post-heating";
            "preheat_status": 0x70, Bit(7), RW,
                "Pre-/post-heating enabled";
            "defrost_setpoint": 0xA8, Temperature, RW, min = -6, max = 15,
                "Frost protection: stop supply fan and heating below this temperature";
            "defrost_hysteresis": 0xB2, ScaledDecimal, RW,
                "Frost protection hysteresis in °C above the defrost setpoint";
            "boost_mode": 0xAA, Bit(5), RW,
                "Boost mode: 0=fireplace (no exhaust air for 15 minutes), 1=normal boost";
            "activate_boost": 0x71, Bit(5), RW,
                "Start a 45 minute boost. Reset by the mainboard";
            "boost_status": 0x71, Bit(6), R_,
                "Boost currently running";
            "boost_remaining": 0x79, Decimal, R_,
                "Remaining boost time in minutes";
            "input_fan_off": 0x08, Bit(3), RW,
                "Supply air fan stopped. Must be set twice";
            "output_fan_off": 0x08, Bit(5), RW,
                "Exhaust air fan stopped. Must be set twice";
            "input_fan_percent": 0xB0, Decimal, RW, min = 65, max = 100,
                "Supply fan calibration in percent";
            "output_fan_percent": 0xB1, Decimal, RW, min = 65, max = 100,
                "Exhaust fan calibration in percent";
            "service_interval": 0xA6, Decimal, RW,
                "Service reminder interval in months";
            "service_due_months": 0xAB, Decimal, RW,
                "Months until the next service reminder";
            "fault_number": 0x36, Decimal, R_,
                "Fault code. 0=no fault";
            "rh_sensor1_raw": 0x2F, Decimal, R_,
                "Humidity sensor 1. 0x33=0% RH, 0xFF=100% RH";
            "rh_sensor2_raw": 0x30, Decimal, R_,
                "Humidity sensor 2. 0x33=0% RH, 0xFF=100% RH";
        }
    };
}

macro_rules! optional {
    () => {
        None
    };
    ($($lit: tt)+) => {
        Some($($lit)*)
    };
}

macro_rules! make_table {
    ($($name: literal: $address: literal, $kind: ident $(($bit: literal))?, $mode: ident
       $(, min = $min: literal)? $(, max = $max: literal)?, $description: literal;)+) => {
        const TABLE: &[RegisterEntry] = &[$(RegisterEntry {
            name: $name,
            address: $address,
            kind: Kind::$kind $(($bit))?,
            mode: Mode::$mode,
            minimum: optional!($($min)?),
            maximum: optional!($($max)?),
            description: $description,
        }),*];
    };
}

for_each_register!(make_table);

pub static REGISTERS: &[RegisterEntry] = TABLE;

const _ASSERT_TABLE_IS_CONSISTENT: () = assert!(
    find_conflict(TABLE).is_none(),
    "register table contains duplicate names or overlapping bits"
);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CatalogError {
    #[error("variable `{0}` is defined more than once")]
    DuplicateName(&'static str),
    #[error("`{0}` and `{1}` occupy the same bit of one register")]
    OverlappingBits(&'static str, &'static str),
    #[error("`{0}` uses bit offset {1}, but registers only have 8 bits")]
    BitOffsetOutOfRange(&'static str, u8),
    #[error("`{0}` shares its register with bit flags, but is not itself a bit flag")]
    MixedRegister(&'static str),
}

#[derive(Clone, Copy)]
enum Conflict {
    DuplicateName(usize),
    OverlappingBits(usize, usize),
    BitOffsetOutOfRange(usize),
    MixedRegister(usize),
}

const fn str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut index = 0;
    while index < a.len() {
        if a[index] != b[index] {
            return false;
        }
        index += 1;
    }
    true
}

const fn find_conflict(entries: &[RegisterEntry]) -> Option<Conflict> {
    let mut i = 0;
    while i < entries.len() {
        if let Kind::Bit(offset) = entries[i].kind {
            if offset >= 8 {
                return Some(Conflict::BitOffsetOutOfRange(i));
            }
        }
        let mut j = i + 1;
        while j < entries.len() {
            if str_eq(entries[i].name, entries[j].name) {
                return Some(Conflict::DuplicateName(j));
            }
            if entries[i].address == entries[j].address {
                match (entries[i].kind, entries[j].kind) {
                    (Kind::Bit(a), Kind::Bit(b)) if a == b => {
                        return Some(Conflict::OverlappingBits(i, j));
                    }
                    (Kind::Bit(_), Kind::Bit(_)) => {}
                    (Kind::Bit(_), _) => return Some(Conflict::MixedRegister(j)),
                    (_, Kind::Bit(_)) => return Some(Conflict::MixedRegister(i)),
                    _ => {}
                }
            }
            j += 1;
        }
        i += 1;
    }
    None
}

/// The set of variables known to a [`DeviceClient`](crate::connection::DeviceClient).
#[derive(Clone, Debug)]
pub struct RegisterCatalog {
    entries: Cow<'static, [RegisterEntry]>,
}

impl Default for RegisterCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl RegisterCatalog {
    /// The register map of the Helios Pro / Vallox SE mainboards.
    pub fn standard() -> Self {
        Self { entries: Cow::Borrowed(REGISTERS) }
    }

    pub fn from_entries(entries: Vec<RegisterEntry>) -> Result<Self, CatalogError> {
        if let Some(conflict) = find_conflict(&entries) {
            return Err(match conflict {
                Conflict::DuplicateName(i) => CatalogError::DuplicateName(entries[i].name),
                Conflict::OverlappingBits(i, j) => {
                    CatalogError::OverlappingBits(entries[i].name, entries[j].name)
                }
                Conflict::BitOffsetOutOfRange(i) => CatalogError::BitOffsetOutOfRange(
                    entries[i].name,
                    entries[i].kind.bit_offset().unwrap_or_default(),
                ),
                Conflict::MixedRegister(i) => CatalogError::MixedRegister(entries[i].name),
            });
        }
        Ok(Self { entries: Cow::Owned(entries) })
    }

    pub fn entries(&self) -> &[RegisterEntry] {
        &self.entries
    }

    pub fn lookup(&self, name: &str) -> Option<&RegisterEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// All the variables multiplexed into the byte at `address`.
    pub fn entries_for_address(&self, address: u8) -> impl Iterator<Item = &RegisterEntry> {
        self.entries.iter().filter(move |e| e.address == address)
    }

    /// Unique register addresses, in the order they first appear in the table.
    pub fn addresses(&self) -> Vec<u8> {
        let mut seen = [false; 256];
        let mut result = Vec::new();
        for entry in self.entries.iter() {
            let slot = &mut seen[usize::from(entry.address)];
            if !*slot {
                *slot = true;
                result.push(entry.address);
            }
        }
        result
    }
}
