use std::collections::BTreeMap;

use crate::metrics::HeatRecovery;
use crate::value::{self, Value};

/// The result of reading every known variable once.
///
/// Variables whose register could not be read are absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValueSnapshot {
    values: BTreeMap<&'static str, Value>,
    heat_recovery: Option<HeatRecovery>,
}

/// A snapshot field as it is presented to the outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Value(Value),
    Text(&'static str),
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Value(v) => v.fmt(f),
            Field::Text(t) => f.write_str(t),
        }
    }
}

impl serde::Serialize for Field {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Value(v) => v.serialize(serializer),
            Field::Text(t) => serializer.serialize_str(t),
        }
    }
}

impl ValueSnapshot {
    pub fn insert(&mut self, name: &'static str, value: Value) {
        self.values.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn heat_recovery(&self) -> Option<&HeatRecovery> {
        self.heat_recovery.as_ref()
    }

    /// Compute [`HeatRecovery`] from the temperatures present.
    pub fn derive_metrics(&mut self) {
        self.heat_recovery = HeatRecovery::from_values(
            self.get("temperature_outdoor_air"),
            self.get("temperature_supply_air"),
            self.get("temperature_extract_air"),
            self.get("temperature_exhaust_air"),
        );
    }

    pub fn fault_text(&self) -> Option<&'static str> {
        let code = self.get("fault_number")?.as_integer();
        Some(u8::try_from(code).map_or("-", value::fault_text))
    }

    /// Register variables in name order, followed by the derived fields that are available.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, Field)> + '_ {
        let number = |v: i16| Field::Value(Value::Number(v.into()));
        let derived = self.heat_recovery.iter().flat_map(move |m| {
            [
                ("temperature_reduction", number(m.temperature_reduction)),
                ("temperature_gain", number(m.temperature_gain)),
                ("temperature_balance", number(m.temperature_balance)),
                ("efficiency", number(m.efficiency.into())),
            ]
        });
        self.values
            .iter()
            .map(|(name, value)| (*name, Field::Value(*value)))
            .chain(derived)
            .chain(self.fault_text().map(|text| ("fault_text", Field::Text(text))))
    }
}

impl serde::Serialize for ValueSnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.fields())
    }
}
