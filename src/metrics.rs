use crate::value::Value;

/// Figures derived from the four air temperatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct HeatRecovery {
    /// Extract minus exhaust.
    pub temperature_reduction: i16,
    /// Supply minus outdoor.
    pub temperature_gain: i16,
    /// Reduction minus gain.
    pub temperature_balance: i16,
    /// Heat recovery efficiency in percent.
    pub efficiency: u8,
}

impl HeatRecovery {
    pub fn compute(outdoor: i16, supply: i16, extract: i16, exhaust: i16) -> Self {
        let temperature_reduction = extract - exhaust;
        let temperature_gain = supply - outdoor;
        let delta = extract - outdoor;
        let efficiency = if delta <= 0 {
            0
        } else {
            let ratio = f64::from(temperature_gain) / f64::from(delta) * 100.0;
            ratio.round().clamp(0.0, 100.0) as u8
        };
        Self {
            temperature_reduction,
            temperature_gain,
            temperature_balance: temperature_reduction - temperature_gain,
            efficiency,
        }
    }

    /// `None` unless all four inputs are temperatures.
    pub fn from_values(
        outdoor: Option<Value>,
        supply: Option<Value>,
        extract: Option<Value>,
        exhaust: Option<Value>,
    ) -> Option<Self> {
        let celsius = |value: Option<Value>| match value? {
            Value::Celsius(c) => Some(c),
            _ => None,
        };
        let (outdoor, supply) = (celsius(outdoor)?, celsius(supply)?);
        let (extract, exhaust) = (celsius(extract)?, celsius(exhaust)?);
        Some(Self::compute(outdoor, supply, extract, exhaust))
    }
}
