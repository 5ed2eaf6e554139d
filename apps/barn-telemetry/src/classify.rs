use crate::model::{AlertLevel, SensorReading, ValidatedReading};
use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GasThreshold {
    pub warning: f64,
    pub danger: f64,
}

impl GasThreshold {
    pub fn new(warning: f64, danger: f64) -> Result<Self> {
        if !warning.is_finite() || !danger.is_finite() {
            bail!("thresholds must be finite (warning={warning}, danger={danger})");
        }
        if warning < 0.0 || warning >= danger {
            bail!("thresholds must satisfy 0 <= warning < danger (warning={warning}, danger={danger})");
        }
        Ok(Self { warning, danger })
    }

    /// Reaching a threshold triggers its level.
    pub fn level(&self, value: f64) -> AlertLevel {
        if value >= self.danger {
            AlertLevel::Danger
        } else if value >= self.warning {
            AlertLevel::Warning
        } else {
            AlertLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub methane: GasThreshold,
    pub co2: GasThreshold,
    pub nh3: GasThreshold,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            methane: GasThreshold {
                warning: 500.0,
                danger: 1000.0,
            },
            co2: GasThreshold {
                warning: 2000.0,
                danger: 3000.0,
            },
            nh3: GasThreshold {
                warning: 15.0,
                danger: 25.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gas {
    Methane,
    Co2,
    Nh3,
}

impl Gas {
    pub fn label(&self) -> &'static str {
        match self {
            Gas::Methane => "CH4",
            Gas::Co2 => "CO2",
            Gas::Nh3 => "NH3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasLevel {
    pub gas: Gas,
    pub value: f64,
    pub level: AlertLevel,
}

impl fmt::Display for GasLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}ppm", self.gas.label(), self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub level: AlertLevel,
    pub gases: [GasLevel; 3],
}

impl Classification {
    pub fn at_level(&self, level: AlertLevel) -> impl Iterator<Item = &GasLevel> {
        self.gases.iter().filter(move |gas| gas.level == level)
    }

    /// "CH4: 6000ppm, NH3: 30ppm"
    pub fn describe(&self, level: AlertLevel) -> String {
        self.at_level(level)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn classify(reading: &ValidatedReading, thresholds: &Thresholds) -> Classification {
    let gases = [
        (Gas::Methane, reading.methane_ppm, &thresholds.methane),
        (Gas::Co2, reading.co2_ppm, &thresholds.co2),
        (Gas::Nh3, reading.nh3_ppm, &thresholds.nh3),
    ]
    .map(|(gas, value, threshold)| GasLevel {
        gas,
        value,
        level: threshold.level(value),
    });
    let level = gases
        .iter()
        .map(|gas| gas.level)
        .max()
        .unwrap_or_default();
    Classification { level, gases }
}

pub fn classify_reading(
    reading: ValidatedReading,
    thresholds: &Thresholds,
) -> (SensorReading, Classification) {
    let classification = classify(&reading, thresholds);
    (reading.with_alert_level(classification.level), classification)
}
