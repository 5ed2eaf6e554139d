use crate::error::ParseEnumError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a reading. Ordered so that `max` picks the worst level.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Normal,
    Warning,
    Danger,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Warning => "warning",
            AlertLevel::Danger => "danger",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(AlertLevel::Normal),
            "warning" => Ok(AlertLevel::Warning),
            "danger" => Ok(AlertLevel::Danger),
            other => Err(ParseEnumError {
                kind: "alert level",
                value: other.to_string(),
            }),
        }
    }
}

/// A payload that passed validation but has not been classified yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedReading {
    pub sensor_id: String,
    pub barn_id: String,
    pub methane_ppm: f64,
    pub co2_ppm: f64,
    pub nh3_ppm: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

impl ValidatedReading {
    pub fn with_alert_level(self, alert_level: AlertLevel) -> SensorReading {
        SensorReading {
            sensor_id: self.sensor_id,
            barn_id: self.barn_id,
            methane_ppm: self.methane_ppm,
            co2_ppm: self.co2_ppm,
            nh3_ppm: self.nh3_ppm,
            temperature: self.temperature,
            humidity: self.humidity,
            timestamp: self.timestamp,
            alert_level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub sensor_id: String,
    pub barn_id: String,
    pub methane_ppm: f64,
    pub co2_ppm: f64,
    pub nh3_ppm: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
    pub alert_level: AlertLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPeriod {
    #[default]
    None,
    Hourly,
    Daily,
    Weekly,
}

impl AggregationPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationPeriod::None => "none",
            AggregationPeriod::Hourly => "hourly",
            AggregationPeriod::Daily => "daily",
            AggregationPeriod::Weekly => "weekly",
        }
    }
}

impl FromStr for AggregationPeriod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(AggregationPeriod::None),
            "hourly" | "hour" => Ok(AggregationPeriod::Hourly),
            "daily" | "day" => Ok(AggregationPeriod::Daily),
            "weekly" | "week" => Ok(AggregationPeriod::Weekly),
            other => Err(ParseEnumError {
                kind: "aggregation period",
                value: other.to_string(),
            }),
        }
    }
}

/// Summary of one sensor over one period bucket `[period_start, period_end)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedReading {
    pub sensor_id: String,
    pub barn_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub reading_count: u64,
    pub min_methane_ppm: f64,
    pub avg_methane_ppm: f64,
    pub max_methane_ppm: f64,
    pub min_co2_ppm: f64,
    pub avg_co2_ppm: f64,
    pub max_co2_ppm: f64,
    pub min_nh3_ppm: f64,
    pub avg_nh3_ppm: f64,
    pub max_nh3_ppm: f64,
    pub min_temperature: f64,
    pub avg_temperature: f64,
    pub max_temperature: f64,
    pub min_humidity: f64,
    pub avg_humidity: f64,
    pub max_humidity: f64,
    pub max_alert_level: AlertLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestReading {
    pub sensor_id: String,
    pub barn_id: String,
    pub reading: SensorReading,
    pub last_updated: DateTime<Utc>,
}

impl From<SensorReading> for LatestReading {
    fn from(reading: SensorReading) -> Self {
        Self {
            sensor_id: reading.sensor_id.clone(),
            barn_id: reading.barn_id.clone(),
            last_updated: reading.timestamp,
            reading,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSeries {
    pub metric: &'static str,
    pub points: Vec<ChartPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub barn_id: String,
    pub aggregation: AggregationPeriod,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub series: Vec<ChartSeries>,
}
