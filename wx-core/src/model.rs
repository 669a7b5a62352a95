//! Shared domain types: raw samples, thresholds, alarm state, and alarm
//! events. These cross component boundaries (protocol -> log -> persistence
//! / alarm evaluator) so they live in one place rather than per-module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Short opaque string identifying a fixed sensor station (a zipcode in
/// practice, but treated as an opaque key throughout).
pub type LocationKey = String;

/// Eight metric fields carried on a metrics frame. All numeric fields may
/// be absent (sensor failure); wind direction is a small enum-ish string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub precipitation: Option<f64>,
    pub wind_speed: Option<f64>,
    #[serde(default)]
    pub wind_direction: Option<WindDirection>,
    pub pollution: Option<f64>,
    pub pollen: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WindDirection {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

/// The name of one of the six numeric metric fields. Used as the join
/// key between `Metrics`, `Threshold`, and alarm state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Temperature,
    Humidity,
    Precipitation,
    WindSpeed,
    Pollution,
    Pollen,
}

impl MetricName {
    pub const ALL: [MetricName; 6] = [
        MetricName::Temperature,
        MetricName::Humidity,
        MetricName::Precipitation,
        MetricName::WindSpeed,
        MetricName::Pollution,
        MetricName::Pollen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Temperature => "temperature",
            MetricName::Humidity => "humidity",
            MetricName::Precipitation => "precipitation",
            MetricName::WindSpeed => "wind_speed",
            MetricName::Pollution => "pollution",
            MetricName::Pollen => "pollen",
        }
    }

    pub fn value_in(&self, m: &Metrics) -> Option<f64> {
        match self {
            MetricName::Temperature => m.temperature,
            MetricName::Humidity => m.humidity,
            MetricName::Precipitation => m.precipitation,
            MetricName::WindSpeed => m.wind_speed,
            MetricName::Pollution => m.pollution,
            MetricName::Pollen => m.pollen,
        }
    }
}

impl std::str::FromStr for MetricName {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricName::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| crate::error::Error::InvalidFrame(format!("unknown metric: {s}")))
    }
}

/// The nested `data` object on the raw-metric log record's wire value
/// (§6.2): the client-supplied RFC-3339 timestamp plus the eight metric
/// fields, flattened alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSampleData {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: Metrics,
}

/// A sample as it flows through the raw-metric log: the wire payload plus
/// server-assigned receive timestamp and connection provenance. Wire
/// field names match §6.2 exactly: `connection_id`, `zipcode`, `city`,
/// `received_at`, `data` (itself `{timestamp, <metrics>}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSample {
    pub connection_id: Uuid,
    #[serde(rename = "zipcode")]
    pub location: LocationKey,
    #[serde(rename = "city")]
    pub label: String,
    /// Server receive timestamp, attached on ingress.
    pub received_at: DateTime<Utc>,
    pub data: RawSampleData,
}

/// Comparison operator stored on a threshold row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
}

impl Operator {
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Lt => value < threshold,
            Operator::Ge => value >= threshold,
            Operator::Le => value <= threshold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
        }
    }
}

/// A threshold row read from the relational store. Unique per
/// (location, metric).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub location: LocationKey,
    pub metric: MetricName,
    pub operator: Operator,
    pub value: f64,
    pub duration_minutes: i64,
    pub active: bool,
}

/// Phase of the per-(location, metric) alarm state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmPhase {
    Pending,
    Active,
}

/// In-cache alarm state. CLEAR is represented by the key's absence, not
/// by a variant of this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmState {
    pub phase: AlarmPhase,
    pub breach_start: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    pub last_value: f64,
    /// Only populated while `phase == Active`.
    pub active_alarm_id: Option<i64>,
}

/// Status of an `alarm_log` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum AlarmStatus {
    Active,
    Cleared,
}

/// An event published on the alarm topic when a transition occurs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AlarmEvent {
    #[serde(rename = "ALARM_TRIGGERED")]
    Triggered {
        zipcode: LocationKey,
        city: String,
        metric: MetricName,
        value: f64,
        threshold: f64,
        operator: Operator,
        duration_minutes: i64,
        start_time: DateTime<Utc>,
        alarm_id: i64,
    },
    #[serde(rename = "ALARM_CLEARED")]
    Cleared {
        zipcode: LocationKey,
        city: String,
        metric: MetricName,
        threshold: f64,
        operator: Operator,
        duration_minutes: i64,
        start_time: DateTime<Utc>,
        alarm_id: i64,
    },
}

impl AlarmEvent {
    /// Partition key for the alarm topic: `"{location}-{metric}"`, so all
    /// transitions for one (location, metric) land on the same partition.
    pub fn partition_key(location: &str, metric: MetricName) -> String {
        format!("{location}-{}", metric.as_str())
    }
}
