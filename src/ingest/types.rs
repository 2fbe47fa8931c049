//! Raw record types handed over by the ingestion collaborator.
//!
//! These are already-parsed, timestamped records. The pipeline validates
//! their internal consistency (session bounds, sortable timestamps) but
//! never their network-layer correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};

/// Anything carrying a UTC timestamp that can be placed on a session grid.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Stable sort by timestamp. Records sharing a timestamp keep input order,
/// so the last one of them is the one an as-of lookup lands on.
pub fn sort_by_time<T: Timestamped>(records: &mut [T]) {
    records.sort_by_key(|r| r.timestamp());
}

/// Check that a slice is in non-decreasing timestamp order.
pub fn is_time_sorted<T: Timestamped>(records: &[T]) -> bool {
    records
        .windows(2)
        .all(|pair| pair[0].timestamp() <= pair[1].timestamp())
}

/// Session metadata. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Opaque session identifier
    #[serde(deserialize_with = "string_or_number")]
    pub session_id: String,
    /// Race weekend the session belongs to; used only for splitting
    #[serde(deserialize_with = "string_or_number")]
    pub group_key: String,
    /// Session start (UTC)
    pub start: DateTime<Utc>,
    /// Session end (UTC)
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

impl SessionMeta {
    pub fn new(
        session_id: impl Into<String>,
        group_key: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            group_key: group_key.into(),
            start,
            end,
            name: None,
            year: None,
        }
    }

    /// Fails with `InvalidSessionBounds` unless `end > start`.
    pub fn validate(&self) -> Result<()> {
        if self.end <= self.start {
            return Err(PipelineError::InvalidSessionBounds {
                session_id: self.session_id.clone(),
                start: self.start,
                end: self.end,
                reason: "end is not after start".to_string(),
            });
        }
        Ok(())
    }
}

/// An incident (race control) message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceControlMessage {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    /// Structured category, e.g. `SafetyCar`, `Flag`, `Other`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Structured flag, e.g. `YELLOW`, `SC`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lap_number: Option<u32>,
}

impl RaceControlMessage {
    pub fn new(timestamp: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
            category: None,
            flag: None,
            scope: None,
            lap_number: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    /// Category with empty strings treated as absent.
    pub fn category(&self) -> Option<&str> {
        self.category.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Flag with empty strings treated as absent.
    pub fn flag(&self) -> Option<&str> {
        self.flag.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

impl Timestamped for RaceControlMessage {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Weather sensor channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherChannel {
    Rainfall,
    TrackTemperature,
    AirTemperature,
    WindSpeed,
    Humidity,
    Pressure,
}

impl WeatherChannel {
    pub const ALL: [WeatherChannel; 6] = [
        WeatherChannel::Rainfall,
        WeatherChannel::TrackTemperature,
        WeatherChannel::AirTemperature,
        WeatherChannel::WindSpeed,
        WeatherChannel::Humidity,
        WeatherChannel::Pressure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WeatherChannel::Rainfall => "rainfall",
            WeatherChannel::TrackTemperature => "track_temperature",
            WeatherChannel::AirTemperature => "air_temperature",
            WeatherChannel::WindSpeed => "wind_speed",
            WeatherChannel::Humidity => "humidity",
            WeatherChannel::Pressure => "pressure",
        }
    }
}

/// A weather reading. Channels may be individually missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub rainfall: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub track_temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub air_temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub wind_speed: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub humidity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub pressure: Option<f64>,
}

impl WeatherReading {
    /// Channel value; non-finite readings count as missing.
    pub fn channel(&self, channel: WeatherChannel) -> Option<f64> {
        let value = match channel {
            WeatherChannel::Rainfall => self.rainfall,
            WeatherChannel::TrackTemperature => self.track_temperature,
            WeatherChannel::AirTemperature => self.air_temperature,
            WeatherChannel::WindSpeed => self.wind_speed,
            WeatherChannel::Humidity => self.humidity,
            WeatherChannel::Pressure => self.pressure,
        };
        value.filter(|v| v.is_finite())
    }
}

impl Timestamped for WeatherReading {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Car position report for one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReading {
    pub timestamp: DateTime<Utc>,
    pub driver_number: u32,
    pub position: u32,
}

impl Timestamped for PositionReading {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Gap/interval report for one driver.
///
/// Upstream sends strings such as `"+1 LAP"` for lapped cars; those
/// deserialize as missing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalReading {
    pub timestamp: DateTime<Utc>,
    pub driver_number: u32,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub gap_to_leader: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub interval: Option<f64>,
}

impl Timestamped for IntervalReading {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// The four upstream stream types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    RaceControl,
    Weather,
    Position,
    Intervals,
}

impl StreamName {
    pub const ALL: [StreamName; 4] = [
        StreamName::RaceControl,
        StreamName::Weather,
        StreamName::Position,
        StreamName::Intervals,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamName::RaceControl => "race_control",
            StreamName::Weather => "weather",
            StreamName::Position => "position",
            StreamName::Intervals => "intervals",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the pipeline receives for one session.
///
/// `None` means the stream is missing entirely; `Some(vec![])` means it
/// exists but carried no records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInput {
    pub session: SessionMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub race_control: Option<Vec<RaceControlMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<Vec<WeatherReading>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec<PositionReading>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervals: Option<Vec<IntervalReading>>,
}

impl SessionInput {
    pub fn new(session: SessionMeta) -> Self {
        Self {
            session,
            race_control: None,
            weather: None,
            position: None,
            intervals: None,
        }
    }

    pub fn with_race_control(mut self, records: Vec<RaceControlMessage>) -> Self {
        self.race_control = Some(records);
        self
    }

    pub fn with_weather(mut self, records: Vec<WeatherReading>) -> Self {
        self.weather = Some(records);
        self
    }

    pub fn with_position(mut self, records: Vec<PositionReading>) -> Self {
        self.position = Some(records);
        self
    }

    pub fn with_intervals(mut self, records: Vec<IntervalReading>) -> Self {
        self.intervals = Some(records);
        self
    }

    /// Streams absent from this session's input.
    pub fn missing_streams(&self) -> Vec<StreamName> {
        StreamName::ALL
            .into_iter()
            .filter(|stream| match stream {
                StreamName::RaceControl => self.race_control.is_none(),
                StreamName::Weather => self.weather.is_none(),
                StreamName::Position => self.position.is_none(),
                StreamName::Intervals => self.intervals.is_none(),
            })
            .collect()
    }

    /// Total raw record count across all present streams.
    pub fn record_count(&self) -> usize {
        self.race_control.as_ref().map_or(0, Vec::len)
            + self.weather.as_ref().map_or(0, Vec::len)
            + self.position.as_ref().map_or(0, Vec::len)
            + self.intervals.as_ref().map_or(0, Vec::len)
    }

    /// Validate bounds and return a copy with every stream time-sorted.
    pub fn prepared(&self) -> Result<SessionInput> {
        self.session.validate()?;
        let mut prepared = self.clone();
        if let Some(records) = prepared.race_control.as_mut() {
            sort_by_time(records);
        }
        if let Some(records) = prepared.weather.as_mut() {
            sort_by_time(records);
        }
        if let Some(records) = prepared.position.as_mut() {
            sort_by_time(records);
        }
        if let Some(records) = prepared.intervals.as_mut() {
            sort_by_time(records);
        }
        Ok(prepared)
    }
}

/// Accept identifiers given either as JSON strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number identifier, got {other}"
        ))),
    }
}

/// Numbers, numeric strings, or anything else as missing.
fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().trim_start_matches('+').parse::<f64>().ok(),
        serde_json::Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
        _ => None,
    };
    Ok(value.filter(|v| v.is_finite()))
}
