//! Causal feature extraction per upstream stream.
//!
//! Every stream belongs to one of three kinds: incident text, multi-channel
//! scalar readings, or per-driver vector readings. Each kind provides an
//! as-of part (latest known state) and a rolling part (trailing windows).
//! Column sets depend only on configuration, never on the data, so all
//! sessions share one schema.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::asof::{AsOfJoiner, Boundary};
use super::grid::TimeGrid;
use super::keywords::KeywordSet;
use super::rolling::{
    CategoryMix, EntityLinks, KeywordPresence, LatestPerEntity, NumericSummary, NumericWindow,
    PositionChanges, RollingAggregator, TextConcat,
};
use super::table::{Column, ColumnSpec};
use crate::config::{
    IntervalConfig, PipelineConfig, PositionConfig, TextStreamConfig, WeatherConfig,
};
use crate::ingest::{
    IntervalReading, PositionReading, RaceControlMessage, SessionInput, StreamName, Timestamped,
    WeatherChannel, WeatherReading,
};

/// Separator for the recent-messages text column.
pub const MESSAGE_SEPARATOR: &str = " | ";

/// Shape of a stream's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Text,
    Scalar,
    Vector,
}

/// Capabilities shared by every stream kind.
pub trait StreamFeatures {
    fn stream(&self) -> StreamName;

    fn kind(&self) -> StreamKind;

    /// Whether the stream was delivered at all (possibly empty).
    fn is_present(&self) -> bool;

    /// Output columns, as-of columns first.
    fn schema(&self) -> Vec<ColumnSpec>;

    fn as_of_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column>;

    fn rolling_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column>;

    /// All columns for the grid. A missing stream yields sentinels only.
    fn extract(&self, grid: &TimeGrid) -> Vec<Column> {
        if !self.is_present() {
            return self
                .schema()
                .iter()
                .map(|spec| Column::missing(spec, grid.len()))
                .collect();
        }
        let mut columns = self.as_of_columns(grid.points());
        columns.extend(self.rolling_columns(grid.points()));
        columns
    }
}

/// Incident messages.
#[derive(Debug, Clone, Copy)]
pub struct TextStream<'a> {
    pub records: Option<&'a [RaceControlMessage]>,
    pub config: &'a TextStreamConfig,
    pub keywords: &'a KeywordSet,
}

/// Multi-channel weather readings.
#[derive(Debug, Clone, Copy)]
pub struct ScalarStream<'a> {
    pub records: Option<&'a [WeatherReading]>,
    pub config: &'a WeatherConfig,
}

/// Per-driver readings.
#[derive(Debug, Clone, Copy)]
pub enum VectorStream<'a> {
    Position {
        records: Option<&'a [PositionReading]>,
        config: &'a PositionConfig,
    },
    Intervals {
        records: Option<&'a [IntervalReading]>,
        config: &'a IntervalConfig,
    },
}

/// The closed set of stream kinds.
#[derive(Debug, Clone, Copy)]
pub enum FeatureStream<'a> {
    Text(TextStream<'a>),
    Scalar(ScalarStream<'a>),
    Vector(VectorStream<'a>),
}

impl<'a> FeatureStream<'a> {
    /// The four streams of a session, in output column order.
    pub fn for_session(
        input: &'a SessionInput,
        config: &'a PipelineConfig,
        keywords: &'a KeywordSet,
    ) -> [FeatureStream<'a>; 4] {
        [
            FeatureStream::Text(TextStream {
                records: input.race_control.as_deref(),
                config: &config.text,
                keywords,
            }),
            FeatureStream::Scalar(ScalarStream {
                records: input.weather.as_deref(),
                config: &config.weather,
            }),
            FeatureStream::Vector(VectorStream::Position {
                records: input.position.as_deref(),
                config: &config.position,
            }),
            FeatureStream::Vector(VectorStream::Intervals {
                records: input.intervals.as_deref(),
                config: &config.intervals,
            }),
        ]
    }

    fn inner(&self) -> &dyn StreamFeatures {
        match self {
            FeatureStream::Text(s) => s,
            FeatureStream::Scalar(s) => s,
            FeatureStream::Vector(s) => s,
        }
    }
}

impl StreamFeatures for FeatureStream<'_> {
    fn stream(&self) -> StreamName {
        self.inner().stream()
    }

    fn kind(&self) -> StreamKind {
        self.inner().kind()
    }

    fn is_present(&self) -> bool {
        self.inner().is_present()
    }

    fn schema(&self) -> Vec<ColumnSpec> {
        self.inner().schema()
    }

    fn as_of_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column> {
        self.inner().as_of_columns(grid)
    }

    fn rolling_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column> {
        self.inner().rolling_columns(grid)
    }
}

/// Feature schema for a configuration, without any data.
pub fn feature_schema(config: &PipelineConfig, keywords: &KeywordSet) -> Vec<ColumnSpec> {
    let empty = SessionInput::new(crate::ingest::SessionMeta::new(
        "",
        "",
        DateTime::<Utc>::MIN_UTC,
        DateTime::<Utc>::MAX_UTC,
    ));
    FeatureStream::for_session(&empty, config, keywords)
        .iter()
        .flat_map(|s| s.schema())
        .collect()
}

fn secs_since<T: Timestamped>(
    boundary: Boundary,
    grid: &[DateTime<Utc>],
    records: &[T],
) -> Vec<Option<f64>> {
    let matches = AsOfJoiner::new(boundary).join(grid, records);
    AsOfJoiner::age_secs(grid, records, &matches)
}

fn to_f64(values: Vec<usize>) -> Vec<Option<f64>> {
    values.into_iter().map(|v| Some(v as f64)).collect()
}

// ============================================================================
// Incident messages
// ============================================================================

impl StreamFeatures for TextStream<'_> {
    fn stream(&self) -> StreamName {
        StreamName::RaceControl
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Text
    }

    fn is_present(&self) -> bool {
        self.records.is_some()
    }

    fn schema(&self) -> Vec<ColumnSpec> {
        let mut schema = vec![
            ColumnSpec::text("rc_last_category"),
            ColumnSpec::numeric("rc_secs_since_message"),
        ];
        for w in &self.config.windows {
            schema.push(ColumnSpec::numeric(format!("rc_msg_count_{w}s")));
            schema.push(ColumnSpec::numeric(format!("rc_category_entropy_{w}s")));
            schema.push(ColumnSpec::numeric(format!("rc_unique_categories_{w}s")));
            for name in self.keywords.names() {
                schema.push(ColumnSpec::numeric(format!("rc_{name}_{w}s")));
            }
        }
        if let Some(window) = self.config.recent_text_window {
            schema.push(ColumnSpec::text(format!(
                "rc_recent_messages_{}s",
                window.as_secs()
            )));
        }
        schema
    }

    fn as_of_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column> {
        let records = self.records.unwrap_or_default();
        let matches = AsOfJoiner::new(self.config.boundary).join(grid, records);

        let last_category = matches
            .iter()
            .map(|m| m.and_then(|i| records[i].category().map(str::to_string)))
            .collect();

        vec![
            Column::text("rc_last_category", last_category),
            Column::numeric(
                "rc_secs_since_message",
                AsOfJoiner::age_secs(grid, records, &matches),
            ),
        ]
    }

    fn rolling_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column> {
        let records = self.records.unwrap_or_default();
        let boundary = self.config.boundary;

        // Intern categories; uncategorized messages form their own bucket
        let mut interned: HashMap<&str, usize> = HashMap::new();
        let ids: Vec<usize> = records
            .iter()
            .map(|r| {
                let next = interned.len();
                *interned.entry(r.category().unwrap_or("")).or_insert(next)
            })
            .collect();
        let cardinality = interned.len();
        let masks: Vec<u64> = records.iter().map(|r| self.keywords.mask(&r.message)).collect();

        let aggregator = RollingAggregator::new(&self.config.windows, boundary);
        let counts = aggregator.counts(grid, records);
        let mixes = aggregator.run(grid, records, || CategoryMix::new(&ids, cardinality));
        let presence = aggregator.run(grid, records, || KeywordPresence::new(&masks));

        let mut columns = Vec::new();
        for (i, w) in self.config.windows.iter().enumerate() {
            columns.push(Column::numeric(
                format!("rc_msg_count_{w}s"),
                to_f64(counts[i].clone()),
            ));
            columns.push(Column::numeric(
                format!("rc_category_entropy_{w}s"),
                mixes[i].iter().map(|m| Some(m.entropy)).collect(),
            ));
            columns.push(Column::numeric(
                format!("rc_unique_categories_{w}s"),
                mixes[i].iter().map(|m| Some(m.unique as f64)).collect(),
            ));
            for (bit, name) in self.keywords.names().iter().enumerate() {
                columns.push(Column::numeric(
                    format!("rc_{name}_{w}s"),
                    presence[i]
                        .iter()
                        .map(|mask| Some(((mask >> bit) & 1) as f64))
                        .collect(),
                ));
            }
        }

        if let Some(window) = self.config.recent_text_window {
            let texts: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
            let recent = RollingAggregator::new(&[window.as_secs()], boundary)
                .run(grid, records, || TextConcat::new(&texts, MESSAGE_SEPARATOR));
            columns.push(Column::text(
                format!("rc_recent_messages_{}s", window.as_secs()),
                recent.into_iter().next().unwrap_or_default(),
            ));
        }

        columns
    }
}

// ============================================================================
// Weather
// ============================================================================

/// One channel value at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    timestamp: DateTime<Utc>,
    value: f64,
}

impl Timestamped for Sample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

fn channel_samples(records: &[WeatherReading], channel: WeatherChannel) -> Vec<Sample> {
    records
        .iter()
        .filter_map(|r| {
            r.channel(channel).map(|value| Sample {
                timestamp: r.timestamp,
                value,
            })
        })
        .collect()
}

const NUMERIC_STATS: [&str; 5] = ["max", "min", "mean", "std", "delta"];

impl StreamFeatures for ScalarStream<'_> {
    fn stream(&self) -> StreamName {
        StreamName::Weather
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Scalar
    }

    fn is_present(&self) -> bool {
        self.records.is_some()
    }

    fn schema(&self) -> Vec<ColumnSpec> {
        let mut schema: Vec<ColumnSpec> = WeatherChannel::ALL
            .iter()
            .map(|ch| ColumnSpec::numeric(format!("wx_{}", ch.as_str())))
            .collect();
        schema.push(ColumnSpec::numeric("wx_secs_since_reading"));
        for channel in &self.config.rolling_channels {
            for w in &self.config.windows {
                for stat in NUMERIC_STATS {
                    schema.push(ColumnSpec::numeric(format!(
                        "wx_{}_{stat}_{w}s",
                        channel.as_str()
                    )));
                }
            }
        }
        schema
    }

    fn as_of_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column> {
        let records = self.records.unwrap_or_default();
        let tolerance = self
            .config
            .tolerance
            .and_then(|t| chrono::Duration::from_std(t).ok());
        let joiner = AsOfJoiner::new(self.config.boundary).with_tolerance(tolerance);

        // Channels read off the latest reading; a null channel there stays null
        let matches = joiner.join(grid, records);
        let mut columns: Vec<Column> = WeatherChannel::ALL
            .iter()
            .map(|&channel| {
                let values = matches
                    .iter()
                    .map(|m| m.and_then(|i| records[i].channel(channel)))
                    .collect();
                Column::numeric(format!("wx_{}", channel.as_str()), values)
            })
            .collect();

        columns.push(Column::numeric(
            "wx_secs_since_reading",
            secs_since(self.config.boundary, grid, records),
        ));
        columns
    }

    fn rolling_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column> {
        let records = self.records.unwrap_or_default();
        let aggregator = RollingAggregator::new(&self.config.windows, self.config.boundary);

        let mut columns = Vec::new();
        for &channel in &self.config.rolling_channels {
            let samples = channel_samples(records, channel);
            let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
            let summaries = aggregator.run(grid, &samples, || NumericWindow::new(&values));

            for (i, w) in self.config.windows.iter().enumerate() {
                let window = &summaries[i];
                let name = |suffix: &str| format!("wx_{}_{suffix}_{w}s", channel.as_str());
                let stat = |pick: fn(&NumericSummary) -> f64| -> Vec<Option<f64>> {
                    window.iter().map(|s| s.as_ref().map(pick)).collect()
                };
                columns.push(Column::numeric(name("max"), stat(|s| s.max)));
                columns.push(Column::numeric(name("min"), stat(|s| s.min)));
                columns.push(Column::numeric(name("mean"), stat(|s| s.mean)));
                columns.push(Column::numeric(name("std"), stat(|s| s.std)));
                columns.push(Column::numeric(name("delta"), stat(|s| s.delta)));
            }
        }
        columns
    }
}

// ============================================================================
// Per-driver streams
// ============================================================================

/// Column stem for a pack-density threshold, e.g. `1.5` -> `1_5`.
fn threshold_label(threshold: f64) -> String {
    format!("{threshold}").replace('.', "_")
}

impl StreamFeatures for VectorStream<'_> {
    fn stream(&self) -> StreamName {
        match self {
            VectorStream::Position { .. } => StreamName::Position,
            VectorStream::Intervals { .. } => StreamName::Intervals,
        }
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Vector
    }

    fn is_present(&self) -> bool {
        match self {
            VectorStream::Position { records, .. } => records.is_some(),
            VectorStream::Intervals { records, .. } => records.is_some(),
        }
    }

    fn schema(&self) -> Vec<ColumnSpec> {
        match self {
            VectorStream::Position { config, .. } => {
                let mut schema = vec![ColumnSpec::numeric("pos_secs_since_update")];
                for w in &config.windows {
                    schema.push(ColumnSpec::numeric(format!("pos_changes_{w}s")));
                    schema.push(ColumnSpec::numeric(format!("pos_volatility_{w}s")));
                }
                schema
            }
            VectorStream::Intervals { config, .. } => {
                let mut schema = vec![ColumnSpec::numeric("ivl_secs_since_update")];
                for w in &config.windows {
                    schema.push(ColumnSpec::numeric(format!("ivl_gap_std_{w}s")));
                    for &threshold in &config.pack_thresholds {
                        schema.push(ColumnSpec::numeric(format!(
                            "ivl_pack_density_{}_{w}s",
                            threshold_label(threshold)
                        )));
                    }
                }
                schema
            }
        }
    }

    fn as_of_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column> {
        match self {
            VectorStream::Position { records, config } => vec![Column::numeric(
                "pos_secs_since_update",
                secs_since(config.boundary, grid, records.unwrap_or_default()),
            )],
            VectorStream::Intervals { records, config } => vec![Column::numeric(
                "ivl_secs_since_update",
                secs_since(config.boundary, grid, records.unwrap_or_default()),
            )],
        }
    }

    fn rolling_columns(&self, grid: &[DateTime<Utc>]) -> Vec<Column> {
        match self {
            VectorStream::Position { records, config } => {
                position_columns(grid, records.unwrap_or_default(), config)
            }
            VectorStream::Intervals { records, config } => {
                interval_columns(grid, records.unwrap_or_default(), config)
            }
        }
    }
}

fn position_columns(
    grid: &[DateTime<Utc>],
    records: &[PositionReading],
    config: &PositionConfig,
) -> Vec<Column> {
    let drivers: Vec<u32> = records.iter().map(|r| r.driver_number).collect();
    let links = EntityLinks::build(&drivers);
    let deltas: Vec<f64> = records
        .iter()
        .enumerate()
        .map(|(i, r)| {
            links.prev[i].map_or(0.0, |p| {
                (f64::from(r.position) - f64::from(records[p].position)).abs()
            })
        })
        .collect();

    let aggregator = RollingAggregator::new(&config.windows, config.boundary);
    let stats = aggregator.run(grid, records, || PositionChanges::new(&links, &deltas));

    let mut columns = Vec::new();
    for (i, w) in config.windows.iter().enumerate() {
        columns.push(Column::numeric(
            format!("pos_changes_{w}s"),
            stats[i].iter().map(|s| Some(s.changes as f64)).collect(),
        ));
        columns.push(Column::numeric(
            format!("pos_volatility_{w}s"),
            stats[i].iter().map(|s| s.volatility).collect(),
        ));
    }
    columns
}

fn interval_columns(
    grid: &[DateTime<Utc>],
    records: &[IntervalReading],
    config: &IntervalConfig,
) -> Vec<Column> {
    let drivers: Vec<u32> = records.iter().map(|r| r.driver_number).collect();
    let links = EntityLinks::build(&drivers);
    let gaps: Vec<Option<f64>> = records.iter().map(|r| r.gap_to_leader).collect();
    let intervals: Vec<Option<f64>> = records.iter().map(|r| r.interval).collect();

    let aggregator = RollingAggregator::new(&config.windows, config.boundary);
    let stats = aggregator.run(grid, records, || {
        LatestPerEntity::new(&links, &gaps, &intervals, &config.pack_thresholds)
    });

    let mut columns = Vec::new();
    for (i, w) in config.windows.iter().enumerate() {
        columns.push(Column::numeric(
            format!("ivl_gap_std_{w}s"),
            stats[i].iter().map(|s| s.gap_std).collect(),
        ));
        for (t, &threshold) in config.pack_thresholds.iter().enumerate() {
            columns.push(Column::numeric(
                format!("ivl_pack_density_{}_{w}s", threshold_label(threshold)),
                stats[i].iter().map(|s| s.density[t]).collect(),
            ));
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SessionMeta;
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        base() + Duration::seconds(secs)
    }

    fn keywords(config: &PipelineConfig) -> KeywordSet {
        KeywordSet::new(config.text.keyword_flags.clone()).unwrap()
    }

    fn grid(secs: i64) -> TimeGrid {
        TimeGrid::from_bounds("9158", base(), at(secs), StdDuration::from_secs(30)).unwrap()
    }

    fn full_input() -> SessionInput {
        SessionInput::new(SessionMeta::new("9158", "1229", base(), at(600)))
            .with_race_control(vec![
                RaceControlMessage::new(at(20), "YELLOW IN TURN 4").with_category("Flag"),
                RaceControlMessage::new(at(40), "DEBRIS ON TRACK").with_category("Other"),
                RaceControlMessage::new(at(50), "CAR 23 STOPPED").with_category("Other"),
            ])
            .with_weather(vec![
                WeatherReading {
                    timestamp: at(0),
                    rainfall: Some(0.0),
                    track_temperature: Some(40.0),
                    ..Default::default()
                },
                WeatherReading {
                    timestamp: at(60),
                    rainfall: Some(1.0),
                    track_temperature: Some(38.0),
                    ..Default::default()
                },
            ])
            .with_position(vec![
                PositionReading { timestamp: at(0), driver_number: 1, position: 1 },
                PositionReading { timestamp: at(0), driver_number: 44, position: 2 },
                PositionReading { timestamp: at(45), driver_number: 1, position: 2 },
                PositionReading { timestamp: at(45), driver_number: 44, position: 1 },
            ])
            .with_intervals(vec![
                IntervalReading { timestamp: at(10), driver_number: 1, gap_to_leader: Some(0.0), interval: None },
                IntervalReading { timestamp: at(10), driver_number: 44, gap_to_leader: Some(1.2), interval: Some(1.2) },
                IntervalReading { timestamp: at(10), driver_number: 63, gap_to_leader: Some(4.0), interval: Some(2.8) },
            ])
    }

    fn extract_all(input: &SessionInput, config: &PipelineConfig, keywords: &KeywordSet, grid: &TimeGrid) -> Vec<Column> {
        FeatureStream::for_session(input, config, keywords)
            .iter()
            .flat_map(|s| s.extract(grid))
            .collect()
    }

    fn value(columns: &[Column], name: &str, row: usize) -> Option<f64> {
        columns
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.as_numeric())
            .unwrap_or_else(|| panic!("no numeric column {name}"))[row]
    }

    #[test]
    fn test_extracted_columns_match_schema() {
        let config = PipelineConfig::default();
        let keywords = keywords(&config);
        let input = full_input();
        let grid = grid(600);

        let columns = extract_all(&input, &config, &keywords, &grid);
        let names: Vec<ColumnSpec> = columns.iter().map(Column::spec).collect();
        assert_eq!(names, feature_schema(&config, &keywords));
        assert!(columns.iter().all(|c| c.len() == grid.len()));
    }

    #[test]
    fn test_missing_stream_is_all_sentinel_but_empty_stream_counts_zero() {
        let config = PipelineConfig::default();
        let keywords = keywords(&config);
        let grid = grid(120);

        let missing = SessionInput::new(SessionMeta::new("9158", "1229", base(), at(120)));
        let columns = extract_all(&missing, &config, &keywords, &grid);
        assert!(columns.iter().all(|c| (0..c.len()).all(|row| c.is_missing(row))));

        let empty = missing.clone().with_race_control(Vec::new());
        let columns = extract_all(&empty, &config, &keywords, &grid);
        assert_eq!(value(&columns, "rc_msg_count_60s", 2), Some(0.0));
        assert_eq!(value(&columns, "rc_category_entropy_60s", 2), Some(0.0));
        assert_eq!(value(&columns, "rc_secs_since_message", 2), None);
    }

    #[test]
    fn test_text_features() {
        let config = PipelineConfig::default();
        let keywords = keywords(&config);
        let columns = extract_all(&full_input(), &config, &keywords, &grid(600));

        // Row 2 is t = 60 s: all three messages inside the 60 s window
        assert_eq!(value(&columns, "rc_msg_count_60s", 2), Some(3.0));
        assert_eq!(value(&columns, "rc_unique_categories_60s", 2), Some(2.0));
        assert_eq!(value(&columns, "rc_debris_60s", 2), Some(1.0));
        assert_eq!(value(&columns, "rc_yellow_60s", 2), Some(1.0));
        assert_eq!(value(&columns, "rc_red_60s", 2), Some(0.0));
        assert_eq!(value(&columns, "rc_secs_since_message", 2), Some(10.0));
        // Row 3 is t = 90 s: the yellow at 20 s has left the 60 s window
        assert_eq!(value(&columns, "rc_yellow_60s", 3), Some(0.0));
        assert_eq!(value(&columns, "rc_msg_count_180s", 3), Some(3.0));

        let recent = columns
            .iter()
            .find(|c| c.name == "rc_recent_messages_180s")
            .and_then(|c| c.as_text())
            .unwrap();
        assert_eq!(recent[0], None);
        assert_eq!(
            recent[2].as_deref(),
            Some("YELLOW IN TURN 4 | DEBRIS ON TRACK | CAR 23 STOPPED")
        );

        let last = columns.iter().find(|c| c.name == "rc_last_category").unwrap();
        assert_eq!(last.as_text().unwrap()[1].as_deref(), Some("Flag"));
    }

    #[test]
    fn test_weather_features() {
        let mut config = PipelineConfig::default();
        config.weather.tolerance = Some(StdDuration::from_secs(120));
        let keywords = keywords(&config);
        let columns = extract_all(&full_input(), &config, &keywords, &grid(600));

        assert_eq!(value(&columns, "wx_track_temperature", 1), Some(40.0));
        assert_eq!(value(&columns, "wx_track_temperature", 2), Some(38.0));
        assert_eq!(value(&columns, "wx_humidity", 2), None);
        // Stale beyond 120 s at t = 210 s
        assert_eq!(value(&columns, "wx_track_temperature", 7), None);
        assert_eq!(value(&columns, "wx_secs_since_reading", 7), Some(150.0));

        assert_eq!(value(&columns, "wx_track_temperature_delta_300s", 2), Some(-2.0));
        assert_eq!(value(&columns, "wx_rainfall_max_300s", 2), Some(1.0));
        assert_eq!(value(&columns, "wx_rainfall_mean_300s", 2), Some(0.5));
        assert_eq!(value(&columns, "wx_rainfall_std_300s", 2), Some(0.5));
    }

    #[test]
    fn test_weather_channel_comes_from_latest_reading() {
        let config = PipelineConfig::default();
        let keywords = keywords(&config);
        let input = SessionInput::new(SessionMeta::new("9158", "1229", base(), at(120)))
            .with_weather(vec![
                WeatherReading {
                    timestamp: at(0),
                    rainfall: Some(0.0),
                    track_temperature: Some(40.0),
                    ..Default::default()
                },
                WeatherReading {
                    timestamp: at(60),
                    rainfall: Some(1.0),
                    track_temperature: None,
                    ..Default::default()
                },
            ]);
        let columns = extract_all(&input, &config, &keywords, &grid(120));

        assert_eq!(value(&columns, "wx_track_temperature", 1), Some(40.0));
        assert_eq!(value(&columns, "wx_track_temperature", 2), None);
        assert_eq!(value(&columns, "wx_rainfall", 2), Some(1.0));
    }

    #[test]
    fn test_vector_features() {
        let config = PipelineConfig::default();
        let keywords = keywords(&config);
        let columns = extract_all(&full_input(), &config, &keywords, &grid(600));

        // t = 60 s: both drivers swapped once
        assert_eq!(value(&columns, "pos_changes_120s", 2), Some(2.0));
        assert_eq!(value(&columns, "pos_volatility_120s", 2), Some(1.0));
        assert_eq!(value(&columns, "pos_changes_120s", 0), Some(0.0));
        assert_eq!(value(&columns, "pos_volatility_120s", 0), None);
        assert_eq!(value(&columns, "pos_secs_since_update", 2), Some(15.0));

        // t = 30 s: intervals 1.2 and 2.8
        assert_eq!(value(&columns, "ivl_pack_density_1_5_120s", 1), Some(0.5));
        assert_eq!(value(&columns, "ivl_pack_density_3_120s", 1), Some(1.0));
        assert!(value(&columns, "ivl_gap_std_120s", 1).is_some());
        assert_eq!(value(&columns, "ivl_gap_std_120s", 0), None);
    }

    #[test]
    fn test_future_records_do_not_change_past_rows() {
        let config = PipelineConfig::default();
        let keywords = keywords(&config);
        let grid = grid(600);
        let input = full_input();
        let before = extract_all(&input, &config, &keywords, &grid);

        let mut later = input.clone();
        if let Some(messages) = later.race_control.as_mut() {
            messages.push(RaceControlMessage::new(at(300), "RED FLAG").with_category("Flag"));
        }
        let after = extract_all(&later, &config, &keywords, &grid);

        let cutoff = grid.index_of(at(270)).unwrap();
        for (a, b) in before.iter().zip(&after) {
            for row in 0..=cutoff {
                assert_eq!(a.render(row), b.render(row), "column {} row {row}", a.name);
            }
        }
        assert_eq!(value(&after, "rc_red_60s", cutoff + 1), Some(1.0));
    }
}
