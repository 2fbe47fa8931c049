//! Configuration for the timeline, labeling and feature pipeline.
//!
//! One immutable [`PipelineConfig`] value is threaded by reference into every
//! component, so tests can vary it per case without shared state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::asof::Boundary;
use crate::core::split::SplitStrategy;
use crate::ingest::WeatherChannel;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub grid: GridConfig,
    pub labels: LabelConfig,
    pub text: TextStreamConfig,
    pub weather: WeatherConfig,
    pub position: PositionConfig,
    pub intervals: IntervalConfig,
    pub split: SplitConfig,
    pub build: BuildConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            labels: LabelConfig::default(),
            text: TextStreamConfig::default(),
            weather: WeatherConfig::default(),
            position: PositionConfig::default(),
            intervals: IntervalConfig::default(),
            split: SplitConfig::default(),
            build: BuildConfig::default(),
        }
    }
}

/// Grid cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Spacing between grid points
    #[serde(with = "duration_serde")]
    pub step: Duration,
    /// Sessions needing more grid points than this are rejected
    pub max_points: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(30),
            max_points: 10_000,
        }
    }
}

/// Intervention detection vocabulary and label shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    /// Forward horizon for the binary label
    #[serde(with = "duration_serde")]
    pub horizon: Duration,
    /// Saturation value for time-to-event, also used when no event follows
    #[serde(with = "duration_serde")]
    pub time_to_event_cap: Duration,
    /// Detections closer than this merge into one event (default: one grid step)
    #[serde(with = "option_duration_serde")]
    pub merge_gap: Option<Duration>,
    /// Structured categories naming an intervention
    pub categories: Vec<String>,
    /// Structured categories naming a virtual safety car specifically
    pub vsc_categories: Vec<String>,
    /// Structured flag values naming an intervention
    pub flags: Vec<String>,
    /// Free-text phrases naming an intervention
    pub keywords: Vec<String>,
    /// Free-text phrases naming a virtual safety car specifically
    pub vsc_keywords: Vec<String>,
    /// Phrases marking a deployment
    pub start_markers: Vec<String>,
    /// Phrases marking the end of a period; these always win over starts
    pub end_markers: Vec<String>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            horizon: Duration::from_secs(300),
            time_to_event_cap: Duration::from_secs(1800),
            merge_gap: None,
            categories: strings(&["SafetyCar", "Vsc", "VirtualSafetyCar"]),
            vsc_categories: strings(&["Vsc", "VirtualSafetyCar"]),
            flags: strings(&["SC", "VSC", "SAFETY CAR", "VIRTUAL SAFETY CAR"]),
            keywords: strings(&["SAFETY CAR", "VIRTUAL SAFETY CAR", "VSC"]),
            vsc_keywords: strings(&["VIRTUAL SAFETY CAR", "VSC"]),
            start_markers: strings(&["DEPLOYED", "OUT", "PERIOD"]),
            end_markers: strings(&[
                "ENDING",
                "ENDED",
                "WITHDRAWN",
                "IN THIS LAP",
                "SAFETY CAR IN",
                "RESUME",
                "CLEAR",
            ]),
        }
    }
}

/// Incident message stream features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextStreamConfig {
    pub boundary: Boundary,
    /// Rolling windows in seconds
    pub windows: Vec<u64>,
    /// Presence flags: column stem -> phrases
    pub keyword_flags: BTreeMap<String, Vec<String>>,
    /// Window for the concatenated recent-message text column
    #[serde(with = "option_duration_serde")]
    pub recent_text_window: Option<Duration>,
}

impl Default for TextStreamConfig {
    fn default() -> Self {
        let mut keyword_flags = BTreeMap::new();
        keyword_flags.insert("debris".to_string(), strings(&["DEBRIS"]));
        keyword_flags.insert(
            "crash".to_string(),
            strings(&["CRASH", "ACCIDENT", "COLLISION", "INCIDENT"]),
        );
        keyword_flags.insert("stopped".to_string(), strings(&["STOPPED"]));
        keyword_flags.insert(
            "rain".to_string(),
            strings(&["RAIN", "WET", "SLIPPERY", "AQUAPLANING"]),
        );
        keyword_flags.insert("yellow".to_string(), strings(&["YELLOW"]));
        keyword_flags.insert("red".to_string(), strings(&["RED FLAG"]));
        keyword_flags.insert("track_limits".to_string(), strings(&["TRACK LIMITS"]));
        keyword_flags.insert("investigation".to_string(), strings(&["INVESTIGATION"]));

        Self {
            boundary: Boundary::Inclusive,
            windows: vec![60, 180, 600],
            keyword_flags,
            recent_text_window: Some(Duration::from_secs(180)),
        }
    }
}

/// Weather stream features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub boundary: Boundary,
    /// As-of values older than this are reported as missing
    #[serde(with = "option_duration_serde")]
    pub tolerance: Option<Duration>,
    /// Channels that get rolling statistics
    pub rolling_channels: Vec<WeatherChannel>,
    /// Rolling windows in seconds
    pub windows: Vec<u64>,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            boundary: Boundary::Inclusive,
            tolerance: Some(Duration::from_secs(600)),
            rolling_channels: vec![WeatherChannel::Rainfall, WeatherChannel::TrackTemperature],
            windows: vec![300],
        }
    }
}

/// Car position stream features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    pub boundary: Boundary,
    pub windows: Vec<u64>,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            boundary: Boundary::Inclusive,
            windows: vec![120, 300],
        }
    }
}

/// Gap/interval stream features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub boundary: Boundary,
    pub windows: Vec<u64>,
    /// Interval thresholds (seconds) for pack density
    pub pack_thresholds: Vec<f64>,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            boundary: Boundary::Inclusive,
            windows: vec![120],
            pack_thresholds: vec![1.5, 3.0],
        }
    }
}

/// Train/validation/test partitioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub strategy: SplitStrategy,
    pub validation_fraction: f64,
    pub test_fraction: f64,
    /// Seed for the group-hash strategy
    pub seed: u64,
    /// Groups forced into the test partition
    pub test_groups: Vec<String>,
    /// Groups forced into the validation partition
    pub validation_groups: Vec<String>,
    /// Number of cross-validation folds
    pub folds: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            strategy: SplitStrategy::Temporal,
            validation_fraction: 0.15,
            test_fraction: 0.2,
            seed: 42,
            test_groups: Vec::new(),
            validation_groups: Vec::new(),
            folds: 5,
        }
    }
}

/// What to do when one session's pipeline fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Drop the session and record it in the manifest
    #[default]
    Exclude,
    /// Fail the whole build
    Abort,
}

/// Build execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub failure_policy: FailurePolicy,
    /// Worker threads; 0 means one per available core
    pub workers: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Exclude,
            workers: 0,
        }
    }
}

impl BuildConfig {
    /// Effective worker count, never zero.
    pub fn worker_count(&self, jobs: usize) -> usize {
        let wanted = if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        };
        wanted.min(jobs.max(1))
    }
}

impl PipelineConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: PipelineConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sc-risk")
            .join("config.json")
    }

    /// Merge gap for event formation.
    pub fn merge_gap(&self) -> Duration {
        self.labels.merge_gap.unwrap_or(self.grid.step)
    }

    /// Reject settings that would make the pipeline ill-defined.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid.step.is_zero() {
            return Err(ConfigError::Invalid("grid.step must be positive".into()));
        }
        if self.grid.max_points < 2 {
            return Err(ConfigError::Invalid("grid.max_points must be at least 2".into()));
        }
        if self.labels.horizon < self.grid.step {
            return Err(ConfigError::Invalid(
                "labels.horizon must be at least one grid step".into(),
            ));
        }
        if self.labels.time_to_event_cap < self.labels.horizon {
            return Err(ConfigError::Invalid(
                "labels.time_to_event_cap must not be shorter than the horizon".into(),
            ));
        }

        let window_sets = [
            ("text.windows", &self.text.windows),
            ("weather.windows", &self.weather.windows),
            ("position.windows", &self.position.windows),
            ("intervals.windows", &self.intervals.windows),
        ];
        for (name, windows) in window_sets {
            if windows.iter().any(|&w| w == 0) {
                return Err(ConfigError::Invalid(format!("{name} contains a zero window")));
            }
            let mut sorted = windows.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != windows.len() {
                return Err(ConfigError::Invalid(format!("{name} contains duplicates")));
            }
        }
        if self.text.keyword_flags.values().any(|phrases| phrases.is_empty()) {
            return Err(ConfigError::Invalid(
                "text.keyword_flags entries need at least one phrase".into(),
            ));
        }
        if self
            .intervals
            .pack_thresholds
            .iter()
            .any(|t| !t.is_finite() || *t <= 0.0)
        {
            return Err(ConfigError::Invalid(
                "intervals.pack_thresholds must be positive".into(),
            ));
        }

        let split = &self.split;
        let fractions = [split.validation_fraction, split.test_fraction];
        if fractions.iter().any(|f| !(0.0..1.0).contains(f))
            || split.validation_fraction + split.test_fraction >= 1.0
        {
            return Err(ConfigError::Invalid(
                "split fractions must lie in [0, 1) and sum below 1".into(),
            ));
        }
        if split.folds < 2 {
            return Err(ConfigError::Invalid("split.folds must be at least 2".into()));
        }

        Ok(())
    }

    /// Stable fingerprint of the configuration, recorded in the manifest.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{:016x}", xxhash_rust::xxh3::xxh3_64(json.as_bytes()))
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Serde support for Duration as whole seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde support for optional Duration as whole seconds (or null).
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.grid.step, Duration::from_secs(30));
        assert_eq!(config.labels.horizon, Duration::from_secs(300));
        assert_eq!(config.text.windows, vec![60, 180, 600]);
        assert_eq!(config.merge_gap(), Duration::from_secs(30));
        assert_eq!(config.grid.max_points, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"grid": {"step": 60}, "split": {"strategy": "group_hash"}}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.grid.step, Duration::from_secs(60));
        assert_eq!(config.split.strategy, SplitStrategy::GroupHash);
        assert_eq!(config.labels.horizon, Duration::from_secs(300));
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = PipelineConfig::default();
        config.grid.step = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.grid.max_points = 1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.text.windows = vec![60, 0];
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.split.test_fraction = 0.6;
        config.split.validation_fraction = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = PipelineConfig::default();
        config.labels.merge_gap = Some(Duration::from_secs(90));
        config.save_to(&path).unwrap();

        let loaded = PipelineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.fingerprint(), config.fingerprint());
    }
}
