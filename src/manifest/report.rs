//! Build manifest: what went into the master table and what was left out.
//!
//! The manifest is assembled once after all session workers have finished,
//! so it needs no shared counters. It carries no wall-clock time and is
//! identical for identical inputs and configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::labeling::InterventionEvent;
use crate::core::split::Partition;
use crate::core::table::MasterTable;
use crate::ingest::StreamName;

/// Non-fatal data problems recorded against a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum DataQualityFlag {
    /// An upstream stream was absent; its features are all sentinel
    MissingStream { stream: StreamName },
    /// Messages that named an intervention but could not be classified
    AmbiguousMessages { count: usize },
    /// No intervention was detected; every label is negative
    NoInterventionsDetected,
    /// End markers that closed no intervention
    UnpairedEndMarkers { count: usize },
}

/// Per-session outcome, used for timeline review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub group_key: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub grid_points: usize,
    pub positive_points: usize,
    pub events: Vec<InterventionEvent>,
    pub ambiguous_messages: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<DataQualityFlag>,
}

/// A session dropped from the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedSession {
    pub session_id: String,
    pub reason: String,
}

/// A session kept in the build with data-quality flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedSession {
    pub session_id: String,
    pub flags: Vec<DataQualityFlag>,
}

/// Summary of one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub crate_version: String,
    pub config_fingerprint: String,
    pub sessions_total: usize,
    pub sessions_included: usize,
    pub rows: usize,
    pub positive_rows: usize,
    pub partition_rows: BTreeMap<Partition, usize>,
    pub excluded: Vec<ExcludedSession>,
    pub degraded: Vec<DegradedSession>,
    pub summaries: Vec<SessionSummary>,
}

impl BuildManifest {
    /// Assemble the manifest from the finished table and per-session results.
    pub fn new(
        config_fingerprint: String,
        sessions_total: usize,
        master: &MasterTable,
        summaries: Vec<SessionSummary>,
        excluded: Vec<ExcludedSession>,
    ) -> Self {
        let partition_rows = Partition::ALL
            .iter()
            .map(|&p| (p, master.partition_rows(p).len()))
            .collect();

        let degraded = summaries
            .iter()
            .filter(|s| !s.flags.is_empty())
            .map(|s| DegradedSession {
                session_id: s.session_id.clone(),
                flags: s.flags.clone(),
            })
            .collect();

        Self {
            crate_version: crate::VERSION.to_string(),
            config_fingerprint,
            sessions_total,
            sessions_included: summaries.len(),
            rows: master.len(),
            positive_rows: master.positive_rows(),
            partition_rows,
            excluded,
            degraded,
            summaries,
        }
    }

    /// Every input session is either included or listed as excluded.
    pub fn is_complete(&self) -> bool {
        self.sessions_included + self.excluded.len() == self.sessions_total
    }

    /// Fraction of positive rows, 0 for an empty table.
    pub fn positive_rate(&self) -> f64 {
        if self.rows == 0 {
            0.0
        } else {
            self.positive_rows as f64 / self.rows as f64
        }
    }

    pub fn event_count(&self) -> usize {
        self.summaries.iter().map(|s| s.events.len()).sum()
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Build Summary (sc-risk-core {}):\n\
             - Sessions included: {}/{}\n\
             - Rows: {} ({} positive, {:.1}%)\n\
             - Intervention events: {}\n\
             - Partitions: train {}, validation {}, test {}\n\
             - Config fingerprint: {}",
            self.crate_version,
            self.sessions_included,
            self.sessions_total,
            self.rows,
            self.positive_rows,
            self.positive_rate() * 100.0,
            self.event_count(),
            self.partition_rows.get(&Partition::Train).copied().unwrap_or(0),
            self.partition_rows.get(&Partition::Validation).copied().unwrap_or(0),
            self.partition_rows.get(&Partition::Test).copied().unwrap_or(0),
            self.config_fingerprint,
        );

        if !self.excluded.is_empty() {
            out.push_str("\n\nExcluded sessions:");
            for e in &self.excluded {
                out.push_str(&format!("\n- {}: {}", e.session_id, e.reason));
            }
        }
        if !self.degraded.is_empty() {
            out.push_str("\n\nDegraded sessions:");
            for d in &self.degraded {
                let flags: Vec<String> = d.flags.iter().map(describe_flag).collect();
                out.push_str(&format!("\n- {}: {}", d.session_id, flags.join(", ")));
            }
        }
        out
    }

    /// Save the manifest as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::from)?;
        std::fs::write(path, json)
    }

    /// Load a manifest written by [`BuildManifest::save`].
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::from)
    }
}

fn describe_flag(flag: &DataQualityFlag) -> String {
    match flag {
        DataQualityFlag::MissingStream { stream } => format!("missing {stream} stream"),
        DataQualityFlag::AmbiguousMessages { count } => format!("{count} ambiguous messages"),
        DataQualityFlag::NoInterventionsDetected => "no interventions detected".to_string(),
        DataQualityFlag::UnpairedEndMarkers { count } => format!("{count} unpaired end markers"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::table::{Column, SessionTable};
    use crate::ingest::SessionMeta;
    use chrono::{Duration, TimeZone};

    fn master() -> MasterTable {
        let start = Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap();
        let mut master = MasterTable::concat(vec![SessionTable {
            session: SessionMeta::new("9158", "1229", start, start + Duration::minutes(1)),
            timestamps: vec![start, start + Duration::seconds(30), start + Duration::seconds(60)],
            labels: vec![1, 0, 0],
            time_to_event: vec![10.0, 1800.0, 1800.0],
            columns: vec![Column::numeric("x", vec![None, None, None])],
        }])
        .unwrap();
        master.partitions = Some(vec![Partition::Train; 3]);
        master
    }

    fn summary(flags: Vec<DataQualityFlag>) -> SessionSummary {
        let start = Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap();
        SessionSummary {
            session_id: "9158".into(),
            group_key: "1229".into(),
            start,
            end: start + Duration::minutes(1),
            grid_points: 3,
            positive_points: 1,
            events: Vec::new(),
            ambiguous_messages: 0,
            flags,
        }
    }

    #[test]
    fn test_manifest_counts() {
        let manifest = BuildManifest::new(
            "abc".into(),
            2,
            &master(),
            vec![summary(vec![DataQualityFlag::MissingStream {
                stream: StreamName::Weather,
            }])],
            vec![ExcludedSession {
                session_id: "9999".into(),
                reason: "bad bounds".into(),
            }],
        );

        assert!(manifest.is_complete());
        assert_eq!(manifest.rows, 3);
        assert_eq!(manifest.positive_rows, 1);
        assert_eq!(manifest.partition_rows[&Partition::Train], 3);
        assert_eq!(manifest.partition_rows[&Partition::Test], 0);
        assert_eq!(manifest.degraded.len(), 1);
    }

    #[test]
    fn test_summary_format() {
        let manifest = BuildManifest::new(
            "abc".into(),
            2,
            &master(),
            vec![summary(vec![DataQualityFlag::NoInterventionsDetected])],
            vec![ExcludedSession {
                session_id: "9999".into(),
                reason: "bad bounds".into(),
            }],
        );
        let text = manifest.summary();

        assert!(text.contains("Sessions included: 1/2"));
        assert!(text.contains("9999: bad bounds"));
        assert!(text.contains("no interventions detected"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest =
            BuildManifest::new("abc".into(), 1, &master(), vec![summary(Vec::new())], Vec::new());

        manifest.save(&path).unwrap();
        assert_eq!(BuildManifest::load(&path).unwrap(), manifest);
    }
}
