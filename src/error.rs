//! Error types for the timeline and feature pipeline.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::split::Partition;
use crate::core::table::ColumnKind;
use crate::ingest::StreamName;

/// Errors raised while building grids, labels and feature tables.
///
/// `AmbiguousEventDetection` and `MissingUpstreamData` are never returned
/// from the pipeline; they are recorded as data-quality flags on the
/// affected session and only exist here so they share one vocabulary.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("session {session_id}: bounds {start} to {end} rejected: {reason}")]
    InvalidSessionBounds {
        session_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reason: String,
    },

    #[error("ambiguous intervention message at {timestamp}: {message:?}")]
    AmbiguousEventDetection {
        timestamp: DateTime<Utc>,
        message: String,
    },

    #[error(
        "schema mismatch on column {column}: {expected} in session {expected_session}, \
         {found} in session {found_session}"
    )]
    SchemaMismatch {
        column: String,
        expected: ColumnKind,
        expected_session: String,
        found: ColumnKind,
        found_session: String,
    },

    #[error("group {group} is present in partitions {partitions:?}")]
    GroupLeakage {
        group: String,
        partitions: Vec<Partition>,
    },

    #[error("session {session_id} has no {stream} stream")]
    MissingUpstreamData {
        session_id: String,
        stream: StreamName,
    },

    #[error("session id {0} appears more than once")]
    DuplicateSession(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no sessions survived the build")]
    EmptyBuild,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether this error is confined to a single session and may be
    /// isolated by excluding that session from the build.
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidSessionBounds { .. }
                | PipelineError::AmbiguousEventDetection { .. }
                | PipelineError::MissingUpstreamData { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_scope_classification() {
        let start = Utc::now();
        let bounds = PipelineError::InvalidSessionBounds {
            session_id: "9158".to_string(),
            start,
            end: start,
            reason: "end is not after start".to_string(),
        };
        assert!(bounds.is_session_scoped());

        let leakage = PipelineError::GroupLeakage {
            group: "1229".to_string(),
            partitions: vec![Partition::Train, Partition::Test],
        };
        assert!(!leakage.is_session_scoped());
        assert!(leakage.to_string().contains("1229"));
    }
}
