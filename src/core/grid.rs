//! Fixed-cadence causal timeline for one session.
//!
//! Grid points are `start, start + step, ...` up to the session end. When
//! the duration is not a whole number of steps, one more point closes the
//! final partial step so the whole session is covered.

use chrono::{DateTime, Duration, Utc};

use crate::config::GridConfig;
use crate::error::{PipelineError, Result};
use crate::ingest::SessionMeta;

/// The ordered grid timestamps of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeGrid {
    /// Session this grid belongs to
    pub session_id: String,
    /// Spacing between points
    pub step: Duration,
    /// Ascending grid timestamps
    points: Vec<DateTime<Utc>>,
}

impl TimeGrid {
    /// Build the grid for a session.
    pub fn build(session: &SessionMeta, config: &GridConfig) -> Result<Self> {
        Self::bounded(
            &session.session_id,
            session.start,
            session.end,
            config.step,
            config.max_points,
        )
    }

    /// Build a grid covering `[start, end]` under the default point limit.
    pub fn from_bounds(
        session_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: std::time::Duration,
    ) -> Result<Self> {
        Self::bounded(session_id, start, end, step, GridConfig::default().max_points)
    }

    /// Build a grid covering `[start, end]` with at most `max_points` points.
    ///
    /// Fails with `InvalidSessionBounds` if `end <= start`, if the grid
    /// would exceed `max_points`, or if a point falls outside the
    /// representable time range.
    pub fn bounded(
        session_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: std::time::Duration,
        max_points: usize,
    ) -> Result<Self> {
        let rejected = |reason: String| PipelineError::InvalidSessionBounds {
            session_id: session_id.to_string(),
            start,
            end,
            reason,
        };
        if end <= start {
            return Err(rejected("end is not after start".into()));
        }
        let step = Duration::from_std(step)
            .ok()
            .filter(|s| *s > Duration::zero())
            .ok_or_else(|| PipelineError::InvalidConfig("grid step must be positive".into()))?;

        let span_ms = (end - start).num_milliseconds();
        let step_ms = step.num_milliseconds().max(1);
        let steps = span_ms / step_ms + i64::from(span_ms % step_ms != 0);
        let needed = usize::try_from(steps)
            .ok()
            .and_then(|n| n.checked_add(1))
            .filter(|&n| n <= max_points)
            .ok_or_else(|| rejected(format!("grid would exceed {max_points} points")))?;

        let mut points = Vec::with_capacity(needed);
        let mut t = start;
        loop {
            points.push(t);
            if t >= end {
                break;
            }
            // Past the end only when closing the final partial step
            t = t
                .checked_add_signed(step)
                .ok_or_else(|| rejected("grid runs past the representable time range".into()))?;
        }

        Ok(Self {
            session_id: session_id.to_string(),
            step,
            points,
        })
    }

    /// Grid timestamps in ascending order.
    pub fn points(&self) -> &[DateTime<Utc>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<DateTime<Utc>> {
        self.points.first().copied()
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.points.last().copied()
    }

    /// Position of an exact grid timestamp.
    pub fn index_of(&self, t: DateTime<Utc>) -> Option<usize> {
        self.points.binary_search(&t).ok()
    }

    /// Seconds from the grid start, handy for reporting.
    pub fn offsets_secs(&self) -> Vec<i64> {
        match self.first() {
            Some(start) => self.points.iter().map(|&t| (t - start).num_seconds()).collect(),
            None => Vec::new(),
        }
    }
}
