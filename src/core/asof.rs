//! Causal as-of join: the latest record at or before each grid point.
//!
//! The join walks the grid and the time-sorted stream together with one
//! forward-only cursor, so it is linear in grid size plus stream size.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::Timestamped;

/// Which records count as "known" at grid time `t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    /// Records with `timestamp <= t`; rolling windows are `(t - w, t]`
    #[default]
    Inclusive,
    /// Records with `timestamp < t`; rolling windows are `(t - w, t)`
    Strict,
}

impl Boundary {
    /// Whether a record at `timestamp` is visible at grid time `t`.
    #[inline]
    pub fn admits(self, timestamp: DateTime<Utc>, t: DateTime<Utc>) -> bool {
        match self {
            Boundary::Inclusive => timestamp <= t,
            Boundary::Strict => timestamp < t,
        }
    }
}

/// Attaches the most recent visible record of a stream to each grid point.
#[derive(Debug, Clone, Copy)]
pub struct AsOfJoiner {
    boundary: Boundary,
    tolerance: Option<Duration>,
}

impl AsOfJoiner {
    pub fn new(boundary: Boundary) -> Self {
        Self {
            boundary,
            tolerance: None,
        }
    }

    /// Treat matches older than `tolerance` as "no data yet".
    pub fn with_tolerance(mut self, tolerance: Option<Duration>) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn boundary(&self) -> Boundary {
        self.boundary
    }

    /// For each grid point, the index of the matching record in `records`.
    ///
    /// `None` is the "no data yet" sentinel: no record is visible (or the
    /// latest one is older than the tolerance). `records` must be sorted by
    /// timestamp; among equal timestamps the last one wins.
    pub fn join<T: Timestamped>(
        &self,
        grid: &[DateTime<Utc>],
        records: &[T],
    ) -> Vec<Option<usize>> {
        debug_assert!(crate::ingest::is_time_sorted(records));

        let mut matches = Vec::with_capacity(grid.len());
        // Number of records visible so far; the match is `cursor - 1`.
        let mut cursor = 0usize;

        for &t in grid {
            while cursor < records.len() && self.boundary.admits(records[cursor].timestamp(), t) {
                cursor += 1;
            }

            let matched = cursor.checked_sub(1).filter(|&idx| match self.tolerance {
                Some(tolerance) => t - records[idx].timestamp() <= tolerance,
                None => true,
            });
            matches.push(matched);
        }

        matches
    }

    /// Seconds elapsed since the matched record, or `None` without a match.
    pub fn age_secs<T: Timestamped>(
        grid: &[DateTime<Utc>],
        records: &[T],
        matches: &[Option<usize>],
    ) -> Vec<Option<f64>> {
        grid.iter()
            .zip(matches)
            .map(|(&t, matched)| {
                matched.map(|idx| (t - records[idx].timestamp()).num_milliseconds() as f64 / 1000.0)
            })
            .collect()
    }
}
