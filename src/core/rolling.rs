//! Trailing-window reductions evaluated at every grid point.
//!
//! One shared end cursor admits records as the grid advances; each window
//! owns a start cursor that evicts records older than `t - w`. Reducers see
//! every record exactly once on insert and once on removal, so the total
//! work is `O(windows * (grid + records))` instead of rescanning each window.
//!
//! ```text
//! records  ─────[ . . . . . . . . . . ]──────────────►
//!                 ▲start(w=600)   ▲start(w=60)    ▲end (visible at t)
//! ```

use chrono::{DateTime, Duration, Utc};
use statrs::statistics::Statistics;
use std::collections::VecDeque;

use super::asof::Boundary;
use crate::ingest::Timestamped;

/// Half-open range `[start, end)` of record indices inside one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpan {
    pub start: usize,
    pub end: usize,
}

impl WindowSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

/// Incremental state for one window.
///
/// `insert` is called with strictly increasing indices, and `remove` with
/// strictly increasing indices that were previously inserted.
pub trait WindowReducer {
    type Output;

    fn insert(&mut self, index: usize);

    fn remove(&mut self, index: usize);

    fn emit(&mut self, span: WindowSpan) -> Self::Output;
}

/// Runs reducers over a set of trailing windows.
#[derive(Debug, Clone)]
pub struct RollingAggregator {
    windows: Vec<Duration>,
    boundary: Boundary,
}

impl RollingAggregator {
    /// `windows_secs` are trailing window lengths in seconds.
    pub fn new(windows_secs: &[u64], boundary: Boundary) -> Self {
        Self {
            windows: windows_secs
                .iter()
                .map(|&w| Duration::seconds(w as i64))
                .collect(),
            boundary,
        }
    }

    pub fn windows(&self) -> &[Duration] {
        &self.windows
    }

    /// Evaluate one reducer per window at every grid point.
    ///
    /// Returns `out[window][grid_index]`. `records` must be time-sorted.
    pub fn run<T, R, F>(
        &self,
        grid: &[DateTime<Utc>],
        records: &[T],
        mut make: F,
    ) -> Vec<Vec<R::Output>>
    where
        T: Timestamped,
        R: WindowReducer,
        F: FnMut() -> R,
    {
        debug_assert!(crate::ingest::is_time_sorted(records));

        let mut states: Vec<R> = self.windows.iter().map(|_| make()).collect();
        let mut starts = vec![0usize; self.windows.len()];
        let mut out: Vec<Vec<R::Output>> = self
            .windows
            .iter()
            .map(|_| Vec::with_capacity(grid.len()))
            .collect();
        let mut end = 0usize;

        for &t in grid {
            while end < records.len() && self.boundary.admits(records[end].timestamp(), t) {
                for state in states.iter_mut() {
                    state.insert(end);
                }
                end += 1;
            }

            for (w, window) in self.windows.iter().enumerate() {
                let lower = t - *window;
                let state = &mut states[w];
                let start = &mut starts[w];
                while *start < end && records[*start].timestamp() <= lower {
                    state.remove(*start);
                    *start += 1;
                }
                out[w].push(state.emit(WindowSpan { start: *start, end }));
            }
        }

        out
    }

    /// Record counts per window and grid point.
    pub fn counts<T: Timestamped>(&self, grid: &[DateTime<Utc>], records: &[T]) -> Vec<Vec<usize>> {
        self.run(grid, records, || Count)
    }
}

/// Number of records in the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl WindowReducer for Count {
    type Output = usize;

    fn insert(&mut self, _index: usize) {}

    fn remove(&mut self, _index: usize) {}

    fn emit(&mut self, span: WindowSpan) -> usize {
        span.len()
    }
}

/// Category diversity of the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryStats {
    /// Shannon entropy in bits; 0 for an empty window
    pub entropy: f64,
    pub unique: usize,
}

/// Running category histogram over interned category ids.
#[derive(Debug, Clone)]
pub struct CategoryMix<'a> {
    ids: &'a [usize],
    counts: Vec<usize>,
    total: usize,
    unique: usize,
}

impl<'a> CategoryMix<'a> {
    /// `ids[i]` is the interned category of record `i`, below `cardinality`.
    pub fn new(ids: &'a [usize], cardinality: usize) -> Self {
        Self {
            ids,
            counts: vec![0; cardinality],
            total: 0,
            unique: 0,
        }
    }
}

impl WindowReducer for CategoryMix<'_> {
    type Output = CategoryStats;

    fn insert(&mut self, index: usize) {
        let slot = &mut self.counts[self.ids[index]];
        if *slot == 0 {
            self.unique += 1;
        }
        *slot += 1;
        self.total += 1;
    }

    fn remove(&mut self, index: usize) {
        let slot = &mut self.counts[self.ids[index]];
        *slot -= 1;
        if *slot == 0 {
            self.unique -= 1;
        }
        self.total -= 1;
    }

    fn emit(&mut self, _span: WindowSpan) -> CategoryStats {
        if self.total == 0 {
            return CategoryStats {
                entropy: 0.0,
                unique: 0,
            };
        }
        let total = self.total as f64;
        let entropy = self
            .counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f64 / total;
                -p * p.log2()
            })
            .sum::<f64>();
        CategoryStats {
            // -0.0 for a single category
            entropy: entropy.abs(),
            unique: self.unique,
        }
    }
}

/// Which keyword flags occur anywhere in the window.
#[derive(Debug, Clone)]
pub struct KeywordPresence<'a> {
    masks: &'a [u64],
    counts: [u32; 64],
}

impl<'a> KeywordPresence<'a> {
    pub fn new(masks: &'a [u64]) -> Self {
        Self {
            masks,
            counts: [0; 64],
        }
    }

    fn apply(&mut self, index: usize, add: bool) {
        let mut mask = self.masks[index];
        while mask != 0 {
            let bit = mask.trailing_zeros() as usize;
            if add {
                self.counts[bit] += 1;
            } else {
                self.counts[bit] -= 1;
            }
            mask &= mask - 1;
        }
    }
}

impl WindowReducer for KeywordPresence<'_> {
    type Output = u64;

    fn insert(&mut self, index: usize) {
        self.apply(index, true);
    }

    fn remove(&mut self, index: usize) {
        self.apply(index, false);
    }

    fn emit(&mut self, _span: WindowSpan) -> u64 {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .fold(0u64, |mask, (bit, _)| mask | (1 << bit))
    }
}

/// Summary statistics of a numeric window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericSummary {
    pub count: usize,
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    /// Last value minus the first value in the window
    pub delta: f64,
}

/// Max/min via monotonic deques, mean/std via shifted running sums.
#[derive(Debug, Clone)]
pub struct NumericWindow<'a> {
    values: &'a [f64],
    shift: f64,
    maxima: VecDeque<usize>,
    minima: VecDeque<usize>,
    sum: f64,
    sum_sq: f64,
    count: usize,
}

impl<'a> NumericWindow<'a> {
    pub fn new(values: &'a [f64]) -> Self {
        Self {
            values,
            shift: values.first().copied().unwrap_or(0.0),
            maxima: VecDeque::new(),
            minima: VecDeque::new(),
            sum: 0.0,
            sum_sq: 0.0,
            count: 0,
        }
    }
}

impl WindowReducer for NumericWindow<'_> {
    type Output = Option<NumericSummary>;

    fn insert(&mut self, index: usize) {
        let value = self.values[index];
        while self.maxima.back().is_some_and(|&i| self.values[i] <= value) {
            self.maxima.pop_back();
        }
        self.maxima.push_back(index);
        while self.minima.back().is_some_and(|&i| self.values[i] >= value) {
            self.minima.pop_back();
        }
        self.minima.push_back(index);

        let shifted = value - self.shift;
        self.sum += shifted;
        self.sum_sq += shifted * shifted;
        self.count += 1;
    }

    fn remove(&mut self, index: usize) {
        if self.maxima.front() == Some(&index) {
            self.maxima.pop_front();
        }
        if self.minima.front() == Some(&index) {
            self.minima.pop_front();
        }
        self.count -= 1;
        if self.count == 0 {
            self.sum = 0.0;
            self.sum_sq = 0.0;
        } else {
            let shifted = self.values[index] - self.shift;
            self.sum -= shifted;
            self.sum_sq -= shifted * shifted;
        }
    }

    fn emit(&mut self, span: WindowSpan) -> Option<NumericSummary> {
        let (&max_idx, &min_idx) = (self.maxima.front()?, self.minima.front()?);
        let n = self.count as f64;
        let mean_shifted = self.sum / n;
        let variance = (self.sum_sq / n - mean_shifted * mean_shifted).max(0.0);
        Some(NumericSummary {
            count: self.count,
            max: self.values[max_idx],
            min: self.values[min_idx],
            mean: mean_shifted + self.shift,
            std: variance.sqrt(),
            delta: self.values[span.end - 1] - self.values[span.start],
        })
    }
}

/// Per-record links between consecutive reports of the same entity.
///
/// Built once per stream so windowed reducers can ask "is the previous
/// report of this entity still inside the window?" in O(1).
#[derive(Debug, Clone, Default)]
pub struct EntityLinks {
    /// Dense entity slot per record
    pub slots: Vec<usize>,
    pub prev: Vec<Option<usize>>,
    pub next: Vec<Option<usize>>,
    pub entities: usize,
}

impl EntityLinks {
    /// `keys[i]` identifies the entity of record `i`. Slots are assigned in
    /// ascending key order so results do not depend on arrival order.
    pub fn build(keys: &[u32]) -> Self {
        let mut distinct: Vec<u32> = keys.to_vec();
        distinct.sort_unstable();
        distinct.dedup();

        let slots: Vec<usize> = keys
            .iter()
            .map(|k| distinct.binary_search(k).unwrap_or_default())
            .collect();

        let mut last_seen: Vec<Option<usize>> = vec![None; distinct.len()];
        let mut prev = vec![None; keys.len()];
        let mut next = vec![None; keys.len()];
        for (i, &slot) in slots.iter().enumerate() {
            if let Some(p) = last_seen[slot] {
                prev[i] = Some(p);
                next[p] = Some(i);
            }
            last_seen[slot] = Some(i);
        }

        Self {
            slots,
            prev,
            next,
            entities: distinct.len(),
        }
    }
}

/// Position churn inside the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeStats {
    /// Consecutive same-driver report pairs whose position differs
    pub changes: usize,
    /// Mean over drivers of the mean absolute position delta; `None`
    /// when no driver has two reports in the window
    pub volatility: Option<f64>,
}

/// Counts position changes between report pairs fully inside the window.
#[derive(Debug, Clone)]
pub struct PositionChanges<'a> {
    links: &'a EntityLinks,
    /// `|pos[i] - pos[prev[i]]|`, 0 without a previous report
    deltas: &'a [f64],
    start: usize,
    end: usize,
    changes: usize,
    driver_sum: Vec<f64>,
    driver_pairs: Vec<usize>,
    active: usize,
}

impl<'a> PositionChanges<'a> {
    pub fn new(links: &'a EntityLinks, deltas: &'a [f64]) -> Self {
        Self {
            links,
            deltas,
            start: 0,
            end: 0,
            changes: 0,
            driver_sum: vec![0.0; links.entities],
            driver_pairs: vec![0; links.entities],
            active: 0,
        }
    }

    fn add_pair(&mut self, later: usize) {
        let slot = self.links.slots[later];
        let delta = self.deltas[later];
        if delta > 0.0 {
            self.changes += 1;
        }
        if self.driver_pairs[slot] == 0 {
            self.active += 1;
        }
        self.driver_pairs[slot] += 1;
        self.driver_sum[slot] += delta;
    }

    fn drop_pair(&mut self, later: usize) {
        let slot = self.links.slots[later];
        let delta = self.deltas[later];
        if delta > 0.0 {
            self.changes -= 1;
        }
        self.driver_pairs[slot] -= 1;
        if self.driver_pairs[slot] == 0 {
            self.active -= 1;
            self.driver_sum[slot] = 0.0;
        } else {
            self.driver_sum[slot] -= delta;
        }
    }
}

impl WindowReducer for PositionChanges<'_> {
    type Output = ChangeStats;

    fn insert(&mut self, index: usize) {
        self.end = index + 1;
        if self.links.prev[index].is_some_and(|p| p >= self.start) {
            self.add_pair(index);
        }
    }

    fn remove(&mut self, index: usize) {
        self.start = index + 1;
        if let Some(later) = self.links.next[index].filter(|&k| k < self.end) {
            self.drop_pair(later);
        }
    }

    fn emit(&mut self, _span: WindowSpan) -> ChangeStats {
        let volatility = (self.active > 0).then(|| {
            let total: f64 = self
                .driver_pairs
                .iter()
                .zip(&self.driver_sum)
                .filter(|(&n, _)| n > 0)
                .map(|(&n, &sum)| sum / n as f64)
                .sum();
            total / self.active as f64
        });
        ChangeStats {
            changes: self.changes,
            volatility,
        }
    }
}

/// Field spread statistics from the latest report of each driver.
#[derive(Debug, Clone, PartialEq)]
pub struct PackStats {
    /// Sample standard deviation of gap-to-leader; needs two drivers
    pub gap_std: Option<f64>,
    /// Share of drivers within each interval threshold of the car ahead
    pub density: Vec<Option<f64>>,
}

/// Tracks the latest in-window report per driver.
#[derive(Debug, Clone)]
pub struct LatestPerEntity<'a> {
    links: &'a EntityLinks,
    gaps: &'a [Option<f64>],
    intervals: &'a [Option<f64>],
    thresholds: &'a [f64],
    latest: Vec<Option<usize>>,
    in_window: Vec<usize>,
    // Scratch reused across emits
    gap_values: Vec<f64>,
    interval_values: Vec<f64>,
}

impl<'a> LatestPerEntity<'a> {
    pub fn new(
        links: &'a EntityLinks,
        gaps: &'a [Option<f64>],
        intervals: &'a [Option<f64>],
        thresholds: &'a [f64],
    ) -> Self {
        Self {
            links,
            gaps,
            intervals,
            thresholds,
            latest: vec![None; links.entities],
            in_window: vec![0; links.entities],
            gap_values: Vec::with_capacity(links.entities),
            interval_values: Vec::with_capacity(links.entities),
        }
    }
}

impl WindowReducer for LatestPerEntity<'_> {
    type Output = PackStats;

    fn insert(&mut self, index: usize) {
        let slot = self.links.slots[index];
        self.in_window[slot] += 1;
        self.latest[slot] = Some(index);
    }

    fn remove(&mut self, index: usize) {
        let slot = self.links.slots[index];
        self.in_window[slot] -= 1;
        if self.in_window[slot] == 0 {
            self.latest[slot] = None;
        }
    }

    fn emit(&mut self, _span: WindowSpan) -> PackStats {
        self.gap_values.clear();
        self.interval_values.clear();
        for &i in self.latest.iter().flatten() {
            self.gap_values.extend(self.gaps[i]);
            self.interval_values.extend(self.intervals[i]);
        }

        let gap_std = (self.gap_values.len() >= 2).then(|| self.gap_values.iter().std_dev());

        let intervals = &self.interval_values;
        let density = self
            .thresholds
            .iter()
            .map(|&threshold| {
                (!intervals.is_empty()).then(|| {
                    let close = intervals.iter().filter(|&&v| v < threshold).count();
                    close as f64 / intervals.len() as f64
                })
            })
            .collect();

        PackStats { gap_std, density }
    }
}

/// Concatenated text of the records in the window.
#[derive(Debug, Clone)]
pub struct TextConcat<'a> {
    texts: &'a [&'a str],
    separator: &'a str,
}

impl<'a> TextConcat<'a> {
    pub fn new(texts: &'a [&'a str], separator: &'a str) -> Self {
        Self { texts, separator }
    }
}

impl WindowReducer for TextConcat<'_> {
    type Output = Option<String>;

    fn insert(&mut self, _index: usize) {}

    fn remove(&mut self, _index: usize) {}

    fn emit(&mut self, span: WindowSpan) -> Option<String> {
        (!span.is_empty()).then(|| self.texts[span.range()].join(self.separator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::RaceControlMessage;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        base() + Duration::seconds(secs)
    }

    fn stream(offsets: &[i64]) -> Vec<RaceControlMessage> {
        offsets
            .iter()
            .map(|&s| RaceControlMessage::new(at(s), format!("m{s}")))
            .collect()
    }

    /// Direct recount used to cross-check the incremental engine.
    fn brute_count(grid: &[DateTime<Utc>], records: &[RaceControlMessage], w: i64) -> Vec<usize> {
        grid.iter()
            .map(|&t| {
                records
                    .iter()
                    .filter(|r| r.timestamp <= t && r.timestamp > t - Duration::seconds(w))
                    .count()
            })
            .collect()
    }

    #[test]
    fn test_window_excludes_left_edge() {
        let records = stream(&[10, 20, 30]);
        let grid = vec![at(35)];
        // (20, 35] holds only the record at 30
        let counts = RollingAggregator::new(&[15, 16], Boundary::Inclusive).counts(&grid, &records);
        assert_eq!(counts, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_strict_boundary_excludes_current_instant() {
        let records = stream(&[10, 20, 30]);
        let grid = vec![at(30)];
        let inclusive = RollingAggregator::new(&[60], Boundary::Inclusive).counts(&grid, &records);
        let strict = RollingAggregator::new(&[60], Boundary::Strict).counts(&grid, &records);
        assert_eq!(inclusive[0][0], 3);
        assert_eq!(strict[0][0], 2);
    }

    #[test]
    fn test_counts_match_brute_force() {
        let records = stream(&[0, 5, 5, 17, 42, 43, 44, 90, 200, 201, 260]);
        let grid: Vec<_> = (0..12).map(|i| at(i * 25)).collect();
        let aggregator = RollingAggregator::new(&[10, 60, 180], Boundary::Inclusive);
        let counts = aggregator.counts(&grid, &records);

        assert_eq!(counts[0], brute_count(&grid, &records, 10));
        assert_eq!(counts[1], brute_count(&grid, &records, 60));
        assert_eq!(counts[2], brute_count(&grid, &records, 180));
    }

    #[test]
    fn test_category_entropy() {
        let records = stream(&[0, 1, 2, 3]);
        let ids = [0, 0, 1, 1];
        let out = RollingAggregator::new(&[60], Boundary::Inclusive)
            .run(&[at(0), at(3)], &records, || CategoryMix::new(&ids, 2));

        assert_eq!(out[0][0].entropy, 0.0);
        assert_eq!(out[0][0].unique, 1);
        assert!((out[0][1].entropy - 1.0).abs() < 1e-12);
        assert_eq!(out[0][1].unique, 2);
    }

    #[test]
    fn test_empty_window_entropy_is_zero() {
        let records = stream(&[0]);
        let ids = [0];
        let out = RollingAggregator::new(&[10], Boundary::Inclusive)
            .run(&[at(100)], &records, || CategoryMix::new(&ids, 1));
        assert_eq!(out[0][0], CategoryStats { entropy: 0.0, unique: 0 });
    }

    #[test]
    fn test_keyword_presence_expires() {
        let records = stream(&[0, 50]);
        let masks = [0b01, 0b10];
        let out = RollingAggregator::new(&[60], Boundary::Inclusive)
            .run(&[at(55), at(65)], &records, || KeywordPresence::new(&masks));
        assert_eq!(out[0], vec![0b11, 0b10]);
    }

    #[test]
    fn test_numeric_window_summary() {
        let records = stream(&[0, 10, 20, 30]);
        let values = [20.0, 24.0, 22.0, 30.0];
        let out = RollingAggregator::new(&[25], Boundary::Inclusive)
            .run(&[at(20), at(30), at(100)], &records, || NumericWindow::new(&values));

        let first = out[0][0].unwrap();
        assert_eq!(first.count, 3);
        assert_eq!(first.max, 24.0);
        assert_eq!(first.min, 20.0);
        assert!((first.mean - 22.0).abs() < 1e-9);
        assert_eq!(first.delta, 2.0);

        let second = out[0][1].unwrap();
        assert_eq!(second.count, 3);
        assert_eq!(second.max, 30.0);
        assert_eq!(second.min, 22.0);
        assert_eq!(second.delta, 6.0);

        assert!(out[0][2].is_none());
    }

    #[test]
    fn test_position_changes_need_both_reports_in_window() {
        // Driver 1 moves 3 -> 1 at t=40, driver 2 holds position
        let records = stream(&[0, 0, 40, 40]);
        let drivers = [1, 2, 1, 2];
        let positions: [f64; 4] = [3.0, 2.0, 1.0, 2.0];
        let links = EntityLinks::build(&drivers);
        let deltas: Vec<f64> = (0..positions.len())
            .map(|i| links.prev[i].map_or(0.0, |p| (positions[i] - positions[p]).abs()))
            .collect();

        let aggregator = RollingAggregator::new(&[30, 60], Boundary::Inclusive);
        let out = aggregator.run(&[at(40)], &records, || PositionChanges::new(&links, &deltas));

        // 30 s window holds only the later reports: no complete pair
        assert_eq!(out[0][0].changes, 0);
        assert_eq!(out[0][0].volatility, None);
        // 60 s window holds both pairs
        assert_eq!(out[1][0].changes, 1);
        assert_eq!(out[1][0].volatility, Some(1.0));
    }

    #[test]
    fn test_latest_per_entity_pack_stats() {
        let records = stream(&[0, 0, 0, 10]);
        let drivers = [1, 2, 3, 1];
        let gaps = [Some(0.0), Some(1.0), Some(5.0), Some(0.0)];
        let intervals = [None, Some(1.0), Some(4.0), None];
        let thresholds = [1.5, 3.0, 5.0];
        let links = EntityLinks::build(&drivers);

        let out = RollingAggregator::new(&[60], Boundary::Inclusive).run(&[at(10)], &records, || {
            LatestPerEntity::new(&links, &gaps, &intervals, &thresholds)
        });

        let stats = &out[0][0];
        let expected_std = [0.0f64, 1.0, 5.0].iter().std_dev();
        assert!((stats.gap_std.unwrap() - expected_std).abs() < 1e-12);
        assert_eq!(stats.density, vec![Some(0.5), Some(0.5), Some(1.0)]);
    }

    #[test]
    fn test_pack_stats_forget_drivers_leaving_the_window() {
        let records = stream(&[0, 0, 0, 50]);
        let drivers = [1, 2, 3, 1];
        let gaps = [Some(0.0), Some(1.0), Some(5.0), Some(0.0)];
        let intervals = [None, Some(1.0), Some(4.0), None];
        let thresholds = [1.5];
        let links = EntityLinks::build(&drivers);

        let grid = [at(0), at(50), at(100)];
        let out = RollingAggregator::new(&[30], Boundary::Inclusive).run(&grid, &records, || {
            LatestPerEntity::new(&links, &gaps, &intervals, &thresholds)
        });

        assert!(out[0][0].gap_std.is_some());
        assert_eq!(out[0][0].density, vec![Some(0.5)]);
        // Only driver 1 reported in (20, 50]
        assert_eq!(out[0][1], PackStats { gap_std: None, density: vec![None] });
        assert_eq!(out[0][2], PackStats { gap_std: None, density: vec![None] });
    }

    #[test]
    fn test_text_concat() {
        let records = stream(&[0, 10, 20]);
        let texts = ["A", "B", "C"];
        let out = RollingAggregator::new(&[15], Boundary::Inclusive)
            .run(&[at(20), at(60)], &records, || TextConcat::new(&texts, " | "));
        assert_eq!(out[0], vec![Some("B | C".to_string()), None]);
    }
}
