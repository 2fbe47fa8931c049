//! Intervention event detection and forward-horizon labels.
//!
//! ```text
//! messages ──classify──► starts / ends ──pair──► raw detections
//!                                                     │
//!                                        merge (gap < merge_gap)
//!                                                     │
//! grid points ──────────────two pointers─────────► label, time_to_event
//! ```
//!
//! Labels look forward, features look backward; the two never share state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::grid::TimeGrid;
use super::keywords::{InterventionKind, MessageClass, MessageClassifier};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::ingest::RaceControlMessage;

/// One start/end pair as read off the message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDetection {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub kind: InterventionKind,
}

/// A merged intervention interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionEvent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub kind: InterventionKind,
    /// Number of raw detections merged into this event
    pub detections: usize,
}

/// A message that names an intervention but could not be classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousMessage {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Output of the detection pass over one session's messages.
#[derive(Debug, Clone, Default)]
pub struct Detections {
    pub detections: Vec<RawDetection>,
    pub ambiguous: Vec<AmbiguousMessage>,
    /// End markers no start was paired with
    pub unpaired_ends: usize,
}

/// Labels for one session grid.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSet {
    /// 1 iff an event starts within `(t, t + horizon]`
    pub labels: Vec<u8>,
    /// Seconds to the next event start, capped
    pub time_to_event: Vec<f64>,
    pub events: Vec<InterventionEvent>,
    pub ambiguous: Vec<AmbiguousMessage>,
    pub unpaired_ends: usize,
}

impl LabelSet {
    pub fn positive_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }
}

/// Merge detections whose gap is below `merge_gap` into events.
///
/// Overlapping detections always merge. A merged event keeps the kind of
/// its earliest detection.
pub fn merge_detections(
    mut detections: Vec<RawDetection>,
    merge_gap: Duration,
) -> Vec<InterventionEvent> {
    detections.sort_by_key(|d| (d.start, d.end));

    let mut events: Vec<InterventionEvent> = Vec::with_capacity(detections.len());
    for detection in detections {
        match events.last_mut() {
            Some(current) if detection.start - current.end < merge_gap => {
                current.end = current.end.max(detection.end);
                current.detections += 1;
            }
            _ => events.push(InterventionEvent {
                start: detection.start,
                end: detection.end,
                kind: detection.kind,
                detections: 1,
            }),
        }
    }
    events
}

/// Derives events and labels from the incident message stream.
#[derive(Debug, Clone)]
pub struct EventLabeler {
    classifier: MessageClassifier,
    horizon: Duration,
    cap: Duration,
    merge_gap: Duration,
}

impl EventLabeler {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let to_chrono = |d: std::time::Duration, what: &str| {
            Duration::from_std(d)
                .map_err(|_| PipelineError::InvalidConfig(format!("{what} out of range")))
        };
        Ok(Self {
            classifier: MessageClassifier::new(&config.labels)?,
            horizon: to_chrono(config.labels.horizon, "labels.horizon")?,
            cap: to_chrono(config.labels.time_to_event_cap, "labels.time_to_event_cap")?,
            merge_gap: to_chrono(config.merge_gap(), "labels.merge_gap")?,
        })
    }

    pub fn classifier(&self) -> &MessageClassifier {
        &self.classifier
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Classify messages and pair each start with the first end marker
    /// strictly after it. Starts without an end run to `session_end`.
    /// When several starts share an end marker, each extra start extends
    /// the shared interval to the next unpaired end marker.
    ///
    /// `messages` must be time-sorted.
    pub fn detect(
        &self,
        messages: &[RaceControlMessage],
        session_end: DateTime<Utc>,
    ) -> Detections {
        let mut starts: Vec<(DateTime<Utc>, InterventionKind)> = Vec::new();
        let mut ends: Vec<DateTime<Utc>> = Vec::new();
        let mut ambiguous = Vec::new();

        for message in messages {
            match self.classifier.classify(message) {
                MessageClass::Start(kind) => starts.push((message.timestamp, kind)),
                MessageClass::End(_) => ends.push(message.timestamp),
                MessageClass::Ambiguous => {
                    let err = PipelineError::AmbiguousEventDetection {
                        timestamp: message.timestamp,
                        message: message.message.clone(),
                    };
                    warn!(error = %err, "Excluded message from event formation");
                    ambiguous.push(AmbiguousMessage {
                        timestamp: message.timestamp,
                        message: message.message.clone(),
                    });
                }
                MessageClass::Irrelevant => {}
            }
        }

        // Detections closed by each end marker
        let mut closed_by: Vec<Vec<usize>> = vec![Vec::new(); ends.len()];
        let mut cursor = 0usize;
        let mut detections = Vec::with_capacity(starts.len());
        for (start, kind) in starts {
            while cursor < ends.len() && ends[cursor] <= start {
                cursor += 1;
            }
            let end = match ends.get(cursor) {
                Some(&end) => {
                    closed_by[cursor].push(detections.len());
                    end
                }
                None => session_end.max(start),
            };
            detections.push(RawDetection { start, end, kind });
        }

        // Extra starts stacked on one end marker each take the next unpaired
        // end marker, extending the shared interval.
        let mut used: Vec<bool> = closed_by.iter().map(|c| !c.is_empty()).collect();
        let mut stacked: Option<usize> = None;
        let mut pending = 0usize;
        for (i, &end) in ends.iter().enumerate() {
            if used[i] {
                stacked = Some(i);
                pending = closed_by[i].len() - 1;
            } else if let Some(owner) = stacked.filter(|_| pending > 0) {
                for &d in &closed_by[owner] {
                    detections[d].end = end;
                }
                used[i] = true;
                pending -= 1;
            }
        }

        let unpaired_ends = used.iter().filter(|&&u| !u).count();
        if unpaired_ends > 0 {
            debug!(unpaired_ends, "End markers without a preceding start");
        }

        Detections {
            detections,
            ambiguous,
            unpaired_ends,
        }
    }

    /// Forward-looking labels for each grid point.
    ///
    /// `events` must be sorted by start. Runs in `O(grid + events)`.
    pub fn assign(
        &self,
        grid: &[DateTime<Utc>],
        events: &[InterventionEvent],
    ) -> (Vec<u8>, Vec<f64>) {
        let cap_secs = secs(self.cap);
        let mut labels = Vec::with_capacity(grid.len());
        let mut time_to_event = Vec::with_capacity(grid.len());

        // First event starting strictly after the current grid point
        let mut next = 0usize;
        for &t in grid {
            while next < events.len() && events[next].start <= t {
                next += 1;
            }
            match events.get(next) {
                Some(event) => {
                    let delta = event.start - t;
                    labels.push(u8::from(delta <= self.horizon));
                    time_to_event.push(secs(delta).min(cap_secs));
                }
                None => {
                    labels.push(0);
                    time_to_event.push(cap_secs);
                }
            }
        }

        (labels, time_to_event)
    }

    /// Detect, merge and label in one pass.
    pub fn label(
        &self,
        grid: &TimeGrid,
        messages: &[RaceControlMessage],
        session_end: DateTime<Utc>,
    ) -> LabelSet {
        let detected = self.detect(messages, session_end);
        let events = merge_detections(detected.detections, self.merge_gap);
        if events.is_empty() {
            warn!(session_id = %grid.session_id, "No intervention events detected");
        }
        let (labels, time_to_event) = self.assign(grid.points(), &events);

        LabelSet {
            labels,
            time_to_event,
            events,
            ambiguous: detected.ambiguous,
            unpaired_ends: detected.unpaired_ends,
        }
    }
}

fn secs(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}
