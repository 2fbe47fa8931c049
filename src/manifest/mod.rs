//! Build reporting.
//!
//! Records which sessions made it into the master table, which were
//! excluded and why, and per-session event summaries for review.

pub mod report;

// Re-export commonly used types
pub use report::{BuildManifest, DataQualityFlag, DegradedSession, ExcludedSession, SessionSummary};
