//! Input contract with the ingestion collaborator.
//!
//! Raw acquisition (retries, rate limits, caching) happens upstream; this
//! module only defines the per-session record sets and reads them from disk.

pub mod loader;
pub mod types;

// Re-export commonly used types
pub use loader::{load_session_file, load_sessions, IngestError};
pub use types::{
    is_time_sorted, sort_by_time, IntervalReading, PositionReading, RaceControlMessage,
    SessionInput, SessionMeta, StreamName, Timestamped, WeatherChannel, WeatherReading,
};
