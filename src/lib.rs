//! SC Risk Core - safety car and VSC forecasting datasets from race telemetry.
//!
//! This library turns per-session record streams (incident messages,
//! weather, car positions, gaps) into a leakage-free supervised table:
//! one row per grid point, labeled with whether an intervention starts
//! within the forecast horizon.
//!
//! # Guarantees
//!
//! - **Causal features**: a feature at time `t` uses only records visible at `t`
//! - **Forward labels**: a label at `t` depends only on events starting after `t`
//! - **Group-disjoint splits**: every session of a race weekend shares one partition
//! - **Deterministic output**: identical inputs and configuration give identical tables
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SC Risk Core                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐        │
//! │  │   Ingest    │──▶│  Time Grid  │──▶│   Labels    │        │
//! │  │  (sessions) │   │  (30s step) │   │  (horizon)  │        │
//! │  └─────────────┘   └─────────────┘   └─────────────┘        │
//! │                           │                 │               │
//! │                           ▼                 ▼               │
//! │                    ┌─────────────┐   ┌─────────────┐        │
//! │                    │  Features   │──▶│  Assembler  │        │
//! │                    │ (as-of/roll)│   │  (master)   │        │
//! │                    └─────────────┘   └─────────────┘        │
//! │                                             │               │
//! │                           ┌─────────────────┴──┐            │
//! │                           ▼                    ▼            │
//! │                    ┌─────────────┐      ┌─────────────┐     │
//! │                    │    Split    │      │  Manifest   │     │
//! │                    │  (groups)   │      │  (report)   │     │
//! │                    └─────────────┘      └─────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sc_risk_core::{config::PipelineConfig, core::FeatureAssembler, ingest};
//!
//! let config = PipelineConfig::default();
//! let sessions = ingest::load_sessions(std::path::Path::new("data/sessions"))
//!     .expect("Failed to load sessions");
//!
//! let assembler = FeatureAssembler::new(&config).expect("Invalid configuration");
//! let output = assembler.build(&sessions).expect("Build failed");
//! println!("{}", output.manifest.summary());
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod ingest;
pub mod manifest;

// Re-export key types at crate root for convenience
pub use config::{ConfigError, FailurePolicy, PipelineConfig};
pub use core::{
    AsOfJoiner, Boundary, BuildOutput, EventLabeler, FeatureAssembler, InterventionEvent,
    MasterTable, Partition, RollingAggregator, SplitPlanner, TimeGrid,
};
pub use error::{PipelineError, Result};
pub use ingest::{SessionInput, SessionMeta, StreamName};
pub use manifest::{BuildManifest, DataQualityFlag, SessionSummary};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
