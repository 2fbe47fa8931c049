//! Core functionality for the forecasting pipeline.
//!
//! This module contains:
//! - Session time grids and causal as-of joins
//! - Intervention event detection and forward labels
//! - Trailing-window reducers and per-stream feature extraction
//! - Session assembly, master table output and group-aware splits

pub mod asof;
pub mod assembler;
pub mod features;
pub mod grid;
pub mod keywords;
pub mod labeling;
pub mod rolling;
pub mod split;
pub mod table;

// Re-export commonly used types
pub use asof::{AsOfJoiner, Boundary};
pub use assembler::{BuildOutput, FeatureAssembler, SessionOutput};
pub use features::{feature_schema, FeatureStream, StreamFeatures, StreamKind};
pub use grid::TimeGrid;
pub use keywords::{InterventionKind, KeywordSet, MessageClass, MessageClassifier};
pub use labeling::{merge_detections, EventLabeler, InterventionEvent, LabelSet, RawDetection};
pub use rolling::{RollingAggregator, WindowReducer, WindowSpan};
pub use split::{GroupFold, Partition, SplitPlan, SplitPlanner, SplitStrategy};
pub use table::{
    reconcile_schemas, Column, ColumnKind, ColumnSpec, ColumnValues, MasterTable, SessionTable,
    TableFormat,
};
