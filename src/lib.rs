//! Stride - Stateful step-count pipeline with debounced activity notifications
//!
//! Stride turns per-user activity events from iOS and Android devices into
//! daily step aggregates, a rolling weekly classification and debounced
//! notifications: platform adaptation → event-time windowing → consecutive-day
//! tracking → notification join and debounce.
//!
//! ## Modules
//!
//! - **Pipeline**: Per-partition processing with transactional SQLite state
//! - **Runtime**: Key-partitioned worker threads with bounded queues

pub mod adapters;
pub mod aggregator;
pub mod config;
pub mod error;
pub mod history;
pub mod notifier;
pub mod pipeline;
pub mod runtime;
pub mod schema;
pub mod sink;
pub mod store;
pub mod types;

pub use config::{ConfigError, LabelThresholds, PipelineConfig};
pub use error::ProcessError;
pub use pipeline::{normalize_record, Disposition, PartitionProcessor, ProcessOutcome};
pub use runtime::{partition_for, PartitionReport, PartitionedRuntime};
pub use schema::{LogRecord, Source};
pub use sink::{Emission, EmissionSink, FanoutSink, MemorySink, NdjsonSink, NotificationLogSink};
pub use types::{
    DailyLabel, DailyStepAggregate, NormalizedActivityEvent, NotificationRecord, WeeklySignal,
};

/// Stride version
pub const STRIDE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "stride";
