//! Windowed daily aggregation
//!
//! Steps accumulate per user into epoch-aligned tumbling windows. A window
//! stays open for its size plus a grace period, measured against the user's
//! stream time (the largest event time seen for that user). Events for a
//! window that has already closed are dropped.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::debug;

use crate::config::{LabelThresholds, PipelineConfig};
use crate::error::ProcessError;
use crate::store::StateTxn;
use crate::types::{DailyLabel, DailyStepAggregate, NormalizedActivityEvent};

/// Tumbling window geometry in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    size_ms: i64,
    grace_ms: i64,
}

impl WindowSpec {
    pub fn new(size: Duration, grace: Duration) -> Self {
        Self {
            size_ms: size.num_milliseconds().max(1),
            grace_ms: grace.num_milliseconds().max(0),
        }
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Start of the window containing `ts_ms`, aligned to the epoch
    pub fn window_start(&self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.size_ms)
    }

    /// Whether a window no longer accepts events at `stream_time_ms`
    pub fn is_closed(&self, window_start_ms: i64, stream_time_ms: i64) -> bool {
        window_start_ms
            .saturating_add(self.size_ms)
            .saturating_add(self.grace_ms)
            <= stream_time_ms
    }

    /// Latest window start that is closed at `stream_time_ms`
    pub fn retired_before(&self, stream_time_ms: i64) -> i64 {
        stream_time_ms
            .saturating_sub(self.size_ms)
            .saturating_sub(self.grace_ms)
    }
}

/// Result of feeding one event to the aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    /// The window was created or updated
    Updated(DailyStepAggregate),
    /// The event's window closed before it arrived
    Late { window_start_ms: i64 },
}

/// Per-user daily step aggregator
#[derive(Debug, Clone)]
pub struct WindowedAggregator {
    spec: WindowSpec,
    thresholds: LabelThresholds,
}

impl WindowedAggregator {
    pub fn new(spec: WindowSpec, thresholds: LabelThresholds) -> Self {
        Self { spec, thresholds }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            WindowSpec::new(config.window_size(), config.window_grace()),
            config.labels,
        )
    }

    pub fn spec(&self) -> &WindowSpec {
        &self.spec
    }

    /// Add one event's steps to its window.
    ///
    /// Advances the user's stream time. A window start that cannot be
    /// represented is reported before anything is written.
    pub fn aggregate(
        &self,
        txn: &StateTxn<'_>,
        user_id: &str,
        event: &NormalizedActivityEvent,
    ) -> Result<WindowOutcome, ProcessError> {
        if event.steps < 0 {
            return Err(ProcessError::NegativeSteps {
                user_id: user_id.to_string(),
                steps: event.steps,
            });
        }

        let ts_ms = event.timestamp.timestamp_millis();
        let window_start_ms = self.spec.window_start(ts_ms);
        let window_start = window_start_time(window_start_ms)?;

        let previous = txn.stream_time(user_id)?;
        let stream_time_ms = previous.map_or(ts_ms, |t| t.max(ts_ms));
        if previous != Some(stream_time_ms) {
            txn.put_stream_time(user_id, stream_time_ms)?;
        }

        if self.spec.is_closed(window_start_ms, stream_time_ms) {
            debug!(
                user_id,
                window_start_ms, stream_time_ms, "dropping event for closed window"
            );
            return Ok(WindowOutcome::Late { window_start_ms });
        }

        let current = txn.window_steps(user_id, window_start_ms)?.unwrap_or(0);
        let steps = u32::try_from(event.steps)
            .ok()
            .and_then(|increment| current.checked_add(increment))
            .ok_or_else(|| ProcessError::StepOverflow {
                user_id: user_id.to_string(),
                window_start_ms,
                current,
                increment: event.steps,
            })?;

        let aggregate = DailyStepAggregate {
            user_id: user_id.to_string(),
            steps,
            window_start,
            label: DailyLabel::classify(steps, &self.thresholds),
        };

        txn.put_window(&aggregate)?;
        txn.put_latest(&aggregate)?;

        let purged = txn.purge_windows(user_id, self.spec.retired_before(stream_time_ms))?;
        if purged > 0 {
            debug!(user_id, purged, stream_time_ms, "retired closed windows");
        }

        Ok(WindowOutcome::Updated(aggregate))
    }
}

fn window_start_time(ms: i64) -> Result<DateTime<Utc>, ProcessError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(ProcessError::TimestampOutOfRange(ms))
}
