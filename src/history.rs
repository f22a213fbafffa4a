//! Consecutive-day tracking
//!
//! Keeps a bounded, ordered history of daily labels per user and derives the
//! weekly signal from it.

use std::collections::BTreeMap;

use crate::config::PipelineConfig;
use crate::error::ProcessError;
use crate::store::StateTxn;
use crate::types::{DailyLabel, DailyStepAggregate, WeeklySignal};

/// What an upsert did to the history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryUpdate {
    Overwritten,
    Inserted,
    InsertedWithEviction { evicted: i64 },
}

/// Capacity-bounded map of window start (ms) to daily label.
///
/// Eviction always removes the smallest key, regardless of arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingHistory {
    entries: BTreeMap<i64, DailyLabel>,
    capacity: usize,
}

impl RollingHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    /// Rebuild a history from persisted entries; more entries than `capacity` is an error.
    pub fn from_entries(
        user_id: &str,
        entries: BTreeMap<i64, DailyLabel>,
        capacity: usize,
    ) -> Result<Self, ProcessError> {
        if entries.len() > capacity {
            return Err(ProcessError::HistoryOverCapacity {
                user_id: user_id.to_string(),
                len: entries.len(),
                capacity,
            });
        }
        Ok(Self { entries, capacity })
    }

    pub fn entries(&self) -> &BTreeMap<i64, DailyLabel> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn upsert(&mut self, window_start_ms: i64, label: DailyLabel) -> HistoryUpdate {
        if let Some(existing) = self.entries.get_mut(&window_start_ms) {
            *existing = label;
            return HistoryUpdate::Overwritten;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_first().map(|(key, _)| key)
        } else {
            None
        };
        self.entries.insert(window_start_ms, label);

        match evicted {
            Some(evicted) => HistoryUpdate::InsertedWithEviction { evicted },
            None => HistoryUpdate::Inserted,
        }
    }

    /// Whether consecutive keys are exactly `step_ms` apart
    pub fn is_contiguous(&self, step_ms: i64) -> bool {
        self.entries
            .keys()
            .zip(self.entries.keys().skip(1))
            .all(|(a, b)| b - a == step_ms)
    }

    pub fn classify(&self, step_ms: i64) -> WeeklySignal {
        if self.entries.len() < self.capacity || !self.is_contiguous(step_ms) {
            WeeklySignal::Insufficient
        } else if self.entries.values().all(DailyLabel::is_medium_or_high) {
            WeeklySignal::MediumOrHigh
        } else {
            WeeklySignal::Low
        }
    }
}

/// Maintains each user's rolling history and weekly signal
#[derive(Debug, Clone)]
pub struct ConsecutiveDayTracker {
    depth: usize,
    step_ms: i64,
}

impl ConsecutiveDayTracker {
    /// # Arguments
    /// * `depth` - Number of days kept per user
    /// * `step_ms` - Distance between two consecutive days (the window size)
    pub fn new(depth: usize, step_ms: i64) -> Self {
        Self { depth, step_ms }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.history_depth, config.window_size().num_milliseconds())
    }

    /// Apply one aggregate update and persist the resulting history and signal.
    pub fn track(
        &self,
        txn: &StateTxn<'_>,
        aggregate: &DailyStepAggregate,
    ) -> Result<WeeklySignal, ProcessError> {
        let user_id = aggregate.user_id.as_str();
        let mut history = match txn.history(user_id)? {
            Some(entries) => RollingHistory::from_entries(user_id, entries, self.depth)?,
            None => RollingHistory::new(self.depth),
        };

        let update = history.upsert(aggregate.window_start_ms(), aggregate.label);
        if let HistoryUpdate::InsertedWithEviction { evicted } = update {
            tracing::debug!(user_id, evicted, "evicted oldest history entry");
        }

        let signal = history.classify(self.step_ms);
        txn.put_history(user_id, history.entries())?;
        txn.put_weekly_signal(user_id, signal)?;
        Ok(signal)
    }
}
