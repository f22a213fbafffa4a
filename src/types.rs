//! Core types for the Stride pipeline
//!
//! This module defines the records that flow between the stages: the
//! normalized activity event, the daily step aggregate, the weekly signal and
//! the notification record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::LabelThresholds;

/// Canonical activity event, independent of the originating platform.
///
/// `timestamp` is event time and drives every windowing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedActivityEvent {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    pub steps: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pincode: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Daily step classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DailyLabel {
    Low,
    Medium,
    High,
}

impl DailyLabel {
    /// Classify a cumulative daily step count.
    pub fn classify(steps: u32, thresholds: &LabelThresholds) -> Self {
        if steps < thresholds.medium_min {
            DailyLabel::Low
        } else if steps < thresholds.high_min {
            DailyLabel::Medium
        } else {
            DailyLabel::High
        }
    }

    pub fn is_medium_or_high(&self) -> bool {
        matches!(self, DailyLabel::Medium | DailyLabel::High)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DailyLabel::Low => "low",
            DailyLabel::Medium => "medium",
            DailyLabel::High => "high",
        }
    }
}

/// Cumulative steps of one user inside one daily window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStepAggregate {
    pub user_id: String,
    pub steps: u32,
    pub window_start: DateTime<Utc>,
    pub label: DailyLabel,
}

impl DailyStepAggregate {
    pub fn window_start_ms(&self) -> i64 {
        self.window_start.timestamp_millis()
    }
}

/// Weekly classification derived from a user's rolling history.
///
/// Serialized as a plain string: `""`, `"low"` or `"medium_or_high"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeeklySignal {
    /// Fewer entries than the history depth, or a gap in the day sequence
    #[serde(rename = "")]
    Insufficient,
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "medium_or_high")]
    MediumOrHigh,
}

impl WeeklySignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeeklySignal::Insufficient => "",
            WeeklySignal::Low => "low",
            WeeklySignal::MediumOrHigh => "medium_or_high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" => Some(WeeklySignal::Insufficient),
            "low" => Some(WeeklySignal::Low),
            "medium_or_high" => Some(WeeklySignal::MediumOrHigh),
            _ => None,
        }
    }
}

impl fmt::Display for WeeklySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification decision.
///
/// Doubles as the per-user "last sent" marker used for debouncing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub user_id: String,
    pub notification_id: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}
