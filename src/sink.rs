//! Output streams
//!
//! A processed record produces a handful of [`Emission`]s, one per derived
//! stream. They are handed to an [`EmissionSink`] only after the record's
//! state transaction has committed.

use serde_json::{json, Value};
use std::io::Write;
use std::sync::Mutex;
use tracing::info;

use crate::error::ProcessError;
use crate::types::{DailyStepAggregate, NotificationRecord, WeeklySignal};

pub const DAILY_TOPIC: &str = "user-steps-daily";
pub const LATEST_DAILY_TOPIC: &str = "user-steps-latest";
pub const WEEKLY_SIGNAL_TOPIC: &str = "user-steps-7-days-aggregated";
pub const NOTIFICATION_TOPIC: &str = "user-notifications";

/// One record on one output stream
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// Every update of a daily window
    DailyAggregate(DailyStepAggregate),
    /// Last-write-wins projection of the user's most recent daily aggregate
    LatestDaily(DailyStepAggregate),
    WeeklySignal {
        user_id: String,
        signal: WeeklySignal,
    },
    Notification(NotificationRecord),
}

impl Emission {
    pub fn topic(&self) -> &'static str {
        match self {
            Emission::DailyAggregate(_) => DAILY_TOPIC,
            Emission::LatestDaily(_) => LATEST_DAILY_TOPIC,
            Emission::WeeklySignal { .. } => WEEKLY_SIGNAL_TOPIC,
            Emission::Notification(_) => NOTIFICATION_TOPIC,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Emission::DailyAggregate(agg) | Emission::LatestDaily(agg) => &agg.user_id,
            Emission::WeeklySignal { user_id, .. } => user_id,
            Emission::Notification(record) => &record.user_id,
        }
    }

    pub fn value(&self) -> Result<Value, ProcessError> {
        let value = match self {
            Emission::DailyAggregate(agg) | Emission::LatestDaily(agg) => serde_json::to_value(agg)?,
            Emission::WeeklySignal { signal, .. } => serde_json::to_value(signal)?,
            Emission::Notification(record) => serde_json::to_value(record)?,
        };
        Ok(value)
    }

    /// `{"topic","key","value"}` envelope
    pub fn to_json(&self) -> Result<Value, ProcessError> {
        Ok(json!({
            "topic": self.topic(),
            "key": self.key(),
            "value": self.value()?,
        }))
    }
}

/// Receives committed emissions
pub trait EmissionSink: Send + Sync {
    fn deliver(&self, emissions: &[Emission]) -> Result<(), ProcessError>;
}

/// Logs notifications through `tracing`; other streams are ignored
#[derive(Debug, Default)]
pub struct NotificationLogSink;

impl EmissionSink for NotificationLogSink {
    fn deliver(&self, emissions: &[Emission]) -> Result<(), ProcessError> {
        for emission in emissions {
            if let Emission::Notification(record) = emission {
                info!(
                    user_id = %record.user_id,
                    notification_id = %record.notification_id,
                    payload = %record.payload,
                    "notification"
                );
            }
        }
        Ok(())
    }
}

/// Writes emissions as NDJSON lines, optionally restricted to some topics
pub struct NdjsonSink<W: Write + Send> {
    writer: Mutex<W>,
    topics: Option<Vec<String>>,
}

impl<W: Write + Send> NdjsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            topics: None,
        }
    }

    /// Only write emissions whose topic is listed
    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = if topics.is_empty() { None } else { Some(topics) };
        self
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn accepts(&self, topic: &str) -> bool {
        self.topics
            .as_ref()
            .map_or(true, |topics| topics.iter().any(|t| t == topic))
    }
}

impl<W: Write + Send> EmissionSink for NdjsonSink<W> {
    fn deliver(&self, emissions: &[Emission]) -> Result<(), ProcessError> {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for emission in emissions.iter().filter(|e| self.accepts(e.topic())) {
            serde_json::to_writer(&mut *writer, &emission.to_json()?)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Delivers to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EmissionSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EmissionSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EmissionSink for FanoutSink {
    fn deliver(&self, emissions: &[Emission]) -> Result<(), ProcessError> {
        for sink in &self.sinks {
            sink.deliver(emissions)?;
        }
        Ok(())
    }
}

/// Collects emissions in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    emissions: Mutex<Vec<Emission>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Emission> {
        match self.emissions.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        let guard = match self.emissions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .iter()
            .filter_map(|e| match e {
                Emission::Notification(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EmissionSink for MemorySink {
    fn deliver(&self, emissions: &[Emission]) -> Result<(), ProcessError> {
        let mut guard = match self.emissions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend_from_slice(emissions);
        Ok(())
    }
}

impl<S: EmissionSink + ?Sized> EmissionSink for std::sync::Arc<S> {
    fn deliver(&self, emissions: &[Emission]) -> Result<(), ProcessError> {
        (**self).deliver(emissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use crate::types::DailyLabel;

    fn aggregate() -> DailyStepAggregate {
        DailyStepAggregate {
            user_id: "u1".to_string(),
            steps: 2000,
            window_start: Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            label: DailyLabel::Medium,
        }
    }

    #[test]
    fn test_weekly_signal_value_is_plain_string() {
        let emission = Emission::WeeklySignal {
            user_id: "u1".to_string(),
            signal: WeeklySignal::Insufficient,
        };
        let line = emission.to_json().unwrap();
        assert_eq!(line["topic"], "user-steps-7-days-aggregated");
        assert_eq!(line["key"], "u1");
        assert_eq!(line["value"], "");
    }

    #[test]
    fn test_ndjson_sink_filters_topics() {
        let sink = NdjsonSink::new(Vec::new()).with_topics(vec![DAILY_TOPIC.to_string()]);
        sink.deliver(&[
            Emission::DailyAggregate(aggregate()),
            Emission::LatestDaily(aggregate()),
        ])
        .unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["value"]["steps"], 2000);
        assert_eq!(parsed["value"]["label"], "medium");
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = std::sync::Arc::new(MemorySink::new());
        let second = std::sync::Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(first.clone()).with(second.clone());

        fanout
            .deliver(&[Emission::LatestDaily(aggregate())])
            .unwrap();
        assert_eq!(first.take().len(), 1);
        assert_eq!(second.take().len(), 1);
    }
}
