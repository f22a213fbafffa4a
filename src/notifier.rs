//! Notification generation and debouncing
//!
//! Every normalized event is joined against its user's weekly signal. Users
//! with a sustained medium-or-high week get a notification candidate, which
//! is only approved when the user's last notification is old enough.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::ProcessError;
use crate::store::StateTxn;
use crate::types::{NormalizedActivityEvent, NotificationRecord, WeeklySignal};

/// Suppresses notifications that follow the previous one too closely
#[derive(Debug, Clone, Copy)]
pub struct Debouncer {
    threshold: Duration,
}

impl Debouncer {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    /// Approve `candidate` unless `last` lies within the threshold of it.
    ///
    /// The distance is absolute and compared at millisecond resolution.
    pub fn admit(&self, candidate: &NotificationRecord, last: Option<&NotificationRecord>) -> bool {
        match last {
            None => true,
            Some(last) => {
                let gap_ms = (candidate.timestamp - last.timestamp)
                    .num_milliseconds()
                    .abs();
                gap_ms > self.threshold.num_milliseconds()
            }
        }
    }
}

/// Fill `{user_id}`, `{first_name}` and `{last_name}` in a payload template
pub fn render_payload(template: &str, event: &NormalizedActivityEvent) -> String {
    template
        .replace("{user_id}", &event.user_id)
        .replace("{first_name}", &event.first_name)
        .replace("{last_name}", &event.last_name)
}

/// Joins events against weekly signals and last-sent markers
#[derive(Debug, Clone)]
pub struct NotificationGenerator {
    template: String,
    debouncer: Debouncer,
}

impl NotificationGenerator {
    pub fn new(template: impl Into<String>, debouncer: Debouncer) -> Self {
        Self {
            template: template.into(),
            debouncer,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.notification_template.clone(),
            Debouncer::new(config.debounce_threshold()),
        )
    }

    /// Decide whether `event` produces a notification at `now`.
    ///
    /// An approved notification is written as the user's new marker before
    /// it is returned. Ineligible or debounced events leave state untouched.
    pub fn evaluate(
        &self,
        txn: &StateTxn<'_>,
        user_id: &str,
        event: &NormalizedActivityEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, ProcessError> {
        if txn.weekly_signal(user_id)? != Some(WeeklySignal::MediumOrHigh) {
            return Ok(None);
        }

        let candidate = NotificationRecord {
            user_id: user_id.to_string(),
            notification_id: Uuid::new_v4().to_string(),
            payload: render_payload(&self.template, event),
            timestamp: now,
        };

        let last = txn.last_notification(user_id)?;
        if !self.debouncer.admit(&candidate, last.as_ref()) {
            debug!(user_id, "notification suppressed by debounce");
            return Ok(None);
        }

        txn.put_last_notification(&candidate)?;
        Ok(Some(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PartitionStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
    }

    fn event() -> NormalizedActivityEvent {
        NormalizedActivityEvent {
            user_id: "u1".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            steps: 2000,
            latitude: None,
            longitude: None,
            pincode: None,
            timestamp: t0(),
        }
    }

    fn record_at(at: DateTime<Utc>) -> NotificationRecord {
        NotificationRecord {
            user_id: "u1".to_string(),
            notification_id: "n".to_string(),
            payload: String::new(),
            timestamp: at,
        }
    }

    fn generator() -> NotificationGenerator {
        NotificationGenerator::new(
            "Hi {first_name} {last_name} ({user_id})",
            Debouncer::new(Duration::seconds(10)),
        )
    }

    #[test]
    fn test_debounce_is_strict_and_symmetric() {
        let debouncer = Debouncer::new(Duration::seconds(10));
        let last = record_at(t0());

        assert!(debouncer.admit(&record_at(t0()), None));
        assert!(!debouncer.admit(&record_at(t0() + Duration::seconds(10)), Some(&last)));
        assert!(debouncer.admit(
            &record_at(t0() + Duration::milliseconds(10_001)),
            Some(&last)
        ));
        assert!(!debouncer.admit(&record_at(t0() - Duration::seconds(5)), Some(&last)));
        assert!(debouncer.admit(&record_at(t0() - Duration::seconds(11)), Some(&last)));
    }

    #[test]
    fn test_render_payload() {
        assert_eq!(
            render_payload("Hi {first_name} {last_name} ({user_id})", &event()),
            "Hi Ada Lovelace (u1)"
        );
    }

    #[test]
    fn test_ineligible_user_gets_nothing() {
        let mut store = PartitionStore::open_in_memory(0, 1).unwrap();
        let txn = store.begin().unwrap();
        txn.put_weekly_signal("u1", WeeklySignal::Low).unwrap();

        let decision = generator().evaluate(&txn, "u1", &event(), t0()).unwrap();
        assert!(decision.is_none());
        assert!(txn.last_notification("u1").unwrap().is_none());
    }

    #[test]
    fn test_qualifying_events_are_debounced() {
        let mut store = PartitionStore::open_in_memory(0, 1).unwrap();
        let txn = store.begin().unwrap();
        txn.put_weekly_signal("u1", WeeklySignal::MediumOrHigh)
            .unwrap();
        let generator = generator();

        let sent: Vec<_> = [0, 5, 11]
            .into_iter()
            .filter_map(|secs| {
                generator
                    .evaluate(&txn, "u1", &event(), t0() + Duration::seconds(secs))
                    .unwrap()
            })
            .collect();

        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].timestamp, t0());
        assert_eq!(sent[1].timestamp, t0() + Duration::seconds(11));
        assert_ne!(sent[0].notification_id, sent[1].notification_id);
        assert_eq!(sent[0].payload, "Hi Ada Lovelace (u1)");

        let marker = txn.last_notification("u1").unwrap().unwrap();
        assert_eq!(marker, sent[1]);
    }
}
