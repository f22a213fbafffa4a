//! Pipeline orchestration
//!
//! A [`PartitionProcessor`] owns one partition's state and runs every record
//! through the stages in order:
//!
//! 1. PlatformPayloadAdapter - Parse the platform payload
//! 2. extract_event_time - Resolve event time, inheriting the previous one if missing
//! 3. WindowedAggregator - Add steps to the user's daily window
//! 4. ConsecutiveDayTracker - Update the rolling history and weekly signal
//! 5. NotificationGenerator - Join against the weekly signal and debounce
//!
//! All state changes of one record, including the applied offset of its
//! input, commit in a single transaction. Emissions are returned only after
//! that commit.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::aggregator::{WindowOutcome, WindowedAggregator};
use crate::config::PipelineConfig;
use crate::error::ProcessError;
use crate::history::ConsecutiveDayTracker;
use crate::notifier::NotificationGenerator;
use crate::schema::{extract_event_time, LogRecord};
use crate::sink::Emission;
use crate::store::{next_offset, PartitionStore, StateTxn};
use crate::types::NormalizedActivityEvent;

/// Map a record's payload to a normalized event.
///
/// # Arguments
/// * `record` - Input record; its `source` selects the payload adapter
/// * `previous` - Event time inherited when the payload has none
pub fn normalize_record(
    record: &LogRecord,
    previous: Option<DateTime<Utc>>,
) -> Result<NormalizedActivityEvent, ProcessError> {
    let activity = record.source.adapter().parse(&record.value)?;
    extract_event_time(activity, previous)
}

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// State updated
    Applied,
    /// Window already closed; only the notification stage ran
    Late,
    /// Malformed; skipped with a warning
    Dropped,
    /// Offset was already applied; nothing changed
    Replayed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub offset: u64,
    pub disposition: Disposition,
    pub emissions: Vec<Emission>,
}

impl ProcessOutcome {
    fn empty(offset: u64, disposition: Disposition) -> Self {
        Self {
            offset,
            disposition,
            emissions: Vec::new(),
        }
    }
}

/// Stateful processor for one partition
pub struct PartitionProcessor {
    store: PartitionStore,
    aggregator: WindowedAggregator,
    tracker: ConsecutiveDayTracker,
    generator: NotificationGenerator,
}

impl PartitionProcessor {
    pub fn new(store: PartitionStore, config: &PipelineConfig) -> Self {
        Self {
            store,
            aggregator: WindowedAggregator::from_config(config),
            tracker: ConsecutiveDayTracker::from_config(config),
            generator: NotificationGenerator::from_config(config),
        }
    }

    /// Open the on-disk store of `partition` under the configured state directory
    pub fn open(config: &PipelineConfig, partition: u32) -> Result<Self, ProcessError> {
        let store = PartitionStore::open(
            config.partition_store_path(partition),
            partition,
            config.partitions,
        )?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub fn checkpoint(&self) -> Result<(), ProcessError> {
        self.store.checkpoint()
    }

    /// Process one record at wall-clock time `now`.
    ///
    /// Offsets are tracked per input source and record key; a record at or
    /// below the last applied offset of its input is a replay. Malformed
    /// records are dropped and their offset still advances. Any error returned
    /// is fatal: the transaction is rolled back and the partition must stop.
    pub fn process(
        &mut self,
        record: &LogRecord,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let Self {
            store,
            aggregator,
            tracker,
            generator,
        } = self;
        let partition = store.partition();

        let source = record.source.as_str();

        let txn = store.begin()?;
        let last_applied = txn.applied_offset(source, &record.key)?;
        let offset = record.offset.unwrap_or_else(|| next_offset(last_applied));
        if last_applied.is_some_and(|last| offset <= last) {
            debug!(partition, offset, key = %record.key, source, "skipping replayed record");
            return Ok(ProcessOutcome::empty(offset, Disposition::Replayed));
        }
        txn.put_applied_offset(source, &record.key, offset)?;

        let mut progress = txn.progress()?;
        let mut event = match normalize_record(record, progress.last_event_time()) {
            Ok(event) => event,
            Err(err) if !err.is_fatal() => return drop_malformed(txn, partition, offset, record, &err),
            Err(err) => return Err(err),
        };

        // State is keyed by the record key, which also decided the partition
        if event.user_id != record.key {
            warn!(
                partition,
                offset,
                key = %record.key,
                payload_user_id = %event.user_id,
                "payload user id differs from record key, keying by record key"
            );
            event.user_id = record.key.clone();
        }

        let window = match aggregator.aggregate(&txn, &record.key, &event) {
            Ok(window) => window,
            Err(err) if !err.is_fatal() => return drop_malformed(txn, partition, offset, record, &err),
            Err(err) => return Err(err),
        };
        progress.record_event(event.timestamp);

        let mut emissions = Vec::new();
        let disposition = match window {
            WindowOutcome::Updated(aggregate) => {
                let signal = tracker.track(&txn, &aggregate)?;
                emissions.push(Emission::DailyAggregate(aggregate.clone()));
                emissions.push(Emission::LatestDaily(aggregate));
                emissions.push(Emission::WeeklySignal {
                    user_id: record.key.clone(),
                    signal,
                });
                Disposition::Applied
            }
            WindowOutcome::Late { .. } => Disposition::Late,
        };

        if let Some(notification) = generator.evaluate(&txn, &record.key, &event, now)? {
            emissions.push(Emission::Notification(notification));
        }

        txn.put_progress(&progress)?;
        txn.commit()?;

        Ok(ProcessOutcome {
            offset,
            disposition,
            emissions,
        })
    }
}

/// Commit only the applied offset of a record that cannot be processed
fn drop_malformed(
    txn: StateTxn<'_>,
    partition: u32,
    offset: u64,
    record: &LogRecord,
    err: &ProcessError,
) -> Result<ProcessOutcome, ProcessError> {
    warn!(
        partition,
        offset,
        key = %record.key,
        source = record.source.as_str(),
        error = %err,
        "dropping malformed record"
    );
    txn.commit()?;
    Ok(ProcessOutcome::empty(offset, Disposition::Dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Source;
    use crate::types::{NotificationRecord, WeeklySignal};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
    }

    /// Wall clock of the test run, independent of event time
    fn clock(tick: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(tick)
    }

    fn steps_record(user: &str, at: DateTime<Utc>, steps: i64) -> LogRecord {
        LogRecord::new(
            Source::Normalized,
            user,
            json!({
                "userId": user,
                "firstName": "Ada",
                "lastName": "Lovelace",
                "steps": steps,
                "timestamp": at.to_rfc3339(),
            }),
        )
    }

    fn processor() -> PartitionProcessor {
        let config = PipelineConfig::default();
        PartitionProcessor::new(PartitionStore::open_in_memory(0, 1).unwrap(), &config)
    }

    fn notifications(outcomes: &[ProcessOutcome]) -> Vec<NotificationRecord> {
        outcomes
            .iter()
            .flat_map(|o| o.emissions.iter())
            .filter_map(|e| match e {
                Emission::Notification(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    /// Feed `(event time, steps)` pairs, one wall-clock second apart
    fn run(
        processor: &mut PartitionProcessor,
        tick: &mut i64,
        events: &[(DateTime<Utc>, i64)],
    ) -> Vec<ProcessOutcome> {
        events
            .iter()
            .map(|(at, steps)| {
                *tick += 1;
                processor
                    .process(&steps_record("u1", *at, *steps), clock(*tick))
                    .unwrap()
            })
            .collect()
    }

    fn scenario_a() -> Vec<(DateTime<Utc>, i64)> {
        [2000, 2000, 6000, 2000, 9000, 2500, 2000]
            .into_iter()
            .enumerate()
            .map(|(day, steps)| (base() + Duration::days(day as i64), steps))
            .collect()
    }

    #[test]
    fn test_scenario_seven_active_days_notifies_once() {
        let mut processor = processor();
        let mut tick = 0;
        let outcomes = run(&mut processor, &mut tick, &scenario_a());

        let sent = notifications(&outcomes);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, "u1");
        assert_eq!(sent[0].payload, "Time for a juice nearby! u1");
        // Only the seventh day completes the week
        assert_eq!(notifications(&outcomes[6..]).len(), 1);
        assert_eq!(
            processor.store().weekly_signal("u1").unwrap(),
            Some(WeeklySignal::MediumOrHigh)
        );
    }

    #[test]
    fn test_scenario_burst_on_following_day_is_debounced() {
        let mut processor = processor();
        let mut tick = 0;
        let mut outcomes = run(&mut processor, &mut tick, &scenario_a());

        let day8 = base() + Duration::days(7);
        outcomes.extend(run(
            &mut processor,
            &mut tick,
            &[(day8, 2000), (day8 + Duration::seconds(2), 5000), (day8 + Duration::seconds(4), 6000)],
        ));

        assert_eq!(notifications(&outcomes).len(), 1);
        let history = processor.store().history("u1").unwrap().unwrap();
        assert_eq!(history.len(), 7);
    }

    #[test]
    fn test_scenario_low_day_blocks_until_completed() {
        let mut processor = processor();
        let mut tick = 0;
        let mut events: Vec<_> = (0..6)
            .map(|day| (base() + Duration::days(day), 2000))
            .collect();
        events.push((base() + Duration::days(6), 100));

        let outcomes = run(&mut processor, &mut tick, &events);
        assert!(notifications(&outcomes).is_empty());
        assert_eq!(
            processor.store().weekly_signal("u1").unwrap(),
            Some(WeeklySignal::Low)
        );

        let later = base() + Duration::days(6) + Duration::hours(1);
        let outcomes = run(&mut processor, &mut tick, &[(later, 2000), (later, 2000)]);
        assert_eq!(notifications(&outcomes).len(), 1);
        assert_eq!(notifications(&outcomes[..1]).len(), 1);
    }

    #[test]
    fn test_debounce_threshold_against_wall_clock() {
        let mut processor = processor();
        let mut tick = 0;
        run(&mut processor, &mut tick, &scenario_a());

        let day7 = base() + Duration::days(6) + Duration::minutes(1);
        let at = |secs: i64| clock(100 + secs);
        let sent: Vec<_> = [0, 5, 11]
            .into_iter()
            .flat_map(|secs| {
                processor
                    .process(&steps_record("u1", day7, 10), at(secs))
                    .unwrap()
                    .emissions
            })
            .filter(|e| matches!(e, Emission::Notification(_)))
            .collect();
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_emissions_per_applied_record() {
        let mut processor = processor();
        let outcome = processor
            .process(&steps_record("u1", base(), 1500), clock(0))
            .unwrap();

        assert_eq!(outcome.disposition, Disposition::Applied);
        assert_eq!(outcome.offset, 0);
        let topics: Vec<_> = outcome.emissions.iter().map(Emission::topic).collect();
        assert_eq!(
            topics,
            vec!["user-steps-daily", "user-steps-latest", "user-steps-7-days-aggregated"]
        );
        assert!(outcome
            .emissions
            .iter()
            .all(|e| e.key() == "u1"));
    }

    #[test]
    fn test_replayed_offset_changes_nothing() {
        let mut processor = processor();
        let record = steps_record("u1", base(), 1500).with_offset(10);

        let first = processor.process(&record, clock(0)).unwrap();
        let replay = processor.process(&record, clock(1)).unwrap();
        let older = processor
            .process(&steps_record("u1", base(), 1500).with_offset(3), clock(2))
            .unwrap();

        assert_eq!(first.disposition, Disposition::Applied);
        assert_eq!(replay.disposition, Disposition::Replayed);
        assert!(replay.emissions.is_empty());
        assert_eq!(older.disposition, Disposition::Replayed);

        let next = processor
            .process(&steps_record("u1", base(), 1500), clock(3))
            .unwrap();
        assert_eq!(next.offset, 11);
        match &next.emissions[0] {
            Emission::DailyAggregate(agg) => assert_eq!(agg.steps, 3000),
            other => panic!("unexpected emission {other:?}"),
        }
    }

    #[test]
    fn test_malformed_record_is_dropped_and_offset_advances() {
        let mut processor = processor();
        let bad = LogRecord::new(Source::Normalized, "u1", json!({"userId": 42}));

        let outcome = processor.process(&bad, clock(0)).unwrap();
        assert_eq!(outcome.disposition, Disposition::Dropped);
        assert_eq!(
            processor.store().applied_offset("normalized", "u1").unwrap(),
            Some(0)
        );

        let good = processor
            .process(&steps_record("u1", base(), 100), clock(1))
            .unwrap();
        assert_eq!(good.disposition, Disposition::Applied);
        assert_eq!(good.offset, 1);
    }

    #[test]
    fn test_missing_timestamp_inherits_partition_time() {
        let mut processor = processor();
        let no_time = LogRecord::new(
            Source::Normalized,
            "u1",
            json!({"userId": "u1", "steps": 700}),
        );

        // Nothing to inherit yet
        let first = processor.process(&no_time, clock(0)).unwrap();
        assert_eq!(first.disposition, Disposition::Dropped);

        processor
            .process(&steps_record("u1", base(), 700), clock(1))
            .unwrap();
        let inherited = processor.process(&no_time, clock(2)).unwrap();
        match &inherited.emissions[0] {
            Emission::DailyAggregate(agg) => {
                assert_eq!(agg.steps, 1400);
                assert_eq!(agg.window_start.date_naive(), base().date_naive());
            }
            other => panic!("unexpected emission {other:?}"),
        }
    }

    #[test]
    fn test_late_event_still_reaches_notification_stage() {
        let mut processor = processor();
        let mut tick = 0;
        run(&mut processor, &mut tick, &scenario_a());

        let outcome = processor
            .process(&steps_record("u1", base(), 5000), clock(500))
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::Late);
        assert_eq!(notifications(&[outcome]).len(), 1);
    }

    #[test]
    fn test_fatal_error_rolls_back_record() {
        let mut processor = processor();
        processor
            .process(&steps_record("u1", base(), 100), clock(0))
            .unwrap();

        let err = processor
            .process(&steps_record("u1", base(), -1), clock(1))
            .unwrap_err();
        assert!(err.is_fatal());

        assert_eq!(
            processor.store().applied_offset("normalized", "u1").unwrap(),
            Some(0)
        );
        match processor.store().user_state("u1").unwrap().latest_daily {
            Some(agg) => assert_eq!(agg.steps, 100),
            None => panic!("missing latest aggregate"),
        }
    }

    #[test]
    fn test_users_sharing_a_partition_are_independent() {
        let mut processor = processor();
        let mut outcomes = Vec::new();
        let mut tick = 0;

        for user in ["u1", "u2"] {
            for (day, (at, steps)) in scenario_a().into_iter().enumerate() {
                tick += 1;
                let outcome = processor
                    .process(&steps_record(user, at, steps), clock(tick))
                    .unwrap();
                assert_eq!(outcome.disposition, Disposition::Applied, "{user} day {day}");
                outcomes.push(outcome);
            }
        }

        let mut notified: Vec<_> = notifications(&outcomes)
            .into_iter()
            .map(|n| n.user_id)
            .collect();
        notified.sort();
        assert_eq!(notified, vec!["u1".to_string(), "u2".to_string()]);
        for user in ["u1", "u2"] {
            assert_eq!(processor.store().history(user).unwrap().unwrap().len(), 7);
        }
    }

    #[test]
    fn test_interleaved_users_close_only_their_own_windows() {
        let mut processor = processor();
        let day = |d: i64| base() + Duration::days(d);

        let ahead = processor.process(&steps_record("u1", day(6), 2000), clock(0)).unwrap();
        let behind = processor.process(&steps_record("u2", day(0), 2000), clock(1)).unwrap();
        let late = processor.process(&steps_record("u1", day(0), 2000), clock(2)).unwrap();
        let behind_next = processor.process(&steps_record("u2", day(1), 2000), clock(3)).unwrap();

        assert_eq!(ahead.disposition, Disposition::Applied);
        assert_eq!(behind.disposition, Disposition::Applied);
        assert_eq!(late.disposition, Disposition::Late);
        assert_eq!(behind_next.disposition, Disposition::Applied);
        assert_eq!(processor.store().history("u2").unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_offsets_of_different_sources_do_not_collide() {
        let mut processor = processor();
        let ios = LogRecord::new(
            Source::Ios,
            "u1",
            json!({
                "UserId": "u1",
                "PhysicalActivity": { "walking_steps": 400 },
                "event_timestamp": base().timestamp_millis(),
            }),
        )
        .with_offset(0);
        let android = LogRecord::new(
            Source::Android,
            "u2",
            json!({
                "Person": { "Id": "u2" },
                "Activity": { "walking_steps": 600 },
                "ts": base().timestamp_millis(),
            }),
        )
        .with_offset(0);

        let first = processor.process(&ios, clock(0)).unwrap();
        let second = processor.process(&android, clock(1)).unwrap();

        assert_eq!(first.disposition, Disposition::Applied);
        assert_eq!(second.disposition, Disposition::Applied);
        match &second.emissions[0] {
            Emission::DailyAggregate(agg) => {
                assert_eq!(agg.user_id, "u2");
                assert_eq!(agg.steps, 600);
            }
            other => panic!("unexpected emission {other:?}"),
        }
        assert_eq!(processor.process(&android, clock(2)).unwrap().disposition, Disposition::Replayed);
    }

    #[test]
    fn test_record_key_wins_over_payload_user_id() {
        let mut processor = processor();
        let mut record = steps_record("u1", base(), 800);
        record.value["userId"] = json!("someone-else");

        let outcome = processor.process(&record, clock(0)).unwrap();
        assert_eq!(outcome.disposition, Disposition::Applied);
        assert!(outcome.emissions.iter().all(|e| e.key() == "u1"));
        assert!(processor.store().history("u1").unwrap().is_some());
        assert!(processor.store().history("someone-else").unwrap().is_none());
    }

    #[test]
    fn test_unrepresentable_window_is_dropped_not_fatal() {
        let earliest = DateTime::<Utc>::MIN_UTC;
        let config = PipelineConfig {
            window_size_secs: 1 - earliest.timestamp(),
            ..Default::default()
        };
        let mut processor =
            PartitionProcessor::new(PartitionStore::open_in_memory(0, 1).unwrap(), &config);

        let record = LogRecord::new(
            Source::Normalized,
            "u1",
            json!({"userId": "u1", "steps": 10, "timestamp": earliest.timestamp_millis()}),
        );
        let outcome = processor.process(&record, clock(0)).unwrap();

        assert_eq!(outcome.disposition, Disposition::Dropped);
        assert_eq!(
            processor.store().applied_offset("normalized", "u1").unwrap(),
            Some(0)
        );
        assert_eq!(processor.store().stream_time("u1").unwrap(), None);
        assert_eq!(processor.store().progress().unwrap().last_event_ms, None);
    }
}
