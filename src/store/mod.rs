//! Per-partition state store
//!
//! Each partition owns one SQLite database holding its windows, rolling
//! histories, weekly signals, notification markers and applied input offsets.
//! Stream time is kept per user, so users sharing a partition never close each
//! other's windows. All writes for one record go through a single
//! [`StateTxn`], so a record is either fully applied or not applied at all.

mod migration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use crate::error::ProcessError;
use crate::types::{DailyLabel, DailyStepAggregate, NotificationRecord, WeeklySignal};

pub use migration::CURRENT_SCHEMA_VERSION;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Event-time position of a partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionProgress {
    /// Event time of the last extracted event (ms), inherited by events without one
    pub last_event_ms: Option<i64>,
}

impl PartitionProgress {
    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.last_event_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    pub fn record_event(&mut self, event: DateTime<Utc>) {
        self.last_event_ms = Some(event.timestamp_millis());
    }
}

/// Offset a record without an explicit one receives, given the last applied offset
pub fn next_offset(last_applied: Option<u64>) -> u64 {
    last_applied.map_or(0, |o| o.saturating_add(1))
}

/// Everything the store knows about one user, for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub user_id: String,
    /// Largest event time seen for the user (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_time_ms: Option<i64>,
    pub history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_signal: Option<WeeklySignal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_daily: Option<DailyStepAggregate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_notification: Option<NotificationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub window_start: DateTime<Utc>,
    pub label: DailyLabel,
}

/// SQLite-backed state of one partition
pub struct PartitionStore {
    conn: Connection,
    partition: u32,
}

impl PartitionStore {
    /// Open (or create) the state database of `partition`.
    ///
    /// The partition count is recorded on first open; reopening with a
    /// different count is refused, since keys would route to other partitions.
    pub fn open<P: AsRef<Path>>(
        path: P,
        partition: u32,
        partitions: u32,
    ) -> Result<Self, ProcessError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn, partition, partitions)
    }

    /// Open an existing state database for inspection; never creates one
    pub fn open_existing<P: AsRef<Path>>(path: P, partition: u32) -> Result<Self, ProcessError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let version = migration::get_schema_version(&conn)?;
        if version != CURRENT_SCHEMA_VERSION {
            return Err(ProcessError::StateCorruption {
                table: "metadata",
                user_id: String::new(),
                message: format!("unsupported schema version {version}"),
            });
        }
        Ok(Self { conn, partition })
    }

    /// In-memory store, used by tests and dry runs
    pub fn open_in_memory(partition: u32, partitions: u32) -> Result<Self, ProcessError> {
        Self::init(Connection::open_in_memory()?, partition, partitions)
    }

    fn init(conn: Connection, partition: u32, partitions: u32) -> Result<Self, ProcessError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migration::migrate_to_current(&conn)?;
        migration::check_partition_layout(&conn, partitions)?;
        Ok(Self { conn, partition })
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Start the transaction covering one record
    pub fn begin(&mut self) -> Result<StateTxn<'_>, ProcessError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(StateTxn { tx })
    }

    pub fn progress(&self) -> Result<PartitionProgress, ProcessError> {
        load_progress(&self.conn)
    }

    /// Offset of the last applied record of `key` on input `source`
    pub fn applied_offset(&self, source: &str, key: &str) -> Result<Option<u64>, ProcessError> {
        load_applied_offset(&self.conn, source, key)
    }

    pub fn stream_time(&self, user_id: &str) -> Result<Option<i64>, ProcessError> {
        load_stream_time(&self.conn, user_id)
    }

    pub fn weekly_signal(&self, user_id: &str) -> Result<Option<WeeklySignal>, ProcessError> {
        load_weekly_signal(&self.conn, user_id)
    }

    pub fn history(&self, user_id: &str) -> Result<Option<BTreeMap<i64, DailyLabel>>, ProcessError> {
        load_history(&self.conn, user_id)
    }

    pub fn last_notification(
        &self,
        user_id: &str,
    ) -> Result<Option<NotificationRecord>, ProcessError> {
        load_last_notification(&self.conn, user_id)
    }

    /// Number of open daily windows held by the partition
    pub fn open_window_count(&self) -> Result<u64, ProcessError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM daily_windows", [], |r| r.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Every user with any state in this partition, sorted by id
    pub fn user_ids(&self) -> Result<Vec<String>, ProcessError> {
        let mut ids = BTreeSet::new();
        for table in [
            "user_progress",
            "daily_windows",
            "latest_daily",
            "rolling_history",
            "weekly_signals",
            "last_notifications",
        ] {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT DISTINCT user_id FROM {table}"))?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            for id in rows {
                ids.insert(id?);
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Full state of one user
    pub fn user_state(&self, user_id: &str) -> Result<UserState, ProcessError> {
        let history = load_history(&self.conn, user_id)?
            .unwrap_or_default()
            .into_iter()
            .map(|(start_ms, label)| {
                let window_start = from_millis("rolling_history", user_id, start_ms)?;
                Ok(HistoryEntry {
                    window_start,
                    label,
                })
            })
            .collect::<Result<Vec<_>, ProcessError>>()?;

        Ok(UserState {
            user_id: user_id.to_string(),
            stream_time_ms: load_stream_time(&self.conn, user_id)?,
            history,
            weekly_signal: load_weekly_signal(&self.conn, user_id)?,
            latest_daily: load_latest(&self.conn, user_id)?,
            last_notification: load_last_notification(&self.conn, user_id)?,
        })
    }

    /// Flush the write-ahead log into the main database file
    pub fn checkpoint(&self) -> Result<(), ProcessError> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

/// One atomic unit of state changes
pub struct StateTxn<'a> {
    tx: Transaction<'a>,
}

impl StateTxn<'_> {
    pub fn progress(&self) -> Result<PartitionProgress, ProcessError> {
        load_progress(&self.tx)
    }

    pub fn put_progress(&self, progress: &PartitionProgress) -> Result<(), ProcessError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO partition_progress (id, last_event_ms) VALUES (0, ?1)",
            params![progress.last_event_ms],
        )?;
        Ok(())
    }

    pub fn applied_offset(&self, source: &str, key: &str) -> Result<Option<u64>, ProcessError> {
        load_applied_offset(&self.tx, source, key)
    }

    pub fn put_applied_offset(&self, source: &str, key: &str, offset: u64) -> Result<(), ProcessError> {
        let stored = i64::try_from(offset).map_err(|_| ProcessError::OffsetOutOfRange(offset))?;
        self.tx.execute(
            "INSERT OR REPLACE INTO input_offsets (source, record_key, last_offset) VALUES (?1, ?2, ?3)",
            params![source, key, stored],
        )?;
        Ok(())
    }

    /// Largest event time seen for `user_id` (ms)
    pub fn stream_time(&self, user_id: &str) -> Result<Option<i64>, ProcessError> {
        load_stream_time(&self.tx, user_id)
    }

    pub fn put_stream_time(&self, user_id: &str, stream_time_ms: i64) -> Result<(), ProcessError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO user_progress (user_id, stream_time_ms) VALUES (?1, ?2)",
            params![user_id, stream_time_ms],
        )?;
        Ok(())
    }

    /// Steps accumulated so far in one open window
    pub fn window_steps(
        &self,
        user_id: &str,
        window_start_ms: i64,
    ) -> Result<Option<u32>, ProcessError> {
        let steps: Option<i64> = self
            .tx
            .query_row(
                "SELECT steps FROM daily_windows WHERE user_id = ?1 AND window_start_ms = ?2",
                params![user_id, window_start_ms],
                |r| r.get(0),
            )
            .optional()?;
        steps
            .map(|s| {
                u32::try_from(s).map_err(|_| ProcessError::StateCorruption {
                    table: "daily_windows",
                    user_id: user_id.to_string(),
                    message: format!("step count {s} out of range"),
                })
            })
            .transpose()
    }

    pub fn put_window(&self, aggregate: &DailyStepAggregate) -> Result<(), ProcessError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO daily_windows (user_id, window_start_ms, steps, label)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                aggregate.user_id,
                aggregate.window_start_ms(),
                i64::from(aggregate.steps),
                aggregate.label.as_str()
            ],
        )?;
        Ok(())
    }

    /// Drop the user's windows starting at or before `cutoff_ms`; returns the count removed
    pub fn purge_windows(&self, user_id: &str, cutoff_ms: i64) -> Result<usize, ProcessError> {
        let removed = self.tx.execute(
            "DELETE FROM daily_windows WHERE user_id = ?1 AND window_start_ms <= ?2",
            params![user_id, cutoff_ms],
        )?;
        Ok(removed)
    }

    pub fn put_latest(&self, aggregate: &DailyStepAggregate) -> Result<(), ProcessError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO latest_daily (user_id, aggregate) VALUES (?1, ?2)",
            params![aggregate.user_id, serde_json::to_string(aggregate)?],
        )?;
        Ok(())
    }

    pub fn history(&self, user_id: &str) -> Result<Option<BTreeMap<i64, DailyLabel>>, ProcessError> {
        load_history(&self.tx, user_id)
    }

    pub fn put_history(
        &self,
        user_id: &str,
        entries: &BTreeMap<i64, DailyLabel>,
    ) -> Result<(), ProcessError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO rolling_history (user_id, history) VALUES (?1, ?2)",
            params![user_id, serde_json::to_string(entries)?],
        )?;
        Ok(())
    }

    pub fn weekly_signal(&self, user_id: &str) -> Result<Option<WeeklySignal>, ProcessError> {
        load_weekly_signal(&self.tx, user_id)
    }

    pub fn put_weekly_signal(&self, user_id: &str, signal: WeeklySignal) -> Result<(), ProcessError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO weekly_signals (user_id, signal) VALUES (?1, ?2)",
            params![user_id, signal.as_str()],
        )?;
        Ok(())
    }

    pub fn last_notification(
        &self,
        user_id: &str,
    ) -> Result<Option<NotificationRecord>, ProcessError> {
        load_last_notification(&self.tx, user_id)
    }

    pub fn put_last_notification(&self, record: &NotificationRecord) -> Result<(), ProcessError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO last_notifications (user_id, record) VALUES (?1, ?2)",
            params![record.user_id, serde_json::to_string(record)?],
        )?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), ProcessError> {
        self.tx.commit()?;
        Ok(())
    }
}

fn load_progress(conn: &Connection) -> Result<PartitionProgress, ProcessError> {
    let last_event_ms: Option<Option<i64>> = conn
        .query_row(
            "SELECT last_event_ms FROM partition_progress WHERE id = 0",
            [],
            |r| r.get(0),
        )
        .optional()?;
    Ok(PartitionProgress {
        last_event_ms: last_event_ms.flatten(),
    })
}

fn load_applied_offset(conn: &Connection, source: &str, key: &str) -> Result<Option<u64>, ProcessError> {
    let offset: Option<i64> = conn
        .query_row(
            "SELECT last_offset FROM input_offsets WHERE source = ?1 AND record_key = ?2",
            params![source, key],
            |r| r.get(0),
        )
        .optional()?;
    offset
        .map(|o| {
            u64::try_from(o).map_err(|_| ProcessError::StateCorruption {
                table: "input_offsets",
                user_id: key.to_string(),
                message: format!("negative offset {o}"),
            })
        })
        .transpose()
}

fn load_stream_time(conn: &Connection, user_id: &str) -> Result<Option<i64>, ProcessError> {
    let stream_time = conn
        .query_row(
            "SELECT stream_time_ms FROM user_progress WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(stream_time)
}

fn load_latest(conn: &Connection, user_id: &str) -> Result<Option<DailyStepAggregate>, ProcessError> {
    load_json(conn, "latest_daily", "aggregate", user_id)
}

fn load_history(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<BTreeMap<i64, DailyLabel>>, ProcessError> {
    load_json(conn, "rolling_history", "history", user_id)
}

fn load_last_notification(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<NotificationRecord>, ProcessError> {
    load_json(conn, "last_notifications", "record", user_id)
}

fn load_weekly_signal(conn: &Connection, user_id: &str) -> Result<Option<WeeklySignal>, ProcessError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT signal FROM weekly_signals WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?;
    raw.map(|s| {
        WeeklySignal::parse(&s).ok_or_else(|| ProcessError::StateCorruption {
            table: "weekly_signals",
            user_id: user_id.to_string(),
            message: format!("unknown signal {s:?}"),
        })
    })
    .transpose()
}

/// Read and decode a JSON column; undecodable state is corruption, not bad input.
fn load_json<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    table: &'static str,
    column: &str,
    user_id: &str,
) -> Result<Option<T>, ProcessError> {
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT {column} FROM {table} WHERE user_id = ?1"),
            params![user_id],
            |r| r.get(0),
        )
        .optional()?;
    raw.map(|json| {
        serde_json::from_str(&json).map_err(|e| ProcessError::StateCorruption {
            table,
            user_id: user_id.to_string(),
            message: e.to_string(),
        })
    })
    .transpose()
}

fn from_millis(
    table: &'static str,
    user_id: &str,
    ms: i64,
) -> Result<DateTime<Utc>, ProcessError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ProcessError::StateCorruption {
            table,
            user_id: user_id.to_string(),
            message: format!("timestamp {ms} out of range"),
        })
}

#[cfg(test)]
impl PartitionStore {
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}
