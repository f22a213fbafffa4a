//! State database schema and migrations

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::ConfigError;
use crate::error::ProcessError;

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Metadata table for schema version and partition layout
fn init_metadata_table(conn: &Connection) -> Result<(), ProcessError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>, ProcessError> {
    let value = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(value)
}

fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<(), ProcessError> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

/// Get current schema version; 0 for a fresh database
pub fn get_schema_version(conn: &Connection) -> Result<i32, ProcessError> {
    match get_metadata(conn, "schema_version")? {
        Some(v) => v.parse::<i32>().map_err(|_| ProcessError::StateCorruption {
            table: "metadata",
            user_id: String::new(),
            message: format!("invalid schema version {v:?}"),
        }),
        None => Ok(0),
    }
}

/// Bring the database to the current schema version
pub fn migrate_to_current(conn: &Connection) -> Result<(), ProcessError> {
    init_metadata_table(conn)?;
    let current_version = get_schema_version(conn)?;

    if current_version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(ProcessError::StateCorruption {
            table: "metadata",
            user_id: String::new(),
            message: format!(
                "database version {} is newer than supported version {}",
                current_version, CURRENT_SCHEMA_VERSION
            ),
        });
    }

    if current_version < 1 {
        migrate_v0_to_v1(conn)?;
        set_metadata(conn, "schema_version", "1")?;
    }

    Ok(())
}

fn migrate_v0_to_v1(conn: &Connection) -> Result<(), ProcessError> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS partition_progress (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            last_event_ms INTEGER
        );
        CREATE TABLE IF NOT EXISTS input_offsets (
            source TEXT NOT NULL,
            record_key TEXT NOT NULL,
            last_offset INTEGER NOT NULL,
            PRIMARY KEY (source, record_key)
        );
        CREATE TABLE IF NOT EXISTS user_progress (
            user_id TEXT PRIMARY KEY,
            stream_time_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS daily_windows (
            user_id TEXT NOT NULL,
            window_start_ms INTEGER NOT NULL,
            steps INTEGER NOT NULL,
            label TEXT NOT NULL,
            PRIMARY KEY (user_id, window_start_ms)
        );
        CREATE TABLE IF NOT EXISTS latest_daily (
            user_id TEXT PRIMARY KEY,
            aggregate TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS rolling_history (
            user_id TEXT PRIMARY KEY,
            history TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS weekly_signals (
            user_id TEXT PRIMARY KEY,
            signal TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS last_notifications (
            user_id TEXT PRIMARY KEY,
            record TEXT NOT NULL
        );
        COMMIT;",
    )?;
    Ok(())
}

/// Record the partition count on first open and refuse a different one later.
pub fn check_partition_layout(conn: &Connection, partitions: u32) -> Result<(), ProcessError> {
    match get_metadata(conn, "partition_count")? {
        None => set_metadata(conn, "partition_count", &partitions.to_string()),
        Some(stored) => {
            let stored: u32 = stored.parse().map_err(|_| ProcessError::StateCorruption {
                table: "metadata",
                user_id: String::new(),
                message: format!("invalid partition count {stored:?}"),
            })?;
            if stored != partitions {
                return Err(ConfigError::PartitionLayoutMismatch {
                    stored,
                    configured: partitions,
                }
                .into());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_to_current(&conn).unwrap();
        migrate_to_current(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_partition_layout_mismatch_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_to_current(&conn).unwrap();
        check_partition_layout(&conn, 4).unwrap();
        check_partition_layout(&conn, 4).unwrap();

        let err = check_partition_layout(&conn, 8).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Config(ConfigError::PartitionLayoutMismatch {
                stored: 4,
                configured: 8
            })
        ));
    }
}
