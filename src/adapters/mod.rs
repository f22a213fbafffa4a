//! Platform payload adapters
//!
//! This module provides adapters that parse raw platform JSON payloads and map
//! them to the canonical, platform-agnostic activity shape.

mod android;
mod ios;
mod normalized;

pub use android::AndroidAdapter;
pub use ios::IosAdapter;
pub use normalized::NormalizedAdapter;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::ProcessError;

/// Canonical activity before event-time resolution.
///
/// Identical to [`crate::types::NormalizedActivityEvent`] except that the
/// timestamp may be missing or unparseable in the source payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalActivity {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    pub steps: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub pincode: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Trait for platform payload adapters
pub trait PlatformPayloadAdapter: Send + Sync {
    /// Name used in logs and parse errors
    fn name(&self) -> &'static str;

    /// Parse a raw payload into the canonical activity shape
    fn parse(&self, payload: &Value) -> Result<CanonicalActivity, ProcessError>;
}

/// Accepts RFC 3339 strings or epoch milliseconds; anything else reads as missing.
pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(timestamp_from_value))
}

fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Pincodes arrive as strings from iOS and as numbers from some Android builds.
pub(crate) fn lenient_pincode<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Wrap a payload deserialization failure with the adapter's name
pub(crate) fn parse_error(source_name: &'static str) -> impl FnOnce(serde_json::Error) -> ProcessError {
    move |e| ProcessError::ParseError {
        source_name,
        message: e.to_string(),
    }
}

pub(crate) fn require<T>(value: Option<T>, field: &str) -> Result<T, ProcessError> {
    value.ok_or_else(|| ProcessError::MissingField(field.to_string()))
}
