//! Event-time extraction
//!
//! Event time always comes from the payload. When a payload's timestamp is
//! missing or unreadable, the event inherits the last event time extracted on
//! the same partition.

use chrono::{DateTime, Utc};

use crate::adapters::CanonicalActivity;
use crate::error::ProcessError;
use crate::types::NormalizedActivityEvent;

/// Resolve a canonical activity into a normalized event.
///
/// # Arguments
/// * `activity` - Adapter output, possibly without a timestamp
/// * `previous` - Last event time extracted on this partition
pub fn extract_event_time(
    activity: CanonicalActivity,
    previous: Option<DateTime<Utc>>,
) -> Result<NormalizedActivityEvent, ProcessError> {
    let timestamp = match activity.timestamp.or(previous) {
        Some(ts) => ts,
        None => return Err(ProcessError::MissingTimestamp(activity.user_id)),
    };

    Ok(NormalizedActivityEvent {
        user_id: activity.user_id,
        first_name: activity.first_name,
        last_name: activity.last_name,
        steps: activity.steps,
        latitude: activity.latitude,
        longitude: activity.longitude,
        pincode: activity.pincode,
        timestamp,
    })
}
