//! Adapter for records that are already in the normalized shape

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{
    lenient_pincode, lenient_timestamp, parse_error, require, CanonicalActivity,
    PlatformPayloadAdapter,
};
use crate::error::ProcessError;

/// Pass-through adapter for `NormalizedActivityEvent` JSON
pub struct NormalizedAdapter;

impl PlatformPayloadAdapter for NormalizedAdapter {
    fn name(&self) -> &'static str {
        "normalized"
    }

    fn parse(&self, payload: &Value) -> Result<CanonicalActivity, ProcessError> {
        let raw = NormalizedPayload::deserialize(payload).map_err(parse_error("normalized"))?;

        Ok(CanonicalActivity {
            user_id: require(raw.user_id, "userId")?,
            first_name: raw.first_name.unwrap_or_default(),
            last_name: raw.last_name.unwrap_or_default(),
            steps: require(raw.steps, "steps")?,
            latitude: raw.latitude,
            longitude: raw.longitude,
            pincode: raw.pincode,
            timestamp: raw.timestamp,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NormalizedPayload {
    user_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    steps: Option<i64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_pincode")]
    pincode: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<DateTime<Utc>>,
}
