//! iOS platform adapter
//!
//! Parses HealthKit-bridge payloads and maps them to canonical activity.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{
    lenient_pincode, lenient_timestamp, parse_error, require, CanonicalActivity,
    PlatformPayloadAdapter,
};
use crate::error::ProcessError;

/// iOS payload adapter
pub struct IosAdapter;

impl PlatformPayloadAdapter for IosAdapter {
    fn name(&self) -> &'static str {
        "ios"
    }

    fn parse(&self, payload: &Value) -> Result<CanonicalActivity, ProcessError> {
        let raw = IosPayload::deserialize(payload).map_err(parse_error("ios"))?;
        let activity = require(raw.activity, "PhysicalActivity")?;

        Ok(CanonicalActivity {
            user_id: require(raw.user_id, "UserId")?,
            first_name: raw.first_name.unwrap_or_default(),
            last_name: raw.last_name.unwrap_or_default(),
            steps: require(activity.walking_steps, "PhysicalActivity.walking_steps")?,
            latitude: raw.latitude,
            longitude: raw.longitude,
            pincode: raw.pincode,
            timestamp: raw.timestamp,
        })
    }
}

// iOS payload structures; fields the pipeline does not use are ignored

#[derive(Debug, Deserialize)]
struct IosPayload {
    #[serde(rename = "UserId")]
    user_id: Option<String>,
    #[serde(rename = "UserFirstName")]
    first_name: Option<String>,
    #[serde(rename = "UserLastName")]
    last_name: Option<String>,
    #[serde(rename = "PhysicalActivity")]
    activity: Option<IosPhysicalActivity>,
    #[serde(rename = "Geo_lat")]
    latitude: Option<f64>,
    #[serde(rename = "Geo_lon")]
    longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_pincode")]
    pincode: Option<String>,
    #[serde(
        rename = "event_timestamp",
        default,
        deserialize_with = "lenient_timestamp"
    )]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct IosPhysicalActivity {
    walking_steps: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ios_payload() {
        let payload = json!({
            "UserFirstName": "Jane",
            "UserLastName": "Doe",
            "UserAddress": "1 Infinite Loop",
            "UserId": "HIGH-user-1",
            "UserGender": "female",
            "UserHeight": 170,
            "UserWeight": 60,
            "PhysicalActivity": {
                "Dance_minutes": 100,
                "Yoga_minutes": 100,
                "Sleep_hours": 8,
                "walking_steps": 150
            },
            "Geo_lat": 1.3521,
            "Geo_lon": 103.8198,
            "pincode": "333001",
            "event_timestamp": "2024-01-15T08:00:00.000Z"
        });

        let activity = IosAdapter.parse(&payload).unwrap();
        assert_eq!(activity.user_id, "HIGH-user-1");
        assert_eq!(activity.first_name, "Jane");
        assert_eq!(activity.steps, 150);
        assert_eq!(activity.latitude, Some(1.3521));
        assert_eq!(activity.pincode.as_deref(), Some("333001"));
        assert!(activity.timestamp.is_some());
    }

    #[test]
    fn test_missing_steps_is_reported() {
        let payload = json!({
            "UserId": "u1",
            "PhysicalActivity": { "Dance_minutes": 10 },
            "event_timestamp": "2024-01-15T08:00:00Z"
        });

        let err = IosAdapter.parse(&payload).unwrap_err();
        assert!(matches!(err, ProcessError::MissingField(ref f) if f == "PhysicalActivity.walking_steps"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_malformed_timestamp_reads_as_missing() {
        let payload = json!({
            "UserId": "u1",
            "PhysicalActivity": { "walking_steps": 10 },
            "event_timestamp": "not-a-date"
        });

        let activity = IosAdapter.parse(&payload).unwrap();
        assert!(activity.timestamp.is_none());
    }
}
