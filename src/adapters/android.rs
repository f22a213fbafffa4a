//! Android platform adapter
//!
//! Parses Health Connect bridge payloads and maps them to canonical activity.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{
    lenient_pincode, lenient_timestamp, parse_error, require, CanonicalActivity,
    PlatformPayloadAdapter,
};
use crate::error::ProcessError;

/// Android payload adapter
pub struct AndroidAdapter;

impl PlatformPayloadAdapter for AndroidAdapter {
    fn name(&self) -> &'static str {
        "android"
    }

    fn parse(&self, payload: &Value) -> Result<CanonicalActivity, ProcessError> {
        let raw = AndroidPayload::deserialize(payload).map_err(parse_error("android"))?;
        let person = require(raw.person, "Person")?;
        let activity = require(raw.activity, "Activity")?;

        // Location block is optional as a whole
        let (latitude, longitude, pincode) = match raw.location {
            Some(loc) => (loc.lat, loc.lon, loc.pincode),
            None => (None, None, None),
        };

        Ok(CanonicalActivity {
            user_id: require(person.id, "Person.Id")?,
            first_name: person.first_name.unwrap_or_default(),
            last_name: person.last_name.unwrap_or_default(),
            steps: require(activity.walking_steps, "Activity.walking_steps")?,
            latitude,
            longitude,
            pincode,
            timestamp: raw.timestamp,
        })
    }
}

// Android payload structures

#[derive(Debug, Deserialize)]
struct AndroidPayload {
    #[serde(rename = "Person")]
    person: Option<AndroidPerson>,
    #[serde(rename = "Activity")]
    activity: Option<AndroidActivity>,
    #[serde(rename = "Location")]
    location: Option<AndroidLocation>,
    #[serde(rename = "ts", default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AndroidPerson {
    id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AndroidActivity {
    walking_steps: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AndroidLocation {
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default, deserialize_with = "lenient_pincode")]
    pincode: Option<String>,
}
