//! Log record envelope
//!
//! Every input record carries the topic-like `source` it was read from, the
//! partitioning key (the user id), the raw payload and, when the log provides
//! one, the record's offset within its partition.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::{AndroidAdapter, IosAdapter, NormalizedAdapter, PlatformPayloadAdapter};
use crate::error::ProcessError;

/// Stream a record was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Ios,
    Android,
    /// Already-normalized activity events
    Normalized,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Ios => "ios",
            Source::Android => "android",
            Source::Normalized => "normalized",
        }
    }

    /// Adapter that understands payloads from this source
    pub fn adapter(&self) -> &'static dyn PlatformPayloadAdapter {
        match self {
            Source::Ios => &IosAdapter,
            Source::Android => &AndroidAdapter,
            Source::Normalized => &NormalizedAdapter,
        }
    }
}

/// One record of the abstract ordered input log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub source: Source,
    /// Partitioning key; the user id
    pub key: String,
    pub value: Value,
    /// Offset within the partition, if the log assigned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl LogRecord {
    pub fn new(source: Source, key: impl Into<String>, value: Value) -> Self {
        Self {
            source,
            key: key.into(),
            value,
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Parse one NDJSON line into a record
    pub fn from_json_line(line: &str) -> Result<Self, ProcessError> {
        let record: LogRecord = serde_json::from_str(line.trim())?;
        if record.key.is_empty() {
            return Err(ProcessError::MissingField("key".to_string()));
        }
        Ok(record)
    }
}
