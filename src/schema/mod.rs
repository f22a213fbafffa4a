//! Input log schema
//!
//! This module defines the envelope every input record arrives in and the
//! rule that turns a payload into an event-timed normalized event.

mod extractor;
mod record;

pub use extractor::extract_event_time;
pub use record::{LogRecord, Source};
