//! Classification of framed stdout lines into protocol events.

use crate::cli::{WireRecord, WorkerRecord};

/// Outcome of classifying one line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Empty or whitespace-only line.
    Blank,
    /// Not a protocol record; kept as diagnostic text.
    Text(String),
    /// A JSON object record.
    Record {
        /// The record exactly as received, for pass-through subscribers.
        raw: serde_json::Value,
        /// Its lifecycle interpretation.
        record: WorkerRecord,
    },
}

/// Classify a single line.
///
/// Never fails: lines that are not JSON objects degrade to
/// [`Classified::Text`], and objects with an unknown or malformed shape become
/// [`WorkerRecord::Unrecognized`].
#[must_use]
pub fn classify(line: &str) -> Classified {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Classified::Blank;
    }

    let raw = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) if value.is_object() => value,
        Ok(_) => return Classified::Text(line.to_string()),
        Err(e) => {
            tracing::trace!(error = %e, "Line is not a protocol record");
            return Classified::Text(line.to_string());
        }
    };

    let record = match serde_json::from_value::<WireRecord>(raw.clone()) {
        Ok(wire) => WorkerRecord::from(wire),
        Err(e) => {
            tracing::debug!(error = %e, "Record has an unexpected shape");
            WorkerRecord::Unrecognized
        }
    };

    Classified::Record { raw, record }
}
