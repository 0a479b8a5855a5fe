//! Human-readable reference numbers such as `APR/00042`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const REQUEST_SEQUENCE_CODE: &str = "approval.request";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFormat {
    pub prefix: String,
    pub padding: usize,
}

impl Default for SequenceFormat {
    fn default() -> Self {
        Self { prefix: "APR/".to_owned(), padding: 5 }
    }
}

impl SequenceFormat {
    pub fn format(&self, number: u64) -> String {
        format!("{}{:0width$}", self.prefix, number, width = self.padding)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("sequence `{0}` is not defined")]
    Unknown(String),
    #[error("sequence `{code}` is unavailable: {message}")]
    Unavailable { code: String, message: String },
}

pub trait ReferenceSequence: Send + Sync {
    fn next_reference(&self, code: &str) -> Result<String, SequenceError>;
}

/// Process-local counters; unknown codes start at 1 with `format`.
#[derive(Debug, Default)]
pub struct InMemoryReferenceSequence {
    format: SequenceFormat,
    counters: Mutex<HashMap<String, u64>>,
}

impl InMemoryReferenceSequence {
    pub fn new(format: SequenceFormat) -> Self {
        Self { format, counters: Mutex::new(HashMap::new()) }
    }
}

impl ReferenceSequence for InMemoryReferenceSequence {
    fn next_reference(&self, code: &str) -> Result<String, SequenceError> {
        let mut counters = match self.counters.lock() {
            Ok(counters) => counters,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = counters.entry(code.to_owned()).or_insert(0);
        *next += 1;
        Ok(self.format.format(*next))
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryReferenceSequence, ReferenceSequence, SequenceFormat, REQUEST_SEQUENCE_CODE};

    #[test]
    fn references_are_prefixed_and_padded() {
        let sequence = InMemoryReferenceSequence::default();
        assert_eq!(sequence.next_reference(REQUEST_SEQUENCE_CODE).as_deref(), Ok("APR/00001"));
        assert_eq!(sequence.next_reference(REQUEST_SEQUENCE_CODE).as_deref(), Ok("APR/00002"));
        assert_eq!(sequence.next_reference("other").as_deref(), Ok("APR/00001"));
    }

    #[test]
    fn custom_format_is_applied() {
        let sequence =
            InMemoryReferenceSequence::new(SequenceFormat { prefix: "REQ-".to_owned(), padding: 3 });
        assert_eq!(sequence.next_reference("x").as_deref(), Ok("REQ-001"));
        assert_eq!(SequenceFormat::default().format(123_456), "APR/123456");
    }
}
