// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// A single categorized log message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogEntry {
    pub category: String,
    pub message: Vec<u8>,
}

impl LogEntry {
    pub fn new(category: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        LogEntry {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// Outcome of a `Log` call, both inbound and towards downstream forwarders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    TryLater,
}

impl ResultCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::TryLater => 1,
        }
    }

    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ResultCode::Ok),
            1 => Some(ResultCode::TryLater),
            _ => None,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Ok => write!(f, "OK"),
            ResultCode::TryLater => write!(f, "TRY_LATER"),
        }
    }
}

/// Message bytes in a batch, as counted against queue write thresholds.
pub fn batch_size(entries: &[LogEntry]) -> usize {
    entries.iter().map(|entry| entry.message.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_counts_message_bytes() {
        let entry = LogEntry::new("cat", "hello");
        assert_eq!(batch_size(&[entry.clone(), entry]), 10);
        assert_eq!(batch_size(&[]), 0);
    }

    #[test]
    fn test_result_code_round_trip() {
        assert_eq!(ResultCode::from_i32(0), Some(ResultCode::Ok));
        assert_eq!(ResultCode::from_i32(1), Some(ResultCode::TryLater));
        assert_eq!(ResultCode::from_i32(7), None);
        assert_eq!(ResultCode::TryLater.as_i32(), 1);
        assert_eq!(ResultCode::Ok.to_string(), "OK");
    }
}
