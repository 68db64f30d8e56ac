// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error type of the transport API. Shared-memory plumbing below it reports
// plain `io::Error`s, which convert into `TransportError::Io`.

use std::io;

use thiserror::Error;

/// Errors surfaced by buffers, instances, clients and producers.
///
/// Capacity drops, lock timeouts and unknown payload types are outcomes, not
/// errors; they are reported through return values and counters instead.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TransportError {
    /// An OS call on a shared object failed.
    #[error("shared memory I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A record body does not fit the 2-byte length prefix.
    #[error("record body of {size} bytes exceeds the {max}-byte frame limit")]
    RecordTooLarge { size: usize, max: usize },

    /// A string field cannot be encoded (it contains a NUL byte).
    #[error("field `{field}` contains a NUL byte")]
    InvalidField { field: &'static str },

    /// Bytes read back from a buffer could not be decoded.
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// The named buffer exists but its creator has not finished setting it up.
    #[error("buffer {name} is not initialised yet")]
    NotReady { name: String },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A JSON document (configuration or distribution list) failed to parse.
    #[error("invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        TransportError::Malformed {
            what,
            reason: reason.into(),
        }
    }

    /// Short stable label for logs and counters.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportError::Io(_) => "transport_io",
            TransportError::RecordTooLarge { .. } => "transport_record_too_large",
            TransportError::InvalidField { .. } => "transport_invalid_field",
            TransportError::Malformed { .. } => "transport_malformed",
            TransportError::NotReady { .. } => "transport_not_ready",
            TransportError::Config(_) => "transport_config",
            TransportError::Json(_) => "transport_json",
        }
    }
}

/// Result alias used across the transport API.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_and_keep_their_message() {
        let err: TransportError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.as_label(), "transport_io");
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn record_too_large_mentions_both_sizes() {
        let err = TransportError::RecordTooLarge { size: 70000, max: 65535 };
        let text = err.to_string();
        assert!(text.contains("70000"));
        assert!(text.contains("65535"));
    }
}
