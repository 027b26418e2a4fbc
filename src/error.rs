//! Error types for Mnemon

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Mnemon operations
pub type Result<T> = std::result::Result<T, MnemonError>;

/// Main error type for Mnemon
#[derive(Error, Debug)]
pub enum MnemonError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MnemonError {
    /// Check if this error must propagate synchronously to the foreground
    /// caller (the local write cannot be silently dropped).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MnemonError::Database(_) | MnemonError::Storage(_) | MnemonError::Io(_)
        )
    }
}

/// Handling class for a failure on the sync path.
///
/// Every remote error is classified exactly once, at the edge that observed
/// it, and the worker dispatches on the class alone:
/// - `Temporary` entries are retried with exponential backoff
/// - `Limit` entries are never retried with the same payload (batches may be
///   split, single entries are dead-lettered)
/// - `Permanent` entries are dead-lettered immediately
/// - `Fatal` never reaches the worker; it is raised on the foreground write
///   path when the local durable storage itself is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncErrorClass {
    Temporary,
    Limit,
    Permanent,
    Fatal,
}

impl SyncErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorClass::Temporary => "temporary",
            SyncErrorClass::Limit => "limit",
            SyncErrorClass::Permanent => "permanent",
            SyncErrorClass::Fatal => "fatal",
        }
    }

    /// Only temporary failures are ever retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncErrorClass::Temporary)
    }
}

impl std::fmt::Display for SyncErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A remote-store failure carrying its handling class.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{class} error: {message}")]
pub struct RemoteError {
    pub class: SyncErrorClass,
    pub message: String,
}

impl RemoteError {
    pub fn new(class: SyncErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(SyncErrorClass::Temporary, message)
    }

    pub fn limit(message: impl Into<String>) -> Self {
        Self::new(SyncErrorClass::Limit, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(SyncErrorClass::Permanent, message)
    }

    /// Classify an HTTP-style status code and message into a remote error.
    ///
    /// Status 0 means the request never produced a response (connection
    /// refused, DNS failure, timeout).
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(classify_status(status, &message), message)
    }
}

/// Central status-code classification used by the worker and every remote
/// adapter. Keep this exhaustive: any unmatched status falls through to
/// `Permanent` so a misbehaving backend can never cause an infinite retry
/// loop.
pub fn classify_status(status: u16, message: &str) -> SyncErrorClass {
    let msg = message.to_lowercase();
    match status {
        // No response at all: connection refused, DNS, timeout
        0 => SyncErrorClass::Temporary,
        // Request timeout and throttling are worth retrying later,
        // except 429 which signals a quota
        408 => SyncErrorClass::Temporary,
        // Payload/quota limits, including insufficient remote storage
        402 | 413 | 429 | 507 => SyncErrorClass::Limit,
        // Auth failures are permanent regardless of message wording
        401 | 403 => SyncErrorClass::Permanent,
        s if s >= 500 => SyncErrorClass::Temporary,
        s if (400..500).contains(&s) => {
            if msg.contains("quota") || msg.contains("limit") || msg.contains("capacity") {
                SyncErrorClass::Limit
            } else {
                SyncErrorClass::Permanent
            }
        }
        _ => SyncErrorClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_statuses_never_retryable() {
        for status in [402u16, 413, 429, 507] {
            let class = classify_status(status, "");
            assert_eq!(class, SyncErrorClass::Limit, "status {}", status);
            assert!(!class.is_retryable());
        }
    }

    #[test]
    fn test_server_errors_are_temporary() {
        for status in [500u16, 502, 503, 504, 599] {
            assert_eq!(classify_status(status, ""), SyncErrorClass::Temporary);
        }
    }

    #[test]
    fn test_connection_failure_is_temporary() {
        assert_eq!(
            classify_status(0, "connection refused"),
            SyncErrorClass::Temporary
        );
        assert_eq!(classify_status(408, "timeout"), SyncErrorClass::Temporary);
    }

    #[test]
    fn test_auth_is_permanent_even_with_quota_wording() {
        assert_eq!(
            classify_status(403, "quota check forbidden"),
            SyncErrorClass::Permanent
        );
        assert_eq!(classify_status(401, "limit"), SyncErrorClass::Permanent);
    }

    #[test]
    fn test_quota_message_upgrades_4xx_to_limit() {
        assert_eq!(
            classify_status(400, "monthly quota exceeded"),
            SyncErrorClass::Limit
        );
        assert_eq!(
            classify_status(422, "row limit reached"),
            SyncErrorClass::Limit
        );
        assert_eq!(
            classify_status(400, "malformed record"),
            SyncErrorClass::Permanent
        );
    }

    #[test]
    fn test_unexpected_status_is_permanent() {
        assert_eq!(classify_status(301, ""), SyncErrorClass::Permanent);
        assert_eq!(classify_status(204, ""), SyncErrorClass::Permanent);
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::from_status(413, "payload too large");
        assert_eq!(err.class, SyncErrorClass::Limit);
        assert_eq!(err.to_string(), "limit error: payload too large");
    }

    #[test]
    fn test_fatal_detection() {
        let err = MnemonError::Storage("disk full".to_string());
        assert!(err.is_fatal());
        let err = MnemonError::Sync("behind".to_string());
        assert!(!err.is_fatal());
    }
}
