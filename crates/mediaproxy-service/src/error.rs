use thiserror::Error;

/// Reasons a request for media content did not produce any bytes.
///
/// Every variant is recovered at the [`FetchCoordinator`](crate::coordinator::FetchCoordinator)
/// boundary. None of them is fatal to the service. The payload strings are meant for logs only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The source address was rejected by the access gate.
    #[error("access denied")]
    Denied,
    /// The request did not name a media identifier, or used the wrong method.
    #[error("no media identifier in request")]
    BadIdentifier,
    /// The downloader process could not be started.
    #[error("downloader unavailable: {0}")]
    ToolUnavailable(String),
    /// Reading the downloader output failed, timed out or exceeded the size limit.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    /// The downloaded content could not be written to the cache.
    #[error("storing content failed: {0}")]
    StorageFailed(String),
}

impl FetchError {
    /// A short, stable name of the error kind, used as a metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Denied => "denied",
            FetchError::BadIdentifier => "bad_identifier",
            FetchError::ToolUnavailable(_) => "tool_unavailable",
            FetchError::TransferFailed(_) => "transfer_failed",
            FetchError::StorageFailed(_) => "storage_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = FetchError::TransferFailed("download exceeded 1024 bytes".into());
        insta::assert_snapshot!(err.to_string(), @"transfer failed: download exceeded 1024 bytes");
        assert_eq!(err.kind(), "transfer_failed");
    }
}
