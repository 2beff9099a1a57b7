//! Error types for relp-gateway.

use thiserror::Error;

/// Main error type for all RELP operations.
#[derive(Debug, Error)]
pub enum RelpError {
    /// Malformed framing or a declared datalen above the cap.
    ///
    /// The byte stream cannot be re-synchronised after this; the connection
    /// must be torn down.
    #[error("Frame parse error: {0}")]
    FrameParse(String),

    /// The `open` offers requested an unsupported (or no) `relp_version`.
    #[error("Version error: {0}")]
    Version(String),

    /// Command received in a session state that does not accept it.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config and JSON-lines sink).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The storage sink failed to persist a batch.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Peer closed the connection before sending `close`.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl RelpError {
    /// True for [`RelpError::FrameParse`].
    pub fn is_frame_parse(&self) -> bool {
        matches!(self, RelpError::FrameParse(_))
    }

    /// True for [`RelpError::Version`].
    pub fn is_version(&self) -> bool {
        matches!(self, RelpError::Version(_))
    }

    /// True for [`RelpError::Protocol`].
    pub fn is_protocol(&self) -> bool {
        matches!(self, RelpError::Protocol(_))
    }
}

/// Result type alias using RelpError.
pub type Result<T> = std::result::Result<T, RelpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_predicates() {
        assert!(RelpError::FrameParse("x".into()).is_frame_parse());
        assert!(RelpError::Version("x".into()).is_version());
        assert!(RelpError::Protocol("x".into()).is_protocol());
        assert!(!RelpError::ConnectionClosed.is_protocol());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = RelpError::FrameParse("datalen 200000 exceeds maximum 128000".into());
        assert_eq!(
            err.to_string(),
            "Frame parse error: datalen 200000 exceeds maximum 128000"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: RelpError = io.into();
        assert!(matches!(err, RelpError::Io(_)));
    }
}
