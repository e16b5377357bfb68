//! Error types for the speech-to-expression synchronization core.

/// Top-level error type for kuchipaku.
///
/// Only [`SyncError::BackendUnavailable`] ever reaches the caller of a
/// speech request. Every other kind is absorbed internally and degrades to
/// an idle or fallback animation state.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The always-available local speech backend failed. Fatal for the
    /// current utterance.
    #[error("local speech backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The remote voice backend failed (load, network or playback).
    #[error("remote speech backend failed: {0}")]
    BackendTransient(String),

    /// Timing units violate the ordering invariant or carry no visemes.
    #[error("malformed timing data: {0}")]
    MalformedTiming(String),

    /// A viseme or emotion label the loaded model does not provide.
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),

    /// Audio decoding or output device failure.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Host protocol (envelope or payload) error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether this error is surfaced to the caller that requested speech.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_local_failure_is_user_visible() {
        assert!(SyncError::BackendUnavailable("no voices".into()).is_user_visible());
        assert!(!SyncError::BackendTransient("503".into()).is_user_visible());
        assert!(!SyncError::MalformedTiming("unordered".into()).is_user_visible());
        assert!(!SyncError::UnsupportedShape("oh".into()).is_user_visible());
        assert!(!SyncError::Audio("no default output device".into()).is_user_visible());
    }

    #[test]
    fn display_includes_reason() {
        let err = SyncError::BackendTransient("connection refused".into());
        assert_eq!(
            err.to_string(),
            "remote speech backend failed: connection refused"
        );
    }
}
