//! Error types for trail guidance and group coordination.

use thiserror::Error;

/// Why a point sequence could not be turned into a [`Track`](crate::Track).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidTrackError {
    #[error("track needs at least {minimum_required} points, got {point_count}")]
    TooFewPoints {
        point_count: usize,
        minimum_required: usize,
    },

    #[error("point {index} has a non-finite or out-of-range coordinate")]
    NonFiniteCoordinate { index: usize },
}

/// Errors surfaced by the guidance engine, sensor adapters and group sync.
#[derive(Error, Debug)]
pub enum GuideError {
    #[error("invalid track: {0}")]
    InvalidTrack(#[from] InvalidTrackError),

    #[error("sensor unavailable: {0}")]
    SensorUnavailable(&'static str),

    #[error("sensor already started: {0}")]
    SensorAlreadyStarted(&'static str),

    #[error("no tokio runtime available to drive the hike session")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("could not decode group service response: {0}")]
    Decode(String),

    #[error("group service returned HTTP {status}")]
    Http { status: u16 },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("no credential available for the group service")]
    MissingCredential,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl GuideError {
    /// Transient failures are retried with exponential backoff by the group
    /// sync loop; the rest wait the full backoff cap.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GuideError::Network(_)
                | GuideError::Timeout(_)
                | GuideError::Http { .. }
                | GuideError::MissingCredential
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: GuideError = InvalidTrackError::TooFewPoints {
            point_count: 1,
            minimum_required: 2,
        }
        .into();
        assert!(err.to_string().contains("at least 2 points"));
        assert!(err.to_string().contains("got 1"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(GuideError::Timeout("pull").is_transient());
        assert!(GuideError::Http { status: 503 }.is_transient());
        assert!(!GuideError::NoRuntime.is_transient());
        assert!(!GuideError::Decode("expected array".to_string()).is_transient());
        assert!(!GuideError::InvalidTrack(InvalidTrackError::NonFiniteCoordinate { index: 3 })
            .is_transient());
    }
}
