//! Error types for `chanmux` core library.

use thiserror::Error;

/// Result type alias using `chanmux` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `chanmux` operations.
///
/// Dropped bundles, lost demux registrations and stalled sends are not
/// errors; they surface only through channel behavior and log output.
#[derive(Debug, Error)]
pub enum Error {
    /// The actor owning a routing table is no longer running
    #[error("{0} actor is not running")]
    ActorStopped(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_stopped_names_the_actor() {
        let err = Error::ActorStopped("demuxer");
        assert_eq!(err.to_string(), "demuxer actor is not running");
    }
}
