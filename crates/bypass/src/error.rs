//! Error types for challenge and token-service operations

/// Errors from the bypass flow. All of them are transient from the
/// monitor's point of view: the caller retries on a later poll.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token service failed: {0}")]
    TokenService(String),

    #[error("challenge rejected: {0}")]
    ChallengeRejected(String),
}

/// Result alias for bypass operations.
pub type Result<T> = std::result::Result<T, Error>;
