//! Error types for pool operations

/// Errors from pool operations. All are transient for a polling task,
/// which retries on its next cycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential pool has no slots")]
    Empty,

    #[error("unknown credential slot: {0}")]
    UnknownSlot(String),

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),

    #[error("no fresh credential after {0} selection rounds")]
    Stale(usize),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
