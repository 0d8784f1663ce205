//! Service-specific error types

use thiserror::Error;

/// Monitor runtime errors.
///
/// Poll outcomes are not errors: they are `site::ErrorKind` values handled
/// inside the task loop. These cover transport setup, credentials and
/// notification delivery, all of which are logged and never stop a task.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("credential unavailable: {0}")]
    Credential(#[from] credential_pool::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("delivery still rate limited after {0} retries")]
    RateLimited(u32),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
