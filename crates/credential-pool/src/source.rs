//! Upstream issuer of new credential values

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// Issues a new credential value for a slot.
///
/// Uses `Pin<Box<dyn Future>>` instead of `async fn` so the pool can hold it
/// as `Arc<dyn CredentialSource>`. Implementations must not retry; the pool
/// and its callers decide when to try again.
pub trait CredentialSource: Send + Sync {
    /// Obtain a fresh credential value (a `Cookie` header value) for `key`.
    fn issue<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}
