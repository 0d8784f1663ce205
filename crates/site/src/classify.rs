//! Response classification
//!
//! Maps a transport outcome to an `ErrorKind`. Only HTTP 200 bodies reach the
//! site adapter, which decides between a listing, `OutOfStock` and
//! `NoVariants`. Everything else is decided by status code alone.

use crate::{ErrorKind, Listing, SiteAdapter};

/// Status codes the mitigation vendor uses for blocked clients.
const BAN_STATUSES: &[u16] = &[403, 456];

/// Classify a poll by HTTP status. `None` means the request failed at the
/// transport level (timeout, refused connection).
///
/// Returns `None` for HTTP 200: the body must be handed to the adapter.
pub fn classify(status: Option<u16>) -> Option<ErrorKind> {
    match status {
        None => Some(ErrorKind::Network),
        Some(200) => None,
        Some(404) => Some(ErrorKind::NotLoaded),
        Some(code) if BAN_STATUSES.contains(&code) => Some(ErrorKind::Banned),
        Some(code) => Some(ErrorKind::Unknown(code)),
    }
}

/// Classify a complete poll response, delegating 200 bodies to the adapter.
pub fn evaluate(
    adapter: &dyn SiteAdapter,
    product: &str,
    status: Option<u16>,
    body: &[u8],
) -> Result<Listing, ErrorKind> {
    match classify(status) {
        Some(kind) => Err(kind),
        None => adapter.parse(product, body),
    }
}
