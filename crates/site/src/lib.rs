//! Site adapter capability for the restock monitor
//!
//! Defines the `SiteAdapter` trait that decouples the generic task loop from
//! per-retailer response formats. The task loop owns all I/O and retry policy;
//! an adapter only turns a product response body into a normalized
//! `AvailabilityMap` (or says why it could not). `JsonAdapter` is the
//! configurable implementation used for JSON product endpoints.

pub mod classify;
pub mod json;

pub use classify::{classify, evaluate};
pub use json::{JsonAdapter, JsonPointers};

use std::collections::HashMap;

use serde::Serialize;

/// Variant key (size label, SKU suffix, ...) to in-stock flag.
pub type AvailabilityMap = HashMap<String, bool>;

/// Classification of a poll that did not produce a usable listing.
///
/// Drives the task loop's recovery branch:
/// - OutOfStock / NoVariants / NotLoaded are "known" states, polling continues
/// - Banned / Network / Unknown rotate the proxy and refresh the credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 403 or 456 from the site (bot mitigation)
    Banned,
    /// Listing exists but is not in stock or not salable
    OutOfStock,
    /// Listing exists but carries no variant list
    NoVariants,
    /// 404, listing not published yet
    NotLoaded,
    /// Timeout, connection refused, body read failure
    Network,
    /// Any other status code
    Unknown(u16),
}

impl ErrorKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Banned => "banned",
            ErrorKind::OutOfStock => "out_of_stock",
            ErrorKind::NoVariants => "no_variants",
            ErrorKind::NotLoaded => "not_loaded",
            ErrorKind::Network => "network",
            ErrorKind::Unknown(_) => "unknown",
        }
    }

    /// Whether this outcome rotates transport state (proxy + credential).
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            ErrorKind::Banned | ErrorKind::Network | ErrorKind::Unknown(_)
        )
    }
}

/// Descriptive product data captured from the first successful parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProductInfo {
    pub name: Option<String>,
    pub url: Option<String>,
    pub price: Option<String>,
    pub image: Option<String>,
}

/// A successfully parsed product listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    pub info: ProductInfo,
    pub availability: AvailabilityMap,
    /// Variant key to the site's own option id, for adapters that expose one
    pub variant_ids: HashMap<String, String>,
}

/// Per-site response parsing strategy.
///
/// Implementations must not perform I/O or retry; they are called once per
/// HTTP 200 response with the raw body.
pub trait SiteAdapter: Send + Sync {
    /// Identifier used in configuration, logs and metric labels (e.g. "end-gb")
    fn id(&self) -> &str;

    /// Human readable site name for notifications
    fn name(&self) -> &str;

    /// URL polled for the given product identifier.
    fn product_url(&self, product: &str) -> String;

    /// Parse a 200 response body into a listing.
    ///
    /// Returns `OutOfStock` when the listing is not purchasable and
    /// `NoVariants` when it carries no variant list.
    fn parse(&self, product: &str, body: &[u8]) -> Result<Listing, ErrorKind>;
}
