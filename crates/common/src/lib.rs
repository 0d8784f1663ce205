//! Types shared by the restock monitor crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
