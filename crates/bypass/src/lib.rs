//! Bot-mitigation bypass primitives
//!
//! Everything the monitor needs to get past the retailer's mitigation layer,
//! with no knowledge of tasks or pools:
//!
//! 1. `token::fetch_payload()` asks the token-issuing service for a challenge solution
//! 2. `token::submit_solution()` posts it to the site's challenge endpoint
//! 3. The endpoint's `Set-Cookie` headers become the credential (`cookies` module)
//! 4. `queue::resolve_queue()` probes a waiting room until a pass cookie is issued

pub mod constants;
pub mod cookies;
pub mod error;
pub mod queue;
pub mod token;

pub use constants::*;
pub use cookies::{cookie_header, parse_set_cookie, response_cookies};
pub use error::{Error, Result};
pub use queue::{
    ProbeOutcome, QueueCookies, QueuePass, QueueProber, QueueState, classify_probe, probe_once,
    resolve_queue,
};
pub use token::{PayloadResponse, fetch_payload, solve_challenge, submit_solution};
