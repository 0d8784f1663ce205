//! Queue bypass resolver
//!
//! Waiting rooms hold a client by setting a marker cookie and release it by
//! setting a pass cookie instead. The resolver probes the queued URL until
//! the pass cookie shows up:
//!
//! ```text
//!   Probing --queued--> Probing          (probe again immediately)
//!   Probing --banned--> Probing          (rotate proxy first)
//!   Probing --no response--> Probing     (rotate proxy, short back-off)
//!   Probing --passed--> Passed(token)    (return to caller)
//! ```
//!
//! There is no retry cap, and queued responses are re-probed without a
//! sleep. The queue advances on the vendor's side, so the caller bounds the
//! wait with `tokio::time::timeout`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::USER_AGENT as USER_AGENT_HEADER;
use tracing::{debug, info, warn};

use crate::constants::{QUEUE_MARKER_COOKIE, QUEUE_PASS_COOKIE, USER_AGENT};
use crate::cookies::response_cookies;

/// Pause after a probe that got no HTTP response at all.
pub const TRANSPORT_BACKOFF: Duration = Duration::from_millis(250);

/// Classification of a single probe response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Still held in the waiting room
    Queued,
    /// 403 from the site, the current proxy is burned
    Banned,
    /// Pass cookie issued; carries its value
    Passed(String),
    /// Transport failure (`None`) or an unexpected status
    Unexpected(Option<u16>),
}

/// Cookie names that mark the waiting room and the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCookies {
    pub marker: String,
    pub pass: String,
}

impl Default for QueueCookies {
    fn default() -> Self {
        Self {
            marker: QUEUE_MARKER_COOKIE.to_string(),
            pass: QUEUE_PASS_COOKIE.to_string(),
        }
    }
}

/// Resolver state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    Probing,
    Passed(String),
}

/// Result of a resolved queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePass {
    /// Value of the pass cookie
    pub token: String,
    pub probes: u64,
    pub rotations: u64,
}

/// Classify a probe response from its status and `Set-Cookie` pairs.
///
/// A 200 carrying the marker is queued even if a pass cookie is also set.
/// A 200 with neither cookie is treated as still queued.
pub fn classify_probe(
    status: Option<u16>,
    cookies: &[(String, String)],
    names: &QueueCookies,
) -> ProbeOutcome {
    match status {
        None => ProbeOutcome::Unexpected(None),
        Some(403) => ProbeOutcome::Banned,
        Some(200) => {
            if cookies.iter().any(|(name, _)| *name == names.marker) {
                return ProbeOutcome::Queued;
            }
            match cookies.iter().find(|(name, _)| *name == names.pass) {
                Some((_, value)) => ProbeOutcome::Passed(value.clone()),
                None => ProbeOutcome::Queued,
            }
        }
        Some(code) => ProbeOutcome::Unexpected(Some(code)),
    }
}

/// Issue one HEAD probe and classify it.
///
/// `client` must be freshly built without a cookie store so a queue-held
/// session is never replayed.
pub async fn probe_once(client: &reqwest::Client, url: &str, names: &QueueCookies) -> ProbeOutcome {
    let response = match client
        .head(url)
        .header(USER_AGENT_HEADER, USER_AGENT)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "queue probe failed");
            return ProbeOutcome::Unexpected(None);
        }
    };
    let cookies = response_cookies(response.headers());
    classify_probe(Some(response.status().as_u16()), &cookies, names)
}

/// Transport used by the resolver.
///
/// Uses `Pin<Box<dyn Future>>` so the task runner can hold it as a trait object.
pub trait QueueProber: Send {
    /// Probe `url` once with the current proxy.
    fn probe<'a>(
        &'a mut self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>>;

    /// Switch to a different proxy for subsequent probes.
    fn rotate_proxy(&mut self);
}

/// Probe until the waiting room issues a pass cookie.
pub async fn resolve_queue(prober: &mut dyn QueueProber, url: &str) -> QueuePass {
    let mut state = QueueState::Probing;
    let mut probes = 0u64;
    let mut rotations = 0u64;

    loop {
        match state {
            QueueState::Passed(token) => {
                info!(probes, rotations, "queue passed");
                return QueuePass {
                    token,
                    probes,
                    rotations,
                };
            }
            QueueState::Probing => {
                probes += 1;
                state = match prober.probe(url).await {
                    ProbeOutcome::Passed(token) => QueueState::Passed(token),
                    ProbeOutcome::Queued => {
                        // Keep the loop cancellable by the caller's timeout.
                        tokio::task::yield_now().await;
                        QueueState::Probing
                    }
                    ProbeOutcome::Banned => {
                        warn!(probes, "banned while queued, rotating proxy");
                        prober.rotate_proxy();
                        rotations += 1;
                        QueueState::Probing
                    }
                    ProbeOutcome::Unexpected(status) => {
                        debug!(?status, probes, "unexpected queue probe response, rotating proxy");
                        prober.rotate_proxy();
                        rotations += 1;
                        if status.is_none() {
                            tokio::time::sleep(TRANSPORT_BACKOFF).await;
                        }
                        QueueState::Probing
                    }
                };
            }
        }
    }
}
