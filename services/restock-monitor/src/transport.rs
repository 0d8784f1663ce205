//! Per-task HTTP transport
//!
//! Each task owns one `Transport`: a proxy picked from the shared proxy list
//! and a client bound to it. Clients never keep a cookie store; cookies are
//! sent explicitly from the pool credential and the task's session cookies.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bypass::{ProbeOutcome, QueueCookies, QueueProber, USER_AGENT, probe_once};
use rand::RngExt;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, USER_AGENT as USER_AGENT_HEADER};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const BUST_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Shared, read-only list of proxy URLs.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    proxies: Vec<String>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<String>) -> Self {
        Self { proxies }
    }

    /// A random proxy, or `None` when running proxyless.
    pub fn pick(&self) -> Option<String> {
        if self.proxies.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..self.proxies.len());
        Some(self.proxies[index].clone())
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }
}

/// Build a client for one proxy. No cookie store, fixed timeout.
pub fn build_client(proxy: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(url) = proxy {
        let proxy = reqwest::Proxy::all(url).map_err(|e| Error::Client(e.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|e| Error::Client(e.to_string()))
}

/// Random 8 character token.
fn random_token() -> String {
    let mut rng = rand::rng();
    (0..8)
        .map(|_| BUST_CHARSET[rng.random_range(0..BUST_CHARSET.len())] as char)
        .collect()
}

/// Append a random `key=value` query pair so CDN caches never answer.
pub fn cache_bust(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{}={}", random_token(), random_token())
}

/// Outcome of one poll request.
#[derive(Debug, Default)]
pub struct PollResponse {
    /// `None` when the request failed at the transport level
    pub status: Option<u16>,
    pub body: Vec<u8>,
    pub cookies: Vec<(String, String)>,
    /// Round trip including the body, for any request that got a response
    pub elapsed: Option<Duration>,
}

impl PollResponse {
    pub fn has_cookie(&self, name: &str) -> bool {
        self.cookies.iter().any(|(n, _)| n == name)
    }
}

/// A task's proxy and client.
pub struct Transport {
    proxies: ProxyPool,
    proxy: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl Transport {
    pub fn new(proxies: ProxyPool, timeout: Duration) -> Result<Self> {
        let proxy = proxies.pick();
        let client = build_client(proxy.as_deref(), timeout)?;
        Ok(Self {
            proxies,
            proxy,
            client,
            timeout,
        })
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Switch to a new random proxy and a fresh client.
    ///
    /// If the new client cannot be built the old one is kept.
    pub fn rotate(&mut self) {
        let proxy = self.proxies.pick();
        match build_client(proxy.as_deref(), self.timeout) {
            Ok(client) => {
                self.client = client;
                self.proxy = proxy;
            }
            Err(e) => warn!(error = %e, "failed to rotate proxy, keeping current client"),
        }
    }

    /// GET the product URL. Transport failures and body read failures both
    /// come back with `status: None`.
    pub async fn poll(&self, url: &str, cookie: Option<&str>) -> PollResponse {
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/json, text/html;q=0.9, */*;q=0.8")
            .header(ACCEPT_LANGUAGE, "en-GB,en;q=0.5")
            .header(USER_AGENT_HEADER, USER_AGENT);
        if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
            request = request.header(COOKIE, cookie);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url, error = %e, "poll request failed");
                return PollResponse::default();
            }
        };

        let status = response.status().as_u16();
        let cookies = bypass::response_cookies(response.headers());
        match response.bytes().await {
            Ok(body) => PollResponse {
                status: Some(status),
                body: body.to_vec(),
                cookies,
                elapsed: Some(started.elapsed()),
            },
            Err(e) => {
                debug!(url, status, error = %e, "failed to read poll body");
                PollResponse {
                    elapsed: Some(started.elapsed()),
                    ..PollResponse::default()
                }
            }
        }
    }

    /// Ask the CDN to drop its cached copy. Failures are only logged.
    pub async fn purge(&self, url: &str) {
        let method = match reqwest::Method::from_bytes(b"PURGE") {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "invalid PURGE method");
                return;
            }
        };
        match self
            .client
            .request(method, url)
            .header(USER_AGENT_HEADER, USER_AGENT)
            .send()
            .await
        {
            Ok(r) => debug!(url, status = r.status().as_u16(), "purge sent"),
            Err(e) => debug!(url, error = %e, "purge failed"),
        }
    }

    /// A queue prober starting from this transport's proxy.
    pub fn prober(&self, names: QueueCookies) -> ProxyProber {
        ProxyProber {
            proxies: self.proxies.clone(),
            proxy: self.proxy.clone(),
            timeout: self.timeout,
            names,
        }
    }
}

/// Queue prober that builds a fresh, cookie-less client for every probe.
pub struct ProxyProber {
    proxies: ProxyPool,
    proxy: Option<String>,
    timeout: Duration,
    names: QueueCookies,
}

impl QueueProber for ProxyProber {
    fn probe<'a>(
        &'a mut self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>> {
        Box::pin(async move {
            match build_client(self.proxy.as_deref(), self.timeout) {
                Ok(client) => probe_once(&client, url, &self.names).await,
                Err(e) => {
                    warn!(error = %e, "failed to build probe client");
                    ProbeOutcome::Unexpected(None)
                }
            }
        })
    }

    fn rotate_proxy(&mut self) {
        self.proxy = self.proxies.pick();
    }
}
