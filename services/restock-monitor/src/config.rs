//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The token service API key is loaded from TOKEN_API_KEY env var or
//! api_key_file, never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use site::JsonPointers;
use site::json::PRODUCT_PLACEHOLDER;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    /// Without this section tasks poll without credentials
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub status: StatusConfig,
    /// Proxy URLs; empty means direct connections
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Task loop policy knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub request_timeout_secs: u64,
    /// Rotate proxy and credential every this many requests
    pub rotate_every: u64,
    pub pacing_ms: u64,
    pub recovery_pacing_ms: u64,
    pub queue_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 15,
            rotate_every: 25,
            pacing_ms: 750,
            recovery_pacing_ms: 2500,
            queue_timeout_secs: 300,
        }
    }
}

impl MonitorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn recovery_pacing(&self) -> Duration {
        Duration::from_millis(self.recovery_pacing_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

/// Latency anomaly thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Samples per computed mean
    pub window: usize,
    pub ratio: f64,
    pub floor_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            window: 25,
            ratio: 0.3,
            floor_ms: 150,
        }
    }
}

/// Credential pool and token service settings
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_slots")]
    pub slots: usize,
    /// Pre-fetched cookie values installed into the first slots at startup
    #[serde(default)]
    pub seeds: Vec<Secret<String>>,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    pub token_endpoint: String,
    pub challenge_url: String,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the API key (alternative to TOKEN_API_KEY env var)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

fn default_slots() -> usize {
    4
}

fn default_ttl() -> u64 {
    1800
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_refresh_threshold() -> u64 {
    120
}

impl CredentialsConfig {
    /// Slot keys `slot-0` .. `slot-{n-1}`.
    pub fn slot_keys(&self) -> Vec<String> {
        (0..self.slots).map(|i| format!("slot-{i}")).collect()
    }
}

/// Outbound notification targets
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhooks: Vec<String>,
    pub restock_server: Option<String>,
    pub retry_delay_secs: u64,
    pub max_retries: u32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhooks: Vec::new(),
            restock_server: None,
            retry_delay_secs: 5,
            max_retries: 3,
        }
    }
}

/// Health and metrics listener
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusConfig {
    pub listen_addr: Option<SocketAddr>,
}

/// One retailer endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub id: String,
    pub name: String,
    /// Product URL with a `{product}` placeholder
    pub url_template: String,
    /// Append a random query pair to every poll
    #[serde(default)]
    pub cache_bust: bool,
    /// Send PURGE to the product URL before every poll
    #[serde(default)]
    pub purge_before_poll: bool,
    #[serde(default = "default_marker_cookie")]
    pub queue_marker_cookie: String,
    #[serde(default = "default_pass_cookie")]
    pub queue_pass_cookie: String,
    #[serde(default)]
    pub json: JsonPointers,
}

fn default_marker_cookie() -> String {
    bypass::QUEUE_MARKER_COOKIE.to_string()
}

fn default_pass_cookie() -> String {
    bypass::QUEUE_PASS_COOKIE.to_string()
}

/// A tracked product and the sites it is polled on
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub product: String,
    pub sites: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file, validate it, then overlay
    /// environment variables.
    ///
    /// API key resolution order:
    /// 1. TOKEN_API_KEY env var
    /// 2. api_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Some(credentials) = config.credentials.as_mut() {
            if let Ok(key) = std::env::var("TOKEN_API_KEY") {
                credentials.api_key = Some(Secret::new(key));
            } else if let Some(ref key_file) = credentials.api_key_file {
                let key = std::fs::read_to_string(key_file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read api_key_file {}: {e}",
                        key_file.display()
                    ))
                })?;
                let key = key.trim().to_owned();
                if !key.is_empty() {
                    credentials.api_key = Some(Secret::new(key));
                }
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("restock-monitor.toml")
    }

    /// Look up a site by id.
    pub fn site(&self, id: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.id == id)
    }

    fn validate(&self) -> common::Result<()> {
        if self.tasks.is_empty() {
            return Err(invalid("at least one [[tasks]] entry is required"));
        }

        let mut site_ids = HashSet::new();
        for site in &self.sites {
            if !site_ids.insert(site.id.as_str()) {
                return Err(invalid(format!("duplicate site id: {}", site.id)));
            }
            if !site.url_template.contains(PRODUCT_PLACEHOLDER) {
                return Err(invalid(format!(
                    "url_template for site {} must contain {PRODUCT_PLACEHOLDER}",
                    site.id
                )));
            }
            check_url(&format!("sites.{}.url_template", site.id), &site.url_template)?;
        }

        for task in &self.tasks {
            if task.product.trim().is_empty() {
                return Err(invalid("task product must not be empty"));
            }
            if task.sites.is_empty() {
                return Err(invalid(format!("task {} lists no sites", task.product)));
            }
            for id in &task.sites {
                if !site_ids.contains(id.as_str()) {
                    return Err(invalid(format!(
                        "task {} references unknown site: {id}",
                        task.product
                    )));
                }
            }
        }

        if self.monitor.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs must be greater than 0"));
        }
        if self.monitor.rotate_every == 0 {
            return Err(invalid("rotate_every must be greater than 0"));
        }
        if self.latency.window == 0 {
            return Err(invalid("latency window must be greater than 0"));
        }
        if !(self.latency.ratio > 0.0 && self.latency.ratio <= 1.0) {
            return Err(invalid(format!(
                "latency ratio must be in (0, 1], got: {}",
                self.latency.ratio
            )));
        }

        if let Some(credentials) = &self.credentials {
            if credentials.slots == 0 {
                return Err(invalid("credential slots must be greater than 0"));
            }
            if credentials.ttl_secs == 0 {
                return Err(invalid("ttl_secs must be greater than 0"));
            }
            if credentials.refresh_interval_secs == 0 {
                return Err(invalid("refresh_interval_secs must be greater than 0"));
            }
            if credentials.seeds.len() > credentials.slots {
                return Err(invalid(format!(
                    "{} seeds configured for {} slots",
                    credentials.seeds.len(),
                    credentials.slots
                )));
            }
            check_url("token_endpoint", &credentials.token_endpoint)?;
            check_url("challenge_url", &credentials.challenge_url)?;
        }

        for webhook in &self.notify.webhooks {
            check_url("webhook", webhook)?;
        }
        if let Some(server) = &self.notify.restock_server {
            check_url("restock_server", server)?;
        }
        for proxy in &self.proxies {
            check_url("proxy", proxy)?;
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> common::Error {
    common::Error::Config(msg.into())
}

/// Reject anything that is not an absolute http(s) URL. The `{product}`
/// placeholder is substituted before parsing.
fn check_url(field: &str, value: &str) -> common::Result<()> {
    let candidate = value.replace(PRODUCT_PLACEHOLDER, "product");
    match reqwest::Url::parse(&candidate) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(()),
        Ok(url) => Err(invalid(format!(
            "{field} must use http or https, got scheme {}",
            url.scheme()
        ))),
        Err(e) => Err(invalid(format!("{field} is not a valid URL ({value}): {e}"))),
    }
}
