//! Notification dispatcher
//!
//! Delivers restock events to every configured webhook (Discord-style embed)
//! and, optionally, to a restock server that takes `{"SKU", "sizeArray"}`,
//! where each size is the site's option id (the label when no id is known).
//! Each destination is independent: one failing never affects the others,
//! and no delivery result ever reaches the polling task.
//!
//! Webhook status handling:
//! - 204 → delivered
//! - 429 → sleep `retry_delay`, retry, at most `max_retries` times
//! - anything else → terminal failure for this delivery, logged

use std::cmp::Ordering;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::error::{Error, Result};
use crate::latency::LatencyAnomaly;
use crate::metrics;
use crate::task::RestockEvent;
use crate::transport::cache_bust;

const RESTOCK_COLOR: u32 = 0x2ecc71;
const ALERT_COLOR: u32 = 0xe74c3c;
const FOOTER: &str = "restock-monitor";

/// Body POSTed to the restock server.
#[derive(Debug, Serialize)]
pub struct RestockServerPayload<'a> {
    #[serde(rename = "SKU")]
    pub sku: &'a str,
    #[serde(rename = "sizeArray")]
    pub size_array: Vec<String>,
}

/// Shared by every task; the inner client pools connections.
pub struct Dispatcher {
    client: reqwest::Client,
    webhooks: Vec<String>,
    restock_server: Option<String>,
    retry_delay: Duration,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, config: &NotifyConfig) -> Self {
        Self {
            client,
            webhooks: config.webhooks.clone(),
            restock_server: config.restock_server.clone(),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            max_retries: config.max_retries,
        }
    }

    /// Deliver a restock event everywhere. Returns how many destinations
    /// accepted it.
    pub async fn dispatch(&self, event: &RestockEvent) -> usize {
        let embed = restock_embed(event);
        let mut delivered = 0;

        for url in &self.webhooks {
            match self.deliver_webhook(url, &embed).await {
                Ok(()) => {
                    metrics::record_notification("webhook", "success");
                    delivered += 1;
                }
                Err(e) => {
                    metrics::record_notification("webhook", failure_label(&e));
                    warn!(event_id = %event.id, product = %event.product, error = %e, "webhook delivery failed");
                }
            }
        }

        if let Some(url) = &self.restock_server {
            match self.deliver_restock_server(url, event).await {
                Ok(()) => {
                    metrics::record_notification("restock_server", "success");
                    delivered += 1;
                }
                Err(e) => {
                    metrics::record_notification("restock_server", failure_label(&e));
                    warn!(event_id = %event.id, product = %event.product, error = %e, "restock server delivery failed");
                }
            }
        }

        info!(
            event_id = %event.id,
            product = %event.product,
            site = %event.site,
            variants = event.variants.len(),
            delivered,
            "restock notification dispatched"
        );
        delivered
    }

    /// Send a latency anomaly alert to every webhook.
    pub async fn alert(&self, product: &str, site_name: &str, anomaly: LatencyAnomaly) -> usize {
        let embed = alert_embed(product, site_name, anomaly);
        let mut delivered = 0;
        for url in &self.webhooks {
            match self.deliver_webhook(url, &embed).await {
                Ok(()) => {
                    metrics::record_notification("alert", "success");
                    delivered += 1;
                }
                Err(e) => {
                    metrics::record_notification("alert", failure_label(&e));
                    warn!(product, site = site_name, error = %e, "latency alert delivery failed");
                }
            }
        }
        delivered
    }

    /// POST an embed, retrying a bounded number of times on 429.
    async fn deliver_webhook(&self, url: &str, body: &Value) -> Result<()> {
        let mut retries = 0u32;
        loop {
            let response = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| Error::Delivery(format!("webhook request failed: {e}")))?;

            match response.status().as_u16() {
                204 => return Ok(()),
                429 if retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        retry = retries,
                        max_retries = self.max_retries,
                        delay_secs = self.retry_delay.as_secs_f64(),
                        "webhook rate limited, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                429 => return Err(Error::RateLimited(retries)),
                status => {
                    return Err(Error::Delivery(format!("webhook returned HTTP {status}")));
                }
            }
        }
    }

    async fn deliver_restock_server(&self, url: &str, event: &RestockEvent) -> Result<()> {
        let payload = RestockServerPayload {
            sku: &event.product,
            size_array: sort_variants(event.variants.iter().cloned())
                .into_iter()
                .map(|label| event.variant_ids.get(&label).cloned().unwrap_or(label))
                .collect(),
        };
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("restock server request failed: {e}")))?;

        match response.status().as_u16() {
            200 => Ok(()),
            status => Err(Error::Delivery(format!(
                "restock server returned HTTP {status}"
            ))),
        }
    }
}

fn failure_label(error: &Error) -> &'static str {
    match error {
        Error::RateLimited(_) => "rate_limited",
        _ => "failure",
    }
}

/// Numeric part of a size label: `UK 9.5` → 9.5, `10` → 10, `XL` → none.
fn size_number(key: &str) -> Option<f64> {
    let last = key.split_whitespace().last()?;
    last.trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()
}

fn compare_sizes(a: &str, b: &str) -> Ordering {
    match (size_number(a), size_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Sizes ordered numerically where possible, the rest lexicographically after them.
pub fn sort_variants(keys: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut sorted: Vec<String> = keys.into_iter().collect();
    sorted.sort_by(|a, b| compare_sizes(a, b));
    sorted
}

/// Discord-style restock embed.
pub fn restock_embed(event: &RestockEvent) -> Value {
    let name = event.info.name.as_deref().unwrap_or(&event.product);
    let sizes = sort_variants(event.in_stock.iter().cloned());
    let restocked = sort_variants(event.variants.iter().cloned());
    let availability = if sizes.is_empty() {
        "-".to_string()
    } else {
        sizes.join("\n")
    };

    let mut embed = json!({
        "title": format!("{name} | {}", event.site_name),
        "description": format!("Restocked: {}", restocked.join(", ")),
        "color": RESTOCK_COLOR,
        "fields": [
            {
                "name": "Price",
                "value": event.info.price.as_deref().unwrap_or("-"),
                "inline": true
            },
            {
                "name": "Product",
                "value": event.product,
                "inline": true
            },
            {
                "name": "Size Availability",
                "value": availability,
                "inline": false
            }
        ],
        "footer": { "text": FOOTER }
    });
    if let Some(url) = &event.info.url {
        embed["url"] = Value::String(cache_bust(url));
    }
    if let Some(image) = &event.info.image {
        embed["thumbnail"] = json!({ "url": image });
    }

    json!({ "embeds": [embed] })
}

/// Alert embed for a latency anomaly.
pub fn alert_embed(product: &str, site_name: &str, anomaly: LatencyAnomaly) -> Value {
    json!({
        "embeds": [{
            "title": "Possible silent block",
            "description": format!("{product} on {site_name} is answering much faster than before"),
            "color": ALERT_COLOR,
            "fields": [
                {
                    "name": "Previous mean",
                    "value": format!("{}ms", anomaly.previous.as_millis()),
                    "inline": true
                },
                {
                    "name": "Current mean",
                    "value": format!("{}ms", anomaly.current.as_millis()),
                    "inline": true
                }
            ],
            "footer": { "text": FOOTER }
        }]
    })
}
