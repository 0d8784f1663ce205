//! Credential slots and freshness-checked hand-out
//!
//! Each slot sits behind its own `tokio::sync::Mutex`. Reading a slot's expiry,
//! refreshing it, and writing the new credential all happen under that lock,
//! so two tasks never refresh the same slot at once and nobody observes a
//! half-written credential. Different slots refresh in parallel.
//!
//! Selection is uniformly random. Fairness is not guaranteed, only freshness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use rand::RngExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::source::CredentialSource;

/// Selection rounds `acquire` makes before giving up.
const SELECTION_ROUNDS: usize = 3;

/// An issued credential. Immutable; a refresh replaces it.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Slot the credential was issued for
    pub key: String,
    /// `Cookie` header value
    pub value: Secret<String>,
    /// Expiry in unix milliseconds
    pub expires_at: u64,
}

impl Credential {
    pub fn is_fresh(&self, now_millis: u64) -> bool {
        self.expires_at > now_millis
    }
}

type Slot = Arc<Mutex<Option<Credential>>>;

/// Process-wide credential pool shared by every polling task.
pub struct Pool {
    keys: Vec<String>,
    slots: HashMap<String, Slot>,
    ttl: Duration,
    source: Arc<dyn CredentialSource>,
    clock: Arc<dyn Clock>,
}

impl Pool {
    /// Create a pool with one empty slot per key.
    ///
    /// Every credential issued by `source` lives for `ttl` from the moment it
    /// is stored.
    pub fn new(
        keys: Vec<String>,
        ttl: Duration,
        source: Arc<dyn CredentialSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let slots = keys
            .iter()
            .map(|k| (k.clone(), Arc::new(Mutex::new(None))))
            .collect();
        info!(slots = keys.len(), ttl_secs = ttl.as_secs(), "credential pool initialized");
        Self {
            keys,
            slots,
            ttl,
            source,
            clock,
        }
    }

    /// Install a pre-fetched credential value, valid for one TTL from now.
    pub async fn seed(&self, key: &str, value: Secret<String>) -> Result<()> {
        let slot = self.slot(key)?;
        let mut guard = slot.lock().await;
        *guard = Some(Credential {
            key: key.to_string(),
            value,
            expires_at: self.expiry_from_now(),
        });
        debug!(key, "credential slot seeded");
        Ok(())
    }

    /// Hand out a credential that has not expired.
    ///
    /// Picks a random slot; if it is empty or expired, refreshes it while
    /// holding the slot lock and re-checks freshness before returning. A failed
    /// refresh moves on to another random pick. After `SELECTION_ROUNDS` picks
    /// without a fresh credential the last error is returned.
    pub async fn acquire(&self, task_id: &str) -> Result<Credential> {
        if self.keys.is_empty() {
            return Err(Error::Empty);
        }

        let mut last_error = None;
        for round in 1..=SELECTION_ROUNDS {
            let key = self.pick();
            let slot = self.slot(key)?;
            let mut guard = slot.lock().await;

            let now = self.clock.now_millis();
            if let Some(credential) = guard.as_ref().filter(|c| c.is_fresh(now)) {
                return Ok(credential.clone());
            }

            debug!(task_id, key, round, "credential slot empty or expired, refreshing");
            match self.refresh_locked(key, &mut guard).await {
                Ok(credential) if credential.is_fresh(self.clock.now_millis()) => {
                    return Ok(credential);
                }
                Ok(_) => {
                    warn!(task_id, key, "refreshed credential already expired");
                }
                Err(e) => {
                    warn!(task_id, key, error = %e, "credential refresh failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(Error::Stale(SELECTION_ROUNDS)))
    }

    /// Replace a credential that the site rejected.
    ///
    /// If another task already replaced it (the slot now holds a different,
    /// fresh credential), that one is returned without another refresh. On
    /// failure the slot is emptied so the burned value is never handed out again.
    pub async fn force_refresh(&self, task_id: &str, stale: &Credential) -> Result<Credential> {
        let slot = self.slot(&stale.key)?;
        let mut guard = slot.lock().await;

        let now = self.clock.now_millis();
        let replaced = guard
            .as_ref()
            .filter(|c| c.expires_at != stale.expires_at && c.is_fresh(now));
        if let Some(current) = replaced {
            debug!(task_id, key = %stale.key, "credential already replaced by another task");
            return Ok(current.clone());
        }

        info!(task_id, key = %stale.key, "forcing credential refresh");
        match self.refresh_locked(&stale.key, &mut guard).await {
            Ok(credential) => Ok(credential),
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    /// Refresh every slot that is empty or expires within `threshold`.
    ///
    /// Returns `(refreshed, failed)`. Slots currently locked by a task are
    /// waited on, then re-checked, so a slot just refreshed is skipped.
    pub async fn refresh_expiring(&self, threshold: Duration) -> (usize, usize) {
        let threshold_millis = threshold.as_millis() as u64;
        let mut refreshed = 0usize;
        let mut failed = 0usize;

        for key in &self.keys {
            let Ok(slot) = self.slot(key) else { continue };
            let mut guard = slot.lock().await;

            let deadline = self.clock.now_millis() + threshold_millis;
            if guard.as_ref().is_some_and(|c| c.expires_at > deadline) {
                continue;
            }

            match self.refresh_locked(key, &mut guard).await {
                Ok(_) => refreshed += 1,
                Err(e) => {
                    warn!(key, error = %e, "background credential refresh failed, will retry next cycle");
                    failed += 1;
                }
            }
        }
        (refreshed, failed)
    }

    /// Whether a credential handed out earlier is still within its TTL.
    pub fn is_fresh(&self, credential: &Credential) -> bool {
        credential.is_fresh(self.clock.now_millis())
    }

    /// Slot keys in configuration order.
    pub fn slot_keys(&self) -> &[String] {
        &self.keys
    }

    /// Pool health summary for the status endpoint.
    ///
    /// Slots locked for a refresh are reported as `refreshing` instead of
    /// waiting on the token service.
    pub fn health(&self) -> serde_json::Value {
        let now = self.clock.now_millis();
        let mut slots = Vec::with_capacity(self.keys.len());
        let (mut fresh, mut expired, mut empty, mut refreshing) = (0usize, 0usize, 0usize, 0usize);

        for key in &self.keys {
            let Some(slot) = self.slots.get(key) else { continue };
            let entry = match slot.try_lock() {
                Err(_) => {
                    refreshing += 1;
                    serde_json::json!({ "key": key, "status": "refreshing" })
                }
                Ok(guard) => match guard.as_ref() {
                    Some(c) if c.is_fresh(now) => {
                        fresh += 1;
                        serde_json::json!({
                            "key": key,
                            "status": "fresh",
                            "expires_in_secs": (c.expires_at - now) / 1000
                        })
                    }
                    Some(_) => {
                        expired += 1;
                        serde_json::json!({ "key": key, "status": "expired" })
                    }
                    None => {
                        empty += 1;
                        serde_json::json!({ "key": key, "status": "empty" })
                    }
                },
            };
            slots.push(entry);
        }

        let total = self.keys.len();
        let status = if total > 0 && fresh == total {
            "healthy"
        } else if fresh > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "slots_total": total,
            "slots_fresh": fresh,
            "slots_expired": expired,
            "slots_empty": empty,
            "slots_refreshing": refreshing,
            "slots": slots
        })
    }

    /// Issue a new credential for `key` and store it. The caller holds the slot lock.
    async fn refresh_locked(
        &self,
        key: &str,
        guard: &mut MutexGuard<'_, Option<Credential>>,
    ) -> Result<Credential> {
        match self.source.issue(key).await {
            Ok(value) => {
                let credential = Credential {
                    key: key.to_string(),
                    value: Secret::new(value),
                    expires_at: self.expiry_from_now(),
                };
                **guard = Some(credential.clone());
                metrics::counter!("credential_refreshes_total", "result" => "success").increment(1);
                info!(key, "credential refreshed");
                Ok(credential)
            }
            Err(e) => {
                metrics::counter!("credential_refreshes_total", "result" => "failure").increment(1);
                Err(e)
            }
        }
    }

    fn pick(&self) -> &str {
        let index = rand::rng().random_range(0..self.keys.len());
        &self.keys[index]
    }

    fn slot(&self, key: &str) -> Result<&Slot> {
        self.slots
            .get(key)
            .ok_or_else(|| Error::UnknownSlot(key.to_string()))
    }

    fn expiry_from_now(&self) -> u64 {
        self.clock.now_millis() + self.ttl.as_millis() as u64
    }
}
