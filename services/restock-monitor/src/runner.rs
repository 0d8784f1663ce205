//! Task runner
//!
//! Drives one (product, site) task forever: keeps the transport and the
//! credential fresh, polls, resolves waiting rooms, feeds latency samples and
//! the poll outcome into the state machine, then executes the resulting
//! action. Polls within a task are strictly sequential; restock and alert
//! deliveries are spawned so the loop never waits on them.

use std::sync::Arc;

use bypass::{QueueCookies, resolve_queue};
use credential_pool::{Credential, Pool};
use site::{ErrorKind, SiteAdapter};
use tracing::{debug, info, warn};

use crate::config::{LatencyConfig, MonitorConfig, SiteConfig};
use crate::error::Result;
use crate::latency::{LatencyAnomaly, LatencyTracker};
use crate::metrics;
use crate::notify::Dispatcher;
use crate::task::{PollOutcome, RestockEvent, TaskAction, TaskState, handle_poll};
use crate::transport::{PollResponse, ProxyPool, Transport, cache_bust};

/// Process-wide resources handed to every task.
#[derive(Clone)]
pub struct Shared {
    pub pool: Option<Arc<Pool>>,
    pub dispatcher: Arc<Dispatcher>,
    pub proxies: ProxyPool,
    pub monitor: MonitorConfig,
    pub latency: LatencyConfig,
}

/// Per-site request behaviour.
#[derive(Debug, Clone, Default)]
pub struct SitePolicy {
    pub cache_bust: bool,
    pub purge_before_poll: bool,
    pub queue: QueueCookies,
}

impl From<&SiteConfig> for SitePolicy {
    fn from(site: &SiteConfig) -> Self {
        Self {
            cache_bust: site.cache_bust,
            purge_before_poll: site.purge_before_poll,
            queue: QueueCookies {
                marker: site.queue_marker_cookie.clone(),
                pass: site.queue_pass_cookie.clone(),
            },
        }
    }
}

pub struct Runner {
    shared: Shared,
    adapter: Arc<dyn SiteAdapter>,
    policy: SitePolicy,
    state: TaskState,
    transport: Transport,
    latency: LatencyTracker,
    credential: Option<Credential>,
    /// Cookies set by the site during this session (queue pass and friends)
    session_cookies: Vec<(String, String)>,
}

impl Runner {
    pub fn new(
        shared: Shared,
        adapter: Arc<dyn SiteAdapter>,
        policy: SitePolicy,
        product: &str,
    ) -> Result<Self> {
        let transport = Transport::new(shared.proxies.clone(), shared.monitor.request_timeout())?;
        let state = TaskState::new(product, adapter.id(), adapter.name());
        let latency = LatencyTracker::from_config(&shared.latency);
        Ok(Self {
            shared,
            adapter,
            policy,
            state,
            transport,
            latency,
            credential: None,
            session_cookies: Vec::new(),
        })
    }

    /// Poll forever, pacing between iterations.
    pub async fn run(mut self) {
        info!(
            task_id = %self.state.id,
            site = %self.state.site,
            product = %self.state.product,
            proxy = self.transport.proxy().unwrap_or("direct"),
            "task started"
        );
        loop {
            let pause = match self.step().await {
                TaskAction::Recover(_) => self.shared.monitor.recovery_pacing(),
                TaskAction::Continue | TaskAction::Dispatch(_) => self.shared.monitor.pacing(),
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// One iteration: prepare transport, poll, classify, act.
    pub async fn step(&mut self) -> TaskAction {
        if self.state.due_for_rotation(self.shared.monitor.rotate_every) {
            if self.state.request_count > 0 {
                self.transport.rotate();
                self.session_cookies.clear();
                debug!(task_id = %self.state.id, proxy = self.transport.proxy().unwrap_or("direct"), "rotated transport");
            }
            self.credential = None;
        }

        if let Some(pool) = self.shared.pool.clone() {
            let stale = self
                .credential
                .as_ref()
                .is_none_or(|c| !pool.is_fresh(c));
            if stale {
                self.credential = None;
                match self.replace_credential(&pool).await {
                    Ok(credential) => self.credential = Some(credential),
                    Err(e) => {
                        warn!(task_id = %self.state.id, error = %e, "no credential available, backing off");
                        return TaskAction::Recover(ErrorKind::Network);
                    }
                }
            }
        }

        let product_url = self.adapter.product_url(&self.state.product);
        let url = if self.policy.cache_bust {
            cache_bust(&product_url)
        } else {
            product_url.clone()
        };
        if self.policy.purge_before_poll {
            self.transport.purge(&product_url).await;
        }

        let mut response = self.poll(&url).await;
        if response.has_cookie(&self.policy.queue.marker) {
            response = self.pass_queue(&url).await;
        }

        if let Some(elapsed) = response.elapsed {
            if let Some(anomaly) = self.latency.record(elapsed) {
                self.on_latency_anomaly(anomaly);
            }
        }

        let outcome = match site::evaluate(
            self.adapter.as_ref(),
            &self.state.product,
            response.status,
            &response.body,
        ) {
            Ok(listing) => PollOutcome::Listing(listing),
            Err(kind) => PollOutcome::Failed(kind),
        };
        let label = match &outcome {
            PollOutcome::Listing(_) => "ok",
            PollOutcome::Failed(kind) => kind.label(),
        };
        metrics::record_poll(
            &self.state.site,
            label,
            response.elapsed.map(|d| d.as_secs_f64()),
        );

        let (state, action) = handle_poll(std::mem::take(&mut self.state), outcome);
        self.state = state;

        match &action {
            TaskAction::Continue => {
                debug!(
                    task_id = %self.state.id,
                    outcome = label,
                    requests = self.state.request_count,
                    window_mean_ms = ?self.latency.previous_average().map(|d| d.as_millis()),
                    "poll complete"
                );
            }
            TaskAction::Dispatch(event) => self.on_restock(event),
            TaskAction::Recover(kind) => {
                warn!(
                    task_id = %self.state.id,
                    outcome = kind.label(),
                    status = ?response.status,
                    "poll failed, rotating proxy and credential"
                );
                self.recover().await;
            }
        }
        action
    }

    async fn poll(&mut self, url: &str) -> PollResponse {
        let cookie = self.cookie_header();
        let response = self.transport.poll(url, cookie.as_deref()).await;
        for (name, value) in &response.cookies {
            if *name != self.policy.queue.marker {
                self.set_session_cookie(name, value);
            }
        }
        response
    }

    /// Resolve the waiting room, then poll once more with the pass cookie.
    /// A queue that outlasts `queue_timeout` counts as a network failure.
    async fn pass_queue(&mut self, url: &str) -> PollResponse {
        info!(task_id = %self.state.id, "waiting room detected, probing queue");
        let mut prober = self.transport.prober(self.policy.queue.clone());
        let timeout = self.shared.monitor.queue_timeout();

        match tokio::time::timeout(timeout, resolve_queue(&mut prober, url)).await {
            Ok(pass) => {
                info!(
                    task_id = %self.state.id,
                    probes = pass.probes,
                    rotations = pass.rotations,
                    "queue passed"
                );
                let name = self.policy.queue.pass.clone();
                self.set_session_cookie(&name, &pass.token);
                self.poll(url).await
            }
            Err(_) => {
                warn!(
                    task_id = %self.state.id,
                    timeout_secs = timeout.as_secs(),
                    "queue did not resolve in time"
                );
                PollResponse::default()
            }
        }
    }

    fn on_latency_anomaly(&self, anomaly: LatencyAnomaly) {
        warn!(
            task_id = %self.state.id,
            previous_ms = anomaly.previous.as_millis() as u64,
            current_ms = anomaly.current.as_millis() as u64,
            "response latency dropped sharply, possible silent block"
        );
        metrics::record_latency_anomaly(&self.state.site);

        let dispatcher = self.shared.dispatcher.clone();
        let product = self.state.product.clone();
        let site_name = self.state.site_name.clone();
        tokio::spawn(async move {
            dispatcher.alert(&product, &site_name, anomaly).await;
        });
    }

    fn on_restock(&self, event: &RestockEvent) {
        info!(
            task_id = %self.state.id,
            event_id = %event.id,
            variants = ?event.variants,
            "restock detected"
        );
        metrics::record_restock(&self.state.site);

        let dispatcher = self.shared.dispatcher.clone();
        let event = event.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&event).await;
        });
    }

    /// New proxy, new session, replacement credential.
    async fn recover(&mut self) {
        self.transport.rotate();
        self.session_cookies.clear();

        let Some(pool) = self.shared.pool.clone() else {
            return;
        };
        match self.replace_credential(&pool).await {
            Ok(credential) => self.credential = Some(credential),
            Err(e) => {
                self.credential = None;
                warn!(task_id = %self.state.id, error = %e, "credential refresh failed, retrying next poll");
            }
        }
    }

    /// Force-refresh the held credential, or acquire one when none is held.
    async fn replace_credential(&self, pool: &Pool) -> Result<Credential> {
        let credential = match &self.credential {
            Some(stale) => pool.force_refresh(&self.state.id, stale).await?,
            None => pool.acquire(&self.state.id).await?,
        };
        Ok(credential)
    }

    fn set_session_cookie(&mut self, name: &str, value: &str) {
        match self.session_cookies.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self
                .session_cookies
                .push((name.to_string(), value.to_string())),
        }
    }

    /// Credential cookies followed by session cookies.
    fn cookie_header(&self) -> Option<String> {
        let session = bypass::cookie_header(
            self.session_cookies
                .iter()
                .map(|(n, v)| (n.as_str(), v.as_str())),
        );
        let parts: Vec<&str> = self
            .credential
            .as_ref()
            .map(|c| c.value.expose().as_str())
            .into_iter()
            .chain(std::iter::once(session.as_str()))
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifyConfig;
    use common::Secret;
    use credential_pool::{CredentialSource, ManualClock};
    use serde_json::json;
    use site::{JsonAdapter, JsonPointers};
    use std::collections::BTreeSet;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PRODUCT_PATH: &str = "/products/AB1234.json";

    /// Issues `D_UID=c<n>` values.
    struct CountingSource {
        issued: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                issued: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl CredentialSource for CountingSource {
        fn issue<'a>(
            &'a self,
            _key: &'a str,
        ) -> Pin<Box<dyn Future<Output = credential_pool::Result<String>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail.load(Ordering::SeqCst) {
                    return Err(credential_pool::Error::RefreshFailed("down".into()));
                }
                let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("D_UID=c{n}"))
            })
        }
    }

    fn body(variants: &[(&str, bool)]) -> serde_json::Value {
        json!({
            "name": "Runner OG",
            "price": "£120",
            "variants": variants
                .iter()
                .map(|(k, v)| json!({"key": k, "in_stock": v}))
                .collect::<Vec<_>>()
        })
    }

    fn shared(webhooks: Vec<String>, pool: Option<Arc<Pool>>) -> Shared {
        let notify = NotifyConfig {
            webhooks,
            retry_delay_secs: 0,
            ..NotifyConfig::default()
        };
        Shared {
            pool,
            dispatcher: Arc::new(Dispatcher::new(reqwest::Client::new(), &notify)),
            proxies: ProxyPool::default(),
            monitor: MonitorConfig {
                request_timeout_secs: 5,
                pacing_ms: 0,
                recovery_pacing_ms: 0,
                queue_timeout_secs: 5,
                ..MonitorConfig::default()
            },
            latency: LatencyConfig::default(),
        }
    }

    fn runner(server: &MockServer, shared: Shared, policy: SitePolicy) -> Runner {
        let adapter = JsonAdapter::new(
            "end-gb",
            "END.",
            format!("{}/products/{{product}}.json", server.uri()),
            JsonPointers::default(),
        );
        Runner::new(shared, Arc::new(adapter), policy, "AB1234").unwrap()
    }

    fn pool(source: Arc<CountingSource>) -> Arc<Pool> {
        Arc::new(Pool::new(
            vec!["slot-0".into()],
            Duration::from_secs(1800),
            source,
            Arc::new(ManualClock::new(1_000)),
        ))
    }

    /// Wait until `server` has seen `n` requests; spawned deliveries finish
    /// after `step` returns.
    async fn wait_for_requests(server: &MockServer, n: usize) -> usize {
        for _ in 0..200 {
            let seen = server.received_requests().await.map_or(0, |r| r.len());
            if seen >= n {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.received_requests().await.map_or(0, |r| r.len())
    }

    #[tokio::test]
    async fn end_to_end_restock_dispatch() {
        let site = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(body(&[("9", true)])))
            .up_to_n_times(1)
            .mount(&site)
            .await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(body(&[("9", false), ("10", true)])),
            )
            .mount(&site)
            .await;

        let hook = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&hook)
            .await;

        let mut runner = runner(&site, shared(vec![hook.uri()], None), SitePolicy::default());

        assert_eq!(runner.step().await, TaskAction::Continue);
        assert!(!runner.state.first_run);
        assert_eq!(runner.state.last_availability.get("9"), Some(&true));

        let TaskAction::Dispatch(event) = runner.step().await else {
            panic!("second poll should dispatch");
        };
        assert_eq!(event.variants, BTreeSet::from(["10".to_string()]));
        assert_eq!(event.info.name.as_deref(), Some("Runner OG"));
        assert_eq!(runner.state.last_availability.get("9"), Some(&false));
        assert_eq!(runner.state.last_availability.get("10"), Some(&true));

        assert_eq!(wait_for_requests(&hook, 1).await, 1);
        let delivered = hook.received_requests().await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&delivered[0].body).unwrap();
        assert_eq!(payload["embeds"][0]["title"], "Runner OG | END.");
    }

    #[tokio::test]
    async fn ban_rotates_credential_and_keeps_baseline_pending() {
        let site = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(1)
            .mount(&site)
            .await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .and(header("cookie", "D_UID=c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body(&[("9", true)])))
            .mount(&site)
            .await;

        let source = Arc::new(CountingSource::new());
        let mut runner = runner(
            &site,
            shared(vec![], Some(pool(source.clone()))),
            SitePolicy::default(),
        );

        assert_eq!(runner.step().await, TaskAction::Recover(ErrorKind::Banned));
        assert_eq!(source.issued.load(Ordering::SeqCst), 2);
        assert!(runner.state.first_run);

        // The replacement credential is sent and the listing becomes the baseline.
        assert_eq!(runner.step().await, TaskAction::Continue);
        assert!(!runner.state.first_run);
        assert_eq!(runner.state.last_availability.get("9"), Some(&true));
    }

    #[tokio::test]
    async fn credential_outage_backs_off_without_polling() {
        let site = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&site)
            .await;

        let source = Arc::new(CountingSource::new());
        source.fail.store(true, Ordering::SeqCst);
        let mut runner = runner(
            &site,
            shared(vec![], Some(pool(source))),
            SitePolicy::default(),
        );

        assert_eq!(runner.step().await, TaskAction::Recover(ErrorKind::Network));
        assert_eq!(runner.state.request_count, 0);
    }

    #[tokio::test]
    async fn waiting_room_is_resolved_before_classifying() {
        let site = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .respond_with(
                ResponseTemplate::new(200).append_header("set-cookie", "akavpwr_VP1=waiting; Path=/"),
            )
            .up_to_n_times(1)
            .mount(&site)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200).append_header("set-cookie", "akavpau_VP1=pass-token; Path=/"),
            )
            .mount(&site)
            .await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .and(header("cookie", "akavpau_VP1=pass-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body(&[("9", true)])))
            .mount(&site)
            .await;

        let mut runner = runner(&site, shared(vec![], None), SitePolicy::default());

        assert_eq!(runner.step().await, TaskAction::Continue);
        assert_eq!(runner.state.last_availability.get("9"), Some(&true));
        assert_eq!(
            runner.cookie_header().as_deref(),
            Some("akavpau_VP1=pass-token")
        );
    }

    #[tokio::test]
    async fn purge_and_cache_bust_are_applied() {
        let site = MockServer::start().await;
        Mock::given(method("PURGE"))
            .and(path(PRODUCT_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&site)
            .await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&site)
            .await;

        let policy = SitePolicy {
            cache_bust: true,
            purge_before_poll: true,
            ..SitePolicy::default()
        };
        let mut runner = runner(&site, shared(vec![], None), policy);

        assert_eq!(runner.step().await, TaskAction::Continue);
        assert!(!runner.state.first_run, "404 is a known state");

        let requests = site.received_requests().await.unwrap();
        let get = requests
            .iter()
            .find(|r| r.method.as_str() == "GET")
            .unwrap();
        assert!(get.url.query().is_some_and(|q| q.len() == 17), "{}", get.url);
    }

    #[tokio::test]
    async fn rotation_reacquires_credential_and_drops_session() {
        let site = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(body(&[("9", true)]))
                    .append_header("set-cookie", "sess=abc; Path=/"),
            )
            .up_to_n_times(1)
            .mount(&site)
            .await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(body(&[("9", true)])))
            .mount(&site)
            .await;

        let source = Arc::new(CountingSource::new());
        let pool = pool(source.clone());
        let mut shared = shared(vec![], Some(pool.clone()));
        shared.monitor.rotate_every = 2;
        let mut runner = runner(&site, shared, SitePolicy::default());

        assert_eq!(runner.step().await, TaskAction::Continue);
        assert_eq!(runner.step().await, TaskAction::Continue);

        // The slot moves on while the task still holds a fresh credential.
        pool.seed("slot-0", Secret::new("D_UID=seeded".to_string()))
            .await
            .unwrap();
        assert_eq!(runner.step().await, TaskAction::Continue);
        assert_eq!(source.issued.load(Ordering::SeqCst), 1);

        let cookies: Vec<Option<String>> = site
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| {
                r.headers
                    .get("cookie")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            })
            .collect();
        assert_eq!(
            cookies,
            vec![
                Some("D_UID=c1".to_string()),
                Some("D_UID=c1; sess=abc".to_string()),
                Some("D_UID=seeded".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn latency_drop_sends_alert() {
        let site = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(body(&[("9", true)]))
                    .set_delay(Duration::from_millis(600)),
            )
            .up_to_n_times(1)
            .mount(&site)
            .await;
        Mock::given(method("GET"))
            .and(path(PRODUCT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(body(&[("9", true)])))
            .mount(&site)
            .await;

        let hook = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&hook)
            .await;

        let mut shared = shared(vec![hook.uri()], None);
        shared.latency = LatencyConfig {
            window: 1,
            ratio: 0.3,
            floor_ms: 150,
        };
        let mut runner = runner(&site, shared, SitePolicy::default());

        assert_eq!(runner.step().await, TaskAction::Continue);
        assert_eq!(runner.step().await, TaskAction::Continue);

        assert_eq!(wait_for_requests(&hook, 1).await, 1);
        let delivered = hook.received_requests().await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&delivered[0].body).unwrap();
        assert_eq!(payload["embeds"][0]["title"], "Possible silent block");
    }

    #[tokio::test]
    async fn network_failure_recovers() {
        let mut shared = shared(vec![], None);
        shared.monitor.request_timeout_secs = 1;
        let adapter = JsonAdapter::new(
            "end-gb",
            "END.",
            "http://127.0.0.1:1/products/{product}.json",
            JsonPointers::default(),
        );
        let mut runner =
            Runner::new(shared, Arc::new(adapter), SitePolicy::default(), "AB1234").unwrap();

        assert_eq!(runner.step().await, TaskAction::Recover(ErrorKind::Network));
        assert!(runner.state.first_run);
        assert_eq!(runner.state.request_count, 1);
    }

    #[test]
    fn site_policy_from_config() {
        let site: SiteConfig = toml::from_str(
            r#"
id = "end-gb"
name = "END."
url_template = "https://shop.test/{product}"
purge_before_poll = true
queue_pass_cookie = "pass"
"#,
        )
        .unwrap();
        let policy = SitePolicy::from(&site);
        assert!(policy.purge_before_poll);
        assert!(!policy.cache_bust);
        assert_eq!(policy.queue.marker, bypass::QUEUE_MARKER_COOKIE);
        assert_eq!(policy.queue.pass, "pass");
    }
}
