//! Geolocation service: coalesced, batched, rate-limited IP lookups.
//!
//! Callers ask for an IP and get a [`GeoLocationData`] back, possibly empty.
//! Duplicate in-flight requests share one upstream call; results (including
//! failures, cached as empty entries) are kept for the life of the service.
//! A single worker drains the pending queue in batches with a sleep between
//! batches to stay under the upstream rate limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use eyre::Context;
use futures_util::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;

const LOOKUP_FIELDS: &str =
    "country,region,regionName,city,zip,lat,lon,timezone,isp,org,as,asname,mobile,proxy,hosting";

/// One resolved location, as returned by the upstream API plus the per-ip
/// traffic counters maintained inside the registries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocationData {
    pub country: Option<String>,
    pub region: Option<String>,
    #[serde(rename = "regionName")]
    pub region_name: Option<String>,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timezone: Option<String>,
    pub isp: Option<String>,
    pub org: Option<String>,
    #[serde(rename = "as")]
    pub as_number: Option<String>,
    pub asname: Option<String>,
    pub mobile: Option<bool>,
    pub proxy: Option<bool>,
    pub hosting: Option<bool>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub packet_count: u64,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
}

impl GeoLocationData {
    /// True when the response carries enough identity to aggregate on.
    pub fn has_identity(&self) -> bool {
        self.country.is_some() || self.city.is_some() || self.as_number.is_some()
    }

    /// Aggregation key within a registry's geo list.
    pub fn identity(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        (
            self.country.as_deref(),
            self.city.as_deref(),
            self.as_number.as_deref(),
        )
    }

    /// The upstream `as` field arrives as `"AS<num> <org>"`; split it into
    /// the numeric part and the organization name.
    pub fn split_as_field(&mut self) {
        let Some(raw) = self.as_number.as_deref() else {
            return;
        };
        let Some(rest) = raw.strip_prefix("AS") else {
            return;
        };
        let Some((number, org)) = rest.split_once(' ') else {
            return;
        };
        if number.chars().all(|c| c.is_ascii_digit()) && !number.is_empty() {
            if self.asname.as_deref().is_none_or(str::is_empty) {
                self.asname = Some(org.to_string());
            }
            self.as_number = Some(number.to_string());
        }
    }
}

type FetchFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, eyre::Result<GeoLocationData>> + Send + Sync>;

#[derive(Default)]
struct GeoState {
    cache: HashMap<String, GeoLocationData>,
    pending: HashMap<String, Vec<oneshot::Sender<GeoLocationData>>>,
}

pub struct GeoService {
    state: Arc<Mutex<GeoState>>,
    queue: Mutex<Option<mpsc::UnboundedSender<String>>>,
    worker: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    caller_timeout: Duration,
}

impl GeoService {
    /// Service backed by the public ip-api.com endpoint.
    pub fn new(config: &EngineConfig) -> Arc<Self> {
        let client = reqwest::Client::new();
        let fetch: FetchFn = Arc::new(
            move |ip: String| -> BoxFuture<'static, eyre::Result<GeoLocationData>> {
                let client = client.clone();
                Box::pin(async move { http_lookup(&client, &ip).await })
            },
        );
        Self::with_fetch(config, fetch)
    }

    /// Service with an injected upstream; the coalescing and batching tests
    /// run against this without any network.
    pub fn with_fetch(config: &EngineConfig, fetch: FetchFn) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(GeoState::default()));

        let worker = tokio::spawn(run_worker(
            Arc::clone(&state),
            rx,
            fetch,
            config.geo_batch,
            Duration::from_millis(config.geo_rate_limit_ms),
        ));

        Arc::new(Self {
            state,
            queue: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            caller_timeout: Duration::from_millis(config.geo_caller_timeout_ms),
        })
    }

    /// Resolve one IP. Cached results return immediately; otherwise the
    /// caller joins the pending set for that IP and waits, bounded by the
    /// caller timeout. A timeout yields an empty result and caches nothing.
    pub async fn lookup(&self, ip: &str) -> GeoLocationData {
        let receiver = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

            if let Some(cached) = state.cache.get(ip) {
                return cached.clone();
            }

            let (tx, rx) = oneshot::channel();
            let first_waiter = !state.pending.contains_key(ip);
            state.pending.entry(ip.to_string()).or_default().push(tx);

            if first_waiter {
                let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(queue) = queue.as_ref() {
                    // The worker only goes away on close(); a send failure
                    // then just means the caller times out with an empty
                    // result.
                    let _ = queue.send(ip.to_string());
                }
            }

            rx
        };

        match tokio::time::timeout(self.caller_timeout, receiver).await {
            Ok(Ok(data)) => data,
            _ => GeoLocationData::default(),
        }
    }

    /// Discover this host's public IP.
    pub async fn get_public_ip() -> eyre::Result<String> {
        #[derive(Deserialize)]
        struct IpifyResponse {
            ip: String,
        }

        let response: IpifyResponse = reqwest::get("https://api.ipify.org/?format=json")
            .await
            .context("Could not reach the public-ip service")?
            .json()
            .await
            .context("Could not parse the public-ip response")?;
        Ok(response.ip)
    }

    /// Stop accepting lookups and drain the queue, waiting for everything
    /// in flight to finish.
    pub async fn close(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle
            && handle.await.is_err()
        {
            tracing::warn!("Geo worker panicked during shutdown");
        }
    }
}

async fn run_worker(
    state: Arc<Mutex<GeoState>>,
    mut queue: mpsc::UnboundedReceiver<String>,
    fetch: FetchFn,
    batch_size: usize,
    rate_limit: Duration,
) {
    // recv() keeps yielding queued IPs after the sender is dropped, so a
    // close() drains the backlog before the worker exits.
    while let Some(first) = queue.recv().await {
        let mut batch = vec![first];
        while batch.len() < batch_size {
            match queue.try_recv() {
                Ok(ip) => batch.push(ip),
                Err(_) => break,
            }
        }

        let lookups = batch.into_iter().map(|ip| {
            let fetch = Arc::clone(&fetch);
            async move {
                let result = fetch(ip.clone()).await;
                (ip, result)
            }
        });

        for (ip, result) in join_all(lookups).await {
            let mut data = match result {
                Ok(data) => data,
                Err(e) => {
                    // Negative result: cached so the IP is not retried.
                    tracing::debug!(ip = %ip, "Geo lookup failed: {e}");
                    GeoLocationData::default()
                }
            };
            data.split_as_field();

            let waiters = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.cache.insert(ip.clone(), data.clone());
                state.pending.remove(&ip).unwrap_or_default()
            };
            for waiter in waiters {
                let _ = waiter.send(data.clone());
            }
        }

        tokio::time::sleep(rate_limit).await;
    }
}

async fn http_lookup(client: &reqwest::Client, ip: &str) -> eyre::Result<GeoLocationData> {
    let url = format!("http://ip-api.com/json/{ip}?fields={LOOKUP_FIELDS}");
    let data = client
        .get(&url)
        .send()
        .await
        .context("Could not reach the geolocation service")?
        .json::<GeoLocationData>()
        .await
        .context("Could not parse the geolocation response")?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> EngineConfig {
        EngineConfig {
            geo_rate_limit_ms: 1,
            geo_caller_timeout_ms: 2000,
            ..EngineConfig::default()
        }
    }

    fn counting_fetch(counter: Arc<AtomicUsize>) -> FetchFn {
        Arc::new(
            move |_ip: String| -> BoxFuture<'static, eyre::Result<GeoLocationData>> {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(GeoLocationData {
                        country: Some("United States".to_string()),
                        city: Some("Mountain View".to_string()),
                        as_number: Some("AS15169 Google LLC".to_string()),
                        ..GeoLocationData::default()
                    })
                })
            },
        )
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_upstream_call() {
        let counter = Arc::new(AtomicUsize::new(0));
        let service = GeoService::with_fetch(&fast_config(), counting_fetch(Arc::clone(&counter)));

        let lookups = (0..1000).map(|_| {
            let service = Arc::clone(&service);
            async move { service.lookup("8.8.8.8").await }
        });
        let results = join_all(lookups).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &results[0]));
        assert_eq!(results[0].country.as_deref(), Some("United States"));

        // Cached afterwards: still one upstream call.
        let again = service.lookup("8.8.8.8").await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(again.as_number.as_deref(), Some("15169"));

        service.close().await;
    }

    #[tokio::test]
    async fn failures_are_cached_as_negative_results() {
        let counter = Arc::new(AtomicUsize::new(0));
        let fetch: FetchFn = {
            let counter = Arc::clone(&counter);
            Arc::new(
                move |_ip: String| -> BoxFuture<'static, eyre::Result<GeoLocationData>> {
                    let counter = Arc::clone(&counter);
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        eyre::bail!("boom")
                    })
                },
            )
        };
        let service = GeoService::with_fetch(&fast_config(), fetch);

        assert_eq!(service.lookup("192.0.2.1").await, GeoLocationData::default());
        assert_eq!(service.lookup("192.0.2.1").await, GeoLocationData::default());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        service.close().await;
    }

    #[tokio::test]
    async fn caller_timeout_yields_empty_and_caches_nothing() {
        let fetch: FetchFn = Arc::new(
            |_ip: String| -> BoxFuture<'static, eyre::Result<GeoLocationData>> {
                Box::pin(async {
                    // Never resolves within the caller timeout.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(GeoLocationData::default())
                })
            },
        );
        let config = EngineConfig {
            geo_caller_timeout_ms: 50,
            ..EngineConfig::default()
        };
        let service = GeoService::with_fetch(&config, fetch);

        let result = service.lookup("203.0.113.7").await;
        assert_eq!(result, GeoLocationData::default());
        assert!(
            !service
                .state
                .lock()
                .expect("state lock")
                .cache
                .contains_key("203.0.113.7")
        );
    }

    #[test]
    fn splits_the_as_field() {
        let mut data = GeoLocationData {
            as_number: Some("AS15169 Google LLC".to_string()),
            ..GeoLocationData::default()
        };
        data.split_as_field();
        assert_eq!(data.as_number.as_deref(), Some("15169"));
        assert_eq!(data.asname.as_deref(), Some("Google LLC"));

        // Already-split or malformed values stay untouched.
        let mut odd = GeoLocationData {
            as_number: Some("ASN whatever".to_string()),
            ..GeoLocationData::default()
        };
        odd.split_as_field();
        assert_eq!(odd.as_number.as_deref(), Some("ASN whatever"));
    }

    #[test]
    fn parses_upstream_json() {
        let raw = r#"{
            "country": "United States",
            "regionName": "Virginia",
            "city": "Ashburn",
            "lat": 39.03,
            "lon": -77.5,
            "isp": "Example ISP",
            "as": "AS64496 Example Org",
            "mobile": false,
            "proxy": false,
            "hosting": true
        }"#;
        let mut data: GeoLocationData = serde_json::from_str(raw).expect("json");
        data.split_as_field();

        assert_eq!(data.region_name.as_deref(), Some("Virginia"));
        assert_eq!(data.as_number.as_deref(), Some("64496"));
        assert_eq!(data.asname.as_deref(), Some("Example Org"));
        assert_eq!(data.hosting, Some(true));
        assert!(data.has_identity());
    }
}
