//! Proxy pool manager
//!
//! Owns the pool store, a provider, and the validator; exposes selection
//! and reporting to callers and runs the refresh and health loops in the
//! background. Construct one at program start and hand it (in an `Arc`)
//! to every consumer.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::{thread_rng, Rng};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolSettings;
use crate::descriptor::ProxyDescriptor;
use crate::providers::{provider_from_name, ProxyProvider};
use crate::store::{PoolSnapshot, PoolStore};
use crate::validator::ProxyValidator;

/// Latency assumed for descriptors that were never measured when a
/// latency bound is applied; keeps them out of bounded selections.
const UNMEASURED_SENTINEL_MS: u64 = 999_999;

/// Aggregate pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_proxies: usize,
    pub active_proxies: usize,
    pub blacklisted_proxies: usize,
    /// Mean per-proxy success percentage, two decimals
    pub avg_success_rate: f64,
    /// Mean per-proxy response time, two decimals
    pub avg_response_time_ms: f64,
    /// Descriptor count per country code
    pub countries: HashMap<String, usize>,
    pub last_refresh: Option<chrono::DateTime<Utc>>,
}

pub struct ProxyPoolManager {
    settings: PoolSettings,
    store: PoolStore,
    provider: Box<dyn ProxyProvider>,
    validator: ProxyValidator,
    shutdown: CancellationToken,
}

impl ProxyPoolManager {
    pub fn new(settings: PoolSettings, provider: Box<dyn ProxyProvider>) -> Self {
        let store = PoolStore::new(settings.cache_path.clone(), settings.use_proxies);
        Self {
            settings,
            store,
            provider,
            validator: ProxyValidator::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the manager entirely from environment configuration.
    pub fn from_env() -> Self {
        let settings = PoolSettings::from_env();
        let provider = provider_from_name(&settings.provider);
        Self::new(settings, provider)
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Current pool state in its persisted form, for diagnostics.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.store.snapshot()
    }

    /// Pull from the provider and merge new endpoints into the pool.
    pub async fn refresh(&self) {
        self.try_refresh().await;
    }

    /// As [`refresh`](Self::refresh); reports whether the provider
    /// produced anything, which drives the loop's backoff.
    async fn try_refresh(&self) -> bool {
        if !self.settings.use_proxies {
            info!("proxies are disabled in configuration");
            return true;
        }

        info!(provider = self.provider.name(), "refreshing proxies from provider");
        let fetched = self.provider.fetch().await;
        if fetched.is_empty() {
            warn!("no proxies received from provider");
            return false;
        }

        let (inserted, total, active, snapshot) = self.store.with_state(|state| {
            let mut known: HashSet<String> = state.proxies.iter().map(|p| p.key()).collect();
            let mut inserted = 0;
            for mut proxy in fetched {
                // Known identities stay untouched; the refresh path never
                // mutates performance or liveness.
                if known.insert(proxy.key()) {
                    proxy.is_active = true;
                    proxy.failure_count = 0;
                    proxy.added_at = Some(Utc::now());
                    state.proxies.push(proxy);
                    inserted += 1;
                }
            }
            state.rebuild_active();
            state.last_refresh = Some(Utc::now());
            (inserted, state.proxies.len(), state.active.len(), state.to_snapshot())
        });
        self.store.write_snapshot(&snapshot);

        info!(inserted, total, active, "proxy refresh completed");
        true
    }

    /// Pick an active proxy, optionally pinned to a country and bounded
    /// by average response time. Faster proxies are favored once the
    /// candidate set is large enough to weight.
    pub fn select(
        &self,
        country: Option<&str>,
        max_response_time_ms: Option<u64>,
    ) -> Option<ProxyDescriptor> {
        if !self.settings.use_proxies {
            return None;
        }

        self.store.with_state(|state| {
            let mut candidates: Vec<usize> = state.active.clone();

            if let Some(country) = country {
                candidates.retain(|&i| state.proxies[i].country == country);
            }
            if let Some(limit) = max_response_time_ms {
                candidates.retain(|&i| {
                    let avg = state.proxies[i].avg_response_time_ms;
                    let avg = if avg == 0 { UNMEASURED_SENTINEL_MS } else { avg };
                    avg <= limit
                });
            }

            if candidates.is_empty() {
                warn!(?country, ?max_response_time_ms, "no matching proxies for criteria");
                return None;
            }

            let index = pick_weighted(&candidates, |i| state.proxies[i].avg_response_time_ms);
            let chosen = &mut state.proxies[index];
            chosen.last_used = Some(Utc::now());
            Some(chosen.clone())
        })
    }

    /// Record a caller-observed outcome for a proxy.
    ///
    /// Success resets the failure streak; three consecutive failures
    /// blacklist the endpoint, same as the health loop.
    pub fn report(
        &self,
        descriptor: &ProxyDescriptor,
        success: bool,
        response_time_ms: Option<u64>,
    ) {
        if !self.settings.use_proxies {
            return;
        }

        let key = descriptor.key();
        let snapshot = self.store.with_state(|state| {
            let perf = state.performance.entry(key.clone()).or_default();
            if success {
                perf.record_success(response_time_ms);
                // Blacklisted descriptors keep their strike count; success
                // only clears the streak of a proxy still in rotation.
                if let Some(stored) = state.find_mut(descriptor) {
                    if stored.is_active {
                        stored.failure_count = 0;
                    }
                }
            } else {
                perf.record_failure();
                let mut tombstone = None;
                if let Some(stored) = state.find_mut(descriptor) {
                    stored.failure_count += 1;
                    if stored.failure_count >= self.settings.blacklist_threshold
                        && stored.is_active
                    {
                        stored.is_active = false;
                        tombstone = Some(stored.clone());
                    }
                }
                if let Some(dead) = tombstone {
                    info!(proxy = %key, failures = dead.failure_count, "blacklisted proxy");
                    state.blacklisted.push(dead);
                    state.rebuild_active();
                }
            }

            // Amortised durability: most reports only touch memory.
            if thread_rng().gen::<f64>() < self.settings.save_probability {
                Some(state.to_snapshot())
            } else {
                None
            }
        });

        if let Some(snapshot) = snapshot {
            self.store.write_snapshot(&snapshot);
        }
    }

    /// Canonical URL for the given descriptor, or for a freshly selected
    /// one when none is passed. `None` when proxies are disabled or the
    /// pool has nothing to offer.
    pub fn proxy_url(&self, descriptor: Option<&ProxyDescriptor>) -> Option<String> {
        if !self.settings.use_proxies {
            return None;
        }
        match descriptor {
            Some(descriptor) => Some(descriptor.proxy_url()),
            None => self.select(None, None).map(|p| p.proxy_url()),
        }
    }

    /// Probe every active proxy and apply the outcomes.
    pub async fn run_health_check(&self) {
        if !self.settings.use_proxies {
            return;
        }

        let targets: Vec<ProxyDescriptor> = self
            .store
            .with_state(|state| state.active.iter().map(|&i| state.proxies[i].clone()).collect());
        if targets.is_empty() {
            debug!("no active proxies to health check");
            return;
        }

        info!(count = targets.len(), "performing proxy health check");
        let results: Vec<(ProxyDescriptor, bool, u64)> = stream::iter(targets)
            .map(|proxy| {
                let validator = &self.validator;
                async move {
                    let url = proxy.proxy_url();
                    let started = Instant::now();
                    let healthy = validator.validate(&url).await;
                    (proxy, healthy, started.elapsed().as_millis() as u64)
                }
            })
            .buffer_unordered(self.settings.health_concurrency)
            .collect()
            .await;

        let (blacklisted, active, snapshot) = self.store.with_state(|state| {
            let mut blacklisted = 0;
            for (probed, healthy, elapsed) in &results {
                if *healthy {
                    let perf = state.performance.entry(probed.key()).or_default();
                    perf.record_success(Some(*elapsed));
                    let avg = perf.avg_response_time_ms;
                    if let Some(stored) = state.find_mut(probed) {
                        stored.failure_count = 0;
                        stored.last_checked = Some(Utc::now());
                        stored.avg_response_time_ms = avg;
                    }
                } else if let Some(stored) = state.find_mut(probed) {
                    stored.failure_count += 1;
                    if stored.failure_count >= self.settings.blacklist_threshold
                        && stored.is_active
                    {
                        stored.is_active = false;
                        let dead = stored.clone();
                        debug!(proxy = %dead.key(), "health check blacklisted proxy");
                        state.blacklisted.push(dead);
                        blacklisted += 1;
                    }
                }
            }
            state.rebuild_active();
            (blacklisted, state.active.len(), state.to_snapshot())
        });
        self.store.write_snapshot(&snapshot);

        info!(blacklisted, active, "health check completed");
    }

    /// Aggregate statistics over the whole pool.
    pub fn stats(&self) -> PoolStats {
        self.store.with_state(|state| {
            let mut success_rates = Vec::new();
            let mut response_times = Vec::new();
            for perf in state.performance.values() {
                if perf.total_requests > 0 {
                    success_rates.push(perf.success_rate());
                }
                if perf.timed_successes > 0 {
                    response_times.push(perf.avg_response_time_ms as f64);
                }
            }

            let mut countries: HashMap<String, usize> = HashMap::new();
            for proxy in &state.proxies {
                *countries.entry(proxy.country.clone()).or_default() += 1;
            }

            PoolStats {
                total_proxies: state.proxies.len(),
                active_proxies: state.active.len(),
                blacklisted_proxies: state.blacklisted.len(),
                avg_success_rate: round2(mean(&success_rates)),
                avg_response_time_ms: round2(mean(&response_times)),
                countries,
                last_refresh: state.last_refresh,
            }
        })
    }

    /// Start the refresh and health loops. No-op when proxies are
    /// disabled. The loops run until [`shutdown`](Self::shutdown).
    pub fn spawn_background_tasks(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        if !self.settings.use_proxies {
            info!("proxies are disabled, background tasks not started");
            return Vec::new();
        }

        let refresh_manager = Arc::clone(&self);
        let health_manager = self;
        let handles = vec![
            tokio::spawn(async move { refresh_manager.refresh_loop().await }),
            tokio::spawn(async move { health_manager.health_loop().await }),
        ];
        info!("started proxy management background tasks");
        handles
    }

    /// Stop both loops and flush a final snapshot.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.store.persist();
        info!("proxy pool manager shut down");
    }

    async fn refresh_loop(&self) {
        loop {
            let due = self.store.with_state(|state| match state.last_refresh {
                None => true,
                Some(at) => {
                    (Utc::now() - at).num_seconds()
                        >= self.settings.refresh_interval.as_secs() as i64
                }
            });

            let delay = if due && !self.try_refresh().await {
                self.settings.error_backoff
            } else {
                self.settings.refresh_tick
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("refresh loop stopped");
    }

    async fn health_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.health_interval) => {
                    self.run_health_check().await;
                }
            }
        }
        debug!("health loop stopped");
    }
}

/// Uniform choice for small candidate sets, latency-weighted otherwise.
///
/// Weights are `1000 / avg_ms` by integer division, so anything slower
/// than a second weighs zero; unmeasured proxies count as 1 ms and win by
/// default, which speeds up cold-start sampling. A zero total weight
/// falls back to uniform choice.
fn pick_weighted(candidates: &[usize], avg_ms: impl Fn(usize) -> u64) -> usize {
    let mut rng = thread_rng();
    if candidates.len() <= 3 {
        return candidates[rng.gen_range(0..candidates.len())];
    }

    let weights: Vec<u64> = candidates
        .iter()
        .map(|&i| {
            let avg = avg_ms(i);
            if avg > 0 {
                1000 / avg
            } else {
                1000
            }
        })
        .collect();
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return candidates[rng.gen_range(0..candidates.len())];
    }

    let draw = rng.gen_range(0.0..total as f64);
    let mut running = 0u64;
    for (&candidate, &weight) in candidates.iter().zip(&weights) {
        running += weight;
        if running as f64 >= draw {
            return candidate;
        }
    }
    *candidates.last().expect("candidates checked non-empty")
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
