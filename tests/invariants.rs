//! Property tests for the pool's structural invariants
//!
//! Any interleaving of refreshes and outcome reports must preserve
//! identity uniqueness, the three-strike rule, and snapshot fidelity.

use async_trait::async_trait;
use proptest::prelude::*;
use proxy_pool::{PoolSettings, PoolSnapshot, ProxyDescriptor, ProxyPoolManager, ProxyProvider};
use std::collections::HashSet;
use tempfile::TempDir;

const HOSTS: [&str; 5] = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"];
const COUNTRIES: [&str; 3] = ["us", "gb", "de"];

struct FixedProvider {
    proxies: Vec<ProxyDescriptor>,
}

#[async_trait]
impl ProxyProvider for FixedProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch(&self) -> Vec<ProxyDescriptor> {
        self.proxies.clone()
    }
}

fn seed_proxies() -> Vec<ProxyDescriptor> {
    HOSTS
        .iter()
        .enumerate()
        .map(|(i, host)| {
            let mut proxy = ProxyDescriptor::new(*host, 8080);
            proxy.country = COUNTRIES[i % COUNTRIES.len()].to_string();
            proxy
        })
        .collect()
}

fn seeded_manager(dir: &TempDir) -> ProxyPoolManager {
    let settings = PoolSettings {
        use_proxies: true,
        cache_path: dir.path().join("proxy_cache.json"),
        ..PoolSettings::default()
    };
    let manager = ProxyPoolManager::new(
        settings,
        Box::new(FixedProvider {
            proxies: seed_proxies(),
        }),
    );
    tokio_test::block_on(manager.refresh());
    manager
}

#[derive(Debug, Clone)]
enum Op {
    Report {
        target: usize,
        success: bool,
        response_time_ms: Option<u64>,
    },
    Refresh,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        8 => (0..HOSTS.len(), any::<bool>(), proptest::option::of(1u64..2000))
            .prop_map(|(target, success, response_time_ms)| Op::Report {
                target,
                success,
                response_time_ms,
            }),
        1 => Just(Op::Refresh),
    ]
}

fn apply(manager: &ProxyPoolManager, ops: &[Op]) {
    let seeds = seed_proxies();
    for op in ops {
        match op {
            Op::Report {
                target,
                success,
                response_time_ms,
            } => manager.report(&seeds[*target], *success, *response_time_ms),
            Op::Refresh => tokio_test::block_on(manager.refresh()),
        }
    }
}

fn assert_structural_invariants(snapshot: &PoolSnapshot, threshold: u32) {
    // Identity uniqueness across the pool
    let keys: Vec<String> = snapshot.proxies.iter().map(|p| p.key()).collect();
    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(keys.len(), unique.len(), "duplicate identities in pool");

    let blacklisted: HashSet<String> = snapshot.blacklisted.iter().map(|p| p.key()).collect();
    assert_eq!(
        blacklisted.len(),
        snapshot.blacklisted.len(),
        "duplicate tombstones"
    );

    // Three-strike rule, both directions
    for proxy in &snapshot.proxies {
        if proxy.failure_count >= threshold {
            assert!(!proxy.is_active, "{} active with 3+ failures", proxy.key());
            assert!(blacklisted.contains(&proxy.key()), "{} missing tombstone", proxy.key());
        }
        if !proxy.is_active {
            assert!(proxy.failure_count >= threshold);
            assert!(blacklisted.contains(&proxy.key()));
        }
    }

    // Performance counters stay consistent
    for perf in snapshot.performance.values() {
        assert!(perf.successful_requests <= perf.total_requests);
        assert!(perf.timed_successes <= perf.successful_requests);
        if perf.timed_successes > 0 {
            assert_eq!(
                perf.avg_response_time_ms,
                perf.total_response_time_ms / perf.timed_successes
            );
        } else {
            assert_eq!(perf.avg_response_time_ms, 0);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_invariants_hold_under_any_interleaving(ops in proptest::collection::vec(op_strategy(), 0..60)) {
        let dir = TempDir::new().unwrap();
        let manager = seeded_manager(&dir);

        apply(&manager, &ops);

        let snapshot = manager.snapshot();
        assert_structural_invariants(&snapshot, 3);
    }

    #[test]
    fn prop_success_resets_streak_of_live_proxy(
        failures in 0u32..3,
        target in 0..HOSTS.len(),
        response_time_ms in proptest::option::of(1u64..2000),
    ) {
        let dir = TempDir::new().unwrap();
        let manager = seeded_manager(&dir);
        let seeds = seed_proxies();

        for _ in 0..failures {
            manager.report(&seeds[target], false, None);
        }
        manager.report(&seeds[target], true, response_time_ms);

        let snapshot = manager.snapshot();
        let stored = snapshot
            .proxies
            .iter()
            .find(|p| p.key() == seeds[target].key())
            .unwrap();
        prop_assert!(stored.is_active);
        prop_assert_eq!(stored.failure_count, 0);
    }

    #[test]
    fn prop_snapshot_round_trips(ops in proptest::collection::vec(op_strategy(), 0..40)) {
        let dir = TempDir::new().unwrap();
        let manager = seeded_manager(&dir);
        apply(&manager, &ops);

        tokio_test::block_on(manager.shutdown());
        let saved = manager.snapshot();
        drop(manager);

        let reloaded = seeded_manager_without_refresh(&dir);
        prop_assert_eq!(reloaded.snapshot(), saved);
    }

    #[test]
    fn prop_selection_is_sound(
        ops in proptest::collection::vec(op_strategy(), 0..40),
        country in proptest::option::of(proptest::sample::select(COUNTRIES.to_vec())),
        max_rt in proptest::option::of(50u64..1500),
    ) {
        let dir = TempDir::new().unwrap();
        let manager = seeded_manager(&dir);
        apply(&manager, &ops);

        let snapshot = manager.snapshot();
        let matches = |p: &ProxyDescriptor| {
            p.is_active
                && country.map_or(true, |c| p.country == c)
                && max_rt.map_or(true, |limit| {
                    let avg = if p.avg_response_time_ms == 0 { 999_999 } else { p.avg_response_time_ms };
                    avg <= limit
                })
        };

        match manager.select(country, max_rt) {
            // Soundness: the choice satisfies every requested filter.
            Some(chosen) => prop_assert!(matches(&chosen)),
            // Liveness: nothing satisfied the filters either.
            None => prop_assert!(!snapshot.proxies.iter().any(matches)),
        }
    }
}

fn seeded_manager_without_refresh(dir: &TempDir) -> ProxyPoolManager {
    let settings = PoolSettings {
        use_proxies: true,
        cache_path: dir.path().join("proxy_cache.json"),
        ..PoolSettings::default()
    };
    ProxyPoolManager::new(settings, Box::new(FixedProvider { proxies: Vec::new() }))
}
