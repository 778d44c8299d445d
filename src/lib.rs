//! Proxy pool management for scraping workloads
//!
//! This crate maintains a rotating population of upstream HTTP proxies:
//! - Pluggable providers (zone-based commercial services, static lists)
//! - Continuous health validation against live reference targets
//! - Per-proxy performance tracking and three-strike blacklisting
//! - Latency-weighted selection with country and latency filters
//! - JSON snapshot persistence across restarts

pub mod config;
pub mod descriptor;
pub mod manager;
pub mod providers;
pub mod store;
pub mod validator;

pub use config::{LuminatiSettings, PoolSettings};
pub use descriptor::{PerformanceRecord, ProxyDescriptor, ProxyProtocol};
pub use manager::{PoolStats, ProxyPoolManager};
pub use providers::{provider_from_name, LuminatiProvider, ProxyProvider, StaticListProvider};
pub use store::PoolSnapshot;
pub use validator::{ProxyValidator, ValidationMetrics};
