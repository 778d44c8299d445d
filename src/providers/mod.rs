//! Upstream proxy providers
//!
//! A provider is the source of proxy descriptors for the pool. Fetches
//! never fail outward: a provider that cannot produce anything returns an
//! empty list and logs why, and repeated fetches yield stable
//! `(host, port)` identities for the same logical endpoints.

use async_trait::async_trait;
use tracing::warn;

use crate::descriptor::ProxyDescriptor;

pub mod luminati;
pub mod static_list;

pub use luminati::LuminatiProvider;
pub use static_list::StaticListProvider;

/// Source of proxy descriptors, pluggable by name
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// Provider name as recorded on descriptors
    fn name(&self) -> &str;

    /// Fetch the current set of proxy descriptors.
    ///
    /// May perform network I/O. Returns an empty list when no proxies can
    /// be produced.
    async fn fetch(&self) -> Vec<ProxyDescriptor>;
}

/// Resolve a provider by its configured name.
///
/// Names are case-insensitive and aliases are accepted; an unknown name
/// falls back to the static-list provider with a warning.
pub fn provider_from_name(name: &str) -> Box<dyn ProxyProvider> {
    match name.to_lowercase().as_str() {
        "luminati" | "brightdata" => Box::new(LuminatiProvider::from_env()),
        "static_list" | "proxy_list" => Box::new(StaticListProvider::from_env()),
        other => {
            warn!(provider = other, "unknown proxy provider, falling back to static list");
            Box::new(StaticListProvider::from_env())
        }
    }
}
