//! Proxy validation and performance probing
//!
//! A proxy is considered live when a GET through it against any of the
//! reference URLs comes back 200. Certificate validation is disabled on
//! purpose: commercial endpoints terminate TLS in the middle.

use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Reference URLs probed during validation
pub const TEST_URLS: [&str; 4] = [
    "https://www.google.com",
    "https://www.amazon.com",
    "https://www.wikipedia.org",
    "https://www.github.com",
];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

static DEFAULT_HEADERS: Lazy<HeaderMap> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
        ),
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers
});

/// Outcome of a [`ProxyValidator::measure`] probe
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationMetrics {
    pub success_count: u32,
    pub failure_count: u32,
    pub avg_response_time_ms: u64,
    pub min_response_time_ms: u64,
    pub max_response_time_ms: u64,
    /// Percentage of probes that came back 200
    pub success_rate: f64,
}

/// Tests whether proxies can reach the reference URLs
pub struct ProxyValidator {
    test_urls: Vec<String>,
    timeout: Duration,
}

impl Default for ProxyValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyValidator {
    pub fn new() -> Self {
        Self {
            test_urls: TEST_URLS.iter().map(|u| u.to_string()).collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Probe a custom URL set instead of the reference one, used by tests.
    pub fn with_test_urls(test_urls: Vec<String>) -> Self {
        Self {
            test_urls,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn client_for(&self, proxy_url: &str) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy_url)?)
            .default_headers(DEFAULT_HEADERS.clone())
            .danger_accept_invalid_certs(true)
            .timeout(self.timeout)
            .build()
    }

    /// Validate a proxy URL: the first 200 from any reference URL wins.
    pub async fn validate(&self, proxy_url: &str) -> bool {
        let client = match self.client_for(proxy_url) {
            Ok(client) => client,
            Err(err) => {
                debug!(proxy_url, error = %err, "could not build proxied client");
                return false;
            }
        };

        for url in &self.test_urls {
            match client.get(url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    debug!(proxy_url, url, "proxy validated");
                    return true;
                }
                Ok(response) => {
                    debug!(proxy_url, url, status = %response.status(), "unexpected status");
                }
                Err(err) => {
                    debug!(proxy_url, url, error = %err, "probe failed");
                }
            }
        }

        false
    }

    /// Blocking twin of [`validate`](Self::validate).
    ///
    /// Must not be called from inside the async runtime.
    pub fn validate_blocking(&self, proxy_url: &str) -> bool {
        let client = match reqwest::blocking::Client::builder()
            .proxy(match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => proxy,
                Err(err) => {
                    debug!(proxy_url, error = %err, "invalid proxy url");
                    return false;
                }
            })
            .default_headers(DEFAULT_HEADERS.clone())
            .danger_accept_invalid_certs(true)
            .timeout(self.timeout)
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                debug!(proxy_url, error = %err, "could not build proxied client");
                return false;
            }
        };

        for url in &self.test_urls {
            match client.get(url).send() {
                Ok(response) if response.status() == StatusCode::OK => return true,
                Ok(response) => {
                    debug!(proxy_url, url, status = %response.status(), "unexpected status");
                }
                Err(err) => {
                    debug!(proxy_url, url, error = %err, "probe failed");
                }
            }
        }

        false
    }

    /// Run `samples` timed probes, cycling through the URL set.
    pub async fn measure(&self, proxy_url: &str, samples: usize) -> ValidationMetrics {
        let mut metrics = ValidationMetrics::default();
        let mut total_ms = 0u64;
        let mut min_ms = u64::MAX;

        let client = match self.client_for(proxy_url) {
            Ok(client) => client,
            Err(_) => {
                metrics.failure_count = samples as u32;
                return metrics;
            }
        };

        for i in 0..samples {
            let url = &self.test_urls[i % self.test_urls.len()];
            let started = Instant::now();
            match client.get(url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    metrics.success_count += 1;
                    total_ms += elapsed;
                    min_ms = min_ms.min(elapsed);
                    metrics.max_response_time_ms = metrics.max_response_time_ms.max(elapsed);
                }
                _ => metrics.failure_count += 1,
            }
        }

        if metrics.success_count > 0 {
            metrics.avg_response_time_ms = total_ms / u64::from(metrics.success_count);
            metrics.min_response_time_ms = min_ms;
        }
        let total = metrics.success_count + metrics.failure_count;
        if total > 0 {
            metrics.success_rate = f64::from(metrics.success_count) / f64::from(total) * 100.0;
        }

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::any;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // The mock server doubles as both the HTTP proxy and the target:
    // plain-http probes arrive at the "proxy" in absolute form and are
    // answered directly.
    async fn proxy_server(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_validate_succeeds_on_200() {
        let server = proxy_server(200).await;
        let validator =
            ProxyValidator::with_test_urls(vec!["http://validation.example/".to_string()]);

        assert!(validator.validate(&server.uri()).await);
    }

    #[tokio::test]
    async fn test_validate_fails_on_error_status() {
        let server = proxy_server(503).await;
        let validator =
            ProxyValidator::with_test_urls(vec!["http://validation.example/".to_string()]);

        assert!(!validator.validate(&server.uri()).await);
    }

    #[tokio::test]
    async fn test_validate_rejects_malformed_proxy_url() {
        let validator =
            ProxyValidator::with_test_urls(vec!["http://validation.example/".to_string()]);
        assert!(!validator.validate("not a proxy url").await);
    }

    #[tokio::test]
    async fn test_measure_counts_successes_and_rate() {
        let server = proxy_server(200).await;
        let validator =
            ProxyValidator::with_test_urls(vec!["http://validation.example/".to_string()]);

        let metrics = validator.measure(&server.uri(), 4).await;
        assert_eq!(metrics.success_count, 4);
        assert_eq!(metrics.failure_count, 0);
        assert_eq!(metrics.success_rate, 100.0);
        assert!(metrics.min_response_time_ms <= metrics.max_response_time_ms);
    }

    #[tokio::test]
    async fn test_measure_all_failures() {
        let server = proxy_server(500).await;
        let validator =
            ProxyValidator::with_test_urls(vec!["http://validation.example/".to_string()]);

        let metrics = validator.measure(&server.uri(), 3).await;
        assert_eq!(metrics.success_count, 0);
        assert_eq!(metrics.failure_count, 3);
        assert_eq!(metrics.avg_response_time_ms, 0);
        assert_eq!(metrics.min_response_time_ms, 0);
        assert_eq!(metrics.success_rate, 0.0);
    }
}
