//! Luminati / Bright Data zone-based provider
//!
//! Descriptors all point at the shared superproxy endpoint; the
//! structured username demultiplexes zone, exit country, and sticky
//! session on the provider side. With a configured zone the set is
//! synthesised locally; without one the zone list is pulled from the
//! REST API, falling back to local synthesis on any API trouble.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::{thread_rng, Rng};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::LuminatiSettings;
use crate::descriptor::{ProxyDescriptor, ProxyProtocol, COUNTRY_ANY};
use crate::providers::ProxyProvider;

/// Shared superproxy endpoint published by the provider
pub const SUPERPROXY_HOST: &str = "zproxy.lum-superproxy.io";
pub const SUPERPROXY_PORT: u16 = 22225;

const API_BASE_URL: &str = "https://luminati.io/api";

/// Exit countries synthesised for every zone
const COUNTRIES: [&str; 18] = [
    "us", "gb", "ca", "de", "fr", "au", "jp", "it", "nl", "br", "es", "in", "mx", "sg", "kr",
    "ch", "se", "no",
];

/// Rotating (no fixed country) entries added per zone
const ROTATING_SLOTS: usize = 5;

/// Zone name used when neither configuration nor the API yields one
const FALLBACK_ZONE: &str = "static";

#[derive(Debug, Deserialize)]
struct ZoneListResponse {
    #[serde(default)]
    zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
struct ZoneEntry {
    name: String,
}

pub struct LuminatiProvider {
    settings: LuminatiSettings,
    api_base_url: String,
    client: Client,
}

impl LuminatiProvider {
    pub fn new(settings: LuminatiSettings) -> Self {
        if settings.username.is_none() || settings.password.is_none() {
            error!("luminati provider requires LUMINATI_USERNAME and LUMINATI_PASSWORD");
        }

        // One long-lived session; the API and superproxy both keep-alive.
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            settings,
            api_base_url: API_BASE_URL.to_string(),
            client,
        }
    }

    pub fn from_env() -> Self {
        Self::new(LuminatiSettings::from_env())
    }

    /// Override the REST endpoint, used by tests against a mock server.
    pub fn with_api_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = base_url.into();
        self
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.settings.username, &self.settings.password) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        }
    }

    fn descriptor(&self, username: String, country: &str, zone: &str) -> ProxyDescriptor {
        ProxyDescriptor {
            host: SUPERPROXY_HOST.to_string(),
            port: SUPERPROXY_PORT,
            protocol: ProxyProtocol::Http,
            username: Some(username),
            password: self.settings.password.clone(),
            country: country.to_string(),
            provider: "luminati".to_string(),
            zone: Some(zone.to_string()),
            session_id: None,
            rotation_slot: None,
            added_at: None,
            is_active: true,
            failure_count: 0,
            last_checked: None,
            last_used: None,
            avg_response_time_ms: 0,
        }
    }

    /// Synthesise the per-country and rotating descriptors for one zone.
    fn zone_descriptors(&self, user: &str, zone: &str) -> Vec<ProxyDescriptor> {
        let mut proxies = Vec::with_capacity(COUNTRIES.len() + ROTATING_SLOTS);

        for country in COUNTRIES {
            let username = format!("{user}-zone-{zone}-country-{country}");
            proxies.push(self.descriptor(username, country, zone));
        }

        for slot in 0..ROTATING_SLOTS {
            let username = format!("{user}-zone-{zone}");
            let mut proxy = self.descriptor(username, COUNTRY_ANY, zone);
            // Rotating entries share host, port, and username; the slot
            // keeps them apart as pool identities.
            proxy.rotation_slot = Some(slot as u32);
            proxies.push(proxy);
        }

        proxies
    }

    /// Enumerate zones through the REST API and synthesise per zone.
    ///
    /// `None` on any API error or an empty zone list; the caller falls
    /// back to single-zone synthesis.
    async fn fetch_from_api(&self, user: &str, password: &str) -> Option<Vec<ProxyDescriptor>> {
        let auth = BASE64.encode(format!("{user}:{password}"));
        let response = self
            .client
            .get(format!("{}/zones", self.api_base_url))
            .header("Authorization", format!("Basic {auth}"))
            .send()
            .await;

        let response = match response {
            Ok(response) if response.status() == reqwest::StatusCode::OK => response,
            Ok(response) => {
                warn!(status = %response.status(), "could not fetch luminati zones");
                return None;
            }
            Err(err) => {
                error!(error = %err, "error accessing luminati API");
                return None;
            }
        };

        let zones = match response.json::<ZoneListResponse>().await {
            Ok(body) => body.zones,
            Err(err) => {
                warn!(error = %err, "unexpected luminati zone listing");
                return None;
            }
        };

        if zones.is_empty() {
            warn!("no zones found in luminati account");
            return None;
        }

        let mut proxies = Vec::new();
        for zone in &zones {
            proxies.extend(self.zone_descriptors(user, &zone.name));
        }
        Some(proxies)
    }

    /// Descriptor for a dedicated browser session: random exit country
    /// and a random 5-digit sticky session id embedded in the username.
    pub fn session_descriptor(&self) -> Option<ProxyDescriptor> {
        let (user, _) = self.credentials()?;
        let zone = self.settings.zone.as_deref()?;

        let country = COUNTRIES[thread_rng().gen_range(0..9)];
        let session_id = thread_rng().gen_range(10_000..=99_999).to_string();
        let username = format!("{user}-zone-{zone}-country-{country}-session-{session_id}");

        let mut proxy = self.descriptor(username, country, zone);
        proxy.session_id = Some(session_id);
        Some(proxy)
    }
}

#[async_trait]
impl ProxyProvider for LuminatiProvider {
    fn name(&self) -> &str {
        "luminati"
    }

    async fn fetch(&self) -> Vec<ProxyDescriptor> {
        let Some((user, password)) = self.credentials() else {
            error!("missing luminati credentials, returning no proxies");
            return Vec::new();
        };

        let proxies = if let Some(zone) = self.settings.zone.as_deref() {
            info!(zone, "using luminati zone-based configuration");
            self.zone_descriptors(user, zone)
        } else {
            info!("attempting to fetch proxies from luminati API");
            match self.fetch_from_api(user, password).await {
                Some(proxies) => proxies,
                None => self.zone_descriptors(user, FALLBACK_ZONE),
            }
        };

        info!(count = proxies.len(), "retrieved proxies from luminati");
        proxies
    }
}
