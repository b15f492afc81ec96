//! Geocoding providers known to the pipeline.
//!
//! Every provider is described by a TOML file in `services/`, embedded at
//! build time. [`geocoder_for`] picks one by id (or the highest-priority
//! enabled one) and [`build_geocoder`] turns its description plus explicit
//! credentials into a [`Geocoder`].

use std::sync::Arc;

use serde::Deserialize;

use crate::google::GoogleGeocoder;
use crate::nominatim::NominatimGeocoder;
use crate::pelias::PeliasGeocoder;
use crate::{GeocodeError, Geocoder};

/// Environment variable selecting the provider by id.
pub const PROVIDER_ENV: &str = "GEOCODING_PROVIDER";

/// Environment variable holding the provider API key.
pub const API_KEY_ENV: &str = "GEOCODING_API_KEY";

/// `User-Agent` sent with every request (Nominatim rejects anonymous
/// clients).
const USER_AGENT: &str = concat!("facility-import/", env!("CARGO_PKG_VERSION"));

const PROVIDER_FILES: [(&str, &str); 3] = [
    ("google", include_str!("../services/google.toml")),
    ("pelias", include_str!("../services/pelias.toml")),
    ("nominatim", include_str!("../services/nominatim.toml")),
];

/// One provider description.
#[derive(Debug, Clone, Deserialize)]
pub struct GeocodingService {
    /// Provider id, matched case-insensitively by [`geocoder_for`].
    pub id: String,
    /// Display name for logs.
    pub name: String,
    /// Whether the provider may be picked when none is requested.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Lower wins when picking a default.
    pub priority: u32,
    /// Endpoint and provider knobs.
    pub provider: ProviderConfig,
}

/// Endpoint and knobs per provider type (`type = "..."` in TOML).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Google Geocoding API. Needs an API key.
    Google {
        /// Endpoint URL.
        base_url: String,
    },
    /// Pelias instance.
    Pelias {
        /// Instance root (e.g., `"http://localhost:4000"`).
        base_url: String,
        /// Maximum candidates per query.
        #[serde(default = "default_candidates")]
        size: usize,
    },
    /// Nominatim search endpoint.
    Nominatim {
        /// Endpoint URL.
        base_url: String,
        /// Maximum candidates per query.
        #[serde(default = "default_candidates")]
        limit: usize,
    },
}

const fn enabled_by_default() -> bool {
    true
}

const fn default_candidates() -> usize {
    5
}

impl GeocodingService {
    /// Endpoint of the provider.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        match &self.provider {
            ProviderConfig::Google { base_url }
            | ProviderConfig::Pelias { base_url, .. }
            | ProviderConfig::Nominatim { base_url, .. } => base_url,
        }
    }

    /// Whether [`build_geocoder`] needs an API key for this provider.
    #[must_use]
    pub const fn requires_api_key(&self) -> bool {
        matches!(self.provider, ProviderConfig::Google { .. })
    }
}

/// Every provider description, enabled or not, in file order.
///
/// # Panics
///
/// Panics if an embedded TOML file is malformed, which the registry tests
/// catch before release.
#[must_use]
pub fn all_services() -> Vec<GeocodingService> {
    PROVIDER_FILES
        .iter()
        .map(|(file, contents)| {
            toml::from_str(contents)
                .unwrap_or_else(|e| panic!("Invalid geocoding provider file '{file}.toml': {e}"))
        })
        .collect()
}

/// Enabled providers, best first.
#[must_use]
pub fn enabled_services() -> Vec<GeocodingService> {
    let mut enabled: Vec<GeocodingService> = all_services()
        .into_iter()
        .filter(|service| service.enabled)
        .collect();
    enabled.sort_by_key(|service| service.priority);
    enabled
}

/// Builds the HTTP client shared by all providers.
///
/// # Errors
///
/// Returns [`GeocodeError::Http`] if the TLS backend cannot be initialized.
pub fn http_client() -> Result<reqwest::Client, GeocodeError> {
    Ok(reqwest::Client::builder().user_agent(USER_AGENT).build()?)
}

/// Creates a geocoder for `service`.
///
/// `api_key` is only used by providers that need one; a missing key is
/// reported later by [`Geocoder::check_ready`].
#[must_use]
pub fn build_geocoder(
    service: &GeocodingService,
    client: reqwest::Client,
    api_key: Option<String>,
) -> Arc<dyn Geocoder> {
    match &service.provider {
        ProviderConfig::Google { base_url } => {
            Arc::new(GoogleGeocoder::new(client, base_url.clone(), api_key))
        }
        ProviderConfig::Pelias { base_url, size } => {
            Arc::new(PeliasGeocoder::new(client, base_url.clone(), *size))
        }
        ProviderConfig::Nominatim { base_url, limit } => {
            Arc::new(NominatimGeocoder::new(client, base_url.clone(), *limit))
        }
    }
}

/// Creates a geocoder for the provider with id `provider_id`, or the
/// highest-priority enabled provider when `None`.
///
/// # Errors
///
/// Returns [`GeocodeError::Config`] if the id is unknown or no provider is
/// enabled, or [`GeocodeError::Http`] if the HTTP client cannot be built.
pub fn geocoder_for(
    provider_id: Option<&str>,
    api_key: Option<String>,
) -> Result<Arc<dyn Geocoder>, GeocodeError> {
    let service = match provider_id {
        Some(id) => {
            let services = all_services();
            let known = services
                .iter()
                .map(|s| s.id.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            services
                .into_iter()
                .find(|s| s.id.eq_ignore_ascii_case(id))
                .ok_or_else(|| GeocodeError::Config {
                    message: format!("Unknown geocoding provider '{id}' (known: {known})"),
                })?
        }
        None => enabled_services()
            .into_iter()
            .next()
            .ok_or_else(|| GeocodeError::Config {
                message: "No geocoding provider is enabled".to_string(),
            })?,
    };

    if service.requires_api_key() && api_key.is_none() {
        log::warn!("Geocoding provider {} has no API key configured", service.id);
    }
    log::info!("Using geocoding provider: {} ({})", service.name, service.id);

    Ok(build_geocoder(&service, http_client()?, api_key))
}

/// Creates a geocoder from the [`PROVIDER_ENV`] and [`API_KEY_ENV`]
/// environment variables.
///
/// This is the only place credentials are read from the environment; the
/// pipeline receives the resulting geocoder explicitly.
///
/// # Errors
///
/// See [`geocoder_for`].
pub fn geocoder_from_env() -> Result<Arc<dyn Geocoder>, GeocodeError> {
    let provider = std::env::var(PROVIDER_ENV).ok().filter(|p| !p.is_empty());
    let api_key = std::env::var(API_KEY_ENV).ok();
    geocoder_for(provider.as_deref(), api_key)
}
