#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Geocoding collaborator for the facility import pipeline.
//!
//! Resolves a free-text address to an ordered list of candidate matches,
//! each with a formatted address, coordinates, an approximate-match flag,
//! and typed address components. Providers are configured via TOML files
//! in `services/`:
//!
//! 1. **Google Geocoding API** (priority 1): requires an API key, reports
//!    approximate matches through `partial_match`.
//! 2. **Pelias** (priority 2): self-hosted, no key. Confidence below 0.9
//!    is reported as approximate.
//! 3. **Nominatim / OpenStreetMap** (priority 3): no key, no exactness
//!    signal, so every candidate is approximate.
//!
//! The pipeline only sees the [`Geocoder`] trait, so tests substitute a
//! scripted implementation.

pub mod address;
pub mod google;
pub mod nominatim;
pub mod pelias;
pub mod service_registry;

use std::time::Duration;

use async_trait::async_trait;
use facility_import_models::Coordinates;
use thiserror::Error;

pub use address::AddressComponent;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A single geocoding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocodeRequest {
    /// Free-text address.
    pub address: String,
    /// Region bias (ISO country code, e.g. `"us"`).
    pub region: Option<String>,
    /// Upper bound on the provider round trip.
    pub timeout: Duration,
}

impl GeocodeRequest {
    /// Creates a request with no region hint and [`DEFAULT_TIMEOUT`].
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            region: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the region hint.
    #[must_use]
    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One candidate match returned by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeCandidate {
    /// Canonical address as formatted by the provider.
    pub formatted_address: String,
    /// Resolved point.
    pub coordinates: Coordinates,
    /// Whether the provider flagged this match as approximate.
    pub approximate: bool,
    /// Typed address components.
    pub components: Vec<AddressComponent>,
}

impl GeocodeCandidate {
    /// Returns the first component tagged with `kind`.
    #[must_use]
    pub fn component(&self, kind: &str) -> Option<&AddressComponent> {
        address::find_component(&self.components, kind)
    }

    /// Long name of the locality component, or `""`.
    #[must_use]
    pub fn city(&self) -> &str {
        self.component(address::LOCALITY)
            .map_or("", |c| c.long_name.as_str())
    }

    /// Short name of the first-level administrative area, or `""`.
    #[must_use]
    pub fn state(&self) -> &str {
        self.component(address::ADMIN_AREA_LEVEL_1)
            .map_or("", |c| c.short_name.as_str())
    }
}

/// Errors from geocoding operations.
#[derive(Debug, Error)]
pub enum GeocodeError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    /// The provider did not answer within the request timeout.
    #[error("Geocoding request timed out")]
    Timeout,

    /// The provider needs credentials that were not configured.
    #[error("Missing credentials for geocoding provider '{provider}'")]
    MissingCredentials {
        /// Provider id.
        provider: String,
    },

    /// The provider rejected the request (bad key, malformed query).
    #[error("Geocoding request denied: {message}")]
    RequestDenied {
        /// Provider-supplied reason.
        message: String,
    },

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Response parsing failed.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of the parsing failure.
        message: String,
    },

    /// The provider answered with an unexpected status.
    #[error("Provider returned {status}: {message}")]
    Provider {
        /// Provider or HTTP status.
        status: String,
        /// Details.
        message: String,
    },

    /// Provider configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description.
        message: String,
    },
}

impl From<reqwest::Error> for GeocodeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e)
        }
    }
}

/// A geocoding provider.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Provider id (e.g. `"google"`).
    fn name(&self) -> &str;

    /// Verifies the provider can be called at all (credentials present).
    ///
    /// Called once before a geocoding phase starts.
    ///
    /// # Errors
    ///
    /// Returns [`GeocodeError::MissingCredentials`] or
    /// [`GeocodeError::Config`] if the provider is unusable.
    fn check_ready(&self) -> Result<(), GeocodeError> {
        Ok(())
    }

    /// Resolves `request.address` to zero or more ordered candidates.
    ///
    /// # Errors
    ///
    /// Returns [`GeocodeError`] on transport, credential, or parse
    /// failures. "Not found" is an empty list, not an error.
    async fn geocode(&self, request: &GeocodeRequest) -> Result<Vec<GeocodeCandidate>, GeocodeError>;
}

/// Reads a required float, accepting both JSON numbers and numeric strings
/// (Nominatim returns coordinates as strings).
pub(crate) fn json_f64(value: Option<&serde_json::Value>) -> Option<f64> {
    let value = value?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
}
