//! Client for a self-hosted Pelias instance.
//!
//! Queries go to `/v1/search` as free text; each `GeoJSON` feature in the
//! answer becomes one candidate. Pelias reports a `confidence` score rather
//! than an approximate flag, so anything under [`EXACT_CONFIDENCE`] counts
//! as approximate.

use async_trait::async_trait;
use facility_import_models::Coordinates;

use crate::address::{ADMIN_AREA_LEVEL_1, COUNTRY, LOCALITY, POSTAL_CODE};
use crate::{AddressComponent, GeocodeCandidate, GeocodeError, GeocodeRequest, Geocoder};

/// Provider id used in the service registry.
pub const PROVIDER_ID: &str = "pelias";

/// Minimum confidence treated as an exact match.
pub const EXACT_CONFIDENCE: f64 = 0.9;

/// Geocoder backed by a Pelias instance.
#[derive(Debug, Clone)]
pub struct PeliasGeocoder {
    client: reqwest::Client,
    base_url: String,
    size: usize,
}

impl PeliasGeocoder {
    /// Creates a client returning at most `size` candidates per query.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, size: usize) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            size: size.max(1),
        }
    }
}

#[async_trait]
impl Geocoder for PeliasGeocoder {
    fn name(&self) -> &str {
        PROVIDER_ID
    }

    async fn geocode(&self, request: &GeocodeRequest) -> Result<Vec<GeocodeCandidate>, GeocodeError> {
        let url = format!("{}/v1/search", self.base_url);
        let size = self.size.to_string();

        let mut query = vec![("text", request.address.as_str()), ("size", size.as_str())];
        if let Some(region) = request.region.as_deref() {
            query.push(("boundary.country", region));
        }

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .timeout(request.timeout)
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GeocodeError::RateLimited);
        }
        if !status.is_success() {
            return Err(GeocodeError::Provider {
                status: status.to_string(),
                message: format!("Pelias search failed with HTTP {status}"),
            });
        }

        let text = resp.text().await?;
        let body: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| GeocodeError::Parse {
                message: format!("Pelias response is not JSON: {e}"),
            })?;
        parse_response(&body)
    }
}

fn parse_error(message: &str) -> GeocodeError {
    GeocodeError::Parse {
        message: format!("Pelias: {message}"),
    }
}

fn parse_response(body: &serde_json::Value) -> Result<Vec<GeocodeCandidate>, GeocodeError> {
    body.get("features")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| parse_error("no feature list in response"))?
        .iter()
        .map(parse_feature)
        .collect()
}

fn parse_feature(feature: &serde_json::Value) -> Result<GeocodeCandidate, GeocodeError> {
    // GeoJSON positions are [longitude, latitude].
    let position = feature
        .pointer("/geometry/coordinates")
        .and_then(serde_json::Value::as_array)
        .map(Vec::as_slice);
    let (longitude, latitude) = match position {
        Some([lon, lat, ..]) => match (lon.as_f64(), lat.as_f64()) {
            (Some(lon), Some(lat)) => (lon, lat),
            _ => return Err(parse_error("non-numeric position")),
        },
        Some(_) => return Err(parse_error("position needs two values")),
        None => return Err(parse_error("feature has no point geometry")),
    };

    let props = feature.get("properties");
    let prop = |name: &str| {
        props
            .and_then(|p| p.get(name))
            .and_then(serde_json::Value::as_str)
    };

    let formatted_address = prop("label")
        .ok_or_else(|| GeocodeError::Parse {
            message: "Pelias: feature has no label".to_string(),
        })?
        .to_string();

    let confidence = props
        .and_then(|p| p.get("confidence"))
        .and_then(serde_json::Value::as_f64);
    let approximate = confidence.is_none_or(|c| c < EXACT_CONFIDENCE);

    let mut components = Vec::new();
    if let Some(locality) = prop("locality") {
        components.push(AddressComponent::new(locality, locality, &[LOCALITY]));
    }
    if let Some(region) = prop("region") {
        let short = prop("region_a").unwrap_or(region);
        components.push(AddressComponent::new(region, short, &[ADMIN_AREA_LEVEL_1]));
    }
    if let Some(postal) = prop("postalcode") {
        components.push(AddressComponent::new(postal, postal, &[POSTAL_CODE]));
    }
    if let Some(country) = prop("country") {
        let short = prop("country_a").unwrap_or(country);
        components.push(AddressComponent::new(country, short, &[COUNTRY]));
    }

    Ok(GeocodeCandidate {
        formatted_address,
        coordinates: Coordinates {
            latitude,
            longitude,
        },
        approximate,
        components,
    })
}
