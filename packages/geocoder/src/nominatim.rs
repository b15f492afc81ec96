//! Client for the OpenStreetMap Nominatim search API.
//!
//! The public instance allows about one request per second, so use a small
//! batch size and a long batch delay with it. Results carry no exactness
//! signal: every candidate is approximate and ends up in the review queue.

use async_trait::async_trait;
use facility_import_models::Coordinates;

use crate::address::{ADMIN_AREA_LEVEL_1, COUNTRY, LOCALITY, POSTAL_CODE, subdivision_code};
use crate::{AddressComponent, GeocodeCandidate, GeocodeError, GeocodeRequest, Geocoder, json_f64};

/// Provider id used in the service registry.
pub const PROVIDER_ID: &str = "nominatim";

/// Address detail keys that name the locality, most specific last.
const LOCALITY_KEYS: &[&str] = &["city", "town", "village", "hamlet"];

/// Geocoder backed by a Nominatim instance.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
    limit: usize,
}

impl NominatimGeocoder {
    /// Creates a client returning at most `limit` candidates per query.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, limit: usize) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            limit: limit.max(1),
        }
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    fn name(&self) -> &str {
        PROVIDER_ID
    }

    async fn geocode(&self, request: &GeocodeRequest) -> Result<Vec<GeocodeCandidate>, GeocodeError> {
        let limit = self.limit.to_string();
        let mut query = vec![
            ("q", request.address.as_str()),
            ("format", "jsonv2"),
            ("addressdetails", "1"),
            ("limit", limit.as_str()),
        ];
        if let Some(region) = request.region.as_deref() {
            query.push(("countrycodes", region));
        }

        let resp = self
            .client
            .get(&self.base_url)
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
                message: format!("Nominatim search failed with HTTP {status}"),
            });
        }

        let text = resp.text().await?;
        let body: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| GeocodeError::Parse {
                message: format!("Nominatim response is not JSON: {e}"),
            })?;
        parse_response(&body)
    }
}

fn missing(field: &str) -> GeocodeError {
    GeocodeError::Parse {
        message: format!("Nominatim: result has no usable '{field}'"),
    }
}

fn parse_response(body: &serde_json::Value) -> Result<Vec<GeocodeCandidate>, GeocodeError> {
    match body {
        serde_json::Value::Array(results) => results.iter().map(parse_result).collect(),
        _ => Err(GeocodeError::Parse {
            message: "Nominatim: expected a list of results".to_string(),
        }),
    }
}

fn parse_result(result: &serde_json::Value) -> Result<GeocodeCandidate, GeocodeError> {
    // Coordinates arrive as decimal strings.
    let latitude = json_f64(result.get("lat")).ok_or_else(|| missing("lat"))?;
    let longitude = json_f64(result.get("lon")).ok_or_else(|| missing("lon"))?;
    let formatted_address = result
        .get("display_name")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| missing("display_name"))?
        .to_string();

    let details = result.get("address");
    let detail = |key: &str| {
        details
            .and_then(|d| d.get(key))
            .and_then(serde_json::Value::as_str)
    };

    let mut components = Vec::new();
    if let Some(locality) = LOCALITY_KEYS.iter().find_map(|k| detail(k)) {
        components.push(AddressComponent::new(locality, locality, &[LOCALITY]));
    }
    if let Some(state) = detail("state") {
        let short = detail("ISO3166-2-lvl4").map_or(state, subdivision_code);
        components.push(AddressComponent::new(state, short, &[ADMIN_AREA_LEVEL_1]));
    }
    if let Some(postcode) = detail("postcode") {
        components.push(AddressComponent::new(postcode, postcode, &[POSTAL_CODE]));
    }
    if let Some(country) = detail("country") {
        let short = detail("country_code").unwrap_or(country);
        components.push(AddressComponent::new(country, short, &[COUNTRY]));
    }

    Ok(GeocodeCandidate {
        formatted_address,
        coordinates: Coordinates {
            latitude,
            longitude,
        },
        approximate: true,
        components,
    })
}
