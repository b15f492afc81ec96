//! Google Geocoding API client.
//!
//! Requires an API key. The response carries a top-level `status`; a
//! `ZERO_RESULTS` status is a successful "not found", while
//! `REQUEST_DENIED`, `INVALID_REQUEST` and `OVER_QUERY_LIMIT` are errors.
//! Each result's `partial_match` flag marks an approximate match.
//!
//! See <https://developers.google.com/maps/documentation/geocoding/requests-geocoding>

use async_trait::async_trait;
use facility_import_models::Coordinates;

use crate::{AddressComponent, GeocodeCandidate, GeocodeError, GeocodeRequest, Geocoder, json_f64};

/// Provider id used in the service registry and error messages.
pub const PROVIDER_ID: &str = "google";

/// Geocoder backed by the Google Geocoding API.
#[derive(Debug, Clone)]
pub struct GoogleGeocoder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GoogleGeocoder {
    /// Creates a client. A missing or empty `api_key` is reported by
    /// [`Geocoder::check_ready`], not here.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn api_key(&self) -> Result<&str, GeocodeError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| GeocodeError::MissingCredentials {
                provider: PROVIDER_ID.to_string(),
            })
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    fn name(&self) -> &str {
        PROVIDER_ID
    }

    fn check_ready(&self) -> Result<(), GeocodeError> {
        self.api_key().map(|_| ())
    }

    async fn geocode(&self, request: &GeocodeRequest) -> Result<Vec<GeocodeCandidate>, GeocodeError> {
        let key = self.api_key()?;

        let mut query = vec![("address", request.address.as_str()), ("key", key)];
        if let Some(region) = request.region.as_deref() {
            query.push(("region", region));
        }

        let resp = self
            .client
            .get(&self.base_url)
            .query(&query)
            .timeout(request.timeout)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GeocodeError::RateLimited);
        }

        if !resp.status().is_success() {
            return Err(GeocodeError::Provider {
                status: resp.status().to_string(),
                message: "unexpected HTTP status from Google geocoder".to_string(),
            });
        }

        let text = resp.text().await?;
        let body: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| GeocodeError::Parse {
                message: format!("Google response is not JSON: {e}"),
            })?;

        parse_response(&body)
    }
}

/// Parses a Google Geocoding JSON response into ordered candidates.
fn parse_response(body: &serde_json::Value) -> Result<Vec<GeocodeCandidate>, GeocodeError> {
    let status = body
        .get("status")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| GeocodeError::Parse {
            message: "Google response missing 'status'".to_string(),
        })?;

    let error_message = || {
        body.get("error_message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(status)
            .to_string()
    };

    match status {
        "OK" => {}
        "ZERO_RESULTS" => return Ok(Vec::new()),
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => return Err(GeocodeError::RateLimited),
        "REQUEST_DENIED" | "INVALID_REQUEST" => {
            return Err(GeocodeError::RequestDenied {
                message: error_message(),
            });
        }
        other => {
            return Err(GeocodeError::Provider {
                status: other.to_string(),
                message: error_message(),
            });
        }
    }

    let results = body
        .get("results")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| GeocodeError::Parse {
            message: "Google response missing 'results' array".to_string(),
        })?;

    results.iter().map(parse_result).collect()
}

fn parse_result(result: &serde_json::Value) -> Result<GeocodeCandidate, GeocodeError> {
    let formatted_address = result
        .get("formatted_address")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| GeocodeError::Parse {
            message: "result missing formatted_address".to_string(),
        })?
        .to_string();

    let latitude =
        json_f64(result.pointer("/geometry/location/lat")).ok_or_else(|| GeocodeError::Parse {
            message: "result missing geometry.location.lat".to_string(),
        })?;
    let longitude =
        json_f64(result.pointer("/geometry/location/lng")).ok_or_else(|| GeocodeError::Parse {
            message: "result missing geometry.location.lng".to_string(),
        })?;

    let approximate = result
        .get("partial_match")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let components = result
        .get("address_components")
        .and_then(serde_json::Value::as_array)
        .map(|items| items.iter().filter_map(parse_component).collect())
        .unwrap_or_default();

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

fn parse_component(value: &serde_json::Value) -> Option<AddressComponent> {
    let long_name = value.get("long_name")?.as_str()?.to_string();
    let short_name = value
        .get("short_name")
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| long_name.clone(), String::from);
    let types = value
        .get("types")
        .and_then(serde_json::Value::as_array)
        .map(|types| {
            types
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Some(AddressComponent {
        long_name,
        short_name,
        types,
    })
}
