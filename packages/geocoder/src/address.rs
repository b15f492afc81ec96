//! Typed address components and free-text query cleanup.
//!
//! Every provider maps its own structured address fields onto
//! [`AddressComponent`]s tagged with Google-style type names, so the
//! pipeline can derive city and state the same way regardless of which
//! provider answered.

use std::sync::LazyLock;

use regex::Regex;

/// Component type for the city/town.
pub const LOCALITY: &str = "locality";

/// Component type for the state/province.
pub const ADMIN_AREA_LEVEL_1: &str = "administrative_area_level_1";

/// Component type for the postal code.
pub const POSTAL_CODE: &str = "postal_code";

/// Component type for the country.
pub const COUNTRY: &str = "country";

/// Runs of whitespace (including tabs and newlines from pasted cells).
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// One typed piece of a structured address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressComponent {
    /// Full form (e.g. `"California"`).
    pub long_name: String,
    /// Abbreviated form (e.g. `"CA"`).
    pub short_name: String,
    /// Type tags (e.g. `["administrative_area_level_1", "political"]`).
    pub types: Vec<String>,
}

impl AddressComponent {
    /// Creates a component with the given type tags.
    #[must_use]
    pub fn new(long_name: impl Into<String>, short_name: impl Into<String>, types: &[&str]) -> Self {
        Self {
            long_name: long_name.into(),
            short_name: short_name.into(),
            types: types.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    /// Returns `true` if this component carries the `kind` tag.
    #[must_use]
    pub fn has_type(&self, kind: &str) -> bool {
        self.types.iter().any(|t| t == kind)
    }
}

/// Returns the first component tagged with `kind`.
#[must_use]
pub fn find_component<'a>(
    components: &'a [AddressComponent],
    kind: &str,
) -> Option<&'a AddressComponent> {
    components.iter().find(|c| c.has_type(kind))
}

/// Collapses whitespace runs and trims, so a query sent to a provider
/// doesn't depend on how the upload was formatted.
#[must_use]
pub fn normalize_query(raw: &str) -> String {
    WHITESPACE_RE.replace_all(raw.trim(), " ").into_owned()
}

/// Extracts the subdivision code from an ISO 3166-2 code (`"US-CA"` ->
/// `"CA"`). Returns the input unchanged if it has no country prefix.
#[must_use]
pub fn subdivision_code(iso: &str) -> &str {
    iso.split_once('-').map_or(iso, |(_, code)| code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_whitespace() {
        assert_eq!(
            normalize_query("  1 Infinite Loop,\n\tCupertino,   CA "),
            "1 Infinite Loop, Cupertino, CA"
        );
    }

    #[test]
    fn finds_first_matching_component() {
        let components = vec![
            AddressComponent::new("95014", "95014", &[POSTAL_CODE]),
            AddressComponent::new("Cupertino", "Cupertino", &[LOCALITY, "political"]),
            AddressComponent::new("Sunnyvale", "Sunnyvale", &[LOCALITY]),
        ];
        let found = find_component(&components, LOCALITY).unwrap();
        assert_eq!(found.long_name, "Cupertino");
        assert!(find_component(&components, ADMIN_AREA_LEVEL_1).is_none());
    }

    #[test]
    fn extracts_subdivision_code() {
        assert_eq!(subdivision_code("US-CA"), "CA");
        assert_eq!(subdivision_code("CA"), "CA");
    }
}
