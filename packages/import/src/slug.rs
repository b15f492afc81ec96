//! URL slugs for imported facilities.

use std::sync::LazyLock;

use regex::Regex;

static NON_ALPHANUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

/// Builds a slug from `parts`: lowercase ASCII alphanumerics joined by
/// single hyphens, with no leading or trailing hyphen.
///
/// Empty parts are skipped. Returns an empty string if nothing usable is
/// left.
#[must_use]
pub fn slugify<S: AsRef<str>>(parts: &[S]) -> String {
    let joined = parts
        .iter()
        .map(AsRef::as_ref)
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    NON_ALPHANUMERIC_RE
        .replace_all(&joined, "-")
        .trim_matches('-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_name_and_address() {
        assert_eq!(
            slugify(&["Apple Park Clinic", "1 Infinite Loop, Cupertino, CA 95014, USA"]),
            "apple-park-clinic-1-infinite-loop-cupertino-ca-95014-usa"
        );
    }

    #[test]
    fn collapses_punctuation_runs() {
        assert_eq!(slugify(&["  St. Mary's -- Urgent Care!  "]), "st-mary-s-urgent-care");
    }

    #[test]
    fn skips_empty_parts() {
        assert_eq!(slugify(&["Clinic", "", "  "]), "clinic");
    }

    #[test]
    fn nothing_usable_is_empty() {
        assert_eq!(slugify(&["!!!"]), "");
        assert_eq!(slugify::<&str>(&[]), "");
    }
}
