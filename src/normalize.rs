//! Key normalization used for joins and deduplication.

use regex::Regex;
use std::sync::LazyLock;

static DOI_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:https?://)?(?:dx\.)?doi\.org/|doi:\s*)")
        .unwrap_or_else(|_| Regex::new("^$").expect("static regex"))
});

/// Canonical DOI: trimmed, lowercased, URI scheme / resolver prefix removed.
///
/// Returns `None` when nothing is left. Applying it to its own output
/// yields the same value.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let stripped = DOI_PREFIX.replace(&lowered, "");
    let doi = stripped.trim();
    if doi.is_empty() {
        None
    } else {
        Some(doi.to_string())
    }
}

/// Lowercased, trimmed title; `None` when blank.
pub fn normalize_title(raw: &str) -> Option<String> {
    let title = raw.trim().to_lowercase();
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

/// Lowercased name with inner whitespace collapsed.
pub fn normalize_name(raw: &str) -> Option<String> {
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_doi_variants() {
        assert_eq!(normalize_doi("10.1/ABC ").as_deref(), Some("10.1/abc"));
        assert_eq!(
            normalize_doi("https://doi.org/10.1/abc").as_deref(),
            Some("10.1/abc")
        );
        assert_eq!(
            normalize_doi("  HTTP://DX.DOI.ORG/10.5555/X.Y ").as_deref(),
            Some("10.5555/x.y")
        );
        assert_eq!(normalize_doi("doi:10.1/Q").as_deref(), Some("10.1/q"));
        assert_eq!(normalize_doi("   "), None);
        assert_eq!(normalize_doi("https://doi.org/"), None);
    }

    #[test]
    fn test_normalize_doi_idempotent() {
        for raw in ["10.1/ABC ", "https://doi.org/10.1/abc", "doi: 10.9/Z", "weird"] {
            let once = normalize_doi(raw);
            let twice = once.as_deref().and_then(normalize_doi);
            assert_eq!(once, twice, "input {raw:?}");
        }
    }

    #[test]
    fn test_normalize_title_and_name() {
        assert_eq!(normalize_title("  Deep Learning ").as_deref(), Some("deep learning"));
        assert_eq!(normalize_title(""), None);
        assert_eq!(normalize_name(" Jane   van  Doe ").as_deref(), Some("jane van doe"));
        assert_eq!(normalize_name("\t"), None);
    }
}
