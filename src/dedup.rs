//! Exact-key deduplication of merged rows.

use crate::normalize::{normalize_doi, normalize_title};
use crate::record::FieldAccess;
use std::collections::HashSet;
use tracing::debug;

/// Keep the first row per normalized DOI and, among rows without a DOI, the
/// first row per normalized title. Rows with neither are all kept.
///
/// Survivors stay in input order, so a set without duplicates comes back
/// unchanged. Which of several duplicates survives depends only on input
/// order.
pub fn deduplicate<R: FieldAccess>(rows: Vec<R>, doi_field: &str, title_field: &str) -> Vec<R> {
    let before = rows.len();
    let mut seen_dois = HashSet::new();
    let mut seen_titles = HashSet::new();

    let kept: Vec<R> = rows
        .into_iter()
        .filter(|row| match row.text(doi_field).and_then(normalize_doi) {
            Some(doi) => seen_dois.insert(doi),
            None => match row.text(title_field).and_then(normalize_title) {
                Some(title) => seen_titles.insert(title),
                None => true,
            },
        })
        .collect();

    debug!(before = before, after = kept.len(), "Deduplicated rows");
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn row(id: &str, doi: Option<&str>, title: Option<&str>) -> Record {
        Record::new("merged", id).with("doi", doi).with("title", title)
    }

    fn ids(rows: &[Record]) -> Vec<&str> {
        rows.iter().map(|r| r.identifier.as_str()).collect()
    }

    #[test]
    fn test_same_doi_keeps_first() {
        let rows = vec![row("a", Some("10.1/x"), Some("One")), row("b", Some("10.1/X "), Some("Two"))];
        assert_eq!(ids(&deduplicate(rows, "doi", "title")), vec!["a"]);
    }

    #[test]
    fn test_title_dedup_only_without_doi() {
        let rows = vec![
            row("a", None, Some("A Paper")),
            row("b", None, Some(" a paper ")),
            row("c", Some("10.1/c"), Some("A Paper")),
            row("d", None, None),
            row("e", None, None),
        ];
        assert_eq!(ids(&deduplicate(rows, "doi", "title")), vec!["a", "c", "d", "e"]);
    }

    #[test]
    fn test_identity_without_duplicates() {
        let rows = vec![
            row("a", Some("10.1/a"), Some("Alpha")),
            row("b", None, Some("Beta")),
            row("c", Some("10.1/c"), None),
        ];
        let out = deduplicate(rows.clone(), "doi", "title");
        assert_eq!(out, rows);
    }
}
