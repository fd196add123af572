//! Three-pass record matching and column coalescing.
//!
//! Rows from a left set are matched against a right set by, in order:
//!
//! 1. equality on the normalized key field,
//! 2. fuzzy title search against a [`CandidateSource`],
//! 3. the manual [`CorrectionTable`].
//!
//! Each pass only sees rows the previous ones left unmatched. Every pass
//! produces a [`PassResult`]; the results are coalesced field by field in
//! pass order, the row's own values first. Right rows nobody matched are
//! appended with only their own provenance flag set.

use crate::config::Settings;
use crate::corrections::CorrectionTable;
use crate::matching::{self, Candidate, CandidateSource, FuzzyConfig, Lookup};
use crate::normalize::normalize_doi;
use crate::record::{FieldAccess, Fields, Record, Value};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPass {
    Deterministic,
    Fuzzy,
    Correction,
}

impl fmt::Display for MatchPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchPass::Deterministic => "deterministic",
            MatchPass::Fuzzy => "fuzzy",
            MatchPass::Correction => "correction",
        };
        f.write_str(s)
    }
}

/// One merged row: coalesced fields plus where they came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeRow {
    pub fields: Fields,
    /// Source label -> contributed to this row
    pub provenance: BTreeMap<String, bool>,
    /// Source label -> identifier of the contributing record
    pub identifiers: BTreeMap<String, String>,
    /// First pass that matched this row to another source
    pub matched_by: Option<MatchPass>,
    /// Right-side label -> pass that matched this row against it
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub passes: BTreeMap<String, MatchPass>,
}

impl MergeRow {
    pub fn from_record(label: &str, record: Record) -> Self {
        Self {
            fields: record.fields,
            provenance: BTreeMap::from([(label.to_string(), true)]),
            identifiers: BTreeMap::from([(label.to_string(), record.identifier)]),
            matched_by: None,
            passes: BTreeMap::new(),
        }
    }

    pub fn has_source(&self, label: &str) -> bool {
        self.provenance.get(label).copied().unwrap_or(false)
    }
}

impl FieldAccess for MergeRow {
    fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Records of one source, tagged with the label used in provenance flags.
#[derive(Debug, Clone)]
pub struct SourceSet {
    pub label: String,
    pub records: Vec<Record>,
}

impl SourceSet {
    pub fn new(label: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            label: label.into(),
            records,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub key_field: String,
    pub normalize_key: fn(&str) -> Option<String>,
    pub title_field: String,
    /// Appended as `title: subtitle` to the fuzzy search string
    pub subtitle_field: Option<String>,
    /// Field looked up in the correction table
    pub correction_field: String,
    pub fuzzy: FuzzyConfig,
    pub lookup_concurrency: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            key_field: "doi".to_string(),
            normalize_key: normalize_doi,
            title_field: "title".to_string(),
            subtitle_field: Some("subtitle".to_string()),
            correction_field: "title".to_string(),
            fuzzy: FuzzyConfig::default(),
            lookup_concurrency: 5,
        }
    }
}

impl MatchConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            fuzzy: FuzzyConfig {
                threshold: settings.fuzzy_threshold,
                trust_bonus: settings.trust_bonus,
            },
            lookup_concurrency: settings.max_concurrent_windows.max(1),
            ..Self::default()
        }
    }
}

/// What one pass contributed to a row.
#[derive(Debug, Clone, PartialEq)]
pub struct PassMatch {
    /// Right-side record consumed by this match, if any
    pub right_index: Option<usize>,
    pub identifier: Option<String>,
    /// Whether the fields came from the right source
    pub from_right: bool,
    pub fields: Fields,
}

/// Matches made by one pass, keyed by left row index.
#[derive(Debug, Clone, PartialEq)]
pub struct PassResult {
    pub pass: MatchPass,
    pub matches: BTreeMap<usize, PassMatch>,
}

impl PassResult {
    pub fn empty(pass: MatchPass) -> Self {
        Self {
            pass,
            matches: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchReport {
    pub left_label: String,
    pub right_label: String,
    pub deterministic: usize,
    pub fuzzy: usize,
    pub corrected: usize,
    pub unmatched_left: usize,
    pub unmatched_right: usize,
    pub lookups: usize,
    pub lookup_failures: usize,
}

impl fmt::Display for MatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} x {}: {} by key, {} fuzzy, {} corrected, {} unmatched left, {} unmatched right ({} lookups, {} failed)",
            self.left_label,
            self.right_label,
            self.deterministic,
            self.fuzzy,
            self.corrected,
            self.unmatched_left,
            self.unmatched_right,
            self.lookups,
            self.lookup_failures
        )
    }
}

/// First non-missing value per field across `layers`, in order. Keys whose
/// values are missing everywhere keep the first value seen.
pub fn coalesce_fields<'a>(layers: impl IntoIterator<Item = &'a Fields>) -> Fields {
    let mut out = Fields::new();
    for layer in layers {
        for (key, value) in layer {
            match out.get(key) {
                Some(existing) if !existing.is_missing() => {}
                Some(_) if value.is_missing() => {}
                _ => {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
    }
    out
}

pub struct MatchEngine {
    config: MatchConfig,
    corrections: CorrectionTable,
}

impl MatchEngine {
    pub fn new(config: MatchConfig, corrections: CorrectionTable) -> Self {
        Self { config, corrections }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Merge two sets. The fuzzy pass only runs when `source` is given.
    pub async fn merge(
        &self,
        left: SourceSet,
        right: SourceSet,
        source: Option<&dyn CandidateSource>,
    ) -> (Vec<MergeRow>, MatchReport) {
        let left_label = left.label.clone();
        let rows = left
            .records
            .into_iter()
            .map(|r| MergeRow::from_record(&left_label, r))
            .collect();
        let (rows, mut report) = self.merge_rows(rows, right, source).await;
        report.left_label = left_label;
        (rows, report)
    }

    /// Fold `rest` into `first` one set at a time, each with its own
    /// optional candidate source.
    pub async fn merge_many(
        &self,
        first: SourceSet,
        rest: Vec<(SourceSet, Option<&dyn CandidateSource>)>,
    ) -> (Vec<MergeRow>, Vec<MatchReport>) {
        let first_label = first.label.clone();
        let mut rows: Vec<MergeRow> = first
            .records
            .into_iter()
            .map(|r| MergeRow::from_record(&first_label, r))
            .collect();
        let mut reports = Vec::with_capacity(rest.len());
        let mut merged_labels = vec![first_label];

        for (set, source) in rest {
            let label = set.label.clone();
            let (next, mut report) = self.merge_rows(rows, set, source).await;
            report.left_label = merged_labels.join("+");
            merged_labels.push(label);
            rows = next;
            reports.push(report);
        }
        (rows, reports)
    }

    /// Match already-merged rows against one more set.
    pub async fn merge_rows(
        &self,
        mut rows: Vec<MergeRow>,
        right: SourceSet,
        source: Option<&dyn CandidateSource>,
    ) -> (Vec<MergeRow>, MatchReport) {
        let mut report = MatchReport {
            right_label: right.label.clone(),
            ..MatchReport::default()
        };
        let labels: BTreeSet<String> = rows
            .iter()
            .flat_map(|r| r.provenance.keys().cloned())
            .collect();

        let index = self.key_index(&right.records);
        let mut used = vec![false; right.records.len()];
        let mut matched = vec![false; rows.len()];

        carry_previous(&rows, &right, &mut used, &mut matched, &mut report);

        let deterministic = self.deterministic_pass(&rows, &matched, &right.records, &index, &mut used);
        mark(&mut matched, &deterministic);
        report.deterministic += deterministic.matches.len();

        let fuzzy = match source {
            Some(source) => {
                self.fuzzy_pass(&rows, &matched, source, &index, &mut used, &mut report)
                    .await
            }
            None => PassResult::empty(MatchPass::Fuzzy),
        };
        mark(&mut matched, &fuzzy);
        report.fuzzy += fuzzy.matches.len();

        let corrected = self.correction_pass(&rows, &matched, &right.records, &index, &mut used);
        mark(&mut matched, &corrected);
        report.corrected += corrected.matches.len();

        let passes = [deterministic, fuzzy, corrected];
        for (idx, row) in rows.iter_mut().enumerate() {
            apply_passes(idx, row, &right.label, &passes);
        }
        report.unmatched_left = matched.iter().filter(|m| !**m).count();

        for (record, _) in right
            .records
            .into_iter()
            .zip(used)
            .filter(|(_, used)| !used)
        {
            let mut row = MergeRow::from_record(&right.label, record);
            for label in &labels {
                row.provenance.entry(label.clone()).or_insert(false);
            }
            rows.push(row);
            report.unmatched_right += 1;
        }

        info!(
            right = %report.right_label,
            deterministic = report.deterministic,
            fuzzy = report.fuzzy,
            corrected = report.corrected,
            unmatched_left = report.unmatched_left,
            unmatched_right = report.unmatched_right,
            "Merge complete"
        );
        (rows, report)
    }

    fn normalized_key<R: FieldAccess>(&self, row: &R) -> Option<String> {
        row.text(&self.config.key_field)
            .and_then(self.config.normalize_key)
    }

    /// Normalized key -> first right row carrying it.
    fn key_index(&self, right: &[Record]) -> HashMap<String, usize> {
        let mut index = HashMap::new();
        for (i, record) in right.iter().enumerate() {
            if let Some(key) = self.normalized_key(record) {
                index.entry(key).or_insert(i);
            }
        }
        index
    }

    fn deterministic_pass(
        &self,
        rows: &[MergeRow],
        matched: &[bool],
        right: &[Record],
        index: &HashMap<String, usize>,
        used: &mut [bool],
    ) -> PassResult {
        let mut result = PassResult::empty(MatchPass::Deterministic);
        for (idx, row) in rows.iter().enumerate() {
            if matched[idx] {
                continue;
            }
            let Some(&ri) = self.normalized_key(row).and_then(|k| index.get(&k)) else {
                continue;
            };
            used[ri] = true;
            result.matches.insert(
                idx,
                PassMatch {
                    right_index: Some(ri),
                    identifier: Some(right[ri].identifier.clone()),
                    from_right: true,
                    fields: right[ri].fields.clone(),
                },
            );
        }
        result
    }

    async fn fuzzy_pass(
        &self,
        rows: &[MergeRow],
        matched: &[bool],
        source: &dyn CandidateSource,
        index: &HashMap<String, usize>,
        used: &mut [bool],
        report: &mut MatchReport,
    ) -> PassResult {
        let mut result = PassResult::empty(MatchPass::Fuzzy);

        let mut pending: Vec<(usize, String, String)> = Vec::new();
        for (idx, row) in rows.iter().enumerate() {
            if matched[idx] {
                continue;
            }
            let Some(title) = row.text(&self.config.title_field) else {
                continue;
            };
            let subtitle = self
                .config
                .subtitle_field
                .as_deref()
                .and_then(|f| row.text(f));
            let query = match subtitle {
                Some(sub) => format!("{title}: {sub}"),
                None => title.to_string(),
            };
            pending.push((idx, title.to_string(), query));
        }
        if pending.is_empty() {
            return result;
        }

        let mut seen = HashSet::new();
        let queries: Vec<String> = pending
            .iter()
            .filter(|(_, _, q)| seen.insert(q.clone()))
            .map(|(_, _, q)| q.clone())
            .collect();

        debug!(rows = pending.len(), queries = queries.len(), "Fuzzy lookups");

        let lookups: HashMap<String, Lookup<Vec<Candidate>>> = stream::iter(queries)
            .map(|query| async move {
                let found = source.lookup(&query).await;
                (query, found)
            })
            .buffer_unordered(self.config.lookup_concurrency.max(1))
            .collect()
            .await;

        report.lookups = lookups.len();
        for (query, outcome) in &lookups {
            if let Lookup::Error(e) = outcome {
                warn!(query = %query, error = %e, "Candidate lookup failed, treating as no candidates");
                report.lookup_failures += 1;
            }
        }

        for (idx, title, query) in pending {
            let candidates = lookups
                .get(&query)
                .cloned()
                .map(Lookup::into_candidates)
                .unwrap_or_default();
            let left_key = rows[idx]
                .text(&self.config.key_field)
                .unwrap_or(title.as_str())
                .to_string();

            let Some(best) = matching::select_best(&left_key, &title, candidates, &self.config.fuzzy) else {
                continue;
            };
            debug!(
                title = %title,
                candidate = %best.candidate.title,
                score = best.score,
                accepted = best.accepted,
                "Best fuzzy candidate"
            );
            if !best.accepted {
                continue;
            }

            let record = best.candidate.record;
            let right_index = self
                .normalized_key(&record)
                .and_then(|k| index.get(&k).copied());
            if let Some(ri) = right_index {
                used[ri] = true;
            }
            result.matches.insert(
                idx,
                PassMatch {
                    right_index,
                    identifier: Some(record.identifier),
                    from_right: true,
                    fields: record.fields,
                },
            );
        }
        result
    }

    fn correction_pass(
        &self,
        rows: &[MergeRow],
        matched: &[bool],
        right: &[Record],
        index: &HashMap<String, usize>,
        used: &mut [bool],
    ) -> PassResult {
        let mut result = PassResult::empty(MatchPass::Correction);
        if self.corrections.is_empty() {
            return result;
        }

        for (idx, row) in rows.iter().enumerate() {
            if matched[idx] {
                continue;
            }
            let Some(correction) = row
                .text(&self.config.correction_field)
                .and_then(|name| self.corrections.lookup(name))
            else {
                continue;
            };

            let right_index = correction
                .get(&self.config.key_field)
                .and_then(Value::as_str)
                .and_then(self.config.normalize_key)
                .and_then(|k| index.get(&k).copied());

            let pass_match = match right_index {
                Some(ri) => {
                    used[ri] = true;
                    PassMatch {
                        right_index,
                        identifier: Some(right[ri].identifier.clone()),
                        from_right: true,
                        fields: coalesce_fields([correction, &right[ri].fields]),
                    }
                }
                None => PassMatch {
                    right_index: None,
                    identifier: None,
                    from_right: false,
                    fields: correction.clone(),
                },
            };
            debug!(row = idx, joined = pass_match.from_right, "Applied manual correction");
            result.matches.insert(idx, pass_match);
        }
        result
    }
}

/// Rows already merged against `right`'s label keep that result. They sit
/// out every pass, the right rows they hold are not appended again, and
/// they count in the report under the pass recorded for them.
fn carry_previous(
    rows: &[MergeRow],
    right: &SourceSet,
    used: &mut [bool],
    matched: &mut [bool],
    report: &mut MatchReport,
) {
    let mut by_id: HashMap<&str, usize> = HashMap::new();
    for (i, record) in right.records.iter().enumerate() {
        by_id.entry(record.identifier.as_str()).or_insert(i);
    }

    for (idx, row) in rows.iter().enumerate() {
        let pass = row.passes.get(&right.label).copied();
        if pass.is_none() && !row.has_source(&right.label) {
            continue;
        }
        matched[idx] = true;
        if let Some(&ri) = row
            .identifiers
            .get(&right.label)
            .and_then(|id| by_id.get(id.as_str()))
        {
            used[ri] = true;
        }
        match pass {
            Some(MatchPass::Deterministic) => report.deterministic += 1,
            Some(MatchPass::Fuzzy) => report.fuzzy += 1,
            Some(MatchPass::Correction) => report.corrected += 1,
            None => report.unmatched_right += 1,
        }
    }
}

fn mark(matched: &mut [bool], pass: &PassResult) {
    for &idx in pass.matches.keys() {
        if let Some(m) = matched.get_mut(idx) {
            *m = true;
        }
    }
}

fn apply_passes(idx: usize, row: &mut MergeRow, right_label: &str, passes: &[PassResult]) {
    let hits: Vec<(MatchPass, &PassMatch)> = passes
        .iter()
        .filter_map(|p| p.matches.get(&idx).map(|m| (p.pass, m)))
        .collect();

    let merged = coalesce_fields(std::iter::once(&row.fields).chain(hits.iter().map(|(_, m)| &m.fields)));
    row.fields = merged;

    let from_right = hits.iter().any(|(_, m)| m.from_right);
    *row.provenance.entry(right_label.to_string()).or_insert(false) |= from_right;
    if let Some(id) = hits.iter().find_map(|(_, m)| m.identifier.clone()) {
        row.identifiers.insert(right_label.to_string(), id);
    }
    if let Some((pass, _)) = hits.first() {
        row.passes.entry(right_label.to_string()).or_insert(*pass);
        row.matched_by = row.matched_by.or(Some(*pass));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrections::Correction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSource {
        responses: HashMap<String, Lookup<Vec<Candidate>>>,
        calls: AtomicUsize,
    }

    impl StaticSource {
        fn new(responses: Vec<(&str, Lookup<Vec<Candidate>>)>) -> Self {
            Self {
                responses: responses
                    .into_iter()
                    .map(|(q, l)| (q.to_string(), l))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CandidateSource for StaticSource {
        async fn lookup(&self, query: &str) -> Lookup<Vec<Candidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(query)
                .cloned()
                .unwrap_or(Lookup::NotFound)
        }
    }

    fn pure(id: &str, title: &str, doi: Option<&str>) -> Record {
        Record::new("publications", id)
            .with("title", title)
            .with("doi", doi)
    }

    fn work(id: &str, title: &str, doi: &str) -> Record {
        Record::new("openalex", id)
            .with("display_name", title)
            .with("doi", doi)
            .with("cited_by_count", 3i64)
    }

    fn candidate(record: Record, trusted: bool) -> Candidate {
        Candidate {
            title: record.text("display_name").unwrap_or_default().to_string(),
            trusted,
            record,
        }
    }

    fn engine(corrections: Vec<Correction>) -> MatchEngine {
        let config = MatchConfig {
            fuzzy: FuzzyConfig {
                threshold: 0.8,
                trust_bonus: 0.05,
            },
            ..MatchConfig::default()
        };
        MatchEngine::new(config, CorrectionTable::new(corrections))
    }

    #[tokio::test]
    async fn test_key_match_skips_fuzzy_lookup() {
        let source = StaticSource::new(vec![]);
        let left = SourceSet::new("pure", vec![pure("p1", "Some Paper", Some("10.1/ABC "))]);
        let right = SourceSet::new("openalex", vec![work("W1", "Some Paper", "https://doi.org/10.1/abc")]);

        let (rows, report) = engine(vec![]).merge(left, right, Some(&source)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(rows.len(), 1);
        assert_eq!(report.deterministic, 1);
        assert_eq!(report.unmatched_right, 0);
        let row = &rows[0];
        assert_eq!(row.matched_by, Some(MatchPass::Deterministic));
        assert!(row.has_source("pure") && row.has_source("openalex"));
        assert_eq!(row.identifiers.get("openalex").map(String::as_str), Some("W1"));
        assert_eq!(row.text("doi"), Some("10.1/ABC"));
        assert_eq!(row.field("cited_by_count"), Some(&Value::Int(3)));
    }

    #[tokio::test]
    async fn test_fuzzy_fallback_and_unmatched_rows() {
        let matched_work = work("W2", "Deep Learning for X", "10.2/dl");
        let source = StaticSource::new(vec![
            (
                "Deep Learning for X",
                Lookup::Found(vec![candidate(matched_work.clone(), false)]),
            ),
            ("Totally Different", Lookup::Error("HTTP 500".into())),
        ]);
        let left = SourceSet::new(
            "pure",
            vec![
                pure("p1", "Deep Learning for X", None),
                pure("p2", "Totally Different", None),
            ],
        );
        let right = SourceSet::new(
            "openalex",
            vec![matched_work, work("W9", "Unrelated", "10.9/zz")],
        );

        let (rows, report) = engine(vec![]).merge(left, right, Some(&source)).await;

        assert_eq!(report.fuzzy, 1);
        assert_eq!(report.lookups, 2);
        assert_eq!(report.lookup_failures, 1);
        assert_eq!(report.unmatched_left, 1);
        assert_eq!(report.unmatched_right, 1);
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].matched_by, Some(MatchPass::Fuzzy));
        assert_eq!(rows[0].text("doi"), Some("10.2/dl"));
        assert!(!rows[1].has_source("openalex"));
        assert_eq!(rows[1].matched_by, None);

        let extra = &rows[2];
        assert!(extra.has_source("openalex"));
        assert_eq!(extra.provenance.get("pure"), Some(&false));
        assert_eq!(extra.identifiers.get("openalex").map(String::as_str), Some("W9"));
    }

    #[tokio::test]
    async fn test_subtitle_extends_query_and_duplicates_query_once() {
        let w = work("W3", "Tides", "10.3/t");
        let source = StaticSource::new(vec![(
            "Tides: A Survey",
            Lookup::Found(vec![candidate(w, false)]),
        )]);
        let left = SourceSet::new(
            "pure",
            vec![
                pure("p1", "Tides", None).with("subtitle", "A Survey"),
                pure("p2", "Tides", None).with("subtitle", "A Survey"),
            ],
        );
        let (rows, report) = engine(vec![])
            .merge(left, SourceSet::new("openalex", vec![]), Some(&source))
            .await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.fuzzy, 2);
        assert!(rows.iter().all(|r| r.text("doi") == Some("10.3/t")));
    }

    #[tokio::test]
    async fn test_correction_fills_remaining_rows_only() {
        let corrections = vec![
            Correction {
                name: "Hand Fixed Paper".into(),
                fields: Fields::from([("doi".to_string(), Value::from("10.4/fixed"))]),
            },
            Correction {
                name: "Already Matched".into(),
                fields: Fields::from([("doi".to_string(), Value::from("10.4/wrong"))]),
            },
        ];
        let left = SourceSet::new(
            "pure",
            vec![
                pure("p1", "hand  fixed paper", None),
                pure("p2", "Already Matched", Some("10.5/right")),
            ],
        );
        let right = SourceSet::new(
            "openalex",
            vec![work("W4", "Hand-fixed paper", "10.4/fixed"), work("W5", "Already Matched", "10.5/right")],
        );

        let (rows, report) = engine(corrections).merge(left, right, None).await;

        assert_eq!(report.deterministic, 1);
        assert_eq!(report.corrected, 1);
        assert_eq!(report.unmatched_right, 0);
        assert_eq!(rows[0].matched_by, Some(MatchPass::Correction));
        assert_eq!(rows[0].text("doi"), Some("10.4/fixed"));
        assert_eq!(rows[0].identifiers.get("openalex").map(String::as_str), Some("W4"));
        assert_eq!(rows[1].matched_by, Some(MatchPass::Deterministic));
        assert_eq!(rows[1].text("doi"), Some("10.5/right"));
    }

    #[test]
    fn test_coalesce_prefers_earlier_layers() {
        let base = Fields::from([
            ("title".to_string(), Value::from("Left")),
            ("doi".to_string(), Value::Null),
            ("year".to_string(), Value::from("")),
        ]);
        let pass1 = Fields::from([
            ("title".to_string(), Value::from("Right")),
            ("doi".to_string(), Value::from("10.1/x")),
        ]);
        let pass2 = Fields::from([("year".to_string(), Value::Int(2020))]);

        let merged = coalesce_fields([&base, &pass1, &pass2]);
        assert_eq!(merged.get("title"), Some(&Value::from("Left")));
        assert_eq!(merged.get("doi"), Some(&Value::from("10.1/x")));
        assert_eq!(merged.get("year"), Some(&Value::Int(2020)));

        assert_eq!(coalesce_fields([&merged]), merged);
        assert_eq!(coalesce_fields([&merged, &merged]), merged);
    }

    #[tokio::test]
    async fn test_remerge_of_merged_rows_is_noop() {
        let left = SourceSet::new("pure", vec![pure("p1", "Paper", Some("10.1/a"))]);
        let right = SourceSet::new("openalex", vec![work("W1", "Paper", "10.1/a")]);
        let engine = engine(vec![]);
        let (rows, _) = engine.merge(left, right, None).await;

        let (again, report) = engine
            .merge_rows(rows.clone(), SourceSet::new("openalex", vec![]), None)
            .await;
        assert_eq!(again.len(), rows.len());
        assert_eq!(again[0].fields, rows[0].fields);
        assert_eq!(again[0].matched_by, rows[0].matched_by);
        assert_eq!(report.unmatched_right, 0);
    }

    #[tokio::test]
    async fn test_rerun_against_same_right_set_is_noop() {
        let source = StaticSource::new(vec![(
            "Deep Learning for X",
            Lookup::Found(vec![candidate(work("W3", "Deep Learning for X", "10.9/z"), false)]),
        )]);
        let right = SourceSet::new(
            "openalex",
            vec![work("W1", "Paper", "10.1/a"), work("W2", "Other", "10.2/b")],
        );
        let rows: Vec<MergeRow> = vec![
            pure("p1", "Paper", Some("10.1/a")),
            pure("p2", "Deep Learning for X", None),
        ]
        .into_iter()
        .map(|r| MergeRow::from_record("pure", r))
        .collect();
        let engine = engine(vec![]);

        let (first, first_report) = engine.merge_rows(rows, right.clone(), Some(&source)).await;
        let calls = source.calls.load(Ordering::SeqCst);
        assert_eq!(first_report.deterministic, 1);
        assert_eq!(first_report.fuzzy, 1);
        assert_eq!(first_report.unmatched_right, 1);

        let (second, second_report) = engine
            .merge_rows(first.clone(), right, Some(&source))
            .await;

        assert_eq!(second, first);
        assert_eq!(
            MatchReport {
                lookups: first_report.lookups,
                ..second_report
            },
            first_report
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
        let passes: Vec<_> = second.iter().map(|r| r.matched_by).collect();
        assert_eq!(
            passes,
            vec![Some(MatchPass::Deterministic), Some(MatchPass::Fuzzy), None]
        );
    }

    #[tokio::test]
    async fn test_merge_many_folds_sets() {
        let (rows, reports) = engine(vec![])
            .merge_many(
                SourceSet::new("pure", vec![pure("p1", "Paper", Some("10.1/a"))]),
                vec![
                    (SourceSet::new("openalex", vec![work("W1", "Paper", "10.1/a")]), None),
                    (
                        SourceSet::new(
                            "oils",
                            vec![Record::new("oils", "o1").with("doi", "https://doi.org/10.1/A")],
                        ),
                        None,
                    ),
                ],
            )
            .await;
        assert_eq!(rows.len(), 1);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].left_label, "pure+openalex");
        let row = &rows[0];
        assert!(row.has_source("pure") && row.has_source("openalex") && row.has_source("oils"));
    }
}
