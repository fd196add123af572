//! OpenAlex API Client
//!
//! Looks up works by DOI / OpenAlex id in batches, and by title through the
//! autocomplete endpoint followed by per-work detail fetches. Works are
//! flattened into [`Record`]s so they can be merged with harvested rows.
//!
//! API notes (per OpenAlex docs):
//! - `mailto` puts requests in the polite pool
//! - `filter=doi:a|b|c` accepts at most 50 values per request
//! - abstracts come as an inverted index and are rebuilt here

use crate::cache::CacheLayer;
use crate::client::{RequestOptions, RetryingClient};
use crate::config::Settings;
use crate::error::Result;
use crate::matching::{Candidate, CandidateSource, Lookup};
use crate::normalize::normalize_doi;
use crate::progress::PositionAllocator;
use crate::record::{FieldAccess, Record, Value};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Maximum ids per `filter` value
pub const MAX_IDS_PER_REQUEST: usize = 50;

/// Source label used on flattened works
pub const SOURCE_LABEL: &str = "openalex";

const OPENALEX_ID_PREFIX: &str = "https://openalex.org/";

/// Which filter the ids belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Doi,
    OpenAlex,
}

impl IdType {
    fn filter_key(self) -> &'static str {
        match self {
            IdType::Doi => "doi",
            IdType::OpenAlex => "openalex",
        }
    }

    /// Bare id as the filter expects it, or `None` for blanks.
    pub fn clean(self, raw: &str) -> Option<String> {
        match self {
            IdType::Doi => normalize_doi(raw),
            IdType::OpenAlex => {
                let id = raw.trim();
                let id = id.strip_prefix(OPENALEX_ID_PREFIX).unwrap_or(id);
                Some(id.to_string()).filter(|s| !s.is_empty())
            }
        }
    }
}

/// Works fetched by id plus how many batches could not be fetched.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub records: Vec<Record>,
    pub requested: usize,
    pub failed_batches: usize,
}

/// OpenAlex API response structures
#[derive(Debug, Deserialize)]
struct WorksResponse {
    #[serde(default)]
    results: Vec<Work>,
}

#[derive(Debug, Deserialize)]
struct AutocompleteResponse {
    #[serde(default)]
    results: Vec<AutocompleteHit>,
}

#[derive(Debug, Deserialize)]
struct AutocompleteHit {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Work {
    id: Option<String>,
    display_name: Option<String>,
    title: Option<String>,
    doi: Option<String>,
    publication_year: Option<i64>,
    publication_date: Option<String>,
    #[serde(rename = "type")]
    work_type: Option<String>,
    language: Option<String>,
    cited_by_count: Option<i64>,
    #[serde(rename = "abstract_inverted_index")]
    abstract_index: Option<serde_json::Value>,
    open_access: Option<OpenAccess>,
    primary_location: Option<Location>,
    best_oa_location: Option<Location>,
    #[serde(default)]
    locations: Vec<Location>,
    primary_topic: Option<Topic>,
    apc_list: Option<Apc>,
    apc_paid: Option<Apc>,
    #[serde(default)]
    corresponding_institution_ids: Vec<String>,
    #[serde(default)]
    authorships: Vec<Authorship>,
}

#[derive(Debug, Deserialize)]
struct OpenAccess {
    is_oa: Option<bool>,
    oa_status: Option<String>,
    oa_url: Option<String>,
    any_repository_has_fulltext: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct Location {
    source: Option<Source>,
    landing_page_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Source {
    display_name: Option<String>,
    host_organization_name: Option<String>,
    #[serde(rename = "type")]
    source_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Named {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Topic {
    display_name: Option<String>,
    subfield: Option<Named>,
    field: Option<Named>,
    domain: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct Apc {
    value_usd: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Authorship {
    author: Option<Named>,
    #[serde(default)]
    is_corresponding: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct OpenAlexClient {
    client: RetryingClient,
    base_url: String,
    mailto: Option<String>,
    institution_id: String,
    positions: PositionAllocator,
    cache: Option<CacheLayer>,
    detail_concurrency: usize,
}

impl OpenAlexClient {
    pub fn new(client: RetryingClient, settings: &Settings, positions: PositionAllocator) -> Self {
        Self {
            client,
            base_url: settings.openalex_base_url.trim_end_matches('/').to_string(),
            mailto: settings.openalex_mailto.clone(),
            institution_id: settings.institution_id.clone(),
            positions,
            cache: None,
            detail_concurrency: 5,
        }
    }

    /// Cache title lookups through `cache`.
    pub fn with_cache(mut self, cache: CacheLayer) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_detail_concurrency(mut self, n: usize) -> Self {
        self.detail_concurrency = n.max(1);
        self
    }

    fn options(&self) -> RequestOptions {
        match &self.mailto {
            Some(mail) => RequestOptions::new().query("mailto", mail.as_str()),
            None => RequestOptions::new(),
        }
    }

    /// Fetch works for `ids` in batches of at most 50.
    ///
    /// A batch that fails after retries is logged and skipped; the other
    /// batches still contribute.
    pub async fn get_works_by_ids(&self, ids: &[String], id_type: IdType) -> BatchOutcome {
        let lane = self.positions.next();
        let cleaned: Vec<String> = ids.iter().filter_map(|id| id_type.clean(id)).collect();
        let batches: Vec<Vec<String>> = cleaned
            .chunks(MAX_IDS_PER_REQUEST)
            .map(<[String]>::to_vec)
            .collect();

        info!(
            lane = lane,
            ids = cleaned.len(),
            batches = batches.len(),
            id_type = id_type.filter_key(),
            "Fetching OpenAlex works by id"
        );

        let url = format!("{}/works", self.base_url);
        let results: Vec<Result<Vec<Work>>> = stream::iter(batches)
            .map(|batch| {
                let opts = self
                    .options()
                    .query("filter", format!("{}:{}", id_type.filter_key(), batch.join("|")))
                    .query("per-page", MAX_IDS_PER_REQUEST.to_string());
                let url = url.as_str();
                async move {
                    self.client
                        .get_json::<WorksResponse>(url, &opts)
                        .await
                        .map(|r| r.results)
                }
            })
            .buffered(self.detail_concurrency)
            .collect()
            .await;

        let mut outcome = BatchOutcome {
            requested: cleaned.len(),
            ..BatchOutcome::default()
        };
        for (n, result) in results.into_iter().enumerate() {
            match result {
                Ok(works) => outcome
                    .records
                    .extend(works.into_iter().map(|w| self.work_to_record(w))),
                Err(e) => {
                    warn!(lane = lane, batch = n, error = %e, "OpenAlex batch failed, skipping");
                    outcome.failed_batches += 1;
                }
            }
        }

        info!(
            lane = lane,
            works = outcome.records.len(),
            failed_batches = outcome.failed_batches,
            "OpenAlex id lookup complete"
        );
        outcome
    }

    /// Works whose title resembles `title`, in autocomplete order.
    ///
    /// Detail fetches that fail are skipped. With caching enabled the
    /// result is cached under `openalex_title_{title}`, hashed into a
    /// file stem by the cache.
    pub async fn get_works_by_title(&self, title: &str) -> Result<Vec<Record>> {
        let cache_name = format!("openalex_title_{title}");
        match &self.cache {
            Some(cache) => {
                cache
                    .read_through(&cache_name, || self.fetch_works_by_title(title))
                    .await
            }
            None => self.fetch_works_by_title(title).await,
        }
    }

    async fn fetch_works_by_title(&self, title: &str) -> Result<Vec<Record>> {
        let url = format!("{}/autocomplete/works", self.base_url);
        let opts = self.options().query("q", title);
        let hits: AutocompleteResponse = self.client.get_json(&url, &opts).await?;

        let ids: Vec<String> = hits
            .results
            .into_iter()
            .filter_map(|h| h.id)
            .filter_map(|id| IdType::OpenAlex.clean(&id))
            .collect();
        debug!(title = title, hits = ids.len(), "Autocomplete results");

        // `buffered` keeps autocomplete order, which decides fuzzy ties.
        let details: Vec<Option<Record>> = stream::iter(ids)
            .map(|id| async move {
                match self.get_work(&id).await {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(id = %id, error = %e, "Work detail fetch failed, skipping");
                        None
                    }
                }
            })
            .buffered(self.detail_concurrency)
            .collect()
            .await;

        Ok(details.into_iter().flatten().collect())
    }

    /// Single work by OpenAlex id.
    pub async fn get_work(&self, id: &str) -> Result<Record> {
        let url = format!("{}/works/{}", self.base_url, urlencoding::encode(id));
        let work: Work = self.client.get_json(&url, &self.options()).await?;
        Ok(self.work_to_record(work))
    }

    /// Flatten a work into the fields used downstream.
    pub fn work_to_record(&self, work: Work) -> Record {
        let id = work.id.clone().unwrap_or_default();
        let short_id = IdType::OpenAlex.clean(&id).unwrap_or_else(|| id.clone());
        let mut rec = Record::new(SOURCE_LABEL, short_id);

        rec.insert("id", id);
        rec.insert("display_name", work.display_name.or(work.title));
        rec.insert("doi", work.doi.as_deref().and_then(normalize_doi));
        rec.insert("publication_year", work.publication_year);
        rec.insert("publication_date", work.publication_date);
        rec.insert("type", work.work_type);
        rec.insert("language", work.language);
        rec.insert("cited_by_count", work.cited_by_count);

        let oa = work.open_access;
        rec.insert("is_oa", oa.as_ref().and_then(|o| o.is_oa));
        rec.insert("oa_color", oa.as_ref().and_then(|o| o.oa_status.clone()));
        rec.insert(
            "in_repository",
            oa.as_ref().and_then(|o| o.any_repository_has_fulltext),
        );
        rec.insert("oa_url", oa.and_then(|o| o.oa_url));

        let best = work.best_oa_location.unwrap_or_default();
        let best_src = best.source.as_ref();
        rec.insert("main_url", best.landing_page_url.clone());
        rec.insert("oa_host_org", best_src.and_then(|s| s.host_organization_name.clone()));
        rec.insert("oa_host_name", best_src.and_then(|s| s.display_name.clone()));
        rec.insert("oa_host_type", best_src.and_then(|s| s.source_type.clone()));

        let primary = work.primary_location.unwrap_or_default();
        let primary_src = primary.source.as_ref();
        rec.insert("primary_url", primary.landing_page_url.clone());
        rec.insert(
            "primary_host_org",
            primary_src.and_then(|s| s.host_organization_name.clone()),
        );
        rec.insert("primary_host_name", primary_src.and_then(|s| s.display_name.clone()));
        rec.insert("primary_host_type", primary_src.and_then(|s| s.source_type.clone()));

        let mut hosts: Vec<String> = Vec::new();
        for host in work
            .locations
            .into_iter()
            .filter_map(|l| l.source)
            .filter_map(|s| s.host_organization_name)
        {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        rec.insert("all_host_orgs", hosts.into_iter().map(Value::from).collect::<Vec<_>>());

        if let Some(topic) = work.primary_topic {
            rec.insert("topic", topic.display_name);
            rec.insert("subfield", topic.subfield.and_then(|n| n.display_name));
            rec.insert("field", topic.field.and_then(|n| n.display_name));
            rec.insert("domain", topic.domain.and_then(|n| n.display_name));
        }

        rec.insert("listed_apc_usd", work.apc_list.and_then(|a| a.value_usd));
        rec.insert("paid_apc_usd", work.apc_paid.and_then(|a| a.value_usd));

        let corresponding_authors: Vec<Value> = work
            .authorships
            .into_iter()
            .filter(|a| a.is_corresponding.unwrap_or(false))
            .filter_map(|a| a.author.and_then(|n| n.display_name))
            .map(Value::from)
            .collect();
        rec.insert("corresponding_authors", corresponding_authors);

        let is_corresponding = work
            .corresponding_institution_ids
            .iter()
            .any(|i| *i == self.institution_id);
        rec.insert(
            "corresponding_institution_ids",
            work.corresponding_institution_ids
                .into_iter()
                .map(Value::from)
                .collect::<Vec<_>>(),
        );
        rec.insert("institution_is_corresponding", is_corresponding);

        if let Some(index) = work.abstract_index {
            let text = reconstruct_abstract(&index);
            if !text.is_empty() {
                rec.insert("abstract", text);
            }
        }

        rec
    }

    /// Candidate view of a flattened work: scored on its display name,
    /// trusted when the institution is among the corresponding ones.
    pub fn to_candidate(record: Record) -> Candidate {
        Candidate {
            title: record.text("display_name").unwrap_or_default().to_string(),
            trusted: record
                .field("institution_is_corresponding")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            record,
        }
    }
}

#[async_trait]
impl CandidateSource for OpenAlexClient {
    async fn lookup(&self, query: &str) -> Lookup<Vec<Candidate>> {
        match self.get_works_by_title(query).await {
            Ok(records) => Lookup::from_candidates(
                records.into_iter().map(OpenAlexClient::to_candidate).collect(),
            ),
            Err(e) => Lookup::Error(e.to_string()),
        }
    }
}

/// Reconstruct abstract text from inverted index
/// OpenAlex provides abstract as inverted index for legal reasons.
pub fn reconstruct_abstract(inverted_index: &serde_json::Value) -> String {
    let Some(obj) = inverted_index.as_object() else {
        return String::new();
    };

    let mut words: Vec<(i64, &str)> = obj
        .iter()
        .filter_map(|(word, positions)| positions.as_array().map(|p| (word, p)))
        .flat_map(|(word, positions)| {
            positions
                .iter()
                .filter_map(|p| p.as_i64())
                .map(move |p| (p, word.as_str()))
        })
        .collect();

    words.sort_by_key(|(pos, _)| *pos);
    words.iter().map(|(_, w)| *w).collect::<Vec<_>>().join(" ")
}
