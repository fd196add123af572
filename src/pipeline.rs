//! End-to-end run: harvest -> OpenAlex lookup -> match -> dedup.

use crate::cache::CacheLayer;
use crate::client::RetryingClient;
use crate::config::Settings;
use crate::corrections::CorrectionTable;
use crate::dedup::deduplicate;
use crate::error::{Result, SynthecaError};
use crate::harvester::{DateWindow, HarvestSummary, PaginatedHarvester};
use crate::merge::{MatchConfig, MatchEngine, MatchReport, MergeRow, SourceSet};
use crate::openalex::{IdType, OpenAlexClient, SOURCE_LABEL};
use crate::progress::PositionAllocator;
use crate::record::{FieldAccess, Record};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Collection whose records are matched against OpenAlex.
pub const PUBLICATIONS: &str = "publications";
/// Label of harvested rows in provenance flags.
pub const PURE_LABEL: &str = "pure";
const OPENALEX_WORKS_CACHE: &str = "openalex_works";

/// Counts for one whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub harvest: HarvestSummary,
    pub works_requested: usize,
    pub works_fetched: usize,
    pub works_failed_batches: usize,
    pub works_cached: bool,
    pub matching: Vec<MatchReport>,
    pub rows_before_dedup: usize,
    pub rows_after_dedup: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.harvest;
        writeln!(f, "{:<26} {:>8}", "stage", "count")?;
        writeln!(f, "{}", "-".repeat(35))?;
        writeln!(f, "{:<26} {:>8}", "windows harvested", h.harvested)?;
        writeln!(f, "{:<26} {:>8}", "windows partial", h.partial)?;
        writeln!(f, "{:<26} {:>8}", "windows failed", h.failed)?;
        writeln!(f, "{:<26} {:>8}", "windows cached", h.cached)?;
        writeln!(f, "{:<26} {:>8}", "records harvested", h.records)?;
        writeln!(f, "{:<26} {:>8}", "works requested", self.works_requested)?;
        writeln!(
            f,
            "{:<26} {:>8}{}",
            "works fetched",
            self.works_fetched,
            if self.works_cached { " (cache)" } else { "" }
        )?;
        writeln!(f, "{:<26} {:>8}", "work batches failed", self.works_failed_batches)?;
        for m in &self.matching {
            writeln!(f, "[{} x {}]", m.left_label, m.right_label)?;
            writeln!(f, "{:<26} {:>8}", "  matched by key", m.deterministic)?;
            writeln!(f, "{:<26} {:>8}", "  matched fuzzy", m.fuzzy)?;
            writeln!(f, "{:<26} {:>8}", "  corrected", m.corrected)?;
            writeln!(f, "{:<26} {:>8}", "  unmatched left", m.unmatched_left)?;
            writeln!(f, "{:<26} {:>8}", "  unmatched right", m.unmatched_right)?;
            writeln!(f, "{:<26} {:>8}", "  lookup failures", m.lookup_failures)?;
        }
        writeln!(f, "{:<26} {:>8}", "rows before dedup", self.rows_before_dedup)?;
        write!(f, "{:<26} {:>8}", "rows after dedup", self.rows_after_dedup)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarvestOutput {
    pub collections: BTreeMap<String, Vec<Record>>,
    pub summary: HarvestSummary,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub rows: Vec<MergeRow>,
    pub summary: RunSummary,
}

pub struct Pipeline {
    harvester: PaginatedHarvester,
    openalex: OpenAlexClient,
    cache: CacheLayer,
    engine: MatchEngine,
}

impl Pipeline {
    pub fn new(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let client = RetryingClient::new(settings)?;
        let positions = PositionAllocator::new();
        let cache = CacheLayer::from_settings(settings);

        let harvester = PaginatedHarvester::new(client.clone(), settings, positions.clone());
        let mut openalex = OpenAlexClient::new(client, settings, positions);
        if settings.use_cache_for_retrieval {
            openalex = openalex.with_cache(cache.clone());
        }

        let corrections = CorrectionTable::load_optional(settings.corrections_path.as_deref())?;
        let engine = MatchEngine::new(MatchConfig::from_settings(settings), corrections);

        Ok(Self {
            harvester,
            openalex,
            cache,
            engine,
        })
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// Harvest each collection in turn. Failures stay in the summary.
    pub async fn harvest(&self, collections: &[String], windows: &[DateWindow]) -> HarvestOutput {
        let mut out = HarvestOutput::default();
        for collection in collections {
            let result = self
                .harvester
                .harvest_collection_cached(&self.cache, collection, windows)
                .await;
            out.summary.extend(result.summary);
            out.collections.insert(collection.clone(), result.records);
        }
        out
    }

    /// Harvest publications, fetch their OpenAlex works, merge and dedup.
    pub async fn run(&self, windows: &[DateWindow]) -> PipelineOutput {
        let harvested = self.harvest(&[PUBLICATIONS.to_string()], windows).await;
        let mut summary = RunSummary {
            harvest: harvested.summary,
            ..RunSummary::default()
        };
        let publications = harvested
            .collections
            .into_iter()
            .next()
            .map(|(_, records)| records)
            .unwrap_or_default();

        let dois: Vec<String> = publications
            .iter()
            .filter_map(|r| r.text("doi"))
            .map(str::to_string)
            .collect();
        summary.works_requested = dois.len();
        let works = self.fetch_works(&dois, &mut summary).await;
        summary.works_fetched = works.len();

        let (rows, report) = self
            .engine
            .merge(
                SourceSet::new(PURE_LABEL, publications),
                SourceSet::new(SOURCE_LABEL, works),
                Some(&self.openalex),
            )
            .await;
        summary.matching.push(report);
        summary.rows_before_dedup = rows.len();

        let rows = deduplicate(rows, "doi", "title");
        summary.rows_after_dedup = rows.len();

        info!(rows = rows.len(), "Pipeline complete");
        PipelineOutput { rows, summary }
    }

    async fn fetch_works(&self, dois: &[String], summary: &mut RunSummary) -> Vec<Record> {
        if let Some(hit) = self.cache.try_load(OPENALEX_WORKS_CACHE) {
            summary.works_cached = true;
            return hit;
        }
        let outcome = self.openalex.get_works_by_ids(dois, IdType::Doi).await;
        summary.works_failed_batches = outcome.failed_batches;
        if outcome.failed_batches == 0 {
            self.cache.store(OPENALEX_WORKS_CACHE, &outcome.records);
        } else {
            warn!(failed = outcome.failed_batches, "Not caching incomplete OpenAlex results");
        }
        outcome.records
    }

    pub async fn harvest_until_cancelled(
        &self,
        collections: &[String],
        windows: &[DateWindow],
        cancel: &CancellationToken,
    ) -> Result<HarvestOutput> {
        until_cancelled(cancel, "harvest", self.harvest(collections, windows)).await
    }

    pub async fn run_until_cancelled(
        &self,
        windows: &[DateWindow],
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput> {
        until_cancelled(cancel, "pipeline run", self.run(windows)).await
    }
}

/// Drive `work` unless `cancel` fires first; dropping it cancels every
/// window and lookup still in flight.
async fn until_cancelled<T>(cancel: &CancellationToken, what: &str, work: impl Future<Output = T>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(what = what, "Cancelled");
            Err(SynthecaError::Cancelled(what.to_string()))
        }
        out = work => Ok(out),
    }
}
