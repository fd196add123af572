//! Resumable OAI-PMH harvesting.
//!
//! A collection is sharded into [`DateWindow`]s. Each window walks its
//! resumption-token chain sequentially; windows run concurrently up to a
//! fixed limit and fail independently. Inside a window a bounded queue sits
//! between the fetch-and-parse producer and the flattening consumer, so at
//! most `queue_capacity` parsed pages are buffered at any time.
//!
//! A malformed page ends its window early. Records from the pages before it
//! are kept and the window is reported as partial.

use crate::cache::CacheLayer;
use crate::client::{RequestOptions, RetryingClient};
use crate::config::Settings;
use crate::error::{Result, SynthecaError};
use crate::oai::{self, ListRecordsResponse, OaiPage, RecordKind};
use crate::progress::PositionAllocator;
use crate::record::Record;
use chrono::{Days, NaiveDate};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Half-open date range `[from, until)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub until: NaiveDate,
}

impl DateWindow {
    pub fn new(from: NaiveDate, until: NaiveDate) -> Result<Self> {
        if from >= until {
            return Err(SynthecaError::Validation(format!(
                "empty date window: {from} is not before {until}"
            )));
        }
        Ok(Self { from, until })
    }

    /// Consecutive disjoint windows of at most `days` days covering
    /// `[start, end)`. The last window is shortened to end at `end`.
    pub fn split(start: NaiveDate, end: NaiveDate, days: u32) -> Result<Vec<Self>> {
        if days == 0 {
            return Err(SynthecaError::Validation("window length must be at least one day".into()));
        }
        let mut windows = Vec::new();
        let mut from = start;
        while from < end {
            let until = from
                .checked_add_days(Days::new(u64::from(days)))
                .map_or(end, |d| d.min(end));
            windows.push(Self { from, until });
            from = until;
        }
        Ok(windows)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date < self.until
    }

    /// `from` as sent to the feed.
    pub fn oai_from(&self) -> String {
        self.from.format("%Y-%m-%d").to_string()
    }

    /// The feed's `until` is inclusive, so send the last day inside the window.
    pub fn oai_until(&self) -> String {
        self.until
            .pred_opt()
            .unwrap_or(self.from)
            .format("%Y-%m-%d")
            .to_string()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.until)
    }
}

/// Continuation token plus the endpoint it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionCursor {
    pub token: String,
    pub base_url: String,
}

impl ResumptionCursor {
    /// Resumed requests carry the token and nothing else.
    pub fn query(&self) -> Vec<(String, String)> {
        vec![
            ("verb".to_string(), "ListRecords".to_string()),
            ("resumptionToken".to_string(), self.token.clone()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HarvestState {
    Idle,
    FetchingPage,
    ParsingPage,
    Resuming,
    Done,
    Failed,
}

impl fmt::Display for HarvestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HarvestState::Idle => "idle",
            HarvestState::FetchingPage => "fetching",
            HarvestState::ParsingPage => "parsing",
            HarvestState::Resuming => "resuming",
            HarvestState::Done => "done",
            HarvestState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Bounded producer/consumer queue
// ---------------------------------------------------------------------------

/// Messages on a window's queue. The sentinel is the only end-of-stream
/// signal the consumer acts on.
#[derive(Debug)]
pub enum QueueMessage<T> {
    Item(T),
    Sentinel,
}

pub struct QueueSender<T> {
    tx: mpsc::Sender<QueueMessage<T>>,
}

impl<T> QueueSender<T> {
    /// Waits while the queue is full. Fails if the consumer is gone.
    pub async fn send(&self, item: T) -> Result<()> {
        self.tx
            .send(QueueMessage::Item(item))
            .await
            .map_err(|_| SynthecaError::Cancelled("queue consumer dropped".into()))
    }
}

pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<QueueMessage<T>>,
    finished: bool,
}

impl<T> QueueReceiver<T> {
    /// Next item, `Ok(None)` once the sentinel arrives. A channel that closes
    /// without a sentinel is an error.
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(QueueMessage::Item(item)) => Ok(Some(item)),
            Some(QueueMessage::Sentinel) => {
                self.finished = true;
                Ok(None)
            }
            None => Err(SynthecaError::Cancelled(
                "queue closed without end-of-stream sentinel".into(),
            )),
        }
    }
}

/// Run a producer and consumer joined by a queue of `capacity` slots.
///
/// The sentinel is sent once the producer future returns, whatever it
/// returned. Both halves are polled by one future, so dropping it cancels
/// the pair together.
pub async fn run_bounded<T, P, PFut, POut, C, CFut, COut>(
    capacity: usize,
    producer: P,
    consumer: C,
) -> (POut, COut)
where
    P: FnOnce(QueueSender<T>) -> PFut,
    PFut: Future<Output = POut>,
    C: FnOnce(QueueReceiver<T>) -> CFut,
    CFut: Future<Output = COut>,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = QueueSender { tx: tx.clone() };

    let produce = async move {
        let out = producer(sender).await;
        if tx.send(QueueMessage::Sentinel).await.is_err() {
            debug!("Consumer gone before end-of-stream sentinel");
        }
        out
    };
    let consume = consumer(QueueReceiver { rx, finished: false });

    tokio::join!(produce, consume)
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum WindowStatus {
    Succeeded,
    /// Stopped at a malformed page; earlier pages were kept.
    Partial(String),
    Failed(String),
    Cached,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub collection: String,
    pub window: Option<DateWindow>,
    pub status: WindowStatus,
    pub pages: usize,
    pub records: usize,
    pub elapsed_ms: u64,
    pub lane: usize,
    pub final_state: HarvestState,
}

impl WindowReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, WindowStatus::Failed(_))
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.status, WindowStatus::Partial(_))
    }
}

/// Per-window outcomes of one or more collection harvests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestSummary {
    pub windows: Vec<WindowReport>,
    pub harvested: usize,
    pub partial: usize,
    pub failed: usize,
    pub cached: usize,
    pub records: usize,
}

impl HarvestSummary {
    pub fn push(&mut self, report: WindowReport) {
        match report.status {
            WindowStatus::Succeeded => {
                self.harvested += 1;
                self.records += report.records;
            }
            WindowStatus::Partial(_) => {
                self.partial += 1;
                self.records += report.records;
            }
            WindowStatus::Failed(_) => self.failed += 1,
            WindowStatus::Cached => {
                self.cached += 1;
                self.records += report.records;
            }
        }
        self.windows.push(report);
    }

    pub fn extend(&mut self, other: HarvestSummary) {
        for report in other.windows {
            self.push(report);
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &WindowReport> {
        self.windows.iter().filter(|w| w.is_failed())
    }

    /// Whether every window ran to the end of its cursor chain.
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.partial == 0
    }
}

impl fmt::Display for HarvestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "windows: {} harvested, {} partial, {} failed, {} cached; {} records",
            self.harvested, self.partial, self.failed, self.cached, self.records
        )?;
        for w in &self.windows {
            let window = w.window.map(|w| w.to_string()).unwrap_or_else(|| "(all)".into());
            match &w.status {
                WindowStatus::Partial(reason) => {
                    writeln!(f, "  PARTIAL {} {}: {}", w.collection, window, reason)?
                }
                WindowStatus::Failed(reason) => {
                    writeln!(f, "  FAILED {} {}: {}", w.collection, window, reason)?
                }
                WindowStatus::Succeeded | WindowStatus::Cached => {}
            }
        }
        Ok(())
    }
}

/// Records from every successful or partial window plus the summary.
#[derive(Debug, Clone, Default)]
pub struct HarvestResult {
    pub records: Vec<Record>,
    pub summary: HarvestSummary,
}

// ---------------------------------------------------------------------------
// Harvester
// ---------------------------------------------------------------------------

struct ProducerOutcome {
    pages: usize,
    final_state: HarvestState,
    error: Option<SynthecaError>,
    /// The error came from parsing a fetched page.
    malformed: bool,
}

#[derive(Debug, Clone)]
pub struct PaginatedHarvester {
    client: RetryingClient,
    base_url: String,
    metadata_prefix: String,
    set_prefix: String,
    max_concurrent_windows: usize,
    queue_capacity: usize,
    positions: PositionAllocator,
}

impl PaginatedHarvester {
    pub fn new(client: RetryingClient, settings: &Settings, positions: PositionAllocator) -> Self {
        Self {
            client,
            base_url: settings.oai_base_url.clone(),
            metadata_prefix: settings.oai_metadata_prefix.clone(),
            set_prefix: settings.oai_set_prefix.clone(),
            max_concurrent_windows: settings.max_concurrent_windows.max(1),
            queue_capacity: settings.queue_capacity.max(1),
            positions,
        }
    }

    /// Query for the first page of a window.
    pub fn initial_query(&self, collection: &str, window: Option<&DateWindow>) -> Vec<(String, String)> {
        let mut query = vec![
            ("verb".to_string(), "ListRecords".to_string()),
            ("metadataPrefix".to_string(), self.metadata_prefix.clone()),
            ("set".to_string(), format!("{}{}", self.set_prefix, collection)),
        ];
        if let Some(w) = window {
            query.push(("from".to_string(), w.oai_from()));
            query.push(("until".to_string(), w.oai_until()));
        }
        query
    }

    /// Harvest one collection over `windows` (the whole collection when
    /// empty). Failed windows contribute no records.
    pub async fn harvest_collection(&self, collection: &str, windows: &[DateWindow]) -> HarvestResult {
        let shards: Vec<Option<DateWindow>> = if windows.is_empty() {
            vec![None]
        } else {
            windows.iter().copied().map(Some).collect()
        };

        info!(
            collection = collection,
            windows = shards.len(),
            concurrency = self.max_concurrent_windows,
            "Starting harvest"
        );

        let outcomes: Vec<(Vec<Record>, WindowReport)> = stream::iter(shards)
            .map(|window| self.harvest_window(collection, window))
            .buffer_unordered(self.max_concurrent_windows)
            .collect()
            .await;

        let mut result = HarvestResult::default();
        for (records, report) in outcomes {
            result.records.extend(records);
            result.summary.push(report);
        }

        info!(
            collection = collection,
            harvested = result.summary.harvested,
            failed = result.summary.failed,
            records = result.records.len(),
            "Harvest complete"
        );
        result
    }

    /// [`harvest_collection`](Self::harvest_collection) that stops as soon as
    /// `cancel` fires, dropping every outstanding window.
    pub async fn harvest_collection_until_cancelled(
        &self,
        collection: &str,
        windows: &[DateWindow],
        cancel: &CancellationToken,
    ) -> Result<HarvestResult> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(collection = collection, "Harvest cancelled");
                Err(SynthecaError::Cancelled(format!("harvest of {collection}")))
            }
            result = self.harvest_collection(collection, windows) => Ok(result),
        }
    }

    /// Serve the collection from `pure_{collection}` in the cache when
    /// possible. A fresh harvest is written back only if every window
    /// completed.
    pub async fn harvest_collection_cached(
        &self,
        cache: &CacheLayer,
        collection: &str,
        windows: &[DateWindow],
    ) -> HarvestResult {
        let name = format!("pure_{collection}");
        if let Some(records) = cache.try_load(&name) {
            let mut summary = HarvestSummary::default();
            summary.push(WindowReport {
                collection: collection.to_string(),
                window: None,
                status: WindowStatus::Cached,
                pages: 0,
                records: records.len(),
                elapsed_ms: 0,
                lane: self.positions.next(),
                final_state: HarvestState::Done,
            });
            return HarvestResult { records, summary };
        }

        let result = self.harvest_collection(collection, windows).await;
        if result.summary.is_complete() {
            cache.store(&name, &result.records);
        } else {
            warn!(
                collection = collection,
                partial = result.summary.partial,
                failed = result.summary.failed,
                "Not caching an incomplete harvest"
            );
        }
        result
    }

    /// Walk one window's cursor chain. Never fails: errors end up in the
    /// report. A malformed page after at least one good page keeps the
    /// records so far; any other error discards them.
    pub async fn harvest_window(&self, collection: &str, window: Option<DateWindow>) -> (Vec<Record>, WindowReport) {
        let lane = self.positions.next();
        let started = Instant::now();
        let label = window.map(|w| w.to_string()).unwrap_or_else(|| "all".to_string());
        let kind = RecordKind::from_collection(collection);

        debug!(collection = collection, window = %label, lane = lane, "Window started");

        let (produced, consumed) = run_bounded(
            self.queue_capacity,
            |tx| self.produce_pages(collection, window, lane, tx),
            |mut rx: QueueReceiver<OaiPage>| {
                let label = label.clone();
                async move {
                    let mut records = Vec::new();
                    let mut seen = 0usize;
                    while let Some(page) = rx.next().await? {
                        for rec in &page.records {
                            let fallback = format!("{collection}@{label}#{seen}");
                            records.push(oai::flatten_record(kind, collection, rec, fallback));
                            seen += 1;
                        }
                    }
                    Ok::<_, SynthecaError>(records)
                }
            },
        )
        .await;

        let elapsed = started.elapsed();
        let (records, status, final_state) = match (produced.error, consumed) {
            (None, Ok(records)) => (records, WindowStatus::Succeeded, produced.final_state),
            (Some(e), Ok(records)) if produced.malformed && produced.pages > 0 => {
                warn!(
                    collection = collection,
                    window = %label,
                    lane = lane,
                    pages = produced.pages,
                    kept = records.len(),
                    error = %e,
                    "Malformed page, keeping earlier pages"
                );
                (records, WindowStatus::Partial(e.to_string()), produced.final_state)
            }
            (Some(e), _) | (None, Err(e)) => {
                warn!(
                    collection = collection,
                    window = %label,
                    lane = lane,
                    pages = produced.pages,
                    error = %e,
                    "Window failed"
                );
                (Vec::new(), WindowStatus::Failed(e.to_string()), HarvestState::Failed)
            }
        };

        info!(
            collection = collection,
            window = %label,
            lane = lane,
            pages = produced.pages,
            records = records.len(),
            elapsed_ms = duration_ms(elapsed),
            state = %final_state,
            "Window finished"
        );

        let report = WindowReport {
            collection: collection.to_string(),
            window,
            status,
            pages: produced.pages,
            records: records.len(),
            elapsed_ms: duration_ms(elapsed),
            lane,
            final_state,
        };
        (records, report)
    }

    async fn produce_pages(
        &self,
        collection: &str,
        window: Option<DateWindow>,
        lane: usize,
        tx: QueueSender<OaiPage>,
    ) -> ProducerOutcome {
        let mut state = HarvestState::Idle;
        let mut cursor: Option<ResumptionCursor> = None;
        let mut body = String::new();
        let mut pages = 0usize;
        let mut seen_tokens: HashSet<String> = HashSet::new();

        let fail = |pages, error| ProducerOutcome {
            pages,
            final_state: HarvestState::Failed,
            error: Some(error),
            malformed: false,
        };

        loop {
            debug!(collection = collection, lane = lane, state = %state, "Harvest step");
            match state {
                HarvestState::Idle => state = HarvestState::FetchingPage,
                HarvestState::FetchingPage => {
                    let query = match &cursor {
                        Some(c) => c.query(),
                        None => self.initial_query(collection, window.as_ref()),
                    };
                    let opts = RequestOptions {
                        query,
                        ..RequestOptions::default()
                    };
                    match self.client.get_text(&self.base_url, &opts).await {
                        Ok(text) => {
                            body = text;
                            state = HarvestState::ParsingPage;
                        }
                        Err(e) => return fail(pages, e),
                    }
                }
                HarvestState::ParsingPage => match oai::parse_list_records(&body) {
                    Ok(ListRecordsResponse::NoRecordsMatch) => {
                        debug!(collection = collection, lane = lane, "No records match");
                        state = HarvestState::Done;
                    }
                    Ok(ListRecordsResponse::Page(page)) => {
                        pages += 1;
                        let token = page.resumption_token.clone();
                        debug!(
                            collection = collection,
                            lane = lane,
                            page = pages,
                            records = page.records.len(),
                            deleted = page.deleted,
                            "Parsed page"
                        );
                        if let Err(e) = tx.send(page).await {
                            return fail(pages, e);
                        }
                        match token {
                            Some(token) if !seen_tokens.insert(token.clone()) => {
                                return fail(
                                    pages,
                                    SynthecaError::Parse(format!("resumption token {token:?} repeated")),
                                );
                            }
                            Some(token) => {
                                cursor = Some(ResumptionCursor {
                                    token,
                                    base_url: self.base_url.clone(),
                                });
                                state = HarvestState::Resuming;
                            }
                            None => state = HarvestState::Done,
                        }
                    }
                    Err(e) => {
                        return ProducerOutcome {
                            pages,
                            final_state: HarvestState::Failed,
                            error: Some(e),
                            malformed: true,
                        }
                    }
                },
                HarvestState::Resuming => state = HarvestState::FetchingPage,
                HarvestState::Done | HarvestState::Failed => {
                    return ProducerOutcome {
                        pages,
                        final_state: state,
                        error: None,
                        malformed: false,
                    }
                }
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
