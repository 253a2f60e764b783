// 🎛️ Orchestrator - one tick: discover → filter → fetch + parse → persist → advance
//
// Ticks run strictly one after another. Inside a tick, fetch + parse fans out
// over a bounded rayon pool; persistence stays on the tick thread because the
// store has a single writer.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dedup::DedupCache;
use crate::discovery::{Discovery, DiscoveryConfig, DiscoveryError};
use crate::error::PipelineError;
use crate::fetch::{FetchClient, FetchError};
use crate::liveness::LivenessReporter;
use crate::model::FilingCandidate;
use crate::parser::{fetch_document, HoldingsParser, InformationTableParser, ParsedFiling};
use crate::persistence::{Ack, BatchWriter, FlushReport};
use crate::shutdown::ShutdownSignal;
use crate::watchlist::Watchlist;

/// Longest look-back a cold start honours
pub const MAX_CATCH_UP: Duration = Duration::from_secs(10 * 366 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Time between tick starts
    pub poll_interval: Duration,

    /// Look-back for a cold start without a stored high-water mark
    pub catch_up: Duration,
    pub workers: usize,
    pub archives_url: String,
    pub discovery: DiscoveryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            poll_interval: Duration::from_secs(30),
            catch_up: Duration::from_secs(24 * 3600),
            workers: 4,
            archives_url: "https://www.sec.gov/Archives/edgar/data".to_string(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub discovered: usize,
    pub matched: usize,
    pub skipped_seen: usize,
    pub skipped_rejected: usize,
    pub parsed: usize,
    pub persisted: usize,
    pub quarantined: usize,
    pub failed: usize,
    pub holdings_written: usize,
    pub rows_skipped: usize,

    /// Feed entries dropped before they became candidates
    pub feed_entries_skipped: usize,

    /// Discovery hit `max_pages` before reaching the mark
    pub truncated: bool,

    /// Upstream circuit was open; nothing was attempted
    pub degraded: bool,

    /// Mark in force after the tick
    pub high_water_mark: Option<DateTime<Utc>>,
}

/// Tracks which discovered timestamps are settled, to place the next mark
struct MarkTracker {
    since: DateTime<Utc>,
    newest_resolved: Option<DateTime<Utc>>,
    oldest_unresolved: Option<DateTime<Utc>>,
}

impl MarkTracker {
    fn new(since: DateTime<Utc>) -> Self {
        MarkTracker {
            since,
            newest_resolved: None,
            oldest_unresolved: None,
        }
    }

    fn resolved(&mut self, at: DateTime<Utc>) {
        self.newest_resolved = Some(self.newest_resolved.map_or(at, |t| t.max(at)));
    }

    fn unresolved(&mut self, at: DateTime<Utc>) {
        self.oldest_unresolved = Some(self.oldest_unresolved.map_or(at, |t| t.min(at)));
    }

    /// Never past an unresolved candidate, never backwards
    fn next_mark(&self) -> DateTime<Utc> {
        let candidate = match self.oldest_unresolved {
            Some(unresolved) => unresolved,
            None => self.newest_resolved.unwrap_or(self.since),
        };
        candidate.max(self.since)
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    watchlist: Arc<Watchlist>,
    client: Arc<FetchClient>,
    discovery: Discovery,
    writer: BatchWriter,
    dedup: DedupCache,
    parser: Box<dyn HoldingsParser>,
    liveness: Box<dyn LivenessReporter>,
    shutdown: ShutdownSignal,
    pool: rayon::ThreadPool,

    /// Permanently failed this process lifetime (parse errors, 404s, quarantine)
    rejected: HashSet<String>,

    /// A truncated pass was already reported at warn level
    stall_warned: bool,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        watchlist: Arc<Watchlist>,
        client: Arc<FetchClient>,
        writer: BatchWriter,
        liveness: Box<dyn LivenessReporter>,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<Pipeline> {
        let dedup = DedupCache::seed_from_store(writer.store())?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("ingest-worker-{}", i))
            .build()?;
        let discovery = Discovery::new(client.clone(), config.discovery.clone());

        Ok(Pipeline {
            config,
            watchlist,
            client,
            discovery,
            writer,
            dedup,
            parser: Box::new(InformationTableParser::new()),
            liveness,
            shutdown,
            pool,
            rejected: HashSet::new(),
            stall_warned: false,
        })
    }

    pub fn with_parser(mut self, parser: Box<dyn HoldingsParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn writer(&self) -> &BatchWriter {
        &self.writer
    }

    pub fn client(&self) -> &FetchClient {
        &self.client
    }

    /// Tick until shutdown. Only fatal errors end the loop early.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        info!(
            "pipeline running: poll every {:?}, {} worker(s), parser v{}",
            self.config.poll_interval,
            self.config.workers,
            self.parser.version()
        );

        while !self.shutdown.is_triggered() {
            let started = Instant::now();
            match self.run_tick() {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!("fatal: {}", e);
                    return Err(e);
                }
                Err(e) => warn!("tick failed ({}): {}", e.kind(), e),
            }

            let wait = self.config.poll_interval.saturating_sub(started.elapsed());
            if self.shutdown.sleep(wait) {
                break;
            }
        }

        info!("pipeline stopped");
        Ok(())
    }

    pub fn run_tick(&mut self) -> Result<TickReport, PipelineError> {
        let mut report = TickReport::default();

        let watched = self.watchlist.current();
        if watched.is_empty() {
            debug!("watchlist empty; skipping discovery");
            self.liveness.tick_completed(&report);
            return Ok(report);
        }

        let store = self.writer.store();
        let stored_mark = store
            .load_high_water_mark()
            .map_err(|e| PipelineError::StoreUnavailable(e.to_string()))?;
        let since =
            stored_mark.unwrap_or_else(|| cold_start_since(Utc::now(), self.config.catch_up));

        // ---- discovery ---------------------------------------------------
        let mut candidates = Vec::new();
        let mut pass = self.discovery.discover(since);
        for item in pass.by_ref() {
            match item {
                Ok(candidate) => candidates.push(candidate),
                Err(DiscoveryError::Fetch(FetchError::CircuitOpen { retry_in })) => {
                    warn!("circuit open; tick degraded, upstream retry in {:?}", retry_in);
                    report.degraded = true;
                    report.high_water_mark = stored_mark;
                    return Ok(report);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let truncated = pass.truncated();
        debug!("discovery read {} feed page(s)", pass.pages_fetched());
        report.discovered = candidates.len();
        report.feed_entries_skipped = pass.entries_skipped();
        report.truncated = truncated;

        let mut tracker = MarkTracker::new(since);
        if truncated {
            // entries older than the last page seen were never discovered
            tracker.unresolved(since);
            if !self.stall_warned {
                warn!(
                    "discovery stopped at {} page(s) of {}; high-water mark held at {} until the feed fits (raise --max-pages or --page-size)",
                    self.config.discovery.max_pages,
                    self.config.discovery.page_size,
                    since.to_rfc3339()
                );
                self.stall_warned = true;
            } else {
                debug!("discovery truncated again; mark still held at {}", since.to_rfc3339());
            }
        }

        // ---- filter ------------------------------------------------------
        let mut work = Vec::new();
        for candidate in candidates {
            let accession = candidate.accession_number.as_str();
            if !watched.contains(&candidate.cik) {
                tracker.resolved(candidate.updated);
                continue;
            }
            report.matched += 1;

            if self.dedup.seen(accession) {
                report.skipped_seen += 1;
                tracker.resolved(candidate.updated);
                continue;
            }
            if self.rejected.contains(accession) {
                report.skipped_rejected += 1;
                tracker.resolved(candidate.updated);
                continue;
            }
            let exists = store
                .filing_exists(accession)
                .map_err(|e| PipelineError::StoreUnavailable(e.to_string()))?;
            if exists {
                self.dedup.mark(accession);
                report.skipped_seen += 1;
                tracker.resolved(candidate.updated);
                continue;
            }
            work.push(candidate);
        }

        // ---- fetch + parse, persist -------------------------------------
        let chunk_size = self.config.workers.max(1) * 2;
        let mut in_batch: HashMap<String, DateTime<Utc>> = HashMap::new();

        for (index, chunk) in work.chunks(chunk_size).enumerate() {
            if self.shutdown.is_triggered() {
                let left = &work[index * chunk_size..];
                info!("shutdown requested; {} filing(s) left for the next run", left.len());
                for candidate in left {
                    tracker.unresolved(candidate.updated);
                }
                break;
            }

            let client = &*self.client;
            let parser = &*self.parser;
            let archives = self.config.archives_url.as_str();
            let outcomes: Vec<Result<ParsedFiling, PipelineError>> = self.pool.install(|| {
                chunk
                    .par_iter()
                    .map(|candidate| fetch_and_parse(client, parser, archives, candidate))
                    .collect()
            });

            for (candidate, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(parsed) => {
                        report.parsed += 1;
                        report.rows_skipped += parsed.skipped_rows.len();
                        in_batch.insert(candidate.accession_number.clone(), candidate.updated);

                        match self.writer.persist(parsed.filing, parsed.holdings) {
                            Ok(Ack::Queued { .. }) => {}
                            Ok(Ack::Flushed(flush)) => {
                                self.absorb(flush, &mut in_batch, &mut tracker, &mut report)
                            }
                            Err(e) => return Err(self.abandon_tick(e.into(), &report)),
                        }
                    }
                    Err(e) if e.is_transient() => {
                        report.failed += 1;
                        tracker.unresolved(candidate.updated);
                        warn!("{} deferred ({}): {}", candidate.accession_number, e.kind(), e);
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracker.resolved(candidate.updated);
                        self.rejected.insert(candidate.accession_number.clone());
                        warn!("{} rejected ({}): {}", candidate.accession_number, e.kind(), e);
                    }
                }
            }
        }

        match self.writer.flush() {
            Ok(flush) => self.absorb(flush, &mut in_batch, &mut tracker, &mut report),
            Err(e) => return Err(self.abandon_tick(e.into(), &report)),
        }

        // ---- advance the mark -------------------------------------------
        let mark = tracker.next_mark();
        if mark > since {
            self.writer
                .store()
                .save_high_water_mark(mark)
                .map_err(|e| PipelineError::StoreUnavailable(e.to_string()))?;
        }
        report.high_water_mark = Some(mark);

        info!(
            "tick complete: discovered={} matched={} skipped_seen={} skipped_rejected={} parsed={} persisted={} quarantined={} failed={} holdings={} rows_skipped={} feed_entries_skipped={} truncated={} mark={}",
            report.discovered,
            report.matched,
            report.skipped_seen,
            report.skipped_rejected,
            report.parsed,
            report.persisted,
            report.quarantined,
            report.failed,
            report.holdings_written,
            report.rows_skipped,
            report.feed_entries_skipped,
            report.truncated,
            mark.to_rfc3339()
        );

        self.liveness.tick_completed(&report);
        Ok(report)
    }

    /// Fold a committed batch into dedup, the mark tracker and the report
    fn absorb(
        &mut self,
        flush: FlushReport,
        in_batch: &mut HashMap<String, DateTime<Utc>>,
        tracker: &mut MarkTracker,
        report: &mut TickReport,
    ) {
        for accession in &flush.committed {
            self.dedup.mark(accession);
            report.persisted += 1;
            if let Some(at) = in_batch.remove(accession) {
                tracker.resolved(at);
            }
        }

        for quarantined in flush.quarantined {
            let err = PipelineError::ConstraintViolation {
                accession: quarantined.accession_number.clone(),
                reason: quarantined.reason,
            };
            warn!("{} ({})", err, err.kind());
            report.quarantined += 1;
            if let Some(at) = in_batch.remove(&quarantined.accession_number) {
                tracker.resolved(at);
            }
            self.rejected.insert(quarantined.accession_number);
        }

        report.holdings_written += flush.holdings_written;
    }

    fn abandon_tick(&self, err: PipelineError, report: &TickReport) -> PipelineError {
        error!(
            "tick abandoned after {} persisted: {}; high-water mark unchanged",
            report.persisted, err
        );
        err
    }
}

/// Where discovery starts without a stored mark
fn cold_start_since(now: DateTime<Utc>, catch_up: Duration) -> DateTime<Utc> {
    let catch_up = chrono::Duration::from_std(catch_up.min(MAX_CATCH_UP))
        .unwrap_or_else(|_| chrono::Duration::hours(24));
    now.checked_sub_signed(catch_up).unwrap_or(now)
}

fn fetch_and_parse(
    client: &FetchClient,
    parser: &dyn HoldingsParser,
    archives_url: &str,
    candidate: &FilingCandidate,
) -> Result<ParsedFiling, PipelineError> {
    let document = fetch_document(client, archives_url, candidate)?;
    let parsed = parser
        .parse(&document)
        .map_err(|e| PipelineError::parse(&candidate.accession_number, &e))?;
    debug!(
        "{} parsed: {} holding(s), {} row(s) skipped",
        candidate.accession_number,
        parsed.holdings.len(),
        parsed.skipped_rows.len()
    );
    Ok(parsed)
}
