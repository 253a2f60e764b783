// End-to-end ticks against a scripted upstream: discovery feed, filing
// archives and a real SQLite store, no network.

use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use filing_ingest::{
    AmendmentPolicy, BatchConfig, BatchWriter, BreakerConfig, BreakerState, CircuitBreaker,
    DiscoveryConfig, FetchClient, FetchConfig, FetchRequest, FetchResponse, FilingDocument,
    FormType, HoldingsParser, HttpTransport, InformationTableParser, LivenessReporter, ParseError,
    ParsedFiling, Pipeline, PipelineConfig, RateLimiter, ShutdownSignal, Store, TickReport,
    TransportError, Watchlist,
};

const IDENTITY: &str = "Example Research ops@example.test";
const FEED: &str = "https://sec.test/cgi-bin/browse-edgar";
const ARCHIVES: &str = "https://sec.test/Archives/edgar/data";

// ============================================================================
// SCRIPTED UPSTREAM
// ============================================================================

#[derive(Default)]
struct Upstream {
    /// Responses per URL; the last one repeats
    scripts: Mutex<HashMap<String, VecDeque<FetchResponse>>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl Upstream {
    fn respond(&self, url: &str, status: u16, body: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(FetchResponse::new(status, body));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
    }

    fn archive_calls(&self) -> usize {
        self.calls().iter().filter(|url| url.starts_with(ARCHIVES)).count()
    }

    fn user_agents(&self) -> Vec<Option<String>> {
        self.calls.lock().unwrap().iter().map(|(_, ua)| ua.clone()).collect()
    }
}

struct Shared(Arc<Upstream>);

impl HttpTransport for Shared {
    fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        let upstream = &self.0;
        upstream.calls.lock().unwrap().push((
            request.url.clone(),
            request.header("User-Agent").map(str::to_string),
        ));

        let mut scripts = upstream.scripts.lock().unwrap();
        let response = match scripts.get_mut(&request.url) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| {
            if request.url.starts_with(FEED) {
                FetchResponse::new(200, feed(&[]))
            } else {
                FetchResponse::new(404, "not found")
            }
        }))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

struct Listed {
    cik: &'static str,
    accession: &'static str,
    updated: DateTime<Utc>,
}

/// Feed timestamps carry whole seconds
fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp() - minutes * 60, 0).unwrap()
}

fn entry(filing: &Listed) -> String {
    let short = filing.accession.replace('-', "");
    format!(
        r#"<entry>
  <title>13F-HR - FILER {cik} LLC ({cik}) (Filer)</title>
  <link rel="alternate" type="text/html" href="https://sec.test/Archives/edgar/data/{cik}/{short}/{acc}-index.htm"/>
  <summary type="html">Filed: {date} AccNo: {acc}</summary>
  <updated>{updated}</updated>
  <category scheme="https://www.sec.gov/" label="form type" term="13F-HR"/>
  <id>urn:tag:sec.gov,2008:accession-number={acc}</id>
</entry>"#,
        cik = filing.cik,
        acc = filing.accession,
        date = filing.updated.format("%Y-%m-%d"),
        updated = filing.updated.to_rfc3339(),
    )
}

fn feed(entries: &[String]) -> String {
    format!(
        r#"<?xml version="1.0" encoding="ISO-8859-1" ?><feed xmlns="http://www.w3.org/2005/Atom"><title>Latest Filings</title>{}</feed>"#,
        entries.join("")
    )
}

const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<edgarSubmission xmlns="http://www.sec.gov/edgar/thirteenffiler">
  <headerData><submissionType>13F-HR</submissionType></headerData>
  <formData>
    <coverPage>
      <reportCalendarOrQuarter>03-31-2024</reportCalendarOrQuarter>
      <filingManager><name>Filer Capital LLC</name></filingManager>
    </coverPage>
    <summaryPage>
      <tableEntryTotal>2</tableEntryTotal>
      <tableValueTotal>1500</tableValueTotal>
    </summaryPage>
  </formData>
  <periodOfReport>03-31-2024</periodOfReport>
</edgarSubmission>"#;

const TABLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<informationTable xmlns="http://www.sec.gov/edgar/document/thirteenf/informationtable">
  <infoTable>
    <nameOfIssuer>APPLE INC</nameOfIssuer>
    <titleOfClass>COM</titleOfClass>
    <cusip>037833100</cusip>
    <value>1000</value>
    <shrsOrPrnAmt><sshPrnamt>50</sshPrnamt><sshPrnamtType>SH</sshPrnamtType></shrsOrPrnAmt>
    <investmentDiscretion>SOLE</investmentDiscretion>
    <votingAuthority><Sole>50</Sole><Shared>0</Shared><None>0</None></votingAuthority>
  </infoTable>
  <infoTable>
    <nameOfIssuer>MICROSOFT CORP</nameOfIssuer>
    <titleOfClass>COM</titleOfClass>
    <cusip>594918104</cusip>
    <value>500</value>
    <shrsOrPrnAmt><sshPrnamt>10</sshPrnamt><sshPrnamtType>SH</sshPrnamtType></shrsOrPrnAmt>
    <investmentDiscretion>SOLE</investmentDiscretion>
  </infoTable>
</informationTable>"#;

fn directory(filing: &Listed) -> String {
    format!(
        "{}/{}/{}",
        ARCHIVES,
        filing.cik,
        filing.accession.replace('-', "")
    )
}

/// Script the index, cover page and information table of one filing
fn publish(upstream: &Upstream, filing: &Listed) {
    let dir = directory(filing);
    upstream.respond(
        &format!("{}/index.json", dir),
        200,
        r#"{"directory":{"item":[{"name":"primary_doc.xml"},{"name":"infotable.xml"},{"name":"0000950123-24-000001.txt"}]}}"#,
    );
    upstream.respond(&format!("{}/primary_doc.xml", dir), 200, PRIMARY);
    upstream.respond(&format!("{}/infotable.xml", dir), 200, TABLE);
}

fn feed_page_url(page_size: usize) -> String {
    format!(
        "{}?action=getcurrent&type=13F-HR&company=&dateb=&owner=include&start=0&count={}&output=atom",
        FEED, page_size
    )
}

fn list(upstream: &Upstream, filings: &[&Listed]) {
    let entries: Vec<String> = filings.iter().map(|f| entry(f)).collect();
    upstream.respond(&feed_page_url(10), 200, &feed(&entries));
}

#[derive(Default)]
struct CountingLiveness(Arc<AtomicUsize>);

impl LivenessReporter for CountingLiveness {
    fn tick_completed(&self, _report: &TickReport) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    upstream: Arc<Upstream>,
    pings: Arc<AtomicUsize>,
    shutdown: ShutdownSignal,
}

impl Harness {
    fn new() -> Self {
        Harness {
            upstream: Arc::new(Upstream::default()),
            pings: Arc::new(AtomicUsize::new(0)),
            shutdown: ShutdownSignal::new(),
        }
    }

    fn client(&self, breaker: BreakerConfig) -> Arc<FetchClient> {
        let mut config = FetchConfig::new(IDENTITY);
        config.max_retries = 0;
        config.retry_base_delay = Duration::from_millis(1);
        config.default_backoff = Duration::ZERO;
        config.max_wait = Duration::from_secs(1);
        Arc::new(FetchClient::new(
            Box::new(Shared(self.upstream.clone())),
            RateLimiter::per_second(1000),
            CircuitBreaker::new(breaker),
            config,
        ))
    }

    fn pipeline_with(
        &self,
        store: Store,
        ciks: &[&str],
        breaker: BreakerConfig,
        discovery: DiscoveryConfig,
    ) -> Pipeline {
        let config = PipelineConfig {
            poll_interval: Duration::from_millis(10),
            catch_up: Duration::from_secs(24 * 3600),
            workers: 2,
            archives_url: ARCHIVES.to_string(),
            discovery,
        };
        let batch = BatchConfig {
            batch_size: 50,
            max_batch_age: Duration::from_secs(3600),
            store_retries: 2,
            retry_base_delay: Duration::from_millis(1),
            amendment_policy: AmendmentPolicy::Coexist,
        };
        Pipeline::new(
            config,
            Arc::new(Watchlist::from_ciks(ciks.iter().copied())),
            self.client(breaker),
            BatchWriter::new(store, batch),
            Box::new(CountingLiveness(self.pings.clone())),
            self.shutdown.clone(),
        )
        .unwrap()
    }

    fn pipeline(&self, store: Store, ciks: &[&str]) -> Pipeline {
        self.pipeline_with(store, ciks, BreakerConfig::default(), discovery_config(10, 3))
    }
}

fn discovery_config(page_size: usize, max_pages: usize) -> DiscoveryConfig {
    DiscoveryConfig {
        feed_url: FEED.to_string(),
        page_size,
        max_pages,
        forms: vec![FormType::HoldingsReport],
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_only_watched_filers_are_ingested() {
    let harness = Harness::new();
    let watched = Listed {
        cik: "1111111",
        accession: "0001111111-24-000001",
        updated: minutes_ago(30),
    };
    let other = Listed {
        cik: "2222222",
        accession: "0002222222-24-000001",
        updated: minutes_ago(40),
    };
    list(&harness.upstream, &[&watched, &other]);
    publish(&harness.upstream, &watched);
    publish(&harness.upstream, &other);

    let mut pipeline = harness.pipeline(Store::open_in_memory().unwrap(), &["1111111"]);
    let report = pipeline.run_tick().unwrap();

    assert_eq!(report.discovered, 2);
    assert_eq!(report.matched, 1);
    assert_eq!(report.persisted, 1);
    assert_eq!(report.holdings_written, 2);
    assert_eq!(report.failed, 0);

    let store = pipeline.writer().store();
    assert_eq!(store.count_filings().unwrap(), 1);
    assert_eq!(store.count_holdings().unwrap(), 2);
    assert!(pipeline.dedup().seen(watched.accession));
    assert!(!pipeline.dedup().seen(other.accession));

    let filing = store.get_filing(watched.accession).unwrap().unwrap();
    assert_eq!(filing.cik, "0001111111");
    assert_eq!(filing.company_name, "Filer Capital LLC");
    assert_eq!(filing.declared_entry_total, Some(2));

    // nothing under the unwatched filer's directory was requested
    let other_dir = directory(&other);
    assert!(harness.upstream.calls().iter().all(|url| !url.starts_with(&other_dir)));

    // every request carried the contact identity
    assert!(harness
        .upstream
        .user_agents()
        .iter()
        .all(|ua| ua.as_deref() == Some(IDENTITY)));

    assert_eq!(harness.pings.load(Ordering::SeqCst), 1);
    assert_eq!(report.high_water_mark, Some(watched.updated));
}

#[test]
fn test_relisted_filing_is_not_fetched_again() {
    let harness = Harness::new();
    let filing = Listed {
        cik: "1111111",
        accession: "0001111111-24-000002",
        updated: minutes_ago(10),
    };
    list(&harness.upstream, &[&filing]);
    publish(&harness.upstream, &filing);

    let mut pipeline = harness.pipeline(Store::open_in_memory().unwrap(), &["1111111"]);
    assert_eq!(pipeline.run_tick().unwrap().persisted, 1);
    let archive_calls = harness.upstream.archive_calls();

    let second = pipeline.run_tick().unwrap();
    assert_eq!(second.skipped_seen, 1);
    assert_eq!(second.persisted, 0);
    assert_eq!(second.holdings_written, 0);
    assert_eq!(harness.upstream.archive_calls(), archive_calls);
    assert_eq!(pipeline.writer().store().count_holdings().unwrap(), 2);
}

#[test]
fn test_restart_does_not_duplicate_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("filings.db");
    let filing = Listed {
        cik: "3333333",
        accession: "0003333333-24-000001",
        updated: minutes_ago(5),
    };

    let harness = Harness::new();
    list(&harness.upstream, &[&filing]);
    publish(&harness.upstream, &filing);

    {
        let mut pipeline = harness.pipeline(Store::open(&db_path).unwrap(), &["3333333"]);
        assert_eq!(pipeline.run_tick().unwrap().persisted, 1);
    }

    // a fresh process seeds dedup from the store
    let mut restarted = harness.pipeline(Store::open(&db_path).unwrap(), &["3333333"]);
    assert!(restarted.dedup().seen(filing.accession));
    let report = restarted.run_tick().unwrap();

    assert_eq!(report.skipped_seen, 1);
    assert_eq!(report.persisted, 0);
    let store = restarted.writer().store();
    assert_eq!(store.count_filings().unwrap(), 1);
    assert_eq!(store.count_holdings().unwrap(), 2);
    assert!(store.load_high_water_mark().unwrap().is_some());
}

#[test]
fn test_breaker_opens_on_unavailable_upstream_then_admits_one_trial() {
    let harness = Harness::new();
    harness.upstream.respond(&feed_page_url(10), 503, "slow down");
    let breaker = BreakerConfig {
        failure_ratio: 0.5,
        min_calls: 5,
        window: Duration::from_secs(60),
        cooldown: Duration::from_millis(300),
        max_cooldown: Duration::from_secs(5),
    };
    let mut pipeline = harness.pipeline_with(
        Store::open_in_memory().unwrap(),
        &["1111111"],
        breaker,
        discovery_config(10, 3),
    );

    for tick in 1..=5 {
        let err = pipeline.run_tick().unwrap_err();
        assert!(err.is_transient(), "tick {}: {}", tick, err);
        assert_eq!(harness.upstream.calls().len(), tick);
    }
    assert_eq!(pipeline.client().breaker().state(), BreakerState::Open);

    // open circuit: the tick is degraded and touches nothing
    let degraded = pipeline.run_tick().unwrap();
    assert!(degraded.degraded);
    assert_eq!(harness.upstream.calls().len(), 5);

    thread::sleep(Duration::from_millis(350));
    assert!(pipeline.run_tick().is_err());
    assert_eq!(harness.upstream.calls().len(), 6, "exactly one trial call");
    assert_eq!(pipeline.client().breaker().state(), BreakerState::Open);
    assert_eq!(pipeline.client().breaker().cooldown(), Duration::from_millis(600));

    // neither failed nor degraded ticks count as alive
    assert_eq!(harness.pings.load(Ordering::SeqCst), 0);
}

/// Wraps the real parser and corrupts one filing's first CUSIP
struct CorruptingParser {
    inner: InformationTableParser,
    target: &'static str,
}

impl HoldingsParser for CorruptingParser {
    fn parse(&self, document: &FilingDocument) -> Result<ParsedFiling, ParseError> {
        let mut parsed = self.inner.parse(document)?;
        if parsed.filing.accession_number == self.target {
            parsed.holdings[0].cusip = "0378331000X".to_string();
        }
        Ok(parsed)
    }
}

#[test]
fn test_constraint_violation_quarantines_only_that_filing() {
    let harness = Harness::new();
    let good = Listed {
        cik: "1111111",
        accession: "0001111111-24-000003",
        updated: minutes_ago(20),
    };
    let bad = Listed {
        cik: "2222222",
        accession: "0002222222-24-000003",
        updated: minutes_ago(10),
    };
    list(&harness.upstream, &[&bad, &good]);
    publish(&harness.upstream, &good);
    publish(&harness.upstream, &bad);

    let mut pipeline = harness
        .pipeline(Store::open_in_memory().unwrap(), &["1111111", "2222222"])
        .with_parser(Box::new(CorruptingParser {
            inner: InformationTableParser::new(),
            target: bad.accession,
        }));

    let report = pipeline.run_tick().unwrap();
    assert_eq!(report.parsed, 2);
    assert_eq!(report.persisted, 1);
    assert_eq!(report.quarantined, 1);

    let store = pipeline.writer().store();
    assert!(store.filing_exists(good.accession).unwrap());
    assert!(!store.filing_exists(bad.accession).unwrap());
    assert_eq!(store.count_holdings().unwrap(), 2);
    assert!(!pipeline.dedup().seen(bad.accession));

    // the quarantined filing is not retried within this process
    let again = pipeline.run_tick().unwrap();
    assert_eq!(again.skipped_rejected, 1);
    assert_eq!(again.parsed, 0);
}

#[test]
fn test_transient_failure_holds_the_mark_and_retries() {
    let harness = Harness::new();
    let flaky = Listed {
        cik: "1111111",
        accession: "0001111111-24-000004",
        updated: minutes_ago(20),
    };
    let steady = Listed {
        cik: "1111111",
        accession: "0001111111-24-000005",
        updated: minutes_ago(10),
    };
    list(&harness.upstream, &[&steady, &flaky]);
    publish(&harness.upstream, &steady);
    // first request for the index fails, later ones succeed
    harness
        .upstream
        .respond(&format!("{}/index.json", directory(&flaky)), 502, "bad gateway");
    publish(&harness.upstream, &flaky);

    let mut pipeline = harness.pipeline(Store::open_in_memory().unwrap(), &["1111111"]);
    let first = pipeline.run_tick().unwrap();
    assert_eq!(first.persisted, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.high_water_mark, Some(flaky.updated));
    assert_eq!(
        pipeline.writer().store().load_high_water_mark().unwrap(),
        Some(flaky.updated)
    );

    let second = pipeline.run_tick().unwrap();
    assert_eq!(second.persisted, 1);
    assert_eq!(second.skipped_seen, 1);
    assert_eq!(second.high_water_mark, Some(steady.updated));
    assert!(pipeline.writer().store().filing_exists(flaky.accession).unwrap());
}

#[test]
fn test_truncated_discovery_keeps_the_mark() {
    let harness = Harness::new();
    let filing = Listed {
        cik: "1111111",
        accession: "0001111111-24-000006",
        updated: minutes_ago(15),
    };
    // one full page and no more pages allowed: older entries may exist
    let page_url = feed_page_url(1);
    harness.upstream.respond(&page_url, 200, &feed(&[entry(&filing)]));
    publish(&harness.upstream, &filing);

    let mut pipeline = harness.pipeline_with(
        Store::open_in_memory().unwrap(),
        &["1111111"],
        BreakerConfig::default(),
        discovery_config(1, 1),
    );
    let report = pipeline.run_tick().unwrap();

    assert_eq!(report.persisted, 1);
    assert!(report.truncated);
    assert_eq!(pipeline.writer().store().load_high_water_mark().unwrap(), None);

    // still truncated on the next tick; the mark stays put
    let again = pipeline.run_tick().unwrap();
    assert!(again.truncated);
    assert_eq!(again.skipped_seen, 1);
    assert_eq!(pipeline.writer().store().load_high_water_mark().unwrap(), None);
}

#[test]
fn test_malformed_feed_entries_are_counted_and_skipped() {
    let harness = Harness::new();
    let filing = Listed {
        cik: "1111111",
        accession: "0001111111-24-000008",
        updated: minutes_ago(20),
    };
    let garbled = entry(&Listed {
        cik: "1111111",
        accession: "0001111111-24-000009",
        updated: minutes_ago(25),
    })
    .replace("13F-HR - FILER", "garbled heading without a CIK");
    harness
        .upstream
        .respond(&feed_page_url(10), 200, &feed(&[entry(&filing), garbled]));
    publish(&harness.upstream, &filing);

    let mut pipeline = harness.pipeline(Store::open_in_memory().unwrap(), &["1111111"]);
    let report = pipeline.run_tick().unwrap();

    assert_eq!(report.discovered, 1);
    assert_eq!(report.feed_entries_skipped, 1);
    assert_eq!(report.persisted, 1);
    assert!(!report.truncated);
    assert!(!pipeline.writer().store().filing_exists("0001111111-24-000009").unwrap());
}

#[test]
fn test_empty_watchlist_skips_discovery() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(Store::open_in_memory().unwrap(), &[]);

    let report = pipeline.run_tick().unwrap();
    assert_eq!(report, TickReport::default());
    assert!(harness.upstream.calls().is_empty());
    assert_eq!(harness.pings.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_leaves_work_for_the_next_run() {
    let harness = Harness::new();
    let filing = Listed {
        cik: "1111111",
        accession: "0001111111-24-000007",
        updated: minutes_ago(5),
    };
    list(&harness.upstream, &[&filing]);
    publish(&harness.upstream, &filing);

    let mut pipeline = harness.pipeline(Store::open_in_memory().unwrap(), &["1111111"]);
    harness.shutdown.trigger();

    let report = pipeline.run_tick().unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.persisted, 0);
    assert_eq!(harness.upstream.archive_calls(), 0);
    assert_eq!(pipeline.writer().store().count_filings().unwrap(), 0);

    // the loop notices the signal before starting a tick
    let calls = harness.upstream.calls().len();
    pipeline.run().unwrap();
    assert_eq!(harness.upstream.calls().len(), calls);
}
