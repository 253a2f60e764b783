// 🛰️ Filing Discovery - walk the EDGAR "current filings" Atom feed
//
// The feed is newest first. A pass pages through it lazily and stops at a
// short page, at the first entry older than `since`, or at `max_pages`.

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

use crate::fetch::{FetchClient, FetchError};
use crate::model::{normalize_cik, FilingCandidate, FormType};
use crate::xml::{parse_document, XmlNode};

/// "13F-HR - EXAMPLE CAPITAL LLC (0001234567) (Filer)"
static TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\S+)\s+-\s+(.+?)\s+\((\d{1,10})\)\s*(?:\([^)]*\))?\s*$")
        .expect("title pattern is valid")
});

static ACCESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{10}-\d{2}-\d{6})").expect("accession pattern is valid"));

static FILED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Filed:\D*(\d{4}-\d{2}-\d{2})").expect("filed pattern is valid"));

#[derive(Debug, Error, Clone)]
pub enum DiscoveryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unreadable feed page {url}: {message}")]
    Feed { url: String, message: String },
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// `browse-edgar` endpoint
    pub feed_url: String,
    pub page_size: usize,
    pub max_pages: usize,
    pub forms: Vec<FormType>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            feed_url: "https://www.sec.gov/cgi-bin/browse-edgar".to_string(),
            page_size: 100,
            max_pages: 10,
            forms: FormType::ALL.to_vec(),
        }
    }
}

pub struct Discovery {
    client: Arc<FetchClient>,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(client: Arc<FetchClient>, config: DiscoveryConfig) -> Self {
        Discovery { client, config }
    }

    pub fn page_url(&self, form: FormType, page: usize) -> String {
        format!(
            "{}?action=getcurrent&type={}&company=&dateb=&owner=include&start={}&count={}&output=atom",
            self.config.feed_url,
            urlencoding::encode(form.as_str()),
            page * self.config.page_size,
            self.config.page_size
        )
    }

    /// Lazy, finite stream of candidates filed at or after `since`
    pub fn discover(&self, since: DateTime<Utc>) -> DiscoveryPass<'_> {
        DiscoveryPass {
            discovery: self,
            since,
            form_index: 0,
            page: 0,
            buffer: VecDeque::new(),
            yielded: HashSet::new(),
            finished: false,
            truncated: false,
            pages_fetched: 0,
            entries_skipped: 0,
        }
    }
}

pub struct DiscoveryPass<'a> {
    discovery: &'a Discovery,
    since: DateTime<Utc>,
    form_index: usize,
    page: usize,
    buffer: VecDeque<FilingCandidate>,
    yielded: HashSet<String>,
    finished: bool,
    truncated: bool,
    pages_fetched: usize,
    entries_skipped: usize,
}

impl DiscoveryPass<'_> {
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// A form's feed was cut off by `max_pages` before reaching `since`;
    /// older entries inside the window were never seen.
    ///
    /// The pipeline holds its high-water mark while this is set, so a window
    /// busier than `max_pages * page_size` entries keeps the mark pinned
    /// until the feed volume drops or the limits are raised.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Feed entries that could not be turned into candidates
    pub fn entries_skipped(&self) -> usize {
        self.entries_skipped
    }

    fn fill(&mut self) -> Result<(), DiscoveryError> {
        let config = &self.discovery.config;
        let Some(&form) = config.forms.get(self.form_index) else {
            self.finished = true;
            return Ok(());
        };

        let url = self.discovery.page_url(form, self.page);
        let body = self.discovery.client.get_text(&url)?;
        self.pages_fetched += 1;

        let root = parse_document(&body).map_err(|e| DiscoveryError::Feed {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let entries = root.find_all("entry");

        let mut reached_since = false;
        for entry in &entries {
            let candidate = match normalize_entry(entry) {
                Ok(candidate) => candidate,
                Err(reason) => {
                    warn!("skipping feed entry on {}: {}", url, reason);
                    self.entries_skipped += 1;
                    continue;
                }
            };
            if candidate.updated < self.since {
                reached_since = true;
                break;
            }
            if !config.forms.contains(&candidate.form_type) {
                continue;
            }
            // page drift can list the same filing twice
            if self.yielded.insert(candidate.accession_number.clone()) {
                self.buffer.push_back(candidate);
            }
        }

        let short_page = entries.len() < config.page_size;
        let out_of_pages = self.page + 1 >= config.max_pages;
        debug!(
            "feed {} page {}: {} entries, {} queued",
            form,
            self.page,
            entries.len(),
            self.buffer.len()
        );

        if reached_since || short_page || out_of_pages {
            if out_of_pages && !reached_since && !short_page {
                self.truncated = true;
                warn!("{} feed still has entries after {} pages; rest left for the next tick", form, config.max_pages);
            }
            self.form_index += 1;
            self.page = 0;
        } else {
            self.page += 1;
        }
        Ok(())
    }
}

impl Iterator for DiscoveryPass<'_> {
    type Item = Result<FilingCandidate, DiscoveryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(candidate) = self.buffer.pop_front() {
                return Some(Ok(candidate));
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.fill() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

// ============================================================================
// ENTRY NORMALIZATION
// ============================================================================

/// Turn one Atom `<entry>` into a candidate, or explain why not
pub fn normalize_entry(entry: &XmlNode) -> Result<FilingCandidate, String> {
    let title = entry.text_of("title").ok_or("entry has no title")?;
    let caps = TITLE
        .captures(title)
        .ok_or_else(|| format!("unrecognized title {:?}", title))?;

    let form_raw = entry
        .find("category")
        .and_then(|c| c.attr("term"))
        .unwrap_or(&caps[1]);
    let form_type =
        FormType::parse(form_raw).ok_or_else(|| format!("unsupported form {:?}", form_raw))?;

    let cik = normalize_cik(&caps[3]).ok_or_else(|| format!("bad CIK in {:?}", title))?;
    let company_name = caps[2].trim().to_string();

    let index_url = entry
        .find("link")
        .and_then(|l| l.attr("href"))
        .unwrap_or_default()
        .to_string();

    let accession_number = entry
        .text_of("id")
        .and_then(|id| id.split("accession-number=").nth(1))
        .and_then(|tail| ACCESSION.captures(tail))
        .or_else(|| ACCESSION.captures(&index_url))
        .map(|c| c[1].to_string())
        .ok_or_else(|| format!("no accession number for {:?}", title))?;

    let updated_raw = entry.text_of("updated").ok_or("entry has no updated timestamp")?;
    let updated = DateTime::parse_from_rfc3339(updated_raw)
        .map_err(|e| format!("bad timestamp {:?}: {}", updated_raw, e))?
        .with_timezone(&Utc);

    let filing_date = entry
        .text_of("summary")
        .and_then(|s| FILED.captures(s))
        .and_then(|c| NaiveDate::parse_from_str(&c[1], "%Y-%m-%d").ok())
        .unwrap_or_else(|| updated.date_naive());

    Ok(FilingCandidate {
        accession_number,
        cik,
        company_name,
        form_type,
        filing_date,
        updated,
        index_url,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{
        BreakerConfig, CircuitBreaker, FetchConfig, FetchRequest, FetchResponse, HttpTransport,
        RateLimiter, TransportError,
    };
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn entry_xml(form: &str, name: &str, cik: &str, accession: &str, updated: &str) -> String {
        let short = accession.replace('-', "");
        format!(
            r#"<entry>
  <title>{form} - {name} ({cik}) (Filer)</title>
  <link rel="alternate" type="text/html" href="https://www.sec.gov/Archives/edgar/data/{cik}/{short}/{accession}-index.htm"/>
  <summary type="html"> &lt;b&gt;Filed:&lt;/b&gt; {date} &lt;b&gt;AccNo:&lt;/b&gt; {accession} &lt;b&gt;Size:&lt;/b&gt; 25 KB</summary>
  <updated>{updated}</updated>
  <category scheme="https://www.sec.gov/" label="form type" term="{form}"/>
  <id>urn:tag:sec.gov,2008:accession-number={accession}</id>
</entry>"#,
            date = &updated[..10],
        )
    }

    fn feed(entries: &[String]) -> String {
        format!(
            r#"<?xml version="1.0" encoding="ISO-8859-1" ?><feed xmlns="http://www.w3.org/2005/Atom"><title>Latest Filings</title>{}</feed>"#,
            entries.join("")
        )
    }

    #[derive(Default)]
    struct Pages {
        by_url: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl HttpTransport for Arc<Pages> {
        fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
            self.calls.lock().unwrap().push(request.url.clone());
            let body = self
                .by_url
                .lock()
                .unwrap()
                .get(&request.url)
                .cloned()
                .unwrap_or_else(|| feed(&[]));
            Ok(FetchResponse::new(200, body))
        }
    }

    fn discovery(pages: Arc<Pages>, page_size: usize, forms: Vec<FormType>) -> Discovery {
        let client = FetchClient::new(
            Box::new(pages),
            RateLimiter::per_second(1000),
            CircuitBreaker::new(BreakerConfig::default()),
            FetchConfig::new("Example Research ops@example.com"),
        );
        Discovery::new(
            Arc::new(client),
            DiscoveryConfig {
                feed_url: "https://feed.test/browse".to_string(),
                page_size,
                max_pages: 3,
                forms,
            },
        )
    }

    #[test]
    fn test_normalize_entry() {
        let xml = entry_xml(
            "13F-HR",
            "EXAMPLE CAPITAL LLC",
            "1234567",
            "0001234567-24-000001",
            "2024-05-15T16:30:12-04:00",
        );
        let root = parse_document(&xml).unwrap();
        let candidate = normalize_entry(root.find("entry").unwrap()).unwrap();

        assert_eq!(candidate.cik, "0001234567");
        assert_eq!(candidate.company_name, "EXAMPLE CAPITAL LLC");
        assert_eq!(candidate.accession_number, "0001234567-24-000001");
        assert_eq!(candidate.form_type, FormType::HoldingsReport);
        assert_eq!(candidate.filing_date, NaiveDate::from_ymd_opt(2024, 5, 15).unwrap());
        assert_eq!(
            candidate.updated,
            Utc.with_ymd_and_hms(2024, 5, 15, 20, 30, 12).unwrap()
        );
    }

    #[test]
    fn test_other_forms_are_rejected() {
        let xml = entry_xml("10-K", "ACME", "1", "0000000001-24-000001", "2024-05-15T16:30:12-04:00");
        let root = parse_document(&xml).unwrap();
        assert!(normalize_entry(root.find("entry").unwrap()).is_err());
    }

    #[test]
    fn test_pass_stops_at_since_and_dedupes() {
        let pages = Arc::new(Pages::default());
        let d = discovery(pages.clone(), 3, vec![FormType::HoldingsReport]);
        let page0 = feed(&[
            entry_xml("13F-HR", "A", "1", "0000000001-24-000003", "2024-05-15T12:00:00Z"),
            entry_xml("13F-HR", "B", "2", "0000000002-24-000002", "2024-05-15T11:00:00Z"),
            entry_xml("13F-HR", "B", "2", "0000000002-24-000002", "2024-05-15T11:00:00Z"),
        ]);
        let page1 = feed(&[
            entry_xml("13F-HR", "C", "3", "0000000003-24-000001", "2024-05-15T10:00:00Z"),
            entry_xml("13F-HR", "D", "4", "0000000004-24-000001", "2024-05-15T09:00:00Z"),
            entry_xml("13F-HR", "E", "5", "0000000005-24-000001", "2024-05-15T08:00:00Z"),
        ]);
        pages.by_url.lock().unwrap().insert(d.page_url(FormType::HoldingsReport, 0), page0);
        pages.by_url.lock().unwrap().insert(d.page_url(FormType::HoldingsReport, 1), page1);

        let since = Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap();
        let found: Vec<String> = d
            .discover(since)
            .map(|c| c.unwrap().accession_number)
            .collect();

        assert_eq!(
            found,
            vec![
                "0000000001-24-000003".to_string(),
                "0000000002-24-000002".to_string(),
                "0000000003-24-000001".to_string(),
            ]
        );
        assert_eq!(pages.calls.lock().unwrap().len(), 2, "stopped before page 2");

        let mut pass = d.discover(since);
        pass.by_ref().for_each(drop);
        assert!(!pass.truncated());
    }

    #[test]
    fn test_pass_is_bounded_by_max_pages() {
        let pages = Arc::new(Pages::default());
        let d = discovery(pages.clone(), 1, FormType::ALL.to_vec());
        for (form, base) in [(FormType::HoldingsReport, 1), (FormType::HoldingsAmendment, 5)] {
            for page in 0..5 {
                let acc = format!("00000000{:02}-24-000001", base + page);
                let body = feed(&[entry_xml(form.as_str(), "X", "9", &acc, "2024-05-15T12:00:00Z")]);
                pages.by_url.lock().unwrap().insert(d.page_url(form, page), body);
            }
        }

        let since = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let count = d.discover(since).filter(|c| c.is_ok()).count();

        assert_eq!(pages.calls.lock().unwrap().len(), 6, "3 pages per form");
        assert_eq!(count, 6);

        let mut pass = d.discover(since);
        pass.by_ref().for_each(drop);
        assert!(pass.truncated());
    }

    #[test]
    fn test_page_url_encodes_form() {
        let d = discovery(Arc::new(Pages::default()), 100, FormType::ALL.to_vec());
        let url = d.page_url(FormType::HoldingsAmendment, 2);
        assert!(url.contains("type=13F-HR%2FA"));
        assert!(url.contains("start=200&count=100"));
    }
}
