// 🏗️ Filing Parser - 13F primary document + information table → Filing, Holdings
//
// Filers produce these XML files with many tools, so parsing is tolerant:
// namespace prefixes and element case are ignored, fields are looked up
// anywhere below their row, and amounts may carry separators or decimals.

use chrono::NaiveDate;
use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::fetch::{FetchClient, FetchError};
use crate::model::{
    cik_path_segment, AmendmentType, Filing, FilingCandidate, Holding, InvestmentDiscretion,
    PutCall, ShareType, VotingAuthority,
};
use crate::xml::{parse_document, XmlError, XmlNode};

const PRIMARY_DOC: &str = "primary_doc.xml";
const MAX_ISSUER_NAME: usize = 255;
const MAX_CUSIP: usize = 9;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Raw documents of one filing, as downloaded
#[derive(Debug, Clone, PartialEq)]
pub struct FilingDocument {
    pub candidate: FilingCandidate,

    /// Cover page and summary (`primary_doc.xml`)
    pub primary_doc: Option<String>,

    /// Information table: one `infoTable` element per holding
    pub info_table: Option<String>,
}

/// A row that failed validation and was left out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    /// 1-based position in the information table
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFiling {
    pub filing: Filing,
    pub holdings: Vec<Holding>,
    pub skipped_rows: Vec<SkippedRow>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("{document} is not well-formed: {source}")]
    Xml {
        document: &'static str,
        #[source]
        source: XmlError,
    },

    #[error("filing declares {declared} holding(s) but has no information table")]
    MissingInfoTable { declared: u64 },

    #[error("no valid holdings extracted ({rows} row(s) present, {declared:?} declared)")]
    NoHoldings { rows: usize, declared: Option<u64> },
}

// ============================================================================
// PARSER TRAIT
// ============================================================================

/// HoldingsParser - turns downloaded documents into a persistable filing.
///
/// The orchestrator only sees this trait, so a different document vintage
/// (or a test double) plugs in without touching the pipeline.
pub trait HoldingsParser: Send + Sync {
    fn parse(&self, document: &FilingDocument) -> Result<ParsedFiling, ParseError>;

    /// Parser version (for debugging)
    fn version(&self) -> &str {
        "1.0.0"
    }
}

/// Parser for the XML information-table format EDGAR has required since 2013
#[derive(Debug, Clone, Copy, Default)]
pub struct InformationTableParser;

impl InformationTableParser {
    pub fn new() -> Self {
        InformationTableParser
    }
}

impl HoldingsParser for InformationTableParser {
    fn parse(&self, document: &FilingDocument) -> Result<ParsedFiling, ParseError> {
        let mut filing = Filing::from_candidate(&document.candidate);

        if let Some(primary) = &document.primary_doc {
            let root = parse_document(primary).map_err(|source| ParseError::Xml {
                document: "primary document",
                source,
            })?;
            apply_cover_page(&mut filing, &root);
        }

        let declared = filing.declared_entry_total;

        let info_table = match &document.info_table {
            Some(xml) => xml,
            None => {
                return match declared {
                    Some(n) if n > 0 => Err(ParseError::MissingInfoTable { declared: n }),
                    // a filer with nothing to report still files
                    _ => Ok(ParsedFiling {
                        filing,
                        holdings: Vec::new(),
                        skipped_rows: Vec::new(),
                    }),
                };
            }
        };

        let root = parse_document(info_table).map_err(|source| ParseError::Xml {
            document: "information table",
            source,
        })?;

        let rows = root.find_all("infoTable");
        let mut holdings = Vec::with_capacity(rows.len());
        let mut skipped_rows = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            match parse_row(row) {
                Ok(holding) => holdings.push(holding),
                Err(reason) => {
                    debug!(
                        "{} row {} skipped: {}",
                        filing.accession_number,
                        index + 1,
                        reason
                    );
                    skipped_rows.push(SkippedRow {
                        row: index + 1,
                        reason,
                    });
                }
            }
        }

        if holdings.is_empty() {
            let suspicious = match declared {
                Some(n) => n > 0,
                None => !rows.is_empty(),
            };
            if suspicious {
                return Err(ParseError::NoHoldings {
                    rows: rows.len(),
                    declared,
                });
            }
        }

        Ok(ParsedFiling {
            filing,
            holdings,
            skipped_rows,
        })
    }
}

// ============================================================================
// COVER PAGE / SUMMARY
// ============================================================================

fn apply_cover_page(filing: &mut Filing, root: &XmlNode) {
    filing.period_of_report = root.text_of("periodOfReport").and_then(parse_date);
    filing.report_quarter = root.text_of("reportCalendarOrQuarter").and_then(parse_date);
    filing.amendment_type = root.text_of("amendmentType").and_then(AmendmentType::parse);
    filing.file_number = root.text_of("form13FFileNumber").map(str::to_string);

    if let Some(name) = root.find("filingManager").and_then(|m| m.text_of("name")) {
        filing.company_name = name.to_string();
    }

    filing.declared_entry_total = root
        .text_of("tableEntryTotal")
        .and_then(parse_amount)
        .map(|n| n as u64);
    filing.declared_value_total = root.text_of("tableValueTotal").and_then(parse_amount);
}

/// EDGAR dates appear as 03-31-2024, 2024-03-31 or 03/31/2024
fn parse_date(raw: &str) -> Option<NaiveDate> {
    ["%m-%d-%Y", "%Y-%m-%d", "%m/%d/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw.trim(), fmt).ok())
}

/// Non-negative integer amount; "1,234", "1234.0" and "1234.9" all read as 1234
pub fn parse_amount(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() || value < 0.0 || value > i64::MAX as f64 {
        return None;
    }
    Some(value.trunc() as i64)
}

// ============================================================================
// INFORMATION TABLE ROWS
// ============================================================================

fn required<'a>(row: &'a XmlNode, field: &str) -> Result<&'a str, String> {
    row.text_of(field).ok_or_else(|| format!("missing {}", field))
}

fn parse_row(row: &XmlNode) -> Result<Holding, String> {
    let issuer_name = required(row, "nameOfIssuer")?;
    if issuer_name.chars().count() > MAX_ISSUER_NAME {
        return Err(format!("issuer name longer than {} characters", MAX_ISSUER_NAME));
    }

    let cusip = required(row, "cusip")?.to_uppercase();
    if cusip.len() > MAX_CUSIP {
        return Err(format!("CUSIP {:?} longer than {} characters", cusip, MAX_CUSIP));
    }

    let title_of_class = required(row, "titleOfClass")?;

    let value = parse_amount(required(row, "value")?)
        .ok_or_else(|| "invalid value".to_string())?;
    let shares_or_principal_amount = parse_amount(required(row, "sshPrnamt")?)
        .ok_or_else(|| "invalid sshPrnamt".to_string())?;

    let share_type_raw = required(row, "sshPrnamtType")?;
    let share_type = ShareType::parse(share_type_raw)
        .ok_or_else(|| format!("invalid share type {:?}", share_type_raw))?;

    let discretion_raw = required(row, "investmentDiscretion")?;
    let investment_discretion = InvestmentDiscretion::parse(discretion_raw)
        .ok_or_else(|| format!("invalid investment discretion {:?}", discretion_raw))?;

    let put_call = match row.text_of("putCall") {
        Some(raw) => Some(PutCall::parse(raw).ok_or_else(|| format!("invalid putCall {:?}", raw))?),
        None => None,
    };

    Ok(Holding {
        issuer_name: issuer_name.to_string(),
        title_of_class: title_of_class.to_string(),
        cusip,
        value,
        shares_or_principal_amount,
        share_type,
        put_call,
        investment_discretion,
        other_manager: row.text_of("otherManager").map(str::to_string),
        voting: parse_voting(row),
    })
}

/// Missing or unreadable voting authority counts as all zeros
fn parse_voting(row: &XmlNode) -> VotingAuthority {
    let Some(node) = row.find("votingAuthority") else {
        return VotingAuthority::default();
    };
    let field = |name: &str| node.text_of(name).map_or(Some(0), parse_amount);

    match (field("Sole"), field("Shared"), field("None")) {
        (Some(sole), Some(shared), Some(none)) => VotingAuthority { sole, shared, none },
        _ => VotingAuthority::default(),
    }
}

// ============================================================================
// DOCUMENT RETRIEVAL
// ============================================================================

#[derive(Debug, Error, Clone)]
pub enum DocumentError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unreadable filing index {url}: {message}")]
    Index { url: String, message: String },
}

#[derive(Debug, Deserialize)]
struct DirectoryListing {
    directory: Directory,
}

#[derive(Debug, Deserialize)]
struct Directory {
    #[serde(default)]
    item: Vec<DirectoryItem>,
}

#[derive(Debug, Deserialize)]
struct DirectoryItem {
    name: String,
}

/// Filing directory on the archives host
pub fn filing_directory_url(archives_base: &str, candidate: &FilingCandidate) -> String {
    format!(
        "{}/{}/{}",
        archives_base.trim_end_matches('/'),
        cik_path_segment(&candidate.cik),
        candidate.accession_number_short()
    )
}

/// Download the primary document and the information table of one filing
pub fn fetch_document(
    client: &FetchClient,
    archives_base: &str,
    candidate: &FilingCandidate,
) -> Result<FilingDocument, DocumentError> {
    let directory = filing_directory_url(archives_base, candidate);
    let index_url = format!("{}/index.json", directory);

    let listing: DirectoryListing = serde_json::from_str(&client.get_text(&index_url)?)
        .map_err(|e| DocumentError::Index {
            url: index_url.clone(),
            message: e.to_string(),
        })?;

    let names: Vec<&str> = listing
        .directory
        .item
        .iter()
        .map(|item| item.name.as_str())
        .collect();
    let primary_name = names
        .iter()
        .find(|name| name.eq_ignore_ascii_case(PRIMARY_DOC))
        .copied();
    let table_name = names
        .iter()
        .find(|name| {
            let lower = name.to_ascii_lowercase();
            lower.ends_with(".xml") && !lower.contains("primary_doc")
        })
        .copied();

    let primary_doc = match primary_name {
        Some(name) => Some(client.get_text(&format!("{}/{}", directory, name))?),
        None => None,
    };
    let info_table = match table_name {
        Some(name) => Some(client.get_text(&format!("{}/{}", directory, name))?),
        None => None,
    };

    Ok(FilingDocument {
        candidate: candidate.clone(),
        primary_doc,
        info_table,
    })
}

// ============================================================================
// TESTS
// ============================================================================
