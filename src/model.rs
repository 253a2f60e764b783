// 📄 Filing Model - Filings, holdings and the candidates discovery hands out
// Identity of a filing is its accession number; everything else is a value

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// FORM TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormType {
    /// Quarterly institutional holdings report
    #[serde(rename = "13F-HR")]
    HoldingsReport,

    /// Amendment to a holdings report
    #[serde(rename = "13F-HR/A")]
    HoldingsAmendment,
}

impl FormType {
    pub const ALL: [FormType; 2] = [FormType::HoldingsReport, FormType::HoldingsAmendment];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormType::HoldingsReport => "13F-HR",
            FormType::HoldingsAmendment => "13F-HR/A",
        }
    }

    /// Parse the form string used by EDGAR (case-insensitive)
    pub fn parse(value: &str) -> Option<FormType> {
        match value.trim().to_uppercase().as_str() {
            "13F-HR" => Some(FormType::HoldingsReport),
            "13F-HR/A" => Some(FormType::HoldingsAmendment),
            _ => None,
        }
    }

    pub fn is_amendment(&self) -> bool {
        matches!(self, FormType::HoldingsAmendment)
    }
}

impl fmt::Display for FormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CIK
// ============================================================================

/// Normalize a CIK to the 10-digit zero-padded form EDGAR uses.
///
/// Accepts 1-10 ASCII digits (surrounding whitespace ignored). Anything else
/// is not a CIK and yields `None`.
pub fn normalize_cik(raw: &str) -> Option<String> {
    let digits = raw.trim();
    if digits.is_empty() || digits.len() > 10 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{:0>10}", digits))
}

/// CIK without leading zeros, as used in archive paths
pub fn cik_path_segment(cik: &str) -> &str {
    let trimmed = cik.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

// ============================================================================
// FILING CANDIDATE (discovery output)
// ============================================================================

/// A feed entry that may be worth ingesting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingCandidate {
    pub accession_number: String,
    pub cik: String,
    pub company_name: String,
    pub form_type: FormType,
    pub filing_date: NaiveDate,

    /// Feed timestamp; drives the high-water mark
    pub updated: DateTime<Utc>,

    /// Filing index page on EDGAR
    pub index_url: String,
}

impl FilingCandidate {
    /// Accession number without dashes ("0001234567-24-000001" -> "000123456724000001")
    pub fn accession_number_short(&self) -> String {
        self.accession_number.replace('-', "")
    }
}

// ============================================================================
// FILING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmendmentType {
    /// Amendment replaces the whole report
    Restatement,

    /// Amendment only adds holdings missing from the original report
    NewHoldings,
}

impl AmendmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmendmentType::Restatement => "RESTATEMENT",
            AmendmentType::NewHoldings => "NEW HOLDINGS",
        }
    }

    pub fn parse(value: &str) -> Option<AmendmentType> {
        let upper = value.trim().to_uppercase();
        match upper.as_str() {
            "RESTATEMENT" => Some(AmendmentType::Restatement),
            "NEW HOLDINGS" | "NEW_HOLDINGS" | "NEWHOLDINGS" => Some(AmendmentType::NewHoldings),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filing {
    // ========================================================================
    // IDENTITY (assigned by the source, never changes)
    // ========================================================================
    pub accession_number: String,

    // ========================================================================
    // VALUES
    // ========================================================================
    pub cik: String,
    pub company_name: String,
    pub form_type: FormType,
    pub filing_date: NaiveDate,
    pub period_of_report: Option<NaiveDate>,
    pub report_quarter: Option<NaiveDate>,
    pub amendment_type: Option<AmendmentType>,
    pub file_number: Option<String>,

    /// Holdings count the filer declared on the summary page
    pub declared_entry_total: Option<u64>,
    pub declared_value_total: Option<i64>,

    pub source_url: String,

    /// When this filing entered our store
    pub ingested_at: DateTime<Utc>,
}

impl Filing {
    /// Filing carrying only what the feed told us
    pub fn from_candidate(candidate: &FilingCandidate) -> Self {
        Filing {
            accession_number: candidate.accession_number.clone(),
            cik: candidate.cik.clone(),
            company_name: candidate.company_name.clone(),
            form_type: candidate.form_type,
            filing_date: candidate.filing_date,
            period_of_report: None,
            report_quarter: None,
            amendment_type: None,
            file_number: None,
            declared_entry_total: None,
            declared_value_total: None,
            source_url: candidate.index_url.clone(),
            ingested_at: Utc::now(),
        }
    }
}

// ============================================================================
// HOLDING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareType {
    /// SH
    Shares,
    /// PRN
    Principal,
}

impl ShareType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareType::Shares => "SH",
            ShareType::Principal => "PRN",
        }
    }

    pub fn parse(value: &str) -> Option<ShareType> {
        match value.trim().to_uppercase().as_str() {
            "SH" => Some(ShareType::Shares),
            "PRN" => Some(ShareType::Principal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutCall {
    Put,
    Call,
}

impl PutCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            PutCall::Put => "PUT",
            PutCall::Call => "CALL",
        }
    }

    pub fn parse(value: &str) -> Option<PutCall> {
        match value.trim().to_uppercase().as_str() {
            "PUT" => Some(PutCall::Put),
            "CALL" => Some(PutCall::Call),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvestmentDiscretion {
    /// SOLE
    Sole,
    /// DFND - shared-defined
    Defined,
    /// OTR - shared-other
    Other,
}

impl InvestmentDiscretion {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentDiscretion::Sole => "SOLE",
            InvestmentDiscretion::Defined => "DFND",
            InvestmentDiscretion::Other => "OTR",
        }
    }

    pub fn parse(value: &str) -> Option<InvestmentDiscretion> {
        match value.trim().to_uppercase().as_str() {
            "SOLE" => Some(InvestmentDiscretion::Sole),
            "DFND" => Some(InvestmentDiscretion::Defined),
            "OTR" => Some(InvestmentDiscretion::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingAuthority {
    pub sole: i64,
    pub shared: i64,
    pub none: i64,
}

/// One row of a filing's information table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub issuer_name: String,
    pub title_of_class: String,
    pub cusip: String,

    /// Market value in the units the filer reported
    pub value: i64,
    pub shares_or_principal_amount: i64,
    pub share_type: ShareType,
    pub put_call: Option<PutCall>,
    pub investment_discretion: InvestmentDiscretion,
    pub other_manager: Option<String>,
    pub voting: VotingAuthority,
}

/// A filing together with the holdings it owns - the unit of persistence
#[derive(Debug, Clone, PartialEq)]
pub struct FilingRecord {
    pub filing: Filing,
    pub holdings: Vec<Holding>,
}

// ============================================================================
// TESTS
// ============================================================================
