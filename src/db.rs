use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::model::{
    AmendmentType, Filing, FilingRecord, FormType, Holding, InvestmentDiscretion, PutCall,
    ShareType, VotingAuthority,
};
use crate::persistence::AmendmentPolicy;

const HIGH_WATER_MARK_KEY: &str = "high_water_mark";
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Event for audit trail: every persisted or quarantined filing leaves one
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// A record the store refused (constraint violation); the rest of its batch committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quarantined {
    pub accession_number: String,
    pub reason: String,
}

/// What one committed batch transaction did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub committed: Vec<String>,
    pub quarantined: Vec<Quarantined>,
    pub holdings_written: usize,
}

// ============================================================================
// STORE
// ============================================================================

/// The single writer connection to the filings database
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        setup_database(&conn)?;
        info!("store ready at {}", path.display());
        Ok(Store { conn })
    }

    pub fn open_in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Store { conn })
    }

    /// How long a write waits on another connection's lock before SQLITE_BUSY
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Every accession number ever committed (dedup cache seed)
    pub fn accession_numbers(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT accession_number FROM filings")?;
        let numbers = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(numbers)
    }

    pub fn filing_exists(&self, accession_number: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM filings WHERE accession_number = ?1",
                params![accession_number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn load_high_water_mark(&self) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM pipeline_state WHERE key = ?1",
                params![HIGH_WATER_MARK_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(raw) => {
                let mark = DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("Corrupt high-water mark {:?}", raw))?
                    .with_timezone(&Utc);
                Ok(Some(mark))
            }
            None => Ok(None),
        }
    }

    pub fn save_high_water_mark(&self, mark: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pipeline_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![HIGH_WATER_MARK_KEY, mark.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn count_filings(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM filings", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_holdings(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM holdings", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn get_filing(&self, accession_number: &str) -> Result<Option<Filing>> {
        let filing = self
            .conn
            .query_row(
                "SELECT accession_number, cik, company_name, form_type, filing_date,
                        period_of_report, report_quarter, amendment_type, file_number,
                        declared_entry_total, declared_value_total, source_url, ingested_at
                 FROM filings WHERE accession_number = ?1",
                params![accession_number],
                filing_from_row,
            )
            .optional()?;
        Ok(filing)
    }

    /// Accession number of the amendment that superseded this filing, if any
    pub fn superseded_by(&self, accession_number: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT superseded_by FROM filings WHERE accession_number = ?1",
                params![accession_number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    pub fn get_holdings(&self, accession_number: &str) -> Result<Vec<Holding>> {
        let mut stmt = self.conn.prepare(
            "SELECT issuer_name, title_of_class, cusip, value, shares_or_principal_amount,
                    share_type, put_call, investment_discretion, other_manager,
                    voting_sole, voting_shared, voting_none
             FROM holdings WHERE accession_number = ?1
             ORDER BY row_number",
        )?;
        let holdings = stmt
            .query_map(params![accession_number], holding_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(holdings)
    }

    /// One transaction for the whole batch, one savepoint per record.
    ///
    /// A constraint violation rolls back only that record's savepoint and
    /// quarantines it. Any other error aborts the transaction untouched, so the
    /// caller may retry the whole batch.
    pub fn write_batch(
        &mut self,
        records: &[FilingRecord],
        policy: AmendmentPolicy,
    ) -> rusqlite::Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut tx = self.conn.transaction()?;

        for record in records {
            let accession = &record.filing.accession_number;
            let attempt = {
                let mut savepoint = tx.savepoint()?;
                match write_record(&savepoint, record, policy) {
                    Ok(written) => {
                        savepoint.commit()?;
                        Ok(written)
                    }
                    Err(e) if is_constraint_violation(&e) => {
                        // undo this record only, then release the savepoint
                        savepoint.rollback()?;
                        savepoint.commit()?;
                        Err(e.to_string())
                    }
                    Err(e) => return Err(e),
                }
            };

            match attempt {
                Ok(written) => {
                    outcome.holdings_written += written;
                    outcome.committed.push(accession.clone());
                }
                Err(reason) => {
                    warn!("quarantined filing {}: {}", accession, reason);
                    record_event(
                        &tx,
                        &Event::new(
                            "filing_quarantined",
                            "filing",
                            accession,
                            serde_json::json!({
                                "cik": record.filing.cik,
                                "form_type": record.filing.form_type.as_str(),
                                "reason": reason,
                            }),
                            "batch_writer",
                        ),
                    )?;
                    outcome.quarantined.push(Quarantined {
                        accession_number: accession.clone(),
                        reason,
                    });
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases answer "memory"
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
        warn!("journal_mode is {} (WAL unavailable)", mode);
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Filings Table (identity = accession number)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS filings (
            accession_number TEXT PRIMARY KEY NOT NULL,
            cik TEXT NOT NULL CHECK (length(cik) = 10),
            company_name TEXT NOT NULL,
            form_type TEXT NOT NULL CHECK (form_type IN ('13F-HR', '13F-HR/A')),
            filing_date TEXT NOT NULL,
            period_of_report TEXT,
            report_quarter TEXT,
            amendment_type TEXT,
            file_number TEXT,
            declared_entry_total INTEGER,
            declared_value_total INTEGER,
            source_url TEXT NOT NULL,
            superseded_by TEXT,
            ingested_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Holdings Table (owned by exactly one filing)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS holdings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            accession_number TEXT NOT NULL
                REFERENCES filings(accession_number) ON DELETE CASCADE,
            row_number INTEGER NOT NULL,
            issuer_name TEXT NOT NULL CHECK (length(issuer_name) BETWEEN 1 AND 255),
            title_of_class TEXT NOT NULL,
            cusip TEXT NOT NULL CHECK (length(cusip) BETWEEN 1 AND 9),
            value INTEGER NOT NULL CHECK (value >= 0),
            shares_or_principal_amount INTEGER NOT NULL CHECK (shares_or_principal_amount >= 0),
            share_type TEXT NOT NULL CHECK (share_type IN ('SH', 'PRN')),
            put_call TEXT CHECK (put_call IS NULL OR put_call IN ('PUT', 'CALL')),
            investment_discretion TEXT NOT NULL
                CHECK (investment_discretion IN ('SOLE', 'DFND', 'OTR')),
            other_manager TEXT,
            voting_sole INTEGER NOT NULL DEFAULT 0,
            voting_shared INTEGER NOT NULL DEFAULT 0,
            voting_none INTEGER NOT NULL DEFAULT 0,
            UNIQUE (accession_number, row_number)
        )",
        [],
    )?;

    // ==========================================================================
    // Pipeline State (high-water mark and friends)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pipeline_state (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_filings_cik_period ON filings(cik, period_of_report)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_holdings_accession ON holdings(accession_number)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_holdings_cusip ON holdings(cusip)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Upsert the filing, replace its holdings. Returns holdings written.
fn write_record(
    conn: &Connection,
    record: &FilingRecord,
    policy: AmendmentPolicy,
) -> rusqlite::Result<usize> {
    let filing = &record.filing;

    conn.execute(
        "INSERT INTO filings (
            accession_number, cik, company_name, form_type, filing_date,
            period_of_report, report_quarter, amendment_type, file_number,
            declared_entry_total, declared_value_total, source_url, ingested_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(accession_number) DO UPDATE SET
            cik = excluded.cik,
            company_name = excluded.company_name,
            form_type = excluded.form_type,
            filing_date = excluded.filing_date,
            period_of_report = excluded.period_of_report,
            report_quarter = excluded.report_quarter,
            amendment_type = excluded.amendment_type,
            file_number = excluded.file_number,
            declared_entry_total = excluded.declared_entry_total,
            declared_value_total = excluded.declared_value_total,
            source_url = excluded.source_url,
            ingested_at = excluded.ingested_at",
        params![
            filing.accession_number,
            filing.cik,
            filing.company_name,
            filing.form_type.as_str(),
            filing.filing_date.to_string(),
            filing.period_of_report.map(|d| d.to_string()),
            filing.report_quarter.map(|d| d.to_string()),
            filing.amendment_type.map(|a| a.as_str()),
            filing.file_number,
            filing.declared_entry_total.map(|n| n as i64),
            filing.declared_value_total,
            filing.source_url,
            filing.ingested_at.to_rfc3339(),
        ],
    )?;

    conn.execute(
        "DELETE FROM holdings WHERE accession_number = ?1",
        params![filing.accession_number],
    )?;

    let mut insert = conn.prepare_cached(
        "INSERT INTO holdings (
            accession_number, row_number, issuer_name, title_of_class, cusip, value,
            shares_or_principal_amount, share_type, put_call, investment_discretion,
            other_manager, voting_sole, voting_shared, voting_none
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?;
    for (row_number, holding) in record.holdings.iter().enumerate() {
        insert.execute(params![
            filing.accession_number,
            row_number as i64,
            holding.issuer_name,
            holding.title_of_class,
            holding.cusip,
            holding.value,
            holding.shares_or_principal_amount,
            holding.share_type.as_str(),
            holding.put_call.map(|p| p.as_str()),
            holding.investment_discretion.as_str(),
            holding.other_manager,
            holding.voting.sole,
            holding.voting.shared,
            holding.voting.none,
        ])?;
    }

    if policy == AmendmentPolicy::Supersede && restates_prior_filings(filing) {
        if let Some(period) = filing.period_of_report {
            let superseded = conn.execute(
                "UPDATE filings SET superseded_by = ?1
                 WHERE cik = ?2 AND period_of_report = ?3
                   AND accession_number <> ?1 AND superseded_by IS NULL",
                params![filing.accession_number, filing.cik, period.to_string()],
            )?;
            if superseded > 0 {
                info!(
                    "{} supersedes {} earlier filing(s) for {} period {}",
                    filing.accession_number, superseded, filing.cik, period
                );
            }
        }
    }

    record_event(
        conn,
        &Event::new(
            "filing_persisted",
            "filing",
            &filing.accession_number,
            serde_json::json!({
                "cik": filing.cik,
                "form_type": filing.form_type.as_str(),
                "holdings": record.holdings.len(),
            }),
            "batch_writer",
        ),
    )?;

    Ok(record.holdings.len())
}

/// NEW HOLDINGS amendments only add rows; they never replace the original
fn restates_prior_filings(filing: &Filing) -> bool {
    filing.form_type.is_amendment() && filing.amendment_type != Some(AmendmentType::NewHoldings)
}

pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// SQLITE_BUSY / SQLITE_LOCKED: another connection holds the lock
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

// ============================================================================
// EVENTS
// ============================================================================

fn record_event(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            event.data.to_string(),
            event.actor,
        ],
    )?;
    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| bad_value(1, &timestamp_str))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|_| bad_value(5, &data_json))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn bad_value(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("unexpected value {:?}", value).into(),
    )
}

fn date_column(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| bad_value(column, &s)))
        .transpose()
}

fn enum_column<T>(
    row: &rusqlite::Row<'_>,
    column: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| parse(&s).ok_or_else(|| bad_value(column, &s)))
        .transpose()
}

fn required<T>(value: Option<T>, column: usize) -> rusqlite::Result<T> {
    value.ok_or(rusqlite::Error::InvalidColumnType(
        column,
        "NULL".to_string(),
        rusqlite::types::Type::Null,
    ))
}

fn filing_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Filing> {
    let ingested_raw: String = row.get(12)?;
    let declared_entry_total: Option<i64> = row.get(9)?;

    Ok(Filing {
        accession_number: row.get(0)?,
        cik: row.get(1)?,
        company_name: row.get(2)?,
        form_type: required(enum_column(row, 3, FormType::parse)?, 3)?,
        filing_date: required(date_column(row, 4)?, 4)?,
        period_of_report: date_column(row, 5)?,
        report_quarter: date_column(row, 6)?,
        amendment_type: enum_column(row, 7, AmendmentType::parse)?,
        file_number: row.get(8)?,
        declared_entry_total: declared_entry_total.map(|n| n.max(0) as u64),
        declared_value_total: row.get(10)?,
        source_url: row.get(11)?,
        ingested_at: DateTime::parse_from_rfc3339(&ingested_raw)
            .map_err(|_| bad_value(12, &ingested_raw))?
            .with_timezone(&Utc),
    })
}

fn holding_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Holding> {
    Ok(Holding {
        issuer_name: row.get(0)?,
        title_of_class: row.get(1)?,
        cusip: row.get(2)?,
        value: row.get(3)?,
        shares_or_principal_amount: row.get(4)?,
        share_type: required(enum_column(row, 5, ShareType::parse)?, 5)?,
        put_call: enum_column(row, 6, PutCall::parse)?,
        investment_discretion: required(enum_column(row, 7, InvestmentDiscretion::parse)?, 7)?,
        other_manager: row.get(8)?,
        voting: VotingAuthority {
            sole: row.get(9)?,
            shared: row.get(10)?,
            none: row.get(11)?,
        },
    })
}

// ============================================================================
// TESTS
// ============================================================================
