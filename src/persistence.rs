// 💾 Batch Persistence - buffer parsed filings, commit them in one transaction
//
// Only accession numbers reported in `FlushReport::committed` are durable.
// Callers mark the dedup cache from that list and nothing else.

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::db::{self, Quarantined, Store};
use crate::model::{Filing, FilingRecord, Holding};

/// How a 13F-HR/A relates to the filing it amends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AmendmentPolicy {
    /// Every amendment is stored as its own filing next to the original
    #[default]
    Coexist,

    /// Restating amendments mark earlier filings for the same period as superseded
    Supersede,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_batch_age: Duration,

    /// Attempts for a batch hitting SQLITE_BUSY / SQLITE_LOCKED
    pub store_retries: u32,
    pub retry_base_delay: Duration,
    pub amendment_policy: AmendmentPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            batch_size: 50,
            max_batch_age: Duration::from_secs(30),
            store_retries: 5,
            retry_base_delay: Duration::from_millis(200),
            amendment_policy: AmendmentPolicy::Coexist,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub committed: Vec<String>,
    pub quarantined: Vec<Quarantined>,
    pub holdings_written: usize,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Queued { pending: usize },
    Flushed(FlushReport),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("store unavailable after {attempts} attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("store write failed: {message}")]
    Fatal { message: String },
}

pub struct BatchWriter {
    store: Store,
    config: BatchConfig,
    pending: Vec<FilingRecord>,
    oldest: Option<Instant>,
}

impl BatchWriter {
    pub fn new(store: Store, config: BatchConfig) -> Self {
        BatchWriter {
            store,
            config,
            pending: Vec::new(),
            oldest: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue one filing. Flushes when the batch is full or too old.
    pub fn persist(&mut self, filing: Filing, holdings: Vec<Holding>) -> Result<Ack, PersistError> {
        self.pending.push(FilingRecord { filing, holdings });
        let oldest = *self.oldest.get_or_insert_with(Instant::now);

        let full = self.pending.len() >= self.config.batch_size;
        let stale = oldest.elapsed() >= self.config.max_batch_age;
        if full || stale {
            self.flush().map(Ack::Flushed)
        } else {
            Ok(Ack::Queued {
                pending: self.pending.len(),
            })
        }
    }

    /// Commit everything pending. On failure the batch is dropped uncommitted;
    /// its filings are rediscovered because neither dedup nor the mark moved.
    pub fn flush(&mut self) -> Result<FlushReport, PersistError> {
        let batch = std::mem::take(&mut self.pending);
        self.oldest = None;
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let max_attempts = self.config.store_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.store.write_batch(&batch, self.config.amendment_policy) {
                Ok(outcome) => {
                    info!(
                        "flushed batch: committed={} quarantined={} holdings={} attempts={}",
                        outcome.committed.len(),
                        outcome.quarantined.len(),
                        outcome.holdings_written,
                        attempt
                    );
                    return Ok(FlushReport {
                        committed: outcome.committed,
                        quarantined: outcome.quarantined,
                        holdings_written: outcome.holdings_written,
                        attempts: attempt,
                    });
                }
                Err(e) if db::is_transient(&e) && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    debug!("store busy (attempt {}), retrying batch in {:?}", attempt, delay);
                    thread::sleep(delay);
                }
                Err(e) if db::is_transient(&e) => {
                    warn!("dropping batch of {} after {} busy attempts", batch.len(), attempt);
                    return Err(PersistError::Unavailable {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!("dropping batch of {}: {}", batch.len(), e);
                    return Err(PersistError::Fatal {
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_base_delay
            .saturating_mul(1u32 << attempt.min(10));
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{sample_filing, sample_holding};
    use pretty_assertions::assert_eq;

    fn config(batch_size: usize) -> BatchConfig {
        BatchConfig {
            batch_size,
            max_batch_age: Duration::from_secs(3600),
            store_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            amendment_policy: AmendmentPolicy::Coexist,
        }
    }

    #[test]
    fn test_queues_until_batch_is_full() {
        let mut writer = BatchWriter::new(Store::open_in_memory().unwrap(), config(2));

        let ack = writer
            .persist(sample_filing("0001234567-24-000001", "0001234567"), vec![])
            .unwrap();
        assert_eq!(ack, Ack::Queued { pending: 1 });
        assert_eq!(writer.store().count_filings().unwrap(), 0);

        let ack = writer
            .persist(
                sample_filing("0001234567-24-000002", "0001234567"),
                vec![sample_holding("A CORP", "000000001")],
            )
            .unwrap();
        match ack {
            Ack::Flushed(report) => {
                assert_eq!(report.committed.len(), 2);
                assert_eq!(report.holdings_written, 1);
                assert_eq!(report.attempts, 1);
            }
            other => panic!("expected flush, got {:?}", other),
        }
        assert_eq!(writer.pending(), 0);
        assert_eq!(writer.store().count_filings().unwrap(), 2);
    }

    #[test]
    fn test_stale_batch_flushes_on_next_persist() {
        let mut cfg = config(100);
        cfg.max_batch_age = Duration::ZERO;
        let mut writer = BatchWriter::new(Store::open_in_memory().unwrap(), cfg);

        let ack = writer
            .persist(sample_filing("0001234567-24-000001", "0001234567"), vec![])
            .unwrap();
        assert!(matches!(ack, Ack::Flushed(_)));
    }

    #[test]
    fn test_empty_flush_is_a_no_op() {
        let mut writer = BatchWriter::new(Store::open_in_memory().unwrap(), config(10));
        assert_eq!(writer.flush().unwrap(), FlushReport::default());
    }

    #[test]
    fn test_busy_store_exhausts_retries_and_drops_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filings.db");

        let blocker = Store::open(&path).unwrap();
        let store = Store::open(&path).unwrap();
        store.set_busy_timeout(Duration::ZERO).unwrap();
        blocker.conn().execute_batch("BEGIN IMMEDIATE").unwrap();

        let mut writer = BatchWriter::new(store, config(10));
        writer
            .persist(sample_filing("0001234567-24-000001", "0001234567"), vec![])
            .unwrap();

        let err = writer.flush().unwrap_err();
        assert!(matches!(err, PersistError::Unavailable { attempts: 3, .. }));
        assert_eq!(writer.pending(), 0);

        blocker.conn().execute_batch("COMMIT").unwrap();
        assert_eq!(writer.store().count_filings().unwrap(), 0);
    }
}
