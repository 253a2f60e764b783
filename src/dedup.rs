// 🔍 Dedup Cache - accession numbers already durably stored
//
// Absent from the cache means "not guaranteed stored", never the reverse:
// entries are only added for accession numbers a flush reported committed.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::db::Store;

#[derive(Default)]
pub struct DedupCache {
    seen: RwLock<HashSet<String>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the store alone, so a cold process never reprocesses history
    pub fn seed_from_store(store: &Store) -> Result<Self> {
        let seen = store.accession_numbers()?;
        log::info!("dedup cache seeded with {} accession number(s)", seen.len());
        Ok(DedupCache {
            seen: RwLock::new(seen),
        })
    }

    pub fn seen(&self, accession_number: &str) -> bool {
        self.seen
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(accession_number)
    }

    pub fn mark(&self, accession_number: &str) {
        self.seen
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(accession_number.to_string());
    }

    pub fn len(&self) -> usize {
        self.seen.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
