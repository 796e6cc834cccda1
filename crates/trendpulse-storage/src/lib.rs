//! Relational persistence for trend dictionaries and fact rows.
//!
//! Dictionary tables are upserted; `trend_raw` is insert-only with a
//! first-write-wins conflict policy on the natural key.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use trendpulse_core::{CategoryKey, CountryMapping, NaturalKey, Source, TrendRecord};

mod postgres;

pub use postgres::{PgStoreConfig, PgTrendStore};

pub const CRATE_NAME: &str = "trendpulse-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("fact row `{keyword}` references missing {table} row `{value}`")]
    DanglingReference {
        table: &'static str,
        value: String,
        keyword: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of one idempotent batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteCounts {
    pub inserted: u64,
    pub skipped: u64,
}

#[async_trait]
pub trait TrendStore: Send + Sync {
    /// Insert or refresh display metadata.
    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError>;

    /// Insert or refresh the per-system geo codes.
    async fn upsert_country(&self, mapping: &CountryMapping) -> Result<(), StoreError>;

    /// Insert if absent; category keys are immutable.
    async fn ensure_category(&self, key: &CategoryKey) -> Result<(), StoreError>;

    /// Writes `records` in a single transaction. Rows colliding with an existing
    /// natural key (or an earlier row of the same batch) are counted as skipped.
    async fn insert_records(&self, records: &[TrendRecord]) -> Result<WriteCounts, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: BTreeMap<String, Source>,
    countries: BTreeMap<String, CountryMapping>,
    categories: BTreeSet<CategoryKey>,
    records: BTreeMap<NaturalKey, TrendRecord>,
}

/// In-process store with the same conflict semantics as the Postgres schema.
/// Unlike the database it also rejects fact rows whose dictionary rows are missing.
#[derive(Debug, Default)]
pub struct MemoryTrendStore {
    state: Mutex<MemoryState>,
}

impl MemoryTrendStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<TrendRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn source(&self, source_id: &str) -> Option<Source> {
        self.state.lock().await.sources.get(source_id).cloned()
    }

    pub async fn country(&self, country: &str) -> Option<CountryMapping> {
        self.state.lock().await.countries.get(country).cloned()
    }

    pub async fn has_category(&self, key: &CategoryKey) -> bool {
        self.state.lock().await.categories.contains(key)
    }
}

#[async_trait]
impl TrendStore for MemoryTrendStore {
    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .sources
            .insert(source.source_id.clone(), source.clone());
        Ok(())
    }

    async fn upsert_country(&self, mapping: &CountryMapping) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .countries
            .insert(mapping.country.clone(), mapping.clone());
        Ok(())
    }

    async fn ensure_category(&self, key: &CategoryKey) -> Result<(), StoreError> {
        self.state.lock().await.categories.insert(key.clone());
        Ok(())
    }

    async fn insert_records(&self, records: &[TrendRecord]) -> Result<WriteCounts, StoreError> {
        let mut state = self.state.lock().await;

        for record in records {
            let dangling = if !state.sources.contains_key(&record.source_id) {
                Some(("trend_source", record.source_id.clone()))
            } else if !state.countries.contains_key(&record.country) {
                Some(("country_map", record.country.clone()))
            } else if !state.categories.contains(&record.category_key) {
                Some(("trend_category_map", record.category_key.to_string()))
            } else {
                None
            };
            if let Some((table, value)) = dangling {
                return Err(StoreError::DanglingReference {
                    table,
                    value,
                    keyword: record.keyword.as_str().to_string(),
                });
            }
        }

        let mut counts = WriteCounts::default();
        for record in records {
            let key = record.natural_key();
            if state.records.contains_key(&key) {
                counts.skipped += 1;
            } else {
                state.records.insert(key, record.clone());
                counts.inserted += 1;
            }
        }
        Ok(counts)
    }
}
