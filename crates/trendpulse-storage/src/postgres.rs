use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;
use trendpulse_core::{CategoryKey, CountryMapping, Rank, Source, TrendRecord};

use crate::{StoreError, TrendStore, WriteCounts};

/// Nine binds per row keeps a chunk well under the 65535 parameter limit.
const INSERT_CHUNK_ROWS: usize = 1_000;

const UPSERT_SOURCE: &str = r#"
    INSERT INTO trend_source (source_id, display_name)
    VALUES ($1, $2)
    ON CONFLICT (source_id) DO UPDATE SET display_name = EXCLUDED.display_name
"#;

const UPSERT_COUNTRY: &str = r#"
    INSERT INTO country_map (country, gt_geo, ttc_region)
    VALUES ($1, $2, $3)
    ON CONFLICT (country) DO UPDATE SET
        gt_geo = EXCLUDED.gt_geo,
        ttc_region = EXCLUDED.ttc_region
"#;

const ENSURE_CATEGORY: &str = r#"
    INSERT INTO trend_category_map (category_key)
    VALUES ($1)
    ON CONFLICT (category_key) DO NOTHING
"#;

/// Connection-level failures mean the store is unreachable, not that a statement failed.
fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Database(other),
    }
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgTrendStore {
    pool: PgPool,
}

impl PgTrendStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(store_error)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl TrendStore for PgTrendStore {
    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError> {
        sqlx::query(UPSERT_SOURCE)
            .bind(&source.source_id)
            .bind(&source.display_name)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn upsert_country(&self, mapping: &CountryMapping) -> Result<(), StoreError> {
        sqlx::query(UPSERT_COUNTRY)
            .bind(&mapping.country)
            .bind(&mapping.gt_geo)
            .bind(&mapping.ttc_region)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn ensure_category(&self, key: &CategoryKey) -> Result<(), StoreError> {
        sqlx::query(ENSURE_CATEGORY)
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn insert_records(&self, records: &[TrendRecord]) -> Result<WriteCounts, StoreError> {
        if records.is_empty() {
            return Ok(WriteCounts::default());
        }

        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let mut inserted = 0u64;

        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO trend_raw \
                 (source_id, country, category_key, window_period, keyword, rank, raw_score, meta_json, collected_at) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.source_id.as_str())
                    .push_bind(record.country.as_str())
                    .push_bind(record.category_key.as_str())
                    .push_bind(record.window_period.as_str())
                    .push_bind(record.keyword.as_str())
                    .push_bind(record.rank.map(Rank::to_i32))
                    .push_bind(record.raw_score)
                    .push_bind(Json(record.meta.to_json()))
                    .push_bind(record.collected_at);
            });
            builder.push(
                " ON CONFLICT (source_id, country, category_key, window_period, keyword, collected_at) DO NOTHING",
            );

            let result = builder.build().execute(&mut *tx).await.map_err(store_error)?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(store_error)?;

        let counts = WriteCounts {
            inserted,
            skipped: (records.len() as u64).saturating_sub(inserted),
        };
        debug!(
            inserted = counts.inserted,
            skipped = counts.skipped,
            "trend_raw batch committed"
        );
        Ok(counts)
    }
}
