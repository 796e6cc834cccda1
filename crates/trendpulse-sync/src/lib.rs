//! Ingestion pipeline orchestration: resolve → fetch → normalize → write, per unit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use trendpulse_adapters::{
    FetchAdapter, FetchError, FixtureTrendsProvider, HttpProviderConfig, HttpTrendsProvider,
    TokenBucket, TrendsProvider,
};
use trendpulse_core::{CollectionBucket, Dimensions, FetchUnit, Source};
use trendpulse_storage::{PgStoreConfig, PgTrendStore, StoreError, TrendStore, WriteCounts};
use uuid::Uuid;

pub mod config;
pub mod normalize;
pub mod report;

pub use config::{ConfigError, DimensionOverrides, DimensionsFile, ProviderSettings, SyncConfig};
pub use normalize::{normalize, Normalized, SampleRejection};
pub use report::{write_report_files, ErrorKind, RunReport, RunTotals, UnitOutcome, UnitReport};

pub const CRATE_NAME: &str = "trendpulse-sync";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Failure of one unit. Caught at the unit boundary and reported, never propagated.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("dictionary upsert failed: {0}")]
    Dictionary(#[source] StoreError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("fact write failed: {0}")]
    Persistence(#[source] StoreError),
}

impl UnitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Dictionary(_) => ErrorKind::Dictionary,
            Self::Fetch(err) if err.is_transient() => ErrorKind::FetchTransient,
            Self::Fetch(_) => ErrorKind::FetchRejected,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }
}

/// Makes sure the dictionary rows a unit's facts reference exist.
pub struct DictionaryResolver {
    store: Arc<dyn TrendStore>,
    source: Source,
}

impl DictionaryResolver {
    pub fn new(store: Arc<dyn TrendStore>, source: Source) -> Self {
        Self { store, source }
    }

    pub async fn ensure(&self, unit: &FetchUnit) -> Result<(), StoreError> {
        self.store.upsert_source(&self.source).await?;
        self.store.upsert_country(&unit.country).await?;
        self.store.ensure_category(&unit.category.key).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UnitCounts {
    fetched: usize,
    written: WriteCounts,
    dropped: usize,
}

struct PipelineInner {
    source: Source,
    fetcher: FetchAdapter,
    resolver: DictionaryResolver,
    store: Arc<dyn TrendStore>,
}

/// Stamps `collected_at` at normalization time, truncated to the bucket.
#[derive(Clone)]
struct Stamper {
    bucket: CollectionBucket,
    clock: Clock,
}

impl Stamper {
    fn now(&self) -> DateTime<Utc> {
        self.bucket.truncate((self.clock)())
    }
}

pub struct SyncPipeline {
    inner: Arc<PipelineInner>,
    dimensions: Dimensions,
    stamper: Stamper,
    concurrency: usize,
    reports_dir: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(
        source: Source,
        dimensions: Dimensions,
        fetcher: FetchAdapter,
        store: Arc<dyn TrendStore>,
    ) -> Self {
        let resolver = DictionaryResolver::new(store.clone(), source.clone());
        Self {
            inner: Arc::new(PipelineInner {
                source,
                fetcher,
                resolver,
                store,
            }),
            dimensions,
            stamper: Stamper {
                bucket: CollectionBucket::default(),
                clock: Arc::new(Utc::now),
            },
            concurrency: 1,
            reports_dir: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_collection_bucket(mut self, bucket: CollectionBucket) -> Self {
        self.stamper.bucket = bucket;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.stamper.clock = clock;
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn units(&self) -> Vec<FetchUnit> {
        self.dimensions.units()
    }

    /// Processes every unit once. Unit failures, panics included, land in the
    /// report; only report file output fails the run.
    pub async fn run_once(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let units = self.units();
        info!(
            %run_id,
            units = units.len(),
            concurrency = self.concurrency,
            provider = self.inner.fetcher.provider_name(),
            "sync run started"
        );

        let reports = if self.concurrency <= 1 {
            let mut reports = Vec::with_capacity(units.len());
            for unit in units {
                let report = isolate_unit(self.inner.clone(), self.stamper.clone(), unit).await;
                reports.push(report);
            }
            reports
        } else {
            self.process_concurrently(units).await?
        };

        let report = RunReport::new(run_id, started_at, Utc::now(), reports);
        info!(
            %run_id,
            units = report.totals.units,
            errored = report.totals.errored,
            inserted = report.totals.inserted,
            skipped = report.totals.skipped,
            "sync run finished"
        );

        if let Some(dir) = &self.reports_dir {
            let run_dir = write_report_files(dir, &report).await?;
            info!(path = %run_dir.display(), "run report written");
        }
        Ok(report)
    }

    async fn process_concurrently(&self, units: Vec<FetchUnit>) -> Result<Vec<UnitReport>> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let mut reports = Vec::with_capacity(units.len());

        for unit in units {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .context("unit worker pool closed")?;
            let inner = self.inner.clone();
            let stamper = self.stamper.clone();
            workers.spawn(async move {
                let _permit = permit;
                isolate_unit(inner, stamper, unit).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            reports.push(joined.context("unit worker crashed")?);
        }
        Ok(reports)
    }
}

/// Runs the unit on its own task so a panic becomes a failed unit instead of
/// ending the run.
async fn isolate_unit(
    inner: Arc<PipelineInner>,
    stamper: Stamper,
    unit: FetchUnit,
) -> UnitReport {
    let index = unit.index;
    let id = unit.id();
    let started = Instant::now();

    match tokio::spawn(async move { process_unit(&inner, &stamper, unit).await }).await {
        Ok(report) => report,
        Err(err) => {
            let message = if err.is_panic() {
                "unit task panicked".to_string()
            } else {
                err.to_string()
            };
            warn!(unit = %id, index, error = %message, "unit crashed");
            UnitReport {
                index,
                unit: id,
                outcome: UnitOutcome::Failed {
                    kind: ErrorKind::Internal,
                    message,
                },
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        }
    }
}

/// Isolation boundary: every stage error becomes a reported outcome.
async fn process_unit(inner: &PipelineInner, stamper: &Stamper, unit: FetchUnit) -> UnitReport {
    let id = unit.id();
    let started = Instant::now();
    let span = info_span!("unit", unit = %id, index = unit.index);

    let result = run_unit(inner, stamper, &unit)
        .instrument(span.clone())
        .await;
    let outcome = span.in_scope(|| match result {
        Ok(counts) => {
            info!(
                fetched = counts.fetched,
                inserted = counts.written.inserted,
                skipped = counts.written.skipped,
                dropped = counts.dropped,
                "unit completed"
            );
            UnitOutcome::Completed {
                fetched: counts.fetched,
                inserted: counts.written.inserted,
                skipped: counts.written.skipped,
                dropped: counts.dropped,
            }
        }
        Err(err) => {
            let kind = err.kind();
            warn!(kind = kind.as_str(), error = %err, "unit failed");
            UnitOutcome::Failed {
                kind,
                message: err.to_string(),
            }
        }
    });

    UnitReport {
        index: unit.index,
        unit: id,
        outcome,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

async fn run_unit(
    inner: &PipelineInner,
    stamper: &Stamper,
    unit: &FetchUnit,
) -> Result<UnitCounts, UnitError> {
    inner
        .resolver
        .ensure(unit)
        .await
        .map_err(UnitError::Dictionary)?;

    let samples = inner.fetcher.fetch(unit).await?;
    let fetched = samples.len();

    let normalized = normalize(&inner.source, unit, samples, stamper.now());

    let written = inner
        .store
        .insert_records(&normalized.records)
        .await
        .map_err(UnitError::Persistence)?;

    Ok(UnitCounts {
        fetched,
        written,
        dropped: normalized.dropped,
    })
}

/// Builds the provider selected by the configuration.
pub fn provider_from_config(config: &SyncConfig) -> Result<Arc<dyn TrendsProvider>> {
    Ok(match &config.provider {
        ProviderSettings::Http { endpoint } => {
            Arc::new(HttpTrendsProvider::new(HttpProviderConfig {
                endpoint: endpoint.clone(),
                timeout: config.http_timeout(),
                user_agent: Some(config.user_agent.clone()),
            })?)
        }
        ProviderSettings::Fixtures { dir } => Arc::new(FixtureTrendsProvider::new(dir.clone())),
    })
}

/// Wires a pipeline from configuration around an already-connected store.
pub async fn build_pipeline(
    config: &SyncConfig,
    store: Arc<dyn TrendStore>,
) -> Result<SyncPipeline> {
    let (source, dimensions) = config.load_dimensions().await?;
    assemble_pipeline(config, source, dimensions, store)
}

fn assemble_pipeline(
    config: &SyncConfig,
    source: Source,
    dimensions: Dimensions,
    store: Arc<dyn TrendStore>,
) -> Result<SyncPipeline> {
    let mut fetcher =
        FetchAdapter::new(provider_from_config(config)?).with_backoff(config.backoff());
    if let Some(rate) = config.rate_limit_per_sec {
        fetcher = fetcher.with_rate_limiter(Arc::new(TokenBucket::per_second(rate)));
    }

    let mut pipeline = SyncPipeline::new(source, dimensions, fetcher, store)
        .with_concurrency(config.concurrency)
        .with_collection_bucket(config.collection_bucket);
    if let Some(dir) = &config.reports_dir {
        pipeline = pipeline.with_reports_dir(dir.clone());
    }
    Ok(pipeline)
}

/// Validates dimensions before connecting to the store.
pub async fn run_sync_once(config: &SyncConfig) -> Result<RunReport> {
    let (source, dimensions) = config.load_dimensions().await?;
    let store = PgTrendStore::connect(&PgStoreConfig {
        max_connections: (config.concurrency as u32).saturating_add(1),
        ..PgStoreConfig::new(config.database_url.clone())
    })
    .await
    .context("connecting to the trend store")?;
    let pipeline = assemble_pipeline(config, source, dimensions, Arc::new(store))?;
    pipeline.run_once().await
}
