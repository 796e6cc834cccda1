use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::tempdir;
use tokio::time::Instant;
use trendpulse_adapters::{
    BackoffPolicy, FetchAdapter, ProviderError, ProviderRequest, ProviderRow, TokenBucket,
    TrendsProvider,
};
use trendpulse_core::{
    CategoryKey, CategorySpec, CountryMapping, Dimensions, Rank, Source, TrendRecord, WindowPeriod,
};
use trendpulse_storage::{MemoryTrendStore, StoreError, TrendStore, WriteCounts};
use trendpulse_sync::{ErrorKind, SyncPipeline, UnitOutcome};

/// Answers per provider geo; geos without a script fail transiently forever.
struct GeoProvider {
    rows: HashMap<&'static str, Vec<&'static str>>,
    calls: AtomicUsize,
}

impl GeoProvider {
    fn new(rows: &[(&'static str, Vec<&'static str>)]) -> Arc<Self> {
        Arc::new(Self {
            rows: rows.iter().cloned().collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TrendsProvider for GeoProvider {
    fn name(&self) -> &str {
        "geo-scripted"
    }

    async fn query(&self, request: &ProviderRequest) -> Result<Vec<ProviderRow>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.rows.get(request.geo.as_str()) {
            Some(keywords) => Ok(keywords
                .iter()
                .map(|k| ProviderRow {
                    keyword: k.to_string(),
                    ..ProviderRow::default()
                })
                .collect()),
            None => Err(ProviderError::Transient("429 Too Many Requests".into())),
        }
    }
}

/// Records when each query reached the provider; panics for one geo.
#[derive(Default)]
struct RecordingProvider {
    seen: Mutex<Vec<(String, Instant)>>,
    panic_on: Option<&'static str>,
}

impl RecordingProvider {
    fn call_times(&self) -> Vec<Instant> {
        let mut times: Vec<Instant> = self
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| *at)
            .collect();
        times.sort();
        times
    }
}

#[async_trait]
impl TrendsProvider for RecordingProvider {
    fn name(&self) -> &str {
        "recording"
    }

    async fn query(&self, request: &ProviderRequest) -> Result<Vec<ProviderRow>, ProviderError> {
        if self.panic_on == Some(request.geo.as_str()) {
            panic!("provider client bug for {}", request.geo);
        }
        self.seen
            .lock()
            .unwrap()
            .push((request.geo.clone(), Instant::now()));
        Ok(vec![ProviderRow {
            keyword: format!("trend in {}", request.geo),
            ..ProviderRow::default()
        }])
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FailAt {
    Country,
    Insert,
}

/// Delegates to a memory store but fails one stage for one country.
struct FlakyStore {
    inner: MemoryTrendStore,
    country: &'static str,
    fail_at: FailAt,
}

#[async_trait]
impl TrendStore for FlakyStore {
    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError> {
        self.inner.upsert_source(source).await
    }

    async fn upsert_country(&self, mapping: &CountryMapping) -> Result<(), StoreError> {
        if self.fail_at == FailAt::Country && mapping.country == self.country {
            return Err(StoreError::Unavailable("country_map locked".into()));
        }
        self.inner.upsert_country(mapping).await
    }

    async fn ensure_category(&self, key: &CategoryKey) -> Result<(), StoreError> {
        self.inner.ensure_category(key).await
    }

    async fn insert_records(&self, records: &[TrendRecord]) -> Result<WriteCounts, StoreError> {
        if self.fail_at == FailAt::Insert && records.iter().any(|r| r.country == self.country) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.insert_records(records).await
    }
}

fn no_wait() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

fn observed_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 9, 14, 30, 0).single().unwrap()
}

fn dimensions(countries: &[&str]) -> Dimensions {
    Dimensions::new(
        countries.iter().map(|c| CountryMapping::from_code(c)).collect(),
        vec![WindowPeriod::OneDay],
        vec![CategorySpec::ranked("shopping", Some(18))],
    )
    .unwrap()
}

fn pipeline(
    countries: &[&str],
    provider: Arc<GeoProvider>,
    store: Arc<dyn TrendStore>,
) -> SyncPipeline {
    let fetcher = FetchAdapter::new(provider).with_backoff(no_wait());
    SyncPipeline::new(Source::default(), dimensions(countries), fetcher, store)
        .with_clock(Arc::new(observed_at))
}

fn us_only_provider() -> Arc<GeoProvider> {
    GeoProvider::new(&[("US", vec!["drone", "espresso machine"])])
}

#[tokio::test]
async fn failing_country_is_isolated_from_the_rest_of_the_run() {
    let store = Arc::new(MemoryTrendStore::new());
    let provider = us_only_provider();
    let report = pipeline(&["US", "UK"], provider.clone(), store.clone())
        .run_once()
        .await
        .expect("run");

    assert_eq!(report.totals.units, 2);
    assert_eq!(report.totals.errored, 1);
    assert_eq!(report.totals.inserted, 2);
    assert_eq!(report.totals.skipped, 0);

    // US once; UK retried to exhaustion (one attempt plus two retries).
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1 + 3);

    let uk = &report.units[1];
    assert_eq!(uk.unit.to_string(), "UK/1d/shopping");
    assert!(matches!(
        uk.outcome,
        UnitOutcome::Failed {
            kind: ErrorKind::FetchTransient,
            ..
        }
    ));

    let mut records = store.records().await;
    records.sort_by_key(|r| r.rank);
    assert!(records.iter().all(|r| r.country == "US"));
    let keywords: Vec<&str> = records.iter().map(|r| r.keyword.as_str()).collect();
    assert_eq!(keywords, vec!["drone", "espresso machine"]);
    let ranks: Vec<Option<u32>> = records.iter().map(|r| r.rank.map(Rank::get)).collect();
    assert_eq!(ranks, vec![Some(1), Some(2)]);
    assert!(records.iter().all(|r| r.raw_score.is_none()));
}

#[tokio::test]
async fn rerun_within_the_same_bucket_skips_every_row() {
    let store = Arc::new(MemoryTrendStore::new());
    let first = pipeline(&["US"], us_only_provider(), store.clone());
    first.run_once().await.expect("first run");

    // Later in the same day still lands on the same collected_at.
    let later = Utc.with_ymd_and_hms(2026, 3, 9, 22, 5, 0).single().unwrap();
    let second = pipeline(&["US"], us_only_provider(), store.clone())
        .with_clock(Arc::new(move || later));
    let report = second.run_once().await.expect("second run");

    assert_eq!(report.totals.inserted, 0);
    assert_eq!(report.totals.skipped, 2);
    assert_eq!(store.record_count().await, 2);
    let collected: Vec<DateTime<Utc>> = store
        .records()
        .await
        .iter()
        .map(|r| r.collected_at)
        .collect();
    let midnight = Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).single().unwrap();
    assert!(collected.iter().all(|at| *at == midnight));
}

#[tokio::test]
async fn dictionary_rows_are_upserted_before_facts() {
    let store = Arc::new(MemoryTrendStore::new());
    pipeline(&["UK"], GeoProvider::new(&[("GB", vec!["kettle"])]), store.clone())
        .run_once()
        .await
        .expect("run");

    assert_eq!(
        store.source("google_trends").await.map(|s| s.display_name),
        Some("Google Trends".to_string())
    );
    let uk = store.country("UK").await.expect("UK mapped");
    assert_eq!(uk.gt_geo, "GB");
    assert!(store.has_category(&CategoryKey::new("shopping")).await);
    assert_eq!(store.records().await[0].meta.geo, "GB");
}

#[tokio::test]
async fn dictionary_failure_only_fails_its_unit() {
    let store = Arc::new(FlakyStore {
        inner: MemoryTrendStore::new(),
        country: "UK",
        fail_at: FailAt::Country,
    });
    let provider = GeoProvider::new(&[("US", vec!["drone"]), ("GB", vec!["kettle"])]);
    let report = pipeline(&["US", "UK"], provider.clone(), store.clone())
        .run_once()
        .await
        .expect("run");

    assert_eq!(report.totals.inserted, 1);
    assert!(matches!(
        report.units[1].outcome,
        UnitOutcome::Failed {
            kind: ErrorKind::Dictionary,
            ..
        }
    ));
    // No fetch happens for a unit whose dictionary rows could not be ensured.
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistence_failure_is_reported_per_unit() {
    let store = Arc::new(FlakyStore {
        inner: MemoryTrendStore::new(),
        country: "US",
        fail_at: FailAt::Insert,
    });
    let provider = GeoProvider::new(&[("US", vec!["drone"]), ("GB", vec!["kettle", "toaster"])]);
    let report = pipeline(&["US", "UK"], provider, store.clone())
        .run_once()
        .await
        .expect("run");

    match &report.units[0].outcome {
        UnitOutcome::Failed { kind, message } => {
            assert_eq!(*kind, ErrorKind::Persistence);
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(report.totals.inserted, 2);
    assert_eq!(store.inner.record_count().await, 2);
}

#[tokio::test]
async fn empty_provider_response_completes_with_no_rows() {
    let store = Arc::new(MemoryTrendStore::new());
    let report = pipeline(&["DE"], GeoProvider::new(&[("DE", vec![])]), store.clone())
        .run_once()
        .await
        .expect("run");

    assert_eq!(report.totals.errored, 0);
    assert_eq!(report.totals.empty, 1);
    assert!(report.units[0].is_empty());
    assert_eq!(store.record_count().await, 0);
}

#[tokio::test]
async fn concurrent_run_matches_sequential_run() {
    let countries = ["US", "UK", "DE", "FR", "JP"];
    let provider = GeoProvider::new(&[
        ("US", vec!["drone", "espresso machine"]),
        ("GB", vec!["kettle"]),
        ("DE", vec!["fahrrad", "grill", "zelt"]),
        ("JP", vec!["umbrella"]),
    ]);

    let sequential_store = Arc::new(MemoryTrendStore::new());
    let sequential = pipeline(&countries, provider.clone(), sequential_store.clone())
        .run_once()
        .await
        .expect("sequential run");

    let concurrent_store = Arc::new(MemoryTrendStore::new());
    let concurrent = pipeline(&countries, provider, concurrent_store.clone())
        .with_concurrency(3)
        .run_once()
        .await
        .expect("concurrent run");

    assert_eq!(sequential.totals, concurrent.totals);
    let order = |report: &trendpulse_sync::RunReport| {
        report
            .units
            .iter()
            .map(|u| u.unit.to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(order(&sequential), order(&concurrent));
    assert_eq!(concurrent.totals.errored, 1);
    assert_eq!(concurrent.totals.inserted, 7);
    assert_eq!(
        sequential_store.records().await,
        concurrent_store.records().await
    );
}

#[tokio::test]
async fn run_report_is_written_when_configured() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(MemoryTrendStore::new());
    let report = pipeline(&["US", "UK"], us_only_provider(), store)
        .with_reports_dir(dir.path())
        .run_once()
        .await
        .expect("run");

    let run_dir = dir.path().join(report.run_id.to_string());
    let summary = std::fs::read_to_string(run_dir.join("run_summary.md")).expect("markdown");
    assert!(summary.contains("- UK/1d/shopping: ERROR fetch_transient"));
    assert!(run_dir.join("run_summary.json").exists());
}

#[tokio::test]
async fn configured_fixture_pipeline_runs_end_to_end() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    std::fs::write(
        root.join("dimensions.yaml"),
        "countries: [US, UK]\nwindows: [1d]\ncategories:\n  - key: shopping\n    provider_category: 18\n",
    )
    .unwrap();
    let us = root.join("fixtures/US/now-1-d");
    std::fs::create_dir_all(&us).unwrap();
    std::fs::write(
        us.join("shopping.json"),
        r#"[{"query": "drone", "value": "+1,000", "type": "rising"}, {"query": "  "}, {"query": "kettle", "value": "Breakout"}]"#,
    )
    .unwrap();

    let dimensions_path = root.join("dimensions.yaml").display().to_string();
    let fixtures_dir = root.join("fixtures").display().to_string();
    let config = trendpulse_sync::SyncConfig::from_lookup(|key: &str| match key {
        "DATABASE_URL" => Some("postgres://unused".to_string()),
        "TRENDPULSE_PROVIDER" => Some("fixtures".to_string()),
        "TRENDPULSE_FIXTURES_DIR" => Some(fixtures_dir.clone()),
        "TRENDPULSE_DIMENSIONS" => Some(dimensions_path.clone()),
        "TRENDPULSE_CONCURRENCY" => Some("2".to_string()),
        _ => None,
    })
    .expect("config");

    let store = Arc::new(MemoryTrendStore::new());
    let report = trendpulse_sync::build_pipeline(&config, store.clone())
        .await
        .expect("pipeline")
        .run_once()
        .await
        .expect("run");

    assert_eq!(report.totals.units, 2);
    assert_eq!(report.totals.errored, 0);
    assert_eq!(report.totals.inserted, 1);
    assert_eq!(report.totals.dropped, 1);
    // No GB fixture on disk: the UK unit completes empty.
    assert!(report.units[1].is_empty());

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].keyword.as_str(), "drone");
    assert_eq!(records[0].raw_score, Some(1000.0));
    assert_eq!(records[0].meta.query_type.as_deref(), Some("rising"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_workers_share_one_rate_limiter() {
    let provider = Arc::new(RecordingProvider::default());
    let limiter = Arc::new(TokenBucket::new(1, Duration::from_millis(100)));
    let fetcher = FetchAdapter::new(provider.clone())
        .with_backoff(no_wait())
        .with_rate_limiter(limiter);
    let store = Arc::new(MemoryTrendStore::new());
    let report = SyncPipeline::new(
        Source::default(),
        dimensions(&["US", "UK", "DE", "FR"]),
        fetcher,
        store,
    )
    .with_clock(Arc::new(observed_at))
    .with_concurrency(4)
    .run_once()
    .await
    .expect("run");

    assert_eq!(report.totals.inserted, 4);
    let times = provider.call_times();
    assert_eq!(times.len(), 4);
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_millis(100), "calls only {gap:?} apart");
    }
}

#[tokio::test(start_paused = true)]
async fn configured_rate_limit_throttles_the_whole_run() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    std::fs::write(
        root.join("dimensions.yaml"),
        "countries: [US, DE, FR]\nwindows: [1d]\ncategories: [{key: shopping}]\n",
    )
    .unwrap();

    let dimensions_path = root.join("dimensions.yaml").display().to_string();
    let fixtures_dir = root.join("fixtures").display().to_string();
    let config = trendpulse_sync::SyncConfig::from_lookup(|key: &str| match key {
        "DATABASE_URL" => Some("postgres://unused".to_string()),
        "TRENDPULSE_PROVIDER" => Some("fixtures".to_string()),
        "TRENDPULSE_FIXTURES_DIR" => Some(fixtures_dir.clone()),
        "TRENDPULSE_DIMENSIONS" => Some(dimensions_path.clone()),
        "TRENDPULSE_CONCURRENCY" => Some("3".to_string()),
        "TRENDPULSE_RATE_LIMIT_PER_SEC" => Some("1".to_string()),
        _ => None,
    })
    .expect("config");

    let pipeline = trendpulse_sync::build_pipeline(&config, Arc::new(MemoryTrendStore::new()))
        .await
        .expect("pipeline");
    let started = Instant::now();
    let report = pipeline.run_once().await.expect("run");

    // No fixtures on disk: every unit completes empty.
    assert_eq!(report.totals.empty, 3);
    assert_eq!(report.totals.errored, 0);
    // One request per second: the third fetch waits for two refills.
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn panicking_unit_is_reported_without_ending_the_run() {
    for concurrency in [1, 3] {
        let provider = Arc::new(RecordingProvider {
            panic_on: Some("DE"),
            ..RecordingProvider::default()
        });
        let fetcher = FetchAdapter::new(provider).with_backoff(no_wait());
        let store = Arc::new(MemoryTrendStore::new());
        let report = SyncPipeline::new(
            Source::default(),
            dimensions(&["US", "DE", "FR"]),
            fetcher,
            store.clone(),
        )
        .with_clock(Arc::new(observed_at))
        .with_concurrency(concurrency)
        .run_once()
        .await
        .expect("run");

        assert_eq!(report.totals.units, 3);
        assert_eq!(report.totals.errored, 1);
        assert_eq!(report.totals.inserted, 2);
        assert_eq!(report.units[1].unit.to_string(), "DE/1d/shopping");
        assert!(matches!(
            report.units[1].outcome,
            UnitOutcome::Failed {
                kind: ErrorKind::Internal,
                ..
            }
        ));
        assert_eq!(store.record_count().await, 2);
    }
}
