//! Trends-provider contracts, the retrying fetch adapter and concrete providers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use trendpulse_core::{FetchUnit, RawSample, RawScore, RetrievalMode};

pub const CRATE_NAME: &str = "trendpulse-adapters";

/// Logical request sent to the trends provider for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub mode: RetrievalMode,
    pub geo: String,
    pub category_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_category: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    pub timeframe: String,
}

impl ProviderRequest {
    pub fn for_unit(unit: &FetchUnit) -> Self {
        Self {
            mode: unit.category.mode,
            geo: unit.country.gt_geo.clone(),
            category_key: unit.category.key.to_string(),
            provider_category: unit.category.provider_category,
            keywords: match unit.category.mode {
                RetrievalMode::Ranked => Vec::new(),
                RetrievalMode::Series => unit.category.keywords.clone(),
            },
            timeframe: unit.window.provider_timeframe().to_string(),
        }
    }
}

/// One row of a provider response. Field aliases cover the shapes the
/// provider uses for rising queries (`query`/`value`) and daily trends
/// (`title`/`formattedTraffic`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderRow {
    #[serde(default, alias = "query", alias = "title")]
    pub keyword: String,
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default, alias = "value", alias = "formattedTraffic")]
    pub score: Option<RawScore>,
    /// Interest-over-time points, oldest first. Only meaningful in series mode.
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default, alias = "type")]
    pub query_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) => RetryDisposition::Retryable,
            Self::Rejected(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Opaque fetch capability. Implementations perform exactly one attempt;
/// retries and rate limiting live in [`FetchAdapter`].
#[async_trait]
pub trait TrendsProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, request: &ProviderRequest) -> Result<Vec<ProviderRow>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Token bucket shared by every fetch worker so throttling is coordinated run-wide.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Roughly `per_second` requests per second with a burst of the same size.
    pub fn per_second(per_second: u32) -> Self {
        let per_second = per_second.max(1);
        Self::new(per_second, Duration::from_secs(1) / per_second)
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            self.refill(&mut state);

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self
                .refill_every
                .saturating_sub(state.last_refill.elapsed())
                .max(Duration::from_nanos(1));
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }

    /// Credits whole elapsed intervals. The remainder carries over to the next
    /// refill unless the bucket is full.
    fn refill(&self, state: &mut TokenBucketState) {
        let interval = self.refill_every.as_nanos().max(1);
        let refills = state.last_refill.elapsed().as_nanos() / interval;
        if refills == 0 {
            return;
        }

        let refills = u32::try_from(refills).unwrap_or(u32::MAX);
        state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
        if state.tokens == self.capacity {
            state.last_refill = Instant::now();
        } else {
            state.last_refill += self.refill_every.saturating_mul(refills);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("provider still failing after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: ProviderError },
    #[error(transparent)]
    Rejected(ProviderError),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Turns a unit into provider calls and provider rows into ordered raw samples.
pub struct FetchAdapter {
    provider: Arc<dyn TrendsProvider>,
    backoff: BackoffPolicy,
    limiter: Option<Arc<TokenBucket>>,
}

impl FetchAdapter {
    pub fn new(provider: Arc<dyn TrendsProvider>) -> Self {
        Self {
            provider,
            backoff: BackoffPolicy::default(),
            limiter: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Fetches one unit. An empty vector means the provider had no data.
    pub async fn fetch(&self, unit: &FetchUnit) -> Result<Vec<RawSample>, FetchError> {
        let request = ProviderRequest::for_unit(unit);
        let rows = self.query_with_retry(&request).await?;
        debug!(rows = rows.len(), mode = unit.category.mode.as_str(), "provider rows received");
        Ok(match unit.category.mode {
            RetrievalMode::Ranked => ranked_samples(rows, unit.category.max_results),
            RetrievalMode::Series => series_samples(rows, &unit.category.keywords),
        })
    }

    async fn query_with_retry(
        &self,
        request: &ProviderRequest,
    ) -> Result<Vec<ProviderRow>, FetchError> {
        let mut attempt = 0usize;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.take().await;
            }

            match self.provider.query(request).await {
                Ok(rows) => return Ok(rows),
                Err(err) if err.disposition() == RetryDisposition::NonRetryable => {
                    return Err(FetchError::Rejected(err));
                }
                Err(err) if attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        provider = self.provider.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying provider query"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(FetchError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
            }
        }
    }
}

fn ranked_samples(rows: Vec<ProviderRow>, max_results: usize) -> Vec<RawSample> {
    rows.into_iter()
        .take(max_results)
        .map(|row| RawSample {
            keyword: row.keyword,
            rank: row.rank,
            score: row.score,
            query_type: row.query_type,
        })
        .collect()
}

/// Emits one sample per configured keyword that the provider answered for,
/// in configured order. The score is the explicit score or the latest series point.
fn series_samples(rows: Vec<ProviderRow>, keywords: &[String]) -> Vec<RawSample> {
    let mut rows: Vec<Option<ProviderRow>> = rows.into_iter().map(Some).collect();
    let mut samples = Vec::with_capacity(keywords.len());

    for keyword in keywords {
        let wanted = keyword.trim();
        let Some(pos) = rows.iter().position(
            |r| matches!(r, Some(r) if r.keyword.trim().eq_ignore_ascii_case(wanted)),
        ) else {
            continue;
        };
        let Some(row) = rows[pos].take() else {
            continue;
        };

        let score = row
            .score
            .or_else(|| row.values.last().copied().map(RawScore::Number));
        samples.push(RawSample {
            keyword: wanted.to_string(),
            rank: row.rank,
            score,
            query_type: row.query_type.or_else(|| Some("interest_over_time".to_string())),
        });
    }
    samples
}

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Provider bridge speaking JSON over HTTP: the request is POSTed as-is and
/// the response body is an array of [`ProviderRow`].
#[derive(Debug)]
pub struct HttpTrendsProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTrendsProvider {
    pub fn new(config: HttpProviderConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
        })
    }
}

#[async_trait]
impl TrendsProvider for HttpTrendsProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn query(&self, request: &ProviderRequest) -> Result<Vec<ProviderRow>, ProviderError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|err| match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => ProviderError::Transient(err.to_string()),
                RetryDisposition::NonRetryable => ProviderError::Rejected(err.to_string()),
            })?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let message = format!("http status {} for {}", status.as_u16(), self.endpoint);
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => ProviderError::Transient(message),
                RetryDisposition::NonRetryable => ProviderError::Rejected(message),
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|err| ProviderError::Transient(err.to_string()))?;
        parse_rows(&body)
    }
}

fn parse_rows(body: &[u8]) -> Result<Vec<ProviderRow>, ProviderError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(body)
        .map_err(|err| ProviderError::Rejected(format!("malformed provider response: {err}")))
}

/// Offline provider reading canned responses from
/// `<root>/<geo>/<timeframe slug>/<category_key>.json`.
#[derive(Debug, Clone)]
pub struct FixtureTrendsProvider {
    root: PathBuf,
}

impl FixtureTrendsProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, request: &ProviderRequest) -> PathBuf {
        self.root
            .join(&request.geo)
            .join(slug(&request.timeframe))
            .join(format!("{}.json", request.category_key))
    }
}

fn slug(input: &str) -> String {
    input
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[async_trait]
impl TrendsProvider for FixtureTrendsProvider {
    fn name(&self) -> &str {
        "fixtures"
    }

    async fn query(&self, request: &ProviderRequest) -> Result<Vec<ProviderRow>, ProviderError> {
        let path = self.fixture_path(request);
        match tokio::fs::read(&path).await {
            Ok(bytes) => parse_rows(&bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(ProviderError::Transient(format!(
                "reading {}: {err}",
                path.display()
            ))),
        }
    }
}
