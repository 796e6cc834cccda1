//! Core domain model for trend ingestion: dimensions, fetch units and canonical records.

use std::fmt;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "trendpulse-core";

pub const DEFAULT_MAX_RESULTS: usize = 50;

/// Lookback horizon of a trend measurement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WindowPeriod {
    OneDay,
    SevenDays,
    ThirtyDays,
    /// Provider-native timeframe passed through verbatim.
    Native(String),
}

impl WindowPeriod {
    /// Accepts both the canonical vocabulary (`7d`) and the provider's (`now 7-d`).
    pub fn parse(input: &str) -> Self {
        match input.trim() {
            "1d" | "now 1-d" => Self::OneDay,
            "7d" | "now 7-d" => Self::SevenDays,
            "30d" | "today 1-m" => Self::ThirtyDays,
            other => Self::Native(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::OneDay => "1d",
            Self::SevenDays => "7d",
            Self::ThirtyDays => "30d",
            Self::Native(raw) => raw,
        }
    }

    pub fn provider_timeframe(&self) -> &str {
        match self {
            Self::OneDay => "now 1-d",
            Self::SevenDays => "now 7-d",
            Self::ThirtyDays => "today 1-m",
            Self::Native(raw) => raw,
        }
    }
}

impl From<String> for WindowPeriod {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<WindowPeriod> for String {
    fn from(value: WindowPeriod) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for WindowPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dictionary row describing a data provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub display_name: String,
}

impl Default for Source {
    fn default() -> Self {
        Self {
            source_id: "google_trends".to_string(),
            display_name: "Google Trends".to_string(),
        }
    }
}

/// Canonical country code plus the geo code each consuming system expects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CountryMapping {
    pub country: String,
    pub gt_geo: String,
    pub ttc_region: String,
}

impl CountryMapping {
    /// Builds the mapping for a bare code. `UK` is the only canonical code whose
    /// ISO geo differs.
    pub fn from_code(code: &str) -> Self {
        let country = code.trim().to_ascii_uppercase();
        let geo = match country.as_str() {
            "UK" => "GB".to_string(),
            _ => country.clone(),
        };
        Self {
            country,
            gt_geo: geo.clone(),
            ttc_region: geo,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryKey(String);

impl CategoryKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(key.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// Rising/trending queries for a category, returned in rank order.
    Ranked,
    /// Interest-over-time lookups for an explicit keyword list.
    Series,
}

impl RetrievalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ranked => "ranked",
            Self::Series => "series",
        }
    }
}

/// A configured category and how the provider should be queried for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySpec {
    pub key: CategoryKey,
    pub mode: RetrievalMode,
    pub provider_category: Option<u32>,
    pub keywords: Vec<String>,
    pub max_results: usize,
}

impl CategorySpec {
    pub fn ranked(key: impl AsRef<str>, provider_category: Option<u32>) -> Self {
        Self {
            key: CategoryKey::new(key),
            mode: RetrievalMode::Ranked,
            provider_category,
            keywords: Vec::new(),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn series(key: impl AsRef<str>, keywords: Vec<String>) -> Self {
        Self {
            key: CategoryKey::new(key),
            mode: RetrievalMode::Series,
            provider_category: None,
            keywords,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DimensionError {
    #[error("dimension list `{0}` is empty")]
    Empty(&'static str),
    #[error("series category `{0}` has no keywords")]
    SeriesWithoutKeywords(String),
}

/// The validated country × window × category configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimensions {
    countries: Vec<CountryMapping>,
    windows: Vec<WindowPeriod>,
    categories: Vec<CategorySpec>,
}

impl Dimensions {
    /// Validates and deduplicates each list, keeping first occurrences in order.
    pub fn new(
        countries: Vec<CountryMapping>,
        windows: Vec<WindowPeriod>,
        categories: Vec<CategorySpec>,
    ) -> Result<Self, DimensionError> {
        let countries = dedup_by_key(countries, |c| c.country.clone());
        let windows = dedup_by_key(windows, |w| w.clone());
        let categories = dedup_by_key(categories, |c| c.key.clone());

        if countries.is_empty() {
            return Err(DimensionError::Empty("countries"));
        }
        if windows.is_empty() {
            return Err(DimensionError::Empty("windows"));
        }
        if categories.is_empty() {
            return Err(DimensionError::Empty("categories"));
        }
        if let Some(bad) = categories
            .iter()
            .find(|c| c.mode == RetrievalMode::Series && c.keywords.is_empty())
        {
            return Err(DimensionError::SeriesWithoutKeywords(bad.key.to_string()));
        }

        Ok(Self {
            countries,
            windows,
            categories,
        })
    }

    pub fn countries(&self) -> &[CountryMapping] {
        &self.countries
    }

    pub fn windows(&self) -> &[WindowPeriod] {
        &self.windows
    }

    pub fn categories(&self) -> &[CategorySpec] {
        &self.categories
    }

    /// Cartesian product, country-major, then window, then category.
    pub fn units(&self) -> Vec<FetchUnit> {
        let mut units =
            Vec::with_capacity(self.countries.len() * self.windows.len() * self.categories.len());
        for country in &self.countries {
            for window in &self.windows {
                for category in &self.categories {
                    units.push(FetchUnit {
                        index: units.len(),
                        country: country.clone(),
                        window: window.clone(),
                        category: category.clone(),
                    });
                }
            }
        }
        units
    }
}

fn dedup_by_key<T, K: PartialEq>(items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut seen: Vec<K> = Vec::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let k = key(&item);
        if !seen.contains(&k) {
            seen.push(k);
            out.push(item);
        }
    }
    out
}

/// One (country, window, category) combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchUnit {
    pub index: usize,
    pub country: CountryMapping,
    pub window: WindowPeriod,
    pub category: CategorySpec,
}

impl FetchUnit {
    pub fn id(&self) -> UnitId {
        UnitId {
            country: self.country.country.clone(),
            window: self.window.as_str().to_string(),
            category: self.category.key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId {
    pub country: String,
    pub window: String,
    pub category: String,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.country, self.window, self.category)
    }
}

/// Score as the provider delivered it; textual scores are parsed during normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawScore {
    Number(f64),
    Text(String),
}

/// Provider-agnostic sample produced by the fetch adapter, in provider order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSample {
    pub keyword: String,
    pub rank: Option<i64>,
    pub score: Option<RawScore>,
    pub query_type: Option<String>,
}

impl RawSample {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            ..Self::default()
        }
    }
}

/// Trimmed, non-empty keyword text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Keyword(String);

impl Keyword {
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 1-based rank, bounded by the `INTEGER` column it is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(i32);

impl Rank {
    pub fn new(value: i64) -> Option<Self> {
        i32::try_from(value).ok().filter(|v| *v >= 1).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.unsigned_abs()
    }

    pub fn to_i32(self) -> i32 {
        self.0
    }
}

/// Provenance annotation stored alongside each fact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub mode: RetrievalMode,
    pub timeframe: String,
    pub geo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
}

impl RecordMeta {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Canonical fact row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRecord {
    pub source_id: String,
    pub country: String,
    pub category_key: CategoryKey,
    pub window_period: WindowPeriod,
    pub keyword: Keyword,
    pub rank: Option<Rank>,
    pub raw_score: Option<f64>,
    pub meta: RecordMeta,
    pub collected_at: DateTime<Utc>,
}

impl TrendRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            source_id: self.source_id.clone(),
            country: self.country.clone(),
            category_key: self.category_key.clone(),
            window_period: self.window_period.as_str().to_string(),
            keyword: self.keyword.clone(),
            collected_at: self.collected_at,
        }
    }
}

/// Uniqueness key of `trend_raw`. Later writes with an equal key are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub source_id: String,
    pub country: String,
    pub category_key: CategoryKey,
    pub window_period: String,
    pub keyword: Keyword,
    pub collected_at: DateTime<Utc>,
}

/// Granularity applied to `collected_at` so reruns inside one bucket collide on the natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionBucket {
    #[default]
    Day,
    Hour,
    Exact,
}

impl CollectionBucket {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "day" => Some(Self::Day),
            "hour" => Some(Self::Hour),
            "exact" => Some(Self::Exact),
            _ => None,
        }
    }

    pub fn truncate(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let step = match self {
            Self::Day => TimeDelta::days(1),
            Self::Hour => TimeDelta::hours(1),
            Self::Exact => return at,
        };
        at.duration_trunc(step).unwrap_or(at)
    }
}
