//! Process configuration: environment settings plus the YAML dimensions file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use trendpulse_adapters::BackoffPolicy;
use trendpulse_core::{
    CategoryKey, CategorySpec, CollectionBucket, CountryMapping, DimensionError, Dimensions,
    RetrievalMode, Source, WindowPeriod, DEFAULT_MAX_RESULTS,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no data store configured: set TRENDPULSE_DATABASE_URL (or PG_DSN / DATABASE_URL)")]
    MissingDatabaseUrl,
    #[error("TRENDPULSE_PROVIDER_URL is required when TRENDPULSE_PROVIDER=http")]
    MissingProviderUrl,
    #[error("invalid value `{value}` for {name}")]
    InvalidValue { name: &'static str, value: String },
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Dimensions(#[from] DimensionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSettings {
    Http { endpoint: String },
    Fixtures { dir: PathBuf },
}

/// Comma-list overrides for the dimension lists of the YAML file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionOverrides {
    pub countries: Option<Vec<String>>,
    pub windows: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub dimensions_path: PathBuf,
    pub overrides: DimensionOverrides,
    pub provider: ProviderSettings,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub concurrency: usize,
    pub rate_limit_per_sec: Option<u32>,
    pub max_retries: usize,
    pub reports_dir: Option<PathBuf>,
    pub collection_bucket: CollectionBucket,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("TRENDPULSE_DATABASE_URL")
            .or_else(|| get("PG_DSN"))
            .or_else(|| get("DATABASE_URL"))
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        let provider = match get("TRENDPULSE_PROVIDER").as_deref().map(str::trim) {
            None | Some("http") => ProviderSettings::Http {
                endpoint: get("TRENDPULSE_PROVIDER_URL").ok_or(ConfigError::MissingProviderUrl)?,
            },
            Some("fixtures") => ProviderSettings::Fixtures {
                dir: get("TRENDPULSE_FIXTURES_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("fixtures")),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "TRENDPULSE_PROVIDER",
                    value: other.to_string(),
                })
            }
        };

        let collection_bucket = match get("TRENDPULSE_COLLECTION_BUCKET") {
            None => CollectionBucket::default(),
            Some(raw) => CollectionBucket::parse(&raw).ok_or(ConfigError::InvalidValue {
                name: "TRENDPULSE_COLLECTION_BUCKET",
                value: raw,
            })?,
        };

        Ok(Self {
            database_url,
            dimensions_path: get("TRENDPULSE_DIMENSIONS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("dimensions.yaml")),
            overrides: DimensionOverrides {
                countries: get("TRENDPULSE_COUNTRIES").map(|v| split_list(&v)),
                windows: get("TRENDPULSE_WINDOWS").map(|v| split_list(&v)),
                categories: get("TRENDPULSE_CATEGORIES").map(|v| split_list(&v)),
            },
            provider,
            http_timeout_secs: parse_number(&get, "TRENDPULSE_HTTP_TIMEOUT_SECS")?.unwrap_or(20),
            user_agent: get("TRENDPULSE_USER_AGENT")
                .unwrap_or_else(|| "trendpulse-bot/0.1".to_string()),
            concurrency: parse_number(&get, "TRENDPULSE_CONCURRENCY")?
                .unwrap_or(1)
                .max(1),
            rate_limit_per_sec: parse_number(&get, "TRENDPULSE_RATE_LIMIT_PER_SEC")?,
            max_retries: parse_number(&get, "TRENDPULSE_MAX_RETRIES")?
                .unwrap_or(BackoffPolicy::default().max_retries),
            reports_dir: get("TRENDPULSE_REPORTS_DIR").map(PathBuf::from),
            collection_bucket,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }

    pub async fn load_dimensions(&self) -> Result<(Source, Dimensions), ConfigError> {
        let file = DimensionsFile::load(&self.dimensions_path).await?;
        file.resolve(&self.overrides)
    }
}

fn parse_number<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CountryEntry {
    Code(String),
    Mapping {
        country: String,
        #[serde(default)]
        gt_geo: Option<String>,
        #[serde(default)]
        ttc_region: Option<String>,
    },
}

impl CountryEntry {
    fn into_mapping(self) -> CountryMapping {
        match self {
            Self::Code(code) => CountryMapping::from_code(&code),
            Self::Mapping {
                country,
                gt_geo,
                ttc_region,
            } => {
                let base = CountryMapping::from_code(&country);
                CountryMapping {
                    gt_geo: gt_geo.map(|g| g.trim().to_string()).unwrap_or(base.gt_geo),
                    ttc_region: ttc_region
                        .map(|r| r.trim().to_string())
                        .unwrap_or(base.ttc_region),
                    country: base.country,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryEntry {
    key: String,
    #[serde(default = "default_mode")]
    mode: RetrievalMode,
    #[serde(default)]
    provider_category: Option<u32>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    max_results: Option<usize>,
}

fn default_mode() -> RetrievalMode {
    RetrievalMode::Ranked
}

impl CategoryEntry {
    fn into_spec(self) -> CategorySpec {
        CategorySpec {
            key: CategoryKey::new(&self.key),
            mode: self.mode,
            provider_category: self.provider_category,
            keywords: self
                .keywords
                .iter()
                .map(|k| k.trim())
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
            max_results: self.max_results.unwrap_or(DEFAULT_MAX_RESULTS).max(1),
        }
    }
}

/// On-disk shape of `dimensions.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DimensionsFile {
    #[serde(default)]
    source: Option<Source>,
    #[serde(default)]
    countries: Vec<CountryEntry>,
    #[serde(default)]
    windows: Vec<String>,
    #[serde(default)]
    categories: Vec<CategoryEntry>,
}

impl DimensionsFile {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Applies overrides and validates. Overridden countries and categories reuse
    /// their file definitions when present.
    pub fn resolve(
        self,
        overrides: &DimensionOverrides,
    ) -> Result<(Source, Dimensions), ConfigError> {
        let file_countries: Vec<CountryMapping> = self
            .countries
            .into_iter()
            .map(CountryEntry::into_mapping)
            .filter(|c| !c.country.is_empty())
            .collect();
        let file_categories: Vec<CategorySpec> = self
            .categories
            .into_iter()
            .map(CategoryEntry::into_spec)
            .filter(|c| !c.key.as_str().is_empty())
            .collect();

        let countries = match &overrides.countries {
            None => file_countries,
            Some(codes) => codes
                .iter()
                .map(|code| {
                    let wanted = CountryMapping::from_code(code);
                    file_countries
                        .iter()
                        .find(|c| c.country == wanted.country)
                        .cloned()
                        .unwrap_or(wanted)
                })
                .collect(),
        };

        let windows = overrides
            .windows
            .as_ref()
            .unwrap_or(&self.windows)
            .iter()
            .filter(|w| !w.trim().is_empty())
            .map(|w| WindowPeriod::parse(w))
            .collect();

        let categories = match &overrides.categories {
            None => file_categories,
            Some(keys) => keys
                .iter()
                .map(|key| {
                    let wanted = CategoryKey::new(key);
                    file_categories
                        .iter()
                        .find(|c| c.key == wanted)
                        .cloned()
                        .unwrap_or_else(|| CategorySpec::ranked(key, None))
                })
                .collect(),
        };

        let dimensions = Dimensions::new(countries, windows, categories)?;
        Ok((self.source.unwrap_or_default(), dimensions))
    }
}
