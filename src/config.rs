use std::path::Path;

use chrono_tz::Tz;
use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::ProviderKind;

const POLYGON_API_KEY_ENV: &str = "POLYGON_API_KEY";
const ALPHA_VANTAGE_API_KEY_ENV: &str = "ALPHA_VANTAGE_API_KEY";

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_provider() -> String {
    "polygon".into()
}

fn default_batch_size() -> usize {
    1000
}

fn default_sync_days_ago() -> u32 {
    2
}

fn default_instrument_sync_days_ago() -> u32 {
    32
}

fn default_backfill_years() -> u32 {
    5
}

fn default_backfill_chunk_days() -> u32 {
    30
}

fn default_polygon_base_url() -> String {
    "https://api.polygon.io".into()
}

fn default_multiplier() -> u32 {
    5
}

fn default_timespan() -> String {
    "minute".into()
}

fn default_sort() -> String {
    "asc".into()
}

fn default_polygon_limit() -> u32 {
    50_000
}

fn default_alpha_vantage_base_url() -> String {
    "https://www.alphavantage.co".into()
}

fn default_interval() -> String {
    "1min".into()
}

fn default_timezone() -> String {
    "America/New_York".into()
}

fn default_requests_per_minute() -> u32 {
    5
}

fn default_days() -> u32 {
    28
}

fn default_lookback_pad_days() -> u32 {
    crate::daily::DEFAULT_LOOKBACK_PAD_DAYS
}

fn default_ma_windows() -> Vec<usize> {
    vec![5, 20]
}

fn default_rsi_period() -> usize {
    14
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub indicators: IndicatorConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct IngestionConfig {
    /// Accepted values: `"polygon"` | `"alpha_vantage"`
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Look-back used by the recurring `sync` of all active instruments.
    #[serde(default = "default_sync_days_ago")]
    pub sync_days_ago: u32,
    /// Look-back used for the first sync after an instrument is added.
    #[serde(default = "default_instrument_sync_days_ago")]
    pub instrument_sync_days_ago: u32,
    #[serde(default = "default_backfill_years")]
    pub backfill_years: u32,
    #[serde(default = "default_backfill_chunk_days")]
    pub backfill_chunk_days: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            batch_size: default_batch_size(),
            sync_days_ago: default_sync_days_ago(),
            instrument_sync_days_ago: default_instrument_sync_days_ago(),
            backfill_years: default_backfill_years(),
            backfill_chunk_days: default_backfill_chunk_days(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProvidersConfig {
    pub polygon: Option<PolygonConfig>,
    pub alpha_vantage: Option<AlphaVantageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolygonConfig {
    /// Falls back to `POLYGON_API_KEY` when omitted.
    pub api_key: Option<String>,
    #[serde(default = "default_polygon_base_url")]
    pub base_url: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_timespan")]
    pub timespan: String,
    #[serde(default = "default_true")]
    pub adjusted: bool,
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default = "default_polygon_limit")]
    pub limit: u32,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlphaVantageConfig {
    /// Falls back to `ALPHA_VANTAGE_API_KEY` when omitted.
    pub api_key: Option<String>,
    #[serde(default = "default_alpha_vantage_base_url")]
    pub base_url: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    /// IANA zone the provider's naive timestamps are expressed in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default = "default_lookback_pad_days")]
    pub lookback_pad_days: u32,
    #[serde(default = "default_ma_windows")]
    pub ma_windows: Vec<usize>,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            days: default_days(),
            lookback_pad_days: default_lookback_pad_days(),
            ma_windows: default_ma_windows(),
            rsi_period: default_rsi_period(),
        }
    }
}

impl AppConfig {
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        ProviderKind::from_str(&self.ingestion.provider)
    }
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
///
/// Missing provider API keys are resolved from the environment here, once,
/// so nothing downstream reads process state.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let mut config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    resolve_api_keys(&mut config, |name| std::env::var(name).ok());
    validate(&config)?;

    Ok(config)
}

fn resolve_api_keys(config: &mut AppConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(polygon) = config.providers.polygon.as_mut() {
        if polygon.api_key.is_none() {
            polygon.api_key = env(POLYGON_API_KEY_ENV);
        }
    }
    if let Some(alpha) = config.providers.alpha_vantage.as_mut() {
        if alpha.api_key.is_none() {
            alpha.api_key = env(ALPHA_VANTAGE_API_KEY_ENV);
        }
    }
}

const VALID_LOG_FORMATS: &[&str] = &["text", "json"];
const VALID_ALPHA_VANTAGE_INTERVALS: &[&str] = &["1min", "5min", "15min", "30min", "60min"];
const VALID_POLYGON_TIMESPANS: &[&str] = &["second", "minute", "hour", "day"];
const VALID_SORT_ORDERS: &[&str] = &["asc", "desc"];

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_general(config)?;
    validate_ingestion(config)?;
    validate_provider(config)?;
    validate_indicators(config)?;
    Ok(())
}

fn invalid(field: String) -> Report<ConfigError> {
    Report::new(ConfigError::Validation { field })
}

fn validate_general(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if !VALID_LOG_FORMATS.contains(&config.general.log_format.as_str()) {
        return Err(invalid(format!(
            "general.log_format \"{}\" is not valid",
            config.general.log_format
        )));
    }
    Ok(())
}

fn validate_ingestion(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let ingestion = &config.ingestion;
    if ingestion.batch_size == 0 {
        return Err(invalid("ingestion.batch_size must be > 0".into()));
    }
    if ingestion.backfill_chunk_days == 0 {
        return Err(invalid("ingestion.backfill_chunk_days must be > 0".into()));
    }
    Ok(())
}

fn validate_provider(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let Some(kind) = config.provider_kind() else {
        return Err(invalid(format!(
            "ingestion.provider \"{}\" is not a known provider",
            config.ingestion.provider
        )));
    };

    match kind {
        ProviderKind::Polygon => {
            let Some(polygon) = &config.providers.polygon else {
                return Err(invalid("providers.polygon section is required".into()));
            };
            if polygon.api_key.as_deref().is_none_or(str::is_empty) {
                return Err(invalid(format!(
                    "providers.polygon.api_key is required (or set {POLYGON_API_KEY_ENV})"
                )));
            }
            if polygon.multiplier == 0 || polygon.limit == 0 || polygon.requests_per_minute == 0 {
                return Err(invalid(
                    "providers.polygon multiplier, limit and requests_per_minute must be > 0"
                        .into(),
                ));
            }
            if !VALID_POLYGON_TIMESPANS.contains(&polygon.timespan.as_str()) {
                return Err(invalid(format!(
                    "providers.polygon.timespan \"{}\" is not valid",
                    polygon.timespan
                )));
            }
            if !VALID_SORT_ORDERS.contains(&polygon.sort.as_str()) {
                return Err(invalid(format!(
                    "providers.polygon.sort \"{}\" is not valid",
                    polygon.sort
                )));
            }
        }
        ProviderKind::AlphaVantage => {
            let Some(alpha) = &config.providers.alpha_vantage else {
                return Err(invalid("providers.alpha_vantage section is required".into()));
            };
            if alpha.api_key.as_deref().is_none_or(str::is_empty) {
                return Err(invalid(format!(
                    "providers.alpha_vantage.api_key is required (or set {ALPHA_VANTAGE_API_KEY_ENV})"
                )));
            }
            if alpha.requests_per_minute == 0 {
                return Err(invalid(
                    "providers.alpha_vantage.requests_per_minute must be > 0".into(),
                ));
            }
            if !VALID_ALPHA_VANTAGE_INTERVALS.contains(&alpha.interval.as_str()) {
                return Err(invalid(format!(
                    "providers.alpha_vantage.interval \"{}\" is not valid",
                    alpha.interval
                )));
            }
            if alpha.timezone.parse::<Tz>().is_err() {
                return Err(invalid(format!(
                    "providers.alpha_vantage.timezone \"{}\" is not an IANA zone",
                    alpha.timezone
                )));
            }
        }
    }
    Ok(())
}

fn validate_indicators(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let indicators = &config.indicators;
    if indicators.days == 0 {
        return Err(invalid("indicators.days must be > 0".into()));
    }
    if indicators.ma_windows.is_empty() || indicators.ma_windows.contains(&0) {
        return Err(invalid(
            "indicators.ma_windows must be non-empty and contain only values > 0".into(),
        ));
    }
    if indicators.rsi_period == 0 {
        return Err(invalid("indicators.rsi_period must be > 0".into()));
    }
    Ok(())
}
