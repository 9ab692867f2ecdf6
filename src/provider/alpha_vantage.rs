use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::AlphaVantageConfig;
use crate::error::{ConfigError, ProviderError};
use crate::model::{ProviderKind, Quote, normalize_symbol};
use crate::provider::{QuoteProvider, volume_from_decimal};

const PROVIDER: &str = "alpha_vantage";
const FUNCTION: &str = "TIME_SERIES_INTRADAY";
const META_DATA_KEY: &str = "Meta Data";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Alpha Vantage intraday client.
///
/// The API serves one calendar month per request and reports naive
/// exchange-local timestamps, which are localized with the configured zone.
pub struct AlphaVantageProvider {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    config: AlphaVantageConfig,
    timezone: Tz,
}

impl AlphaVantageProvider {
    pub fn new(config: AlphaVantageConfig) -> Result<Self, Report<ConfigError>> {
        let timezone = config.timezone.parse::<Tz>().map_err(|_| {
            Report::new(ConfigError::Validation {
                field: format!(
                    "providers.alpha_vantage.timezone \"{}\" is not an IANA zone",
                    config.timezone
                ),
            })
        })?;
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(nonzero!(5u32));
        Ok(Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
            config,
            timezone,
        })
    }

    async fn fetch_month(
        &self,
        symbol: &str,
        month: &str,
    ) -> Result<Map<String, Value>, Report<ProviderError>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/query", self.config.base_url.trim_end_matches('/'));
        let params = [
            ("function", FUNCTION),
            ("symbol", symbol),
            ("interval", self.config.interval.as_str()),
            ("month", month),
            ("outputsize", "full"),
            ("apikey", self.config.api_key.as_deref().unwrap_or_default()),
        ];

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .change_context(ProviderError::Unavailable {
                provider: PROVIDER.into(),
            })?;

        if !response.status().is_success() {
            return Err(Report::new(ProviderError::Unavailable {
                provider: PROVIDER.into(),
            })
            .attach(format!("HTTP status: {}", response.status())));
        }

        let payload: Map<String, Value> =
            response
                .json()
                .await
                .change_context(ProviderError::ResponseParse {
                    provider: PROVIDER.into(),
                })?;

        check_service_messages(symbol, &payload)?;
        debug!(symbol, month, "alpha vantage month fetched");
        Ok(payload)
    }
}

impl QuoteProvider for AlphaVantageProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AlphaVantage
    }

    fn fetch_quotes(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'_, Result<Value, Report<ProviderError>>> {
        let symbol = normalize_symbol(symbol);
        Box::pin(async move {
            let mut pages = Vec::new();
            for month in months_between(from, to) {
                pages.push(self.fetch_month(&symbol, &month).await?);
            }

            let merged = merge_months(pages, from, to);
            let results = dataset_key(&merged)
                .and_then(|key| merged.get(&key).and_then(Value::as_object).map(Map::len))
                .unwrap_or(0);
            info!(
                symbol = %symbol,
                from = %from,
                to = %to,
                results,
                "alpha vantage series fetched"
            );
            Ok(Value::Object(merged))
        })
    }

    fn normalize(&self, symbol: &str, payload: Value) -> Result<Vec<Quote>, Report<ProviderError>> {
        let empty = || ProviderError::Empty {
            provider: PROVIDER.into(),
            symbol: symbol.to_owned(),
        };
        let Value::Object(mut payload) = payload else {
            return Err(Report::new(ProviderError::ResponseParse {
                provider: PROVIDER.into(),
            })
            .attach("payload is not a JSON object"));
        };
        let Some(key) = dataset_key(&payload) else {
            return Err(Report::new(empty()));
        };
        let Some(Value::Object(entries)) = payload.remove(&key) else {
            return Err(Report::new(empty()).attach(format!("\"{key}\" is not an object")));
        };

        let mut quotes = entries
            .into_iter()
            .map(|(timestamp, entry)| {
                let bar: AlphaVantageBar = serde_json::from_value(entry)
                    .change_context(ProviderError::ResponseParse {
                        provider: PROVIDER.into(),
                    })
                    .attach_with(|| format!("timestamp: {timestamp}"))?;
                bar.into_quote(timestamp, self.timezone)
            })
            .collect::<Result<Vec<_>, _>>()?;

        // The API lists newest first.
        quotes.sort_by_key(|q| q.time);
        Ok(quotes)
    }
}

/// The first key that is not the metadata block names the series.
fn dataset_key(payload: &Map<String, Value>) -> Option<String> {
    payload
        .keys()
        .find(|key| !key.eq_ignore_ascii_case(META_DATA_KEY))
        .cloned()
}

/// Alpha Vantage reports throttling and bad requests inside a 200 response.
fn check_service_messages(
    symbol: &str,
    payload: &Map<String, Value>,
) -> Result<(), Report<ProviderError>> {
    for key in ["Note", "Information"] {
        if let Some(message) = payload.get(key) {
            return Err(Report::new(ProviderError::Unavailable {
                provider: PROVIDER.into(),
            })
            .attach(format!("{key}: {message}")));
        }
    }
    if let Some(message) = payload.get("Error Message") {
        return Err(Report::new(ProviderError::Empty {
            provider: PROVIDER.into(),
            symbol: symbol.to_owned(),
        })
        .attach(format!("Error Message: {message}")));
    }
    Ok(())
}

/// `YYYY-MM` for every calendar month overlapping `[from, to]`.
fn months_between(from: NaiveDate, to: NaiveDate) -> Vec<String> {
    let mut months = Vec::new();
    let (mut year, mut month) = (from.year(), from.month());
    while (year, month) <= (to.year(), to.month()) {
        months.push(format!("{year:04}-{month:02}"));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    months
}

/// Fold monthly pages into one payload shaped like a single page, keeping
/// only entries dated within `[from, to]`.
///
/// A page without a series contributes nothing, so the result lacks a
/// series key only when every page did.
fn merge_months(
    pages: Vec<Map<String, Value>>,
    from: NaiveDate,
    to: NaiveDate,
) -> Map<String, Value> {
    let mut meta: Option<Value> = None;
    let mut series: Option<(String, Map<String, Value>)> = None;

    for mut page in pages {
        if meta.is_none() {
            meta = page.remove(META_DATA_KEY);
        }
        let Some(key) = dataset_key(&page) else {
            continue;
        };
        if let Some(Value::Object(entries)) = page.remove(&key) {
            series
                .get_or_insert_with(|| (key, Map::new()))
                .1
                .extend(entries.into_iter().filter(|(ts, _)| within_dates(ts, from, to)));
        }
    }

    let mut merged = Map::new();
    if let Some(meta) = meta {
        merged.insert(META_DATA_KEY.to_owned(), meta);
    }
    if let Some((key, entries)) = series {
        merged.insert(key, Value::Object(entries));
    }
    merged
}

/// Whether a `YYYY-MM-DD HH:MM:SS` key falls on a local date in `[from, to]`.
/// Keys that do not start with a date are kept so `normalize` reports them.
fn within_dates(timestamp: &str, from: NaiveDate, to: NaiveDate) -> bool {
    match timestamp
        .get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
    {
        Some(day) => day >= from && day <= to,
        None => true,
    }
}

/// Attach `zone` to a naive local time. The repeated hour at the end of
/// daylight saving resolves to standard time; a skipped hour has no instant.
fn localize(naive: NaiveDateTime, zone: Tz) -> Option<DateTime<Utc>> {
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(local) => Some(local.with_timezone(&Utc)),
        LocalResult::Ambiguous(_, standard) => Some(standard.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AlphaVantageBar {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

impl AlphaVantageBar {
    fn into_quote(self, timestamp: String, zone: Tz) -> Result<Quote, Report<ProviderError>> {
        let parse_error = || ProviderError::ResponseParse {
            provider: PROVIDER.into(),
        };
        let decimal = |field: &str, value: &str| {
            Decimal::from_str(value.trim())
                .change_context(parse_error())
                .attach_with(|| format!("{field}: {value}"))
        };

        let naive = NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT)
            .change_context(parse_error())
            .attach_with(|| format!("timestamp: {timestamp}"))?;
        let time = localize(naive, zone).ok_or_else(|| {
            Report::new(parse_error())
                .attach(format!("timestamp {timestamp} does not exist in {}", zone.name()))
        })?;
        let volume = volume_from_decimal(decimal("volume", &self.volume)?).ok_or_else(|| {
            Report::new(parse_error()).attach(format!("volume: {}", self.volume))
        })?;

        Ok(Quote {
            time,
            open: decimal("open", &self.open)?,
            close: decimal("close", &self.close)?,
            high: decimal("high", &self.high)?,
            low: decimal("low", &self.low)?,
            volume,
            trade_count: None,
            vwap: None,
            raw_timestamp: Some(timestamp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn provider() -> AlphaVantageProvider {
        AlphaVantageProvider::new(AlphaVantageConfig {
            api_key: Some("test-key".into()),
            base_url: "https://www.alphavantage.co".into(),
            interval: "1min".into(),
            timezone: "America/New_York".into(),
            requests_per_minute: 5,
        })
        .unwrap()
    }

    fn bar(open: &str, close: &str) -> Value {
        serde_json::json!({
            "1. open": open,
            "2. high": "190.0000",
            "3. low": "180.0000",
            "4. close": close,
            "5. volume": "1200"
        })
    }

    #[test]
    fn unknown_timezone_rejected() {
        let result = AlphaVantageProvider::new(AlphaVantageConfig {
            api_key: None,
            base_url: String::new(),
            interval: "1min".into(),
            timezone: "Not/AZone".into(),
            requests_per_minute: 5,
        });
        assert!(result.is_err());
    }

    #[test]
    fn eastern_timestamps_convert_to_utc_across_dst() {
        let payload = serde_json::json!({
            "Meta Data": { "2. Symbol": "IBM" },
            "Time Series (1min)": {
                "2024-07-09 09:30:00": bar("185.1200", "185.5000"),
                "2024-01-09 09:30:00": bar("160.0000", "161.2500")
            }
        });

        let quotes = provider().normalize("IBM", payload).unwrap();
        assert_eq!(quotes.len(), 2);

        // EST is UTC-5, EDT is UTC-4; output is ascending.
        assert_eq!(quotes[0].time, Utc.with_ymd_and_hms(2024, 1, 9, 14, 30, 0).unwrap());
        assert_eq!(quotes[1].time, Utc.with_ymd_and_hms(2024, 7, 9, 13, 30, 0).unwrap());
        assert_eq!(quotes[0].raw_timestamp.as_deref(), Some("2024-01-09 09:30:00"));
        assert_eq!(quotes[0].close, dec!(161.25));
        assert_eq!(quotes[1].open, dec!(185.12));
        assert_eq!(quotes[1].volume, 1200);
        assert!(quotes[1].vwap.is_none());
        assert!(quotes[1].trade_count.is_none());
    }

    #[test]
    fn repeated_fall_back_hour_resolves_to_standard_time() {
        let naive = NaiveDateTime::parse_from_str("2024-11-03 01:30:00", TIMESTAMP_FORMAT).unwrap();
        let utc = localize(naive, chrono_tz::America::New_York).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 11, 3, 6, 30, 0).unwrap());
    }

    #[test]
    fn skipped_spring_forward_hour_is_parse_error() {
        let payload = serde_json::json!({
            "Time Series (1min)": { "2024-03-10 02:30:00": bar("1", "1") }
        });
        let err = provider().normalize("IBM", payload).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProviderError::ResponseParse { .. }
        ));
    }

    #[test]
    fn payload_without_series_is_empty_error() {
        let payload = serde_json::json!({ "Meta Data": { "2. Symbol": "IBM" } });
        let err = provider().normalize("IBM", payload).unwrap_err();
        assert!(matches!(err.current_context(), ProviderError::Empty { .. }));
    }

    #[test]
    fn empty_series_is_not_an_error() {
        let payload = serde_json::json!({ "Time Series (1min)": {} });
        assert!(provider().normalize("IBM", payload).unwrap().is_empty());
    }

    #[test]
    fn throttling_note_is_unavailable() {
        let payload = serde_json::json!({ "Note": "Thank you for using Alpha Vantage!" });
        let err = check_service_messages("IBM", payload.as_object().unwrap()).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProviderError::Unavailable { .. }
        ));
    }

    #[test]
    fn error_message_is_empty() {
        let payload = serde_json::json!({ "Error Message": "Invalid API call." });
        let err = check_service_messages("NOPE", payload.as_object().unwrap()).unwrap_err();
        assert!(matches!(err.current_context(), ProviderError::Empty { .. }));
    }

    fn page(entries: Value) -> Map<String, Value> {
        let mut page = Map::new();
        page.insert(META_DATA_KEY.into(), serde_json::json!({ "2. Symbol": "IBM" }));
        page.insert("Time Series (1min)".into(), entries);
        page
    }

    #[test]
    fn merged_months_are_trimmed_to_requested_dates() {
        let january = page(serde_json::json!({
            "2024-01-30 15:59:00": bar("1", "1"),
            "2024-01-31 15:59:00": bar("2", "2"),
        }));
        let february = page(serde_json::json!({
            "2024-02-01 09:30:00": bar("3", "3"),
            "2024-02-02 09:30:00": bar("4", "4"),
        }));

        let merged = merge_months(
            vec![january, february],
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        assert!(merged.contains_key(META_DATA_KEY));

        let quotes = provider().normalize("IBM", Value::Object(merged)).unwrap();
        let closes: Vec<Decimal> = quotes.iter().map(|q| q.close).collect();
        assert_eq!(closes, vec![dec!(2), dec!(3)]);
    }

    #[test]
    fn merge_without_any_series_is_empty() {
        let mut throttled = Map::new();
        throttled.insert(META_DATA_KEY.into(), serde_json::json!({}));
        let merged = merge_months(
            vec![throttled],
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        );
        let err = provider().normalize("IBM", Value::Object(merged)).unwrap_err();
        assert!(matches!(err.current_context(), ProviderError::Empty { .. }));
    }

    #[test]
    fn months_cover_range_inclusive() {
        let months = months_between(
            NaiveDate::from_ymd_opt(2023, 11, 20).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        assert_eq!(months, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);

        let single = months_between(
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 30).unwrap(),
        );
        assert_eq!(single, vec!["2024-01"]);
    }
}
