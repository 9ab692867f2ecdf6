use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::PolygonConfig;
use crate::error::ProviderError;
use crate::model::{ProviderKind, Quote, normalize_symbol};
use crate::provider::{QuoteProvider, decimal_from_number, volume_from_decimal};

const PROVIDER: &str = "polygon";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Polygon.io aggregates ("bars") client.
///
/// Timestamps arrive as epoch milliseconds in UTC.
pub struct PolygonProvider {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    config: PolygonConfig,
}

impl PolygonProvider {
    pub fn new(config: PolygonConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(nonzero!(5u32));
        Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
            config,
        }
    }

    fn aggregates_url(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> String {
        format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            normalize_symbol(symbol),
            self.config.multiplier,
            self.config.timespan,
            from.format(DATE_FORMAT),
            to.format(DATE_FORMAT),
        )
    }

    fn query_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("adjusted", self.config.adjusted.to_string()),
            ("sort", self.config.sort.clone()),
            ("limit", self.config.limit.to_string()),
        ]
    }
}

impl QuoteProvider for PolygonProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Polygon
    }

    fn fetch_quotes(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'_, Result<serde_json::Value, Report<ProviderError>>> {
        let url = self.aggregates_url(symbol, from, to);
        Box::pin(async move {
            self.rate_limiter.until_ready().await;
            debug!(url = %url, "polygon aggregates request");

            let api_key = self.config.api_key.as_deref().unwrap_or_default();
            let response = self
                .client
                .get(&url)
                .bearer_auth(api_key)
                .query(&self.query_params())
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

            let payload: serde_json::Value =
                response
                    .json()
                    .await
                    .change_context(ProviderError::ResponseParse {
                        provider: PROVIDER.into(),
                    })?;

            info!(
                url = %url,
                results = payload.get("resultsCount").and_then(|v| v.as_u64()).unwrap_or(0),
                "polygon aggregates fetched"
            );
            Ok(payload)
        })
    }

    fn normalize(
        &self,
        symbol: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<Quote>, Report<ProviderError>> {
        normalize_aggregates(symbol, payload)
    }
}

fn normalize_aggregates(
    symbol: &str,
    payload: serde_json::Value,
) -> Result<Vec<Quote>, Report<ProviderError>> {
    let response: PolygonAggregates =
        serde_json::from_value(payload).change_context(ProviderError::ResponseParse {
            provider: PROVIDER.into(),
        })?;

    let Some(results) = response.results else {
        return Err(Report::new(ProviderError::Empty {
            provider: PROVIDER.into(),
            symbol: symbol.to_owned(),
        })
        .attach(format!("status: {}", response.status.unwrap_or_default())));
    };

    results.into_iter().map(PolygonBar::into_quote).collect()
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PolygonAggregates {
    status: Option<String>,
    #[serde(default)]
    results: Option<Vec<PolygonBar>>,
}

#[derive(Debug, Deserialize)]
struct PolygonBar {
    /// Bar start, epoch milliseconds.
    t: i64,
    o: serde_json::Number,
    c: serde_json::Number,
    h: serde_json::Number,
    l: serde_json::Number,
    v: serde_json::Number,
    n: Option<i64>,
    vw: Option<serde_json::Number>,
}

impl PolygonBar {
    fn into_quote(self) -> Result<Quote, Report<ProviderError>> {
        let parse_error = || ProviderError::ResponseParse {
            provider: PROVIDER.into(),
        };
        let price = |field: &'static str, number: &serde_json::Number| {
            decimal_from_number(number)
                .ok_or_else(|| Report::new(parse_error()).attach(format!("{field}: {number}")))
        };

        let time = DateTime::from_timestamp_millis(self.t)
            .ok_or_else(|| Report::new(parse_error()).attach(format!("t: {}", self.t)))?;
        let volume = price("v", &self.v).and_then(|v| {
            volume_from_decimal(v)
                .ok_or_else(|| Report::new(parse_error()).attach(format!("v: {v}")))
        })?;
        let vwap = self.vw.as_ref().map(|vw| price("vw", vw)).transpose()?;

        Ok(Quote {
            time,
            open: price("o", &self.o)?,
            close: price("c", &self.c)?,
            high: price("h", &self.h)?,
            low: price("l", &self.l)?,
            volume,
            trade_count: self.n,
            vwap,
            raw_timestamp: None,
        })
    }
}
