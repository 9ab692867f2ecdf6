use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Market-data vendor a quote batch was sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Polygon,
    AlphaVantage,
}

impl ProviderKind {
    /// Parse a config-format string into a `ProviderKind`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "polygon" => Some(Self::Polygon),
            "alpha_vantage" => Some(Self::AlphaVantage),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Polygon => "polygon",
            Self::AlphaVantage => "alpha_vantage",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical instrument identity: trimmed, upper-cased ticker.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instrument {
    pub id: i64,
    pub symbol: String,
    pub name: Option<String>,
    pub active: bool,
}

/// One OHLCV observation for an instrument at a UTC instant.
///
/// Quotes are keyed by `(instrument, time)` in the store and never updated
/// after the first write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: i64,
    pub trade_count: Option<i64>,
    pub vwap: Option<Decimal>,
    pub raw_timestamp: Option<String>,
}

/// The representative (latest) quote of one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: i64,
    pub timestamp_of_record: DateTime<Utc>,
}

impl DailyPoint {
    pub fn from_quote(quote: &Quote) -> Self {
        Self {
            date: quote.time.date_naive(),
            close: quote.close,
            high: quote.high,
            low: quote.low,
            volume: quote.volume,
            timestamp_of_record: quote.time,
        }
    }
}
