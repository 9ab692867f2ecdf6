pub mod alpha_vantage;
pub mod polygon;

use std::str::FromStr;

use chrono::NaiveDate;
use error_stack::Report;
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::error::ProviderError;
use crate::model::{ProviderKind, Quote};

/// Abstraction over a market-data vendor.
///
/// Fetching and normalizing are split so the pipeline owns the conversion
/// step and payloads can be replayed without network access.
pub trait QuoteProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Fetch the provider-native payload for `symbol` between two dates.
    ///
    /// Transport failures and non-2xx responses map to
    /// [`ProviderError::Unavailable`].
    fn fetch_quotes(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> BoxFuture<'_, Result<serde_json::Value, Report<ProviderError>>>;

    /// Convert a payload from [`QuoteProvider::fetch_quotes`] into quotes
    /// with UTC timestamps and fixed-point prices.
    ///
    /// A payload without a result set is [`ProviderError::Empty`]; an empty
    /// result set is an empty `Vec`.
    fn normalize(
        &self,
        symbol: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<Quote>, Report<ProviderError>>;
}

/// Parse a JSON number into a `Decimal` through its textual form, so
/// `140.41` stays exactly `140.41`.
pub fn decimal_from_number(number: &serde_json::Number) -> Option<Decimal> {
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Volumes are whole shares; fractional values from adjusted series are truncated.
pub fn volume_from_decimal(value: Decimal) -> Option<i64> {
    value.trunc().to_i64()
}
