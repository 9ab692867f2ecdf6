use chrono::{DateTime, Duration, Utc};
use error_stack::Report;
use tracing::debug;

use crate::error::StorageError;
use crate::model::DailyPoint;
use crate::storage::QuoteStore;

pub const DEFAULT_LOOKBACK_PAD_DAYS: u32 = 40;

/// One point per UTC calendar day over `[as_of - days, as_of]`, using the
/// latest quote recorded that day, ascending by date.
///
/// The per-day maxima are computed over a range widened by `lookback_pad`
/// days, then only the timestamps inside the requested window are fetched.
/// Days without quotes are absent; nothing is filled forward.
pub async fn daily_series(
    store: &dyn QuoteStore,
    symbol: &str,
    days: u32,
    as_of: DateTime<Utc>,
    lookback_pad: u32,
) -> Result<Vec<DailyPoint>, Report<StorageError>> {
    let start = days_before(as_of, days)?;
    let padded_start = days_before(start, lookback_pad)?;

    let latest = store
        .latest_timestamp_per_day(symbol, padded_start, as_of)
        .await?;
    let times: Vec<DateTime<Utc>> = latest
        .into_iter()
        .map(|(_, time)| time)
        .filter(|time| *time >= start && *time <= as_of)
        .collect();

    let quotes = store.quotes_at(symbol, &times).await?;
    let mut points: Vec<DailyPoint> = quotes.iter().map(DailyPoint::from_quote).collect();
    points.sort_by_key(|p| p.date);

    debug!(symbol, days, points = points.len(), "daily series reduced");
    Ok(points)
}

fn days_before(at: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>, Report<StorageError>> {
    Duration::try_days(i64::from(days))
        .and_then(|delta| at.checked_sub_signed(delta))
        .ok_or_else(|| {
            Report::new(StorageError::InvalidRange {
                reason: format!("{days} days before {at}"),
            })
        })
}
