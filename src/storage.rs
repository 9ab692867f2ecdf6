pub mod sqlite;

use chrono::{DateTime, NaiveDate, Utc};
use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::StorageError;
use crate::model::{Instrument, Quote};

/// Durable `(instrument, time) -> OHLCV` store.
///
/// Quotes are append-only: a write whose key already exists is dropped
/// silently and the stored row is left untouched. Every range bound is
/// inclusive and every returned sequence is ascending by time.
pub trait QuoteStore: Send + Sync {
    /// Create the instrument, or update its name/active flag if the
    /// normalized symbol already exists.
    fn upsert_instrument(
        &self,
        symbol: &str,
        name: Option<&str>,
        active: bool,
    ) -> BoxFuture<'_, Result<Instrument, Report<StorageError>>>;

    fn get_instrument(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<Option<Instrument>, Report<StorageError>>>;

    fn list_instruments(
        &self,
        active_only: bool,
    ) -> BoxFuture<'_, Result<Vec<Instrument>, Report<StorageError>>>;

    /// Write `quotes` in batches, ignoring duplicate keys.
    ///
    /// Returns the number of rows attempted, not the number inserted. Fails
    /// with [`StorageError::InvalidInstrument`] before any batch is written
    /// when `symbol` does not resolve.
    fn bulk_write(
        &self,
        symbol: &str,
        quotes: &[Quote],
    ) -> BoxFuture<'_, Result<usize, Report<StorageError>>>;

    fn query_range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Quote>, Report<StorageError>>>;

    /// For each UTC calendar date with at least one quote in range, the
    /// maximum timestamp recorded on that date.
    fn latest_timestamp_per_day(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<(NaiveDate, DateTime<Utc>)>, Report<StorageError>>>;

    /// Quotes stored at exactly the given instants.
    fn quotes_at(
        &self,
        symbol: &str,
        times: &[DateTime<Utc>],
    ) -> BoxFuture<'_, Result<Vec<Quote>, Report<StorageError>>>;
}
