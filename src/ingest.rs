use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use error_stack::{Report, ResultExt};
use tracing::{info, warn};

use crate::error::{IngestError, ProviderError, StorageError};
use crate::model::normalize_symbol;
use crate::provider::QuoteProvider;
use crate::storage::QuoteStore;

/// Pulls provider data for one instrument and lands it in the quote store.
///
/// Holds no mutable state, so one `Ingestor` can serve concurrent syncs;
/// overlapping ranges are absorbed by the store's ignore-on-conflict writes.
pub struct Ingestor {
    store: Arc<dyn QuoteStore>,
    provider: Arc<dyn QuoteProvider>,
}

/// Outcome of a fan-out over several instruments.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub quotes_attempted: usize,
}

impl Ingestor {
    pub fn new(store: Arc<dyn QuoteStore>, provider: Arc<dyn QuoteProvider>) -> Self {
        Self { store, provider }
    }

    /// Sync `[as_of - days_ago, as_of + 1 day]`.
    ///
    /// The extra day guards against providers that treat the end date as
    /// exclusive. Returns the number of quotes attempted.
    pub async fn sync(
        &self,
        symbol: &str,
        days_ago: u32,
        as_of: DateTime<Utc>,
    ) -> Result<usize, Report<IngestError>> {
        let (from, to) = sync_range(days_ago, as_of)?;
        self.sync_window(symbol, from, to).await
    }

    pub async fn sync_window(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<usize, Report<IngestError>> {
        let symbol = normalize_symbol(symbol);
        let provider = self.provider.kind();

        // Checked before fetching so an unknown instrument never costs a request.
        let instrument = self
            .store
            .get_instrument(&symbol)
            .await
            .change_context(IngestError::Store)?;
        if instrument.is_none() {
            return Err(Report::new(IngestError::InvalidInstrument { symbol }));
        }

        info!(symbol = %symbol, provider = %provider, from = %from, to = %to, "syncing quotes");

        let payload = self
            .provider
            .fetch_quotes(&symbol, from, to)
            .await
            .map_err(|report| upstream_report(report, &symbol))?;
        let quotes = self
            .provider
            .normalize(&symbol, payload)
            .map_err(|report| upstream_report(report, &symbol))?;

        let attempted = self
            .store
            .bulk_write(&symbol, &quotes)
            .await
            .map_err(|report| store_report(report, &symbol))?;

        info!(symbol = %symbol, provider = %provider, attempted, "quotes synced");
        Ok(attempted)
    }

    /// Walk back `360 * years` days in `chunk_days` windows, newest first.
    ///
    /// A window failing upstream is logged and skipped; an unknown
    /// instrument or a store failure aborts the walk.
    pub async fn backfill(
        &self,
        symbol: &str,
        years: u32,
        chunk_days: u32,
        as_of: DateTime<Utc>,
    ) -> Result<usize, Report<IngestError>> {
        let mut attempted = 0;
        for (from, to) in backfill_windows(years, chunk_days, as_of)? {
            match self.sync_window(symbol, from, to).await {
                Ok(count) => attempted += count,
                Err(report) if is_upstream(report.current_context()) => {
                    warn!(symbol, from = %from, to = %to, error = ?report, "backfill window skipped");
                }
                Err(report) => return Err(report),
            }
        }
        info!(symbol, years, attempted, "backfill complete");
        Ok(attempted)
    }
}

/// Sync every active instrument concurrently, one task per instrument.
///
/// Failures are logged and counted; they never cancel sibling syncs.
pub async fn sync_active(
    ingestor: Arc<Ingestor>,
    days_ago: u32,
    as_of: DateTime<Utc>,
) -> Result<SyncSummary, Report<IngestError>> {
    let instruments = ingestor
        .store
        .list_instruments(true)
        .await
        .change_context(IngestError::Store)?;

    let mut handles = Vec::with_capacity(instruments.len());
    for instrument in instruments {
        let ingestor = Arc::clone(&ingestor);
        let handle = tokio::spawn(async move {
            let result = ingestor.sync(&instrument.symbol, days_ago, as_of).await;
            (instrument.symbol, result)
        });
        handles.push(handle);
    }

    let mut summary = SyncSummary::default();
    for handle in handles {
        match handle.await {
            Ok((_, Ok(attempted))) => {
                summary.succeeded += 1;
                summary.quotes_attempted += attempted;
            }
            Ok((symbol, Err(report))) => {
                warn!(symbol = %symbol, error = ?report, "sync failed (continuing)");
                summary.failed += 1;
            }
            Err(e) => {
                warn!(error = %e, "sync task panicked (continuing)");
                summary.failed += 1;
            }
        }
    }

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        attempted = summary.quotes_attempted,
        "active instrument sync complete"
    );
    Ok(summary)
}

fn sync_range(
    days_ago: u32,
    as_of: DateTime<Utc>,
) -> Result<(NaiveDate, NaiveDate), Report<IngestError>> {
    let from = shift_days(as_of, -i64::from(days_ago))?;
    let to = shift_days(as_of, 1)?;
    Ok((from.date_naive(), to.date_naive()))
}

/// Contiguous windows covering `[as_of - 360 * years, as_of + 1 day]`.
///
/// Adjacent windows share their boundary date, which the store absorbs.
/// Only the newest window reaches past `as_of`.
fn backfill_windows(
    years: u32,
    chunk_days: u32,
    as_of: DateTime<Utc>,
) -> Result<Vec<(NaiveDate, NaiveDate)>, Report<IngestError>> {
    let total = i64::from(years) * 360;
    let chunk = i64::from(chunk_days.max(1));
    // Fails early when the oldest date is out of range.
    shift_days(as_of, -total)?;

    let mut windows = Vec::new();
    let mut newest = 0;
    while newest < total {
        let oldest = (newest + chunk).min(total);
        let from = shift_days(as_of, -oldest)?;
        let to = shift_days(as_of, if newest == 0 { 1 } else { -newest })?;
        windows.push((from.date_naive(), to.date_naive()));
        newest = oldest;
    }
    Ok(windows)
}

fn shift_days(at: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, Report<IngestError>> {
    let out_of_range = || {
        Report::new(IngestError::InvalidRange {
            reason: format!("{at} shifted by {days} days"),
        })
    };
    let delta = Duration::try_days(days).ok_or_else(out_of_range)?;
    at.checked_add_signed(delta).ok_or_else(out_of_range)
}

fn is_upstream(error: &IngestError) -> bool {
    matches!(
        error,
        IngestError::UpstreamUnavailable { .. } | IngestError::UpstreamEmpty { .. }
    )
}

/// Re-contextualize a provider report while keeping its retryability class.
fn upstream_report(report: Report<ProviderError>, symbol: &str) -> Report<IngestError> {
    let context = match report.current_context() {
        ProviderError::Unavailable { provider } => IngestError::UpstreamUnavailable {
            provider: provider.clone(),
        },
        ProviderError::Empty { .. } => IngestError::UpstreamEmpty {
            symbol: symbol.to_owned(),
        },
        ProviderError::ResponseParse { provider } => IngestError::UpstreamUnavailable {
            provider: provider.clone(),
        },
    };
    report.change_context(context)
}

fn store_report(report: Report<StorageError>, symbol: &str) -> Report<IngestError> {
    let context = match report.current_context() {
        StorageError::InvalidInstrument { .. } => IngestError::InvalidInstrument {
            symbol: symbol.to_owned(),
        },
        _ => IngestError::Store,
    };
    report.change_context(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::TimeZone;
    use futures::future::BoxFuture;

    use crate::model::{ProviderKind, Quote};
    use crate::storage::sqlite::SqliteStore;

    /// Replays canned Polygon-shaped payloads and records requested ranges.
    struct FakeProvider {
        response: Result<serde_json::Value, fn() -> ProviderError>,
        requests: Mutex<Vec<(String, NaiveDate, NaiveDate)>>,
    }

    impl FakeProvider {
        fn returning(payload: serde_json::Value) -> Self {
            Self {
                response: Ok(payload),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing(error: fn() -> ProviderError) -> Self {
            Self {
                response: Err(error),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<(String, NaiveDate, NaiveDate)> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl QuoteProvider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Polygon
        }

        fn fetch_quotes(
            &self,
            symbol: &str,
            from: NaiveDate,
            to: NaiveDate,
        ) -> BoxFuture<'_, Result<serde_json::Value, Report<ProviderError>>> {
            self.requests
                .lock()
                .unwrap()
                .push((symbol.to_owned(), from, to));
            let response = match &self.response {
                Ok(payload) => Ok(payload.clone()),
                Err(error) => Err(Report::new(error())),
            };
            Box::pin(async move { response })
        }

        fn normalize(
            &self,
            _symbol: &str,
            payload: serde_json::Value,
        ) -> Result<Vec<Quote>, Report<ProviderError>> {
            let bars = payload
                .get("results")
                .and_then(|r| r.as_array())
                .cloned()
                .ok_or_else(|| {
                    Report::new(ProviderError::Empty {
                        provider: "fake".into(),
                        symbol: "?".into(),
                    })
                })?;
            Ok(bars
                .iter()
                .map(|bar| {
                    let close = bar["c"].as_i64().unwrap();
                    Quote {
                        time: DateTime::from_timestamp_millis(bar["t"].as_i64().unwrap()).unwrap(),
                        open: close.into(),
                        close: close.into(),
                        high: close.into(),
                        low: close.into(),
                        volume: 10,
                        trade_count: None,
                        vwap: None,
                        raw_timestamp: None,
                    }
                })
                .collect())
        }
    }

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 18, 0, 0).unwrap()
    }

    fn bars(count: i64) -> serde_json::Value {
        let start = Utc.with_ymd_and_hms(2024, 3, 14, 14, 30, 0).unwrap().timestamp_millis();
        let results: Vec<serde_json::Value> = (0..count)
            .map(|i| serde_json::json!({ "t": start + i * 60_000, "c": 100 + i }))
            .collect();
        serde_json::json!({ "status": "OK", "results": results })
    }

    async fn store_with(symbols: &[&str]) -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory(2).await;
        for symbol in symbols {
            store.upsert_instrument(symbol, None, true).await.unwrap();
        }
        Arc::new(store)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn sync_range_extends_one_day_past_as_of() {
        assert_eq!(sync_range(32, as_of()).unwrap(), (day(2024, 2, 12), day(2024, 3, 16)));
        assert_eq!(sync_range(0, as_of()).unwrap(), (day(2024, 3, 15), day(2024, 3, 16)));
    }

    #[test]
    fn backfill_windows_are_contiguous_chunks() {
        let windows = backfill_windows(1, 30, as_of()).unwrap();
        assert_eq!(windows.len(), 12);
        assert_eq!(windows[0], (day(2024, 2, 14), day(2024, 3, 16)));
        assert_eq!(windows[1], (day(2024, 1, 15), day(2024, 2, 14)));
        for pair in windows.windows(2) {
            assert_eq!(pair[1].1, pair[0].0);
        }
        let oldest = windows.last().unwrap().0;
        assert_eq!(oldest, (as_of() - Duration::days(360)).date_naive());
    }

    #[test]
    fn backfill_last_window_is_clamped() {
        let windows = backfill_windows(1, 100, as_of()).unwrap();
        assert_eq!(windows.len(), 4);
        let (from, to) = windows[3];
        assert_eq!(from, (as_of() - Duration::days(360)).date_naive());
        assert_eq!(to, (as_of() - Duration::days(300)).date_naive());
    }

    #[test]
    fn out_of_range_offsets_are_errors() {
        let err = sync_range(u32::MAX, as_of()).unwrap_err();
        assert!(matches!(err.current_context(), IngestError::InvalidRange { .. }));
        let err = backfill_windows(u32::MAX, 30, as_of()).unwrap_err();
        assert!(matches!(err.current_context(), IngestError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn oversized_look_back_fails_without_fetching() {
        let store = store_with(&["AAPL"]).await;
        let provider = Arc::new(FakeProvider::returning(bars(1)));
        let ingestor = Ingestor::new(store, provider.clone());

        let err = ingestor.sync("AAPL", u32::MAX, as_of()).await.unwrap_err();
        assert!(matches!(err.current_context(), IngestError::InvalidRange { .. }));
        assert!(ingestor.backfill("AAPL", u32::MAX, 30, as_of()).await.is_err());
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn sync_writes_normalized_quotes() {
        let store = store_with(&["AAPL"]).await;
        let provider = Arc::new(FakeProvider::returning(bars(5)));
        let ingestor = Ingestor::new(store.clone(), provider.clone());

        let attempted = ingestor.sync("aapl", 32, as_of()).await.unwrap();
        assert_eq!(attempted, 5);
        assert_eq!(
            provider.requests(),
            vec![("AAPL".to_string(), day(2024, 2, 12), day(2024, 3, 16))]
        );

        let stored = store
            .query_range("AAPL", as_of() - Duration::days(2), as_of())
            .await
            .unwrap();
        assert_eq!(stored.len(), 5);
    }

    #[tokio::test]
    async fn repeated_sync_is_idempotent() {
        let store = store_with(&["AAPL"]).await;
        let ingestor = Ingestor::new(store.clone(), Arc::new(FakeProvider::returning(bars(3))));

        let first = ingestor.sync("AAPL", 2, as_of()).await.unwrap();
        let second = ingestor.sync("AAPL", 2, as_of()).await.unwrap();
        // Attempted, not inserted: both runs report the full batch.
        assert_eq!((first, second), (3, 3));

        let stored = store
            .query_range("AAPL", as_of() - Duration::days(2), as_of())
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn unknown_instrument_fails_before_fetch() {
        let store = store_with(&[]).await;
        let provider = Arc::new(FakeProvider::returning(bars(1)));
        let ingestor = Ingestor::new(store, provider.clone());

        let err = ingestor.sync("MSFT", 2, as_of()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            IngestError::InvalidInstrument { symbol } if symbol == "MSFT"
        ));
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_upstream_unavailable() {
        let store = store_with(&["AAPL"]).await;
        let ingestor = Ingestor::new(
            store,
            Arc::new(FakeProvider::failing(|| ProviderError::Unavailable {
                provider: "polygon".into(),
            })),
        );

        let err = ingestor.sync("AAPL", 2, as_of()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            IngestError::UpstreamUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn missing_result_set_is_upstream_empty() {
        let store = store_with(&["AAPL"]).await;
        let ingestor = Ingestor::new(
            store,
            Arc::new(FakeProvider::returning(serde_json::json!({ "status": "OK" }))),
        );

        let err = ingestor.sync("AAPL", 2, as_of()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            IngestError::UpstreamEmpty { symbol } if symbol == "AAPL"
        ));
    }

    #[tokio::test]
    async fn empty_result_set_is_zero_attempted() {
        let store = store_with(&["AAPL"]).await;
        let ingestor = Ingestor::new(store, Arc::new(FakeProvider::returning(bars(0))));
        assert_eq!(ingestor.sync("AAPL", 2, as_of()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn backfill_skips_failing_windows() {
        let store = store_with(&["AAPL"]).await;
        let provider = Arc::new(FakeProvider::failing(|| ProviderError::Unavailable {
            provider: "polygon".into(),
        }));
        let ingestor = Ingestor::new(store, provider.clone());

        let attempted = ingestor.backfill("AAPL", 1, 90, as_of()).await.unwrap();
        assert_eq!(attempted, 0);
        assert_eq!(provider.requests().len(), 4);
    }

    #[tokio::test]
    async fn backfill_aborts_on_unknown_instrument() {
        let store = store_with(&[]).await;
        let ingestor = Ingestor::new(store, Arc::new(FakeProvider::returning(bars(1))));
        assert!(ingestor.backfill("AAPL", 1, 30, as_of()).await.is_err());
    }

    #[tokio::test]
    async fn sync_active_covers_only_active_instruments() {
        let store = store_with(&["AAPL", "MSFT"]).await;
        store.upsert_instrument("IBM", None, false).await.unwrap();
        let provider = Arc::new(FakeProvider::returning(bars(4)));
        let ingestor = Arc::new(Ingestor::new(store.clone(), provider.clone()));

        let summary = sync_active(ingestor, 2, as_of()).await.unwrap();
        assert_eq!(
            summary,
            SyncSummary {
                succeeded: 2,
                failed: 0,
                quotes_attempted: 8,
            }
        );

        let mut requested: Vec<String> = provider.requests().into_iter().map(|r| r.0).collect();
        requested.sort();
        assert_eq!(requested, vec!["AAPL".to_string(), "MSFT".to_string()]);
    }

    #[tokio::test]
    async fn sync_active_counts_failures() {
        let store = store_with(&["AAPL", "MSFT"]).await;
        let ingestor = Arc::new(Ingestor::new(
            store,
            Arc::new(FakeProvider::failing(|| ProviderError::Unavailable {
                provider: "polygon".into(),
            })),
        ));

        let summary = sync_active(ingestor, 2, as_of()).await.unwrap();
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 2);
    }
}
