use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use sqlx::{
    QueryBuilder, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::error::StorageError;
use crate::model::{Instrument, Quote, normalize_symbol};
use crate::storage::QuoteStore;

type InstrumentRow = (i64, String, Option<String>, bool);

type QuoteRow = (
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<String>,
    Option<String>,
);

const QUOTE_COLUMNS: &str = "q.time, q.open, q.close, q.high, q.low, q.volume, \
                             q.trade_count, q.vwap, q.raw_timestamp";

pub struct SqliteStore {
    pool: SqlitePool,
    batch_size: usize,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path` and run migrations.
    pub async fn open(path: &Path, batch_size: usize) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;

        Ok(Self {
            pool,
            batch_size: batch_size.max(1),
        })
    }

    async fn instrument_id(&self, symbol: &str) -> Result<Option<i64>, Report<StorageError>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM instruments WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;
        Ok(row.map(|(id,)| id))
    }

    async fn fetch_instrument(
        &self,
        symbol: &str,
    ) -> Result<Option<Instrument>, Report<StorageError>> {
        let row: Option<InstrumentRow> = sqlx::query_as(
            "SELECT id, symbol, name, active FROM instruments WHERE symbol = ?",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .change_context(StorageError::Query)?;
        Ok(row.map(map_instrument_row))
    }
}

impl QuoteStore for SqliteStore {
    fn upsert_instrument(
        &self,
        symbol: &str,
        name: Option<&str>,
        active: bool,
    ) -> BoxFuture<'_, Result<Instrument, Report<StorageError>>> {
        let symbol = normalize_symbol(symbol);
        let name = name.map(str::to_owned);
        Box::pin(async move {
            let now = encode_time(&Utc::now());
            sqlx::query(
                "INSERT INTO instruments (symbol, name, active, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT (symbol) DO UPDATE SET \
                 name = COALESCE(excluded.name, instruments.name), \
                 active = excluded.active, \
                 updated_at = excluded.updated_at",
            )
            .bind(&symbol)
            .bind(name.as_deref())
            .bind(active)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("symbol: {symbol}"))?;

            self.fetch_instrument(&symbol)
                .await?
                .ok_or_else(|| Report::new(StorageError::InvalidInstrument { symbol }))
        })
    }

    fn get_instrument(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<Option<Instrument>, Report<StorageError>>> {
        let symbol = normalize_symbol(symbol);
        Box::pin(async move { self.fetch_instrument(&symbol).await })
    }

    fn list_instruments(
        &self,
        active_only: bool,
    ) -> BoxFuture<'_, Result<Vec<Instrument>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<InstrumentRow> = sqlx::query_as(
                "SELECT id, symbol, name, active FROM instruments \
                 WHERE (? = 0 OR active = 1) \
                 ORDER BY symbol ASC",
            )
            .bind(active_only)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(rows.into_iter().map(map_instrument_row).collect())
        })
    }

    fn bulk_write(
        &self,
        symbol: &str,
        quotes: &[Quote],
    ) -> BoxFuture<'_, Result<usize, Report<StorageError>>> {
        let symbol = normalize_symbol(symbol);
        let quotes = quotes.to_vec();
        Box::pin(async move {
            // Resolve first: an unknown instrument must not leave partial batches.
            let instrument_id = self.instrument_id(&symbol).await?.ok_or_else(|| {
                Report::new(StorageError::InvalidInstrument {
                    symbol: symbol.clone(),
                })
            })?;

            for (batch, chunk) in quotes.chunks(self.batch_size).enumerate() {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .change_context(StorageError::Insert)?;

                for q in chunk {
                    sqlx::query(
                        "INSERT OR IGNORE INTO quotes \
                         (instrument_id, time, open, close, high, low, volume, \
                          trade_count, vwap, raw_timestamp) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(instrument_id)
                    .bind(encode_time(&q.time))
                    .bind(q.open.to_string())
                    .bind(q.close.to_string())
                    .bind(q.high.to_string())
                    .bind(q.low.to_string())
                    .bind(q.volume)
                    .bind(q.trade_count)
                    .bind(q.vwap.map(|v| v.to_string()))
                    .bind(q.raw_timestamp.as_deref())
                    .execute(&mut *tx)
                    .await
                    .change_context(StorageError::Insert)
                    .attach_with(|| format!("symbol: {symbol}, time: {}", q.time))?;
                }

                tx.commit().await.change_context(StorageError::Insert)?;
                debug!(symbol = %symbol, batch, rows = chunk.len(), "quote batch written");
            }

            Ok(quotes.len())
        })
    }

    fn query_range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Quote>, Report<StorageError>>> {
        let symbol = normalize_symbol(symbol);
        Box::pin(async move {
            let rows: Vec<QuoteRow> = sqlx::query_as(&format!(
                "SELECT {QUOTE_COLUMNS} \
                 FROM quotes q JOIN instruments i ON i.id = q.instrument_id \
                 WHERE i.symbol = ? AND q.time >= ? AND q.time <= ? \
                 ORDER BY q.time ASC"
            ))
            .bind(&symbol)
            .bind(encode_time(&start))
            .bind(encode_time(&end))
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            rows.into_iter().map(map_quote_row).collect()
        })
    }

    fn latest_timestamp_per_day(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<(NaiveDate, DateTime<Utc>)>, Report<StorageError>>> {
        let symbol = normalize_symbol(symbol);
        Box::pin(async move {
            let rows: Vec<(String, String)> = sqlx::query_as(
                "SELECT substr(q.time, 1, 10) AS day, MAX(q.time) AS latest \
                 FROM quotes q JOIN instruments i ON i.id = q.instrument_id \
                 WHERE i.symbol = ? AND q.time >= ? AND q.time <= ? \
                 GROUP BY day \
                 ORDER BY day ASC",
            )
            .bind(&symbol)
            .bind(encode_time(&start))
            .bind(encode_time(&end))
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            rows.into_iter()
                .map(|(day, latest)| {
                    let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                        .change_context(StorageError::Decode)
                        .attach_with(|| format!("day: {day}"))?;
                    Ok((date, decode_time(&latest)?))
                })
                .collect()
        })
    }

    fn quotes_at(
        &self,
        symbol: &str,
        times: &[DateTime<Utc>],
    ) -> BoxFuture<'_, Result<Vec<Quote>, Report<StorageError>>> {
        let symbol = normalize_symbol(symbol);
        let times: Vec<String> = times.iter().map(encode_time).collect();
        Box::pin(async move {
            if times.is_empty() {
                return Ok(Vec::new());
            }

            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {QUOTE_COLUMNS} \
                 FROM quotes q JOIN instruments i ON i.id = q.instrument_id \
                 WHERE i.symbol = "
            ));
            builder.push_bind(symbol);
            builder.push(" AND q.time IN (");
            let mut separated = builder.separated(", ");
            for time in times {
                separated.push_bind(time);
            }
            separated.push_unseparated(") ORDER BY q.time ASC");

            let rows: Vec<QuoteRow> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .change_context(StorageError::Query)?;

            rows.into_iter().map(map_quote_row).collect()
        })
    }
}

fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_time(value: &str) -> Result<DateTime<Utc>, Report<StorageError>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .change_context(StorageError::Decode)
        .attach_with(|| format!("time: {value}"))
}

fn decode_decimal(value: &str) -> Result<Decimal, Report<StorageError>> {
    Decimal::from_str(value)
        .change_context(StorageError::Decode)
        .attach_with(|| format!("decimal: {value}"))
}

fn map_instrument_row((id, symbol, name, active): InstrumentRow) -> Instrument {
    Instrument {
        id,
        symbol,
        name,
        active,
    }
}

fn map_quote_row(
    (time, open, close, high, low, volume, trade_count, vwap, raw_timestamp): QuoteRow,
) -> Result<Quote, Report<StorageError>> {
    Ok(Quote {
        time: decode_time(&time)?,
        open: decode_decimal(&open)?,
        close: decode_decimal(&close)?,
        high: decode_decimal(&high)?,
        low: decode_decimal(&low)?,
        volume,
        trade_count,
        vwap: vwap.as_deref().map(decode_decimal).transpose()?,
        raw_timestamp,
    })
}

#[cfg(test)]
impl SqliteStore {
    /// Single-connection in-memory store; every pooled connection to
    /// `sqlite::memory:` would otherwise see its own empty database.
    pub(crate) async fn in_memory(batch_size: usize) -> Self {
        use sqlx::sqlite::SqlitePoolOptions;

        let opts = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Self { pool, batch_size }
    }
}
