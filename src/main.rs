mod config;
mod daily;
mod error;
mod indicator;
mod ingest;
mod model;
mod provider;
mod storage;

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use indicator::IndicatorSet;
use ingest::{Ingestor, sync_active};
use model::{ProviderKind, normalize_symbol};
use provider::QuoteProvider;
use provider::alpha_vantage::AlphaVantageProvider;
use provider::polygon::PolygonProvider;
use storage::QuoteStore;
use storage::sqlite::SqliteStore;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("ingestion error")]
    Ingest,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "quote-pulse", about = "Market quote ingestion and daily indicators")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage tracked instruments
    #[command(subcommand)]
    Instrument(InstrumentCommand),
    /// Fetch recent quotes for one instrument or every active one
    Sync {
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        days_ago: Option<u32>,
    },
    /// Fetch several years of history in fixed-size windows
    Backfill {
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        years: Option<u32>,
    },
    /// Print the indicator report for an instrument as JSON
    Indicators {
        symbol: String,
        #[arg(long)]
        days: Option<u32>,
    },
    /// Print stored quotes as JSON lines
    Quotes {
        symbol: String,
        #[arg(long, default_value_t = 1)]
        days: u32,
    },
}

#[derive(Subcommand)]
enum InstrumentCommand {
    /// Create or reactivate an instrument, then run its first sync
    Add {
        symbol: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        inactive: bool,
        /// Skip the initial sync
        #[arg(long)]
        no_sync: bool,
    },
    Deactivate {
        symbol: String,
    },
    List {
        /// Only show active instruments
        #[arg(long)]
        active: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    // ── Storage ───────────────────────────────────────────────────────────────
    let data_dir = &config.general.data_dir;
    std::fs::create_dir_all(data_dir)
        .change_context(AppError::Storage)
        .attach_with(|| format!("data_dir: {data_dir}"))?;

    let db_path = format!("{data_dir}/quote-pulse.db");
    let store: Arc<dyn QuoteStore> = Arc::new(
        SqliteStore::open(Path::new(&db_path), config.ingestion.batch_size)
            .await
            .change_context(AppError::Storage)?,
    );

    match cli.command {
        Command::Instrument(command) => run_instrument(command, &config, store).await,
        Command::Sync { symbol, days_ago } => {
            let days_ago = days_ago.unwrap_or(config.ingestion.sync_days_ago);
            let ingestor = Arc::new(Ingestor::new(store, build_provider(&config)?));
            match symbol {
                Some(symbol) => {
                    let attempted = ingestor
                        .sync(&symbol, days_ago, Utc::now())
                        .await
                        .change_context(AppError::Ingest)?;
                    info!(symbol = %normalize_symbol(&symbol), attempted, "sync finished");
                }
                None => {
                    let summary = sync_active(ingestor, days_ago, Utc::now())
                        .await
                        .change_context(AppError::Ingest)?;
                    if summary.failed > 0 {
                        warn!(failed = summary.failed, "some instruments failed to sync");
                    }
                }
            }
            Ok(())
        }
        Command::Backfill { symbol, years } => {
            let years = years.unwrap_or(config.ingestion.backfill_years);
            let chunk_days = config.ingestion.backfill_chunk_days;
            let ingestor = Ingestor::new(Arc::clone(&store), build_provider(&config)?);

            let symbols = match symbol {
                Some(symbol) => vec![symbol],
                None => store
                    .list_instruments(true)
                    .await
                    .change_context(AppError::Storage)?
                    .into_iter()
                    .map(|i| i.symbol)
                    .collect(),
            };
            for symbol in symbols {
                ingestor
                    .backfill(&symbol, years, chunk_days, Utc::now())
                    .await
                    .change_context(AppError::Ingest)?;
            }
            Ok(())
        }
        Command::Indicators { symbol, days } => {
            let days = days.unwrap_or(config.indicators.days);
            print_indicators(&config, store.as_ref(), &symbol, days).await
        }
        Command::Quotes { symbol, days } => {
            let end = Utc::now();
            let start = Duration::try_days(i64::from(days))
                .and_then(|delta| end.checked_sub_signed(delta))
                .ok_or_else(|| {
                    Report::new(AppError::Runtime).attach(format!("--days {days} is out of range"))
                })?;
            let quotes = store
                .query_range(&symbol, start, end)
                .await
                .change_context(AppError::Storage)?;
            for quote in &quotes {
                let line = serde_json::to_string(quote).change_context(AppError::Runtime)?;
                println!("{line}");
            }
            Ok(())
        }
    }
}

async fn run_instrument(
    command: InstrumentCommand,
    config: &AppConfig,
    store: Arc<dyn QuoteStore>,
) -> Result<(), Report<AppError>> {
    match command {
        InstrumentCommand::Add {
            symbol,
            name,
            inactive,
            no_sync,
        } => {
            let instrument = store
                .upsert_instrument(&symbol, name.as_deref(), !inactive)
                .await
                .change_context(AppError::Storage)?;
            info!(symbol = %instrument.symbol, active = instrument.active, "instrument saved");

            // The first sync is a follow-up step of its own, never a side effect of the write.
            if instrument.active && !no_sync {
                let ingestor = Ingestor::new(store, build_provider(config)?);
                let attempted = ingestor
                    .sync(
                        &instrument.symbol,
                        config.ingestion.instrument_sync_days_ago,
                        Utc::now(),
                    )
                    .await
                    .change_context(AppError::Ingest)?;
                info!(symbol = %instrument.symbol, attempted, "initial sync finished");
            }
            Ok(())
        }
        InstrumentCommand::Deactivate { symbol } => {
            let existing = store
                .get_instrument(&symbol)
                .await
                .change_context(AppError::Storage)?;
            if existing.is_none() {
                return Err(Report::new(AppError::Storage)
                    .attach(format!("unknown instrument: {}", normalize_symbol(&symbol))));
            }
            let instrument = store
                .upsert_instrument(&symbol, None, false)
                .await
                .change_context(AppError::Storage)?;
            info!(symbol = %instrument.symbol, "instrument deactivated");
            Ok(())
        }
        InstrumentCommand::List { active } => {
            let instruments = store
                .list_instruments(active)
                .await
                .change_context(AppError::Storage)?;
            for instrument in &instruments {
                println!(
                    "{}\t{}\t{}",
                    instrument.symbol,
                    if instrument.active { "active" } else { "inactive" },
                    instrument.name.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
    }
}

async fn print_indicators(
    config: &AppConfig,
    store: &dyn QuoteStore,
    symbol: &str,
    days: u32,
) -> Result<(), Report<AppError>> {
    let symbol = normalize_symbol(symbol);
    let as_of = Utc::now();
    let set = IndicatorSet::new(
        &config.indicators.ma_windows,
        config.indicators.rsi_period,
        days,
    )
    .change_context(AppError::Config)?;

    let series = daily::daily_series(
        store,
        &symbol,
        days,
        as_of,
        config.indicators.lookback_pad_days,
    )
    .await
    .change_context(AppError::Storage)?;

    let report = set.report(&symbol, days, as_of, &series);
    let json = serde_json::to_string_pretty(&report).change_context(AppError::Runtime)?;
    println!("{json}");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    // Logs go to stderr so JSON output on stdout stays machine-readable.
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

fn build_provider(config: &AppConfig) -> Result<Arc<dyn QuoteProvider>, Report<AppError>> {
    let missing = |section: &str| {
        Report::new(AppError::Config).attach(format!("providers.{section} section is required"))
    };
    match config.provider_kind() {
        Some(ProviderKind::Polygon) => {
            let polygon = config.providers.polygon.clone().ok_or_else(|| missing("polygon"))?;
            Ok(Arc::new(PolygonProvider::new(polygon)))
        }
        Some(ProviderKind::AlphaVantage) => {
            let alpha = config
                .providers
                .alpha_vantage
                .clone()
                .ok_or_else(|| missing("alpha_vantage"))?;
            let provider = AlphaVantageProvider::new(alpha).change_context(AppError::Config)?;
            Ok(Arc::new(provider))
        }
        None => Err(Report::new(AppError::Config)
            .attach(format!("unknown provider: {}", config.ingestion.provider))),
    }
}
