use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum ProviderError {
    #[display("{provider} is unavailable")]
    Unavailable { provider: String },
    #[display("{provider} returned no result set for {symbol}")]
    Empty { provider: String, symbol: String },
    #[display("failed to parse response from {provider}")]
    ResponseParse { provider: String },
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert data")]
    Insert,
    #[display("failed to query data")]
    Query,
    #[display("failed to decode stored row")]
    Decode,
    #[display("no instrument found for symbol {symbol}")]
    InvalidInstrument { symbol: String },
    #[display("query window out of range: {reason}")]
    InvalidRange { reason: String },
}

#[derive(Debug, Display, Error)]
pub enum IngestError {
    #[display("invalid instrument: {symbol}")]
    InvalidInstrument { symbol: String },
    #[display("upstream {provider} unavailable")]
    UpstreamUnavailable { provider: String },
    #[display("upstream returned no data for {symbol}")]
    UpstreamEmpty { symbol: String },
    #[display("quote store failure")]
    Store,
    #[display("sync window out of range: {reason}")]
    InvalidRange { reason: String },
}

#[derive(Debug, Display, Error)]
pub enum IndicatorError {
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
}
