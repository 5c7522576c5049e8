use thiserror::Error;

/// Input and data errors that abort a rebalance before any result is produced.
#[derive(Debug, Error, PartialEq)]
pub enum RebalanceError {
    #[error("unrecognized risk profile '{0}' (expected one of: conservative, moderate, aggressive, balanced, growth)")]
    InvalidProfile(String),

    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error("invalid market snapshot for {symbol}: {reason}")]
    InvalidSnapshot { symbol: String, reason: String },
}
