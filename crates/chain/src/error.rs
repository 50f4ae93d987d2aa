use thiserror::Error;

/// Failures at the chain boundary.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("LCD request to {path} failed: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("LCD returned {status} for {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {context}: {reason}")]
    Decode { context: String, reason: String },

    #[error("signing relay rejected the transaction: {0}")]
    Signing(String),

    #[error("transaction {txhash} failed with code {code}: {raw_log}")]
    TxFailed {
        txhash: String,
        code: u32,
        raw_log: String,
    },

    #[error("unknown asset {0}")]
    UnknownAsset(String),
}

impl ChainError {
    pub(crate) fn decode(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            context: context.into(),
            reason: reason.into(),
        }
    }
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;
