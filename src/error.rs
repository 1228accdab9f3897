//! Crate-level error type.

use thiserror::Error;

use crate::client::ClientError;

/// Errors that stop a run or a one-shot command.
///
/// Per-hop failures never surface here; workers resolve them locally and only
/// report classified outcomes to the recorder.
#[derive(Debug, Error)]
pub enum Error {
    /// The ledger could not be reached when the run started.
    #[error("failed to dial ledger at {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: ClientError,
    },

    /// A ledger call made outside the retrying worker paths failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The master private key could not be parsed.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// The node configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The node configuration file is not valid JSON.
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The run was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,
}
