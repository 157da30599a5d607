use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the configuration and ingestion layers.
///
/// Flag evaluation itself never fails: every problem there is reported through
/// [`Reason`](crate::Reason) on the evaluation result.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Configuration JSON could not be decoded.
    #[error("error parsing flagger configuration")]
    ConfigurationParse(#[source] Arc<serde_json::Error>),
    /// An ingestion payload could not be encoded.
    #[error("error serializing ingestion payload")]
    Serialization(#[source] Arc<serde_json::Error>),
    /// The transport failed to deliver a payload.
    #[error("transport error: {0}")]
    Transport(String),
    /// The ingestion batcher has been shut down and no longer accepts data.
    #[error("ingestion batcher is shut down")]
    ShutDown,
    /// The ingestion batcher has not been started inside an async runtime yet.
    #[error("ingestion batcher has not been started")]
    NotStarted,
}

impl Error {
    /// Build a transport error from anything printable.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Error::Transport(err.to_string())
    }
}
