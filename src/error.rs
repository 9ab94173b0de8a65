//! Error kinds for the ingestion path.
//!
//! Per-message errors are contained by [`crate::subscriber::Ingester::process`];
//! only [`IngestError::SchemaInit`] is allowed to stop the process.

use rumqttc::{ConnectReturnCode, ConnectionError};
use thiserror::Error;

/// Why an inbound payload could not be parsed at all.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// Undecodable bytes or JSON; the message is dropped.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] PayloadError),

    /// Insert failed at the storage layer; the message is dropped.
    #[error("storage write failed: {0}")]
    StorageWrite(#[source] sqlx::Error),

    /// Broker answered the CONNECT with a non-success code.
    #[error("broker refused connection: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    /// Transport-level failure; the event loop reconnects on the next poll.
    #[error("broker connection failed: {0}")]
    Connection(#[from] ConnectionError),

    /// Schema could not be ensured; fatal at startup.
    #[error("schema initialisation failed: {0}")]
    SchemaInit(#[source] sqlx::Error),
}
