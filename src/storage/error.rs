//! Error typedefs used by the keyed store and its backends

use thiserror::Error as ThisError;

/// The error produced from most Storage functions
#[derive(Debug, ThisError)]
pub enum StorageError {
    /// Unable to serialize a partition before writing it
    #[error("error on serialize data: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),
    /// Unable to deserialize a partition read from the backend
    #[error("error on deserialize data: {0}")]
    Deserialize(#[from] rmp_serde::decode::Error),
    /// The durable medium rejected a read or write
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    /// An unexpected error occurred
    #[error("{0:?}")]
    Other(String),
}
