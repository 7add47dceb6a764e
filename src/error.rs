//! Errors of the process around the client: environment, `.env` and log
//! setup. Client commands fail with [`NotifyClientError`].

pub use crate::{
    client::error::{InboundMessageError, NotifyClientError},
    repository::RepositoryError,
    storage::StorageError,
};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Failed to read the environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Failed to load .env: {0}")]
    DotEnv(#[from] dotenvy::Error),

    #[error("Failed to install the log subscriber: {0}")]
    Logging(String),
}
