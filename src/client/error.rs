use {
    super::lifecycle::LifecycleState,
    crate::{
        auth::JwtError,
        keyserver::KeyserverError,
        model::types::{AccountIdParseError, NotifyMessageError},
        repository::RepositoryError,
        resolver::ResolverError,
        rpc::{DecodeKeyError, JsonRpcError, ResponseDecodeError},
        storage::StorageError,
        transport::TransportError,
        types::EnvelopeError,
    },
    relay_rpc::domain::Topic,
    std::time::Duration,
    thiserror::Error,
};

/// Everything a client command can fail with.
#[derive(Debug, Error)]
pub enum NotifyClientError {
    #[error("Subscription not found for topic {0}")]
    SubscriptionNotFound(Topic),

    #[error("No response to {method} within {timeout:?}")]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },

    #[error("The account owner rejected the signature request")]
    SignatureRejected,

    #[error("Account {0} is not registered")]
    NotRegistered(String),

    #[error("Another operation is in progress for {0}")]
    OperationInProgress(String),

    #[error("Cannot move {key} from {from:?} to {to:?}")]
    InvalidTransition {
        key: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Response was signed by {0} instead of the expected key")]
    WrongIssuer(String),

    #[error("The notify service did not return a subscription for {0}")]
    MissingSubscription(String),

    #[error("Nothing is watched on topic {0}")]
    UnknownWatchTopic(Topic),

    #[error("Subscription has no usable app domain")]
    MissingAppDomain,

    #[error("Subscription's app authentication key is not a did:key")]
    InvalidAppAuthenticationKey,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Peer answered with an error: {0}")]
    JsonRpc(JsonRpcError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Keyserver(#[from] KeyserverError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error("JWT: {0}")]
    Jwt(#[from] JwtError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Key(#[from] DecodeKeyError),

    #[error(transparent)]
    Account(#[from] AccountIdParseError),
}

impl From<RepositoryError> for NotifyClientError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::SubscriptionNotFound(topic) => Self::SubscriptionNotFound(topic),
            RepositoryError::Storage(e) => Self::Storage(e),
        }
    }
}

impl From<ResponseDecodeError> for NotifyClientError {
    fn from(e: ResponseDecodeError) -> Self {
        match e {
            ResponseDecodeError::Json(e) => Self::Json(e),
            ResponseDecodeError::Rpc(e) => Self::JsonRpc(e),
        }
    }
}

/// Why an inbound push was dropped. Only ever logged.
#[derive(Debug, Error)]
pub enum InboundMessageError {
    #[error("No subscription on topic {0}")]
    UnknownTopic(Topic),

    #[error("Subscription on topic {0} has expired")]
    SubscriptionExpired(Topic),

    #[error("Decryption failed: {0}")]
    DecryptionFailure(#[from] EnvelopeError),

    #[error("JWT: {0}")]
    Jwt(#[from] JwtError),

    #[error("Message was signed by {0}, not by the subscribed app")]
    WrongIssuer(String),

    #[error("Message is addressed to {0}, not to the subscribed account")]
    WrongAccount(String),

    #[error("Notification type {0} is not enabled for this subscription")]
    ScopeMismatch(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] NotifyMessageError),

    #[error(transparent)]
    Storage(#[from] RepositoryError),
}
