use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    futures::stream::BoxStream,
    relay_rpc::domain::Topic,
    std::{
        sync::Arc,
        time::{Duration, Instant},
    },
    thiserror::Error,
    tokio::time::sleep,
    tracing::{error, instrument, warn},
};

mod loopback;

pub use loopback::{LoopbackConnection, LoopbackRelay};

const PUBLISH_TRIES: usize = 3;
const PUBLISH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A message as delivered by the relay on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: Topic,
    /// Base64 envelope
    pub message: Arc<str>,
    pub tag: u32,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Relay connection closed")]
    Closed,

    #[error("Relay rejected the request: {0}")]
    Rejected(String),
}

/// Publish/subscribe access to the relay network.
///
/// Implementations never deliver a message back to the connection that
/// published it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        topic: Topic,
        message: Arc<str>,
        tag: u32,
        ttl: Duration,
    ) -> Result<(), TransportError>;

    /// Starts receiving messages sent to `topic`, including ones the relay
    /// held while nobody was listening. Subscribing again replaces the
    /// previous stream.
    async fn subscribe(&self, topic: Topic)
        -> Result<BoxStream<'static, InboundMessage>, TransportError>;

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError>;
}

/// Publishes with a few retries. The TTL shrinks by the time already spent so
/// a late retry does not outlive the original deadline.
#[instrument(skip(transport, message))]
pub async fn publish_relay_message(
    transport: &dyn Transport,
    topic: &Topic,
    message: Arc<str>,
    tag: u32,
    ttl: Duration,
) -> Result<(), TransportError> {
    let start = Instant::now();

    let mut tries = 0;
    while let Err(e) = transport
        .publish(
            topic.clone(),
            message.clone(),
            tag,
            ttl.saturating_sub(start.elapsed()),
        )
        .await
    {
        tries += 1;
        if tries >= PUBLISH_TRIES || matches!(e, TransportError::Closed) {
            error!("Permanent error publishing to topic {topic} after {tries} tries: {e}");
            return Err(e);
        }

        warn!(
            "Temporary error publishing to topic {topic}, retrying attempt {tries} in \
            {PUBLISH_RETRY_INTERVAL:?}: {e}"
        );
        sleep(PUBLISH_RETRY_INTERVAL).await;
    }

    Ok(())
}
