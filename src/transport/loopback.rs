//! In-process relay. Every [`LoopbackConnection`] behaves like one websocket
//! connection to the relay network.

use {
    super::{InboundMessage, Transport, TransportError},
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    futures::{stream::BoxStream, StreamExt},
    parking_lot::Mutex,
    relay_rpc::domain::Topic,
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio::sync::mpsc,
    tokio_stream::wrappers::UnboundedReceiverStream,
    tracing::debug,
};

type ConnectionId = u64;

struct Subscriber {
    connection: ConnectionId,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

struct Stored {
    from: ConnectionId,
    expiry: DateTime<Utc>,
    message: InboundMessage,
}

#[derive(Default)]
struct RelayState {
    next_connection: ConnectionId,
    subscribers: HashMap<Topic, Vec<Subscriber>>,
    /// Messages nobody was subscribed to yet, kept until their TTL runs out
    mailbox: HashMap<Topic, Vec<Stored>>,
}

#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> LoopbackConnection {
        let mut state = self.state.lock();
        state.next_connection += 1;
        LoopbackConnection {
            id: state.next_connection,
            relay: self.clone(),
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state
            .lock()
            .subscribers
            .get(topic)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|subscriber| !subscriber.sender.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    fn deliver(&self, from: ConnectionId, message: InboundMessage, ttl: Duration) {
        let mut state = self.state.lock();
        let mut delivered = false;
        if let Some(subscribers) = state.subscribers.get_mut(&message.topic) {
            subscribers.retain(|subscriber| !subscriber.sender.is_closed());
            for subscriber in subscribers.iter().filter(|s| s.connection != from) {
                delivered |= subscriber.sender.send(message.clone()).is_ok();
            }
        }

        if !delivered {
            debug!("No subscriber for {}, holding message", message.topic);
            let expiry = message.published_at
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
            state
                .mailbox
                .entry(message.topic.clone())
                .or_default()
                .push(Stored {
                    from,
                    expiry,
                    message,
                });
        }
    }

    fn subscribe(&self, connection: ConnectionId, topic: Topic) -> BoxStream<'static, InboundMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        if let Some(stored) = state.mailbox.remove(&topic) {
            let now = Utc::now();
            let (mine, held): (Vec<_>, Vec<_>) =
                stored.into_iter().partition(|stored| stored.from == connection);
            for stored in held.into_iter().filter(|stored| stored.expiry > now) {
                let _ = sender.send(stored.message);
            }
            if !mine.is_empty() {
                state.mailbox.insert(topic.clone(), mine);
            }
        }

        let subscribers = state.subscribers.entry(topic).or_default();
        subscribers.retain(|subscriber| subscriber.connection != connection);
        subscribers.push(Subscriber { connection, sender });

        UnboundedReceiverStream::new(receiver).boxed()
    }

    fn unsubscribe(&self, connection: ConnectionId, topic: &Topic) {
        let mut state = self.state.lock();
        if let Some(subscribers) = state.subscribers.get_mut(topic) {
            subscribers.retain(|subscriber| subscriber.connection != connection);
            if subscribers.is_empty() {
                state.subscribers.remove(topic);
            }
        }
    }

    fn disconnect(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        for subscribers in state.subscribers.values_mut() {
            subscribers.retain(|subscriber| subscriber.connection != connection);
        }
        state.subscribers.retain(|_, subscribers| !subscribers.is_empty());
    }
}

/// Dropping the connection ends all of its subscriptions.
pub struct LoopbackConnection {
    id: ConnectionId,
    relay: LoopbackRelay,
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.relay.disconnect(self.id);
    }
}

#[async_trait]
impl Transport for LoopbackConnection {
    async fn publish(
        &self,
        topic: Topic,
        message: Arc<str>,
        tag: u32,
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let message = InboundMessage {
            topic,
            message,
            tag,
            published_at: Utc::now(),
        };
        self.relay.deliver(self.id, message, ttl);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: Topic,
    ) -> Result<BoxStream<'static, InboundMessage>, TransportError> {
        Ok(self.relay.subscribe(self.id, topic))
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        self.relay.unsubscribe(self.id, topic);
        Ok(())
    }
}
