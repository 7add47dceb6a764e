use {
    super::{
        error::NotifyClientError,
        identity::IdentityRecord,
        lifecycle::Lifecycle,
        pending::PendingRequests,
    },
    crate::{
        account::AccountProvider,
        keyserver::KeyserverClient,
        model::types::AccountId,
        repository::SubscriptionRepository,
        resolver::AppResolver,
        storage::KeyedStore,
        transport::{publish_relay_message, InboundMessage, Transport},
    },
    futures::StreamExt,
    parking_lot::Mutex,
    relay_rpc::domain::{DecodedClientId, Topic},
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, warn},
};

/// What a watch topic belongs to.
#[derive(Clone)]
pub struct WatchContext {
    pub account: AccountId,
    pub key: [u8; 32],
    /// Authentication key of the notify service
    pub notify_server: DecodedClientId,
    /// Where watch requests are sent
    pub notify_server_topic: Topic,
}

pub struct ClientState {
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<dyn AppResolver>,
    pub keyserver: KeyserverClient,
    pub repository: SubscriptionRepository,
    pub identities: KeyedStore<IdentityRecord>,
    pub account_provider: Arc<dyn AccountProvider>,
    pub lifecycle: Lifecycle,
    pub pending: PendingRequests,
    pub notify_server_domain: String,
    pub request_timeout: Duration,
    /// Held for a whole watch-subscriptions round trip, they share a topic
    pub watch_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<HashMap<Topic, JoinHandle<()>>>,
    watchers: Mutex<HashMap<Topic, WatchContext>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

impl ClientState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn AppResolver>,
        keyserver: KeyserverClient,
        repository: SubscriptionRepository,
        identities: KeyedStore<IdentityRecord>,
        account_provider: Arc<dyn AccountProvider>,
        notify_server_domain: String,
        request_timeout: Duration,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Self {
        Self {
            transport,
            resolver,
            keyserver,
            repository,
            identities,
            account_provider,
            lifecycle: Lifecycle::new(),
            pending: PendingRequests::new(),
            notify_server_domain,
            request_timeout,
            watch_lock: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            inbound,
        }
    }

    pub fn identity(&self, account: &AccountId) -> Option<IdentityRecord> {
        self.identities
            .get_all_in(account.as_ref())
            .into_iter()
            .next()
    }

    pub fn require_identity(&self, account: &AccountId) -> Result<IdentityRecord, NotifyClientError> {
        self.identity(account)
            .ok_or_else(|| NotifyClientError::NotRegistered(account.to_string()))
    }

    pub fn is_listening(&self, topic: &Topic) -> bool {
        self.listeners.lock().contains_key(topic)
    }

    /// Forwards everything arriving on `topic` to the dispatch loop. Does
    /// nothing if the topic is already being listened to.
    pub async fn listen(&self, topic: Topic) -> Result<(), NotifyClientError> {
        if self.is_listening(&topic) {
            return Ok(());
        }

        let mut stream = self.transport.subscribe(topic.clone()).await?;
        let inbound = self.inbound.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                if inbound.send(msg).is_err() {
                    break;
                }
            }
        });
        debug!("Listening on {topic}");
        if let Some(previous) = self.listeners.lock().insert(topic, forwarder) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops listening on `topic`. Unsubscribe failures are only logged, the
    /// relay drops idle subscriptions on its own.
    pub async fn release(&self, topic: &Topic) {
        let forwarder = self.listeners.lock().remove(topic);
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Err(e) = self.transport.unsubscribe(topic).await {
            warn!("Failed to unsubscribe from {topic}: {e}");
        }
        debug!("Released {topic}");
    }

    pub async fn publish(
        &self,
        topic: &Topic,
        message: Arc<str>,
        tag: u32,
        ttl: Duration,
    ) -> Result<(), NotifyClientError> {
        publish_relay_message(self.transport.as_ref(), topic, message, tag, ttl).await?;
        Ok(())
    }

    pub fn watch(&self, topic: Topic, context: WatchContext) {
        self.watchers.lock().insert(topic, context);
    }

    pub fn watch_context(&self, topic: &Topic) -> Option<WatchContext> {
        self.watchers.lock().get(topic).cloned()
    }

    /// Forgets the watch topics of `account` and returns them.
    pub fn stop_watching(&self, account: &AccountId) -> Vec<Topic> {
        let mut watchers = self.watchers.lock();
        let topics = watchers
            .iter()
            .filter(|(_, context)| &context.account == account)
            .map(|(topic, _)| topic.clone())
            .collect::<Vec<_>>();
        for topic in &topics {
            watchers.remove(topic);
        }
        topics
    }
}

impl Drop for ClientState {
    fn drop(&mut self) {
        for (_, forwarder) in self.listeners.lock().drain() {
            forwarder.abort();
        }
    }
}
