//! The client side of the notify protocol.
//!
//! Commands run on the caller's task. Everything arriving from the relay goes
//! through one dispatch loop: responses are handed to the command awaiting
//! them, pushes are handled on their own task.

use {
    self::{
        handlers::{
            notify_delete, notify_message, notify_subscribe, notify_subscriptions_changed,
            notify_update, notify_watch_subscriptions, register,
        },
        identity::{identity_account, IdentityRecord, IDENTITIES_NAMESPACE},
        lifecycle::LifecycleState,
        state::ClientState,
    },
    crate::{
        account::{AccountProvider, CurrentAccount, NoAccountSet},
        config::Configuration,
        keyserver::{KeyserverClient, SigningResult},
        model::types::{AccountId, NotifySubscription},
        repository::SubscriptionRepository,
        resolver::{AppResolver, HttpAppResolver},
        spec::{NOTIFY_MESSAGE_TAG, NOTIFY_SUBSCRIPTIONS_CHANGED_TAG},
        storage::{FileBackend, KeyedStore, MemoryBackend, StorageBackend},
        transport::{InboundMessage, Transport},
    },
    relay_rpc::domain::Topic,
    std::{collections::HashSet, sync::Arc},
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info, instrument, warn},
};

pub mod error;
pub mod handlers;
pub mod identity;
pub mod lifecycle;
pub mod pending;
pub mod state;

pub use error::{InboundMessageError, NotifyClientError};

pub type Result<T> = std::result::Result<T, NotifyClientError>;

pub struct NotifyClient {
    state: Arc<ClientState>,
    dispatcher: JoinHandle<()>,
}

impl Drop for NotifyClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl NotifyClient {
    /// Opens the stores held by `backend` and resumes listening on every
    /// stored subscription and registered account.
    pub async fn new(
        config: &Configuration,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn StorageBackend>,
        resolver: Arc<dyn AppResolver>,
    ) -> Result<Self> {
        let account_provider: Arc<dyn AccountProvider> = Arc::new(CurrentAccount::default());
        let repository = SubscriptionRepository::new(backend.clone(), account_provider.clone())?;
        let identities = KeyedStore::open(IDENTITIES_NAMESPACE, backend, identity_account)?;

        let (inbound, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ClientState::new(
            transport,
            resolver,
            KeyserverClient::new(config.keyserver_url.clone()),
            repository,
            identities,
            account_provider,
            config.notify_server_domain.clone(),
            config.request_timeout(),
            inbound,
        ));
        let dispatcher = tokio::spawn(dispatch(state.clone(), rx));

        resume(&state).await?;
        Ok(Self { state, dispatcher })
    }

    /// Builds the backend and resolver `config` describes.
    pub async fn from_config(config: &Configuration, transport: Arc<dyn Transport>) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match &config.storage_path {
            Some(path) => Arc::new(FileBackend::new(path)?),
            None => Arc::new(MemoryBackend::new()),
        };
        let resolver = Arc::new(HttpAppResolver::new(config.app_resolver_scheme.clone()));
        Self::new(config, transport, backend, resolver).await
    }

    pub fn repository(&self) -> &SubscriptionRepository {
        &self.state.repository
    }

    pub fn current_account(&self) -> std::result::Result<AccountId, NoAccountSet> {
        self.state.account_provider.current_account()
    }

    /// Points the repository's account scoped streams at `account`.
    pub fn set_current_account(&self, account: Option<AccountId>) {
        self.state.account_provider.set_current_account(account);
    }

    pub fn is_registered(&self, account: &AccountId) -> bool {
        self.state.identity(account).is_some()
    }

    /// State of an account, a subscribe attempt (`{account}/{domain}`) or a
    /// subscription topic. None when nothing is in flight or recorded.
    pub fn lifecycle_state(&self, key: &str) -> Option<LifecycleState> {
        self.state.lifecycle.state(key)
    }

    pub async fn register(
        &self,
        account: &AccountId,
        domain: &str,
        on_sign: impl FnOnce(&str) -> SigningResult + Send,
    ) -> Result<String> {
        register::register(&self.state, account, domain, on_sign).await
    }

    pub async fn unregister(&self, account: &AccountId) -> Result<()> {
        register::unregister(&self.state, account).await
    }

    pub async fn subscribe(&self, app_domain: &str, account: &AccountId) -> Result<NotifySubscription> {
        notify_subscribe::subscribe(&self.state, app_domain, account).await
    }

    pub async fn update(&self, topic: &Topic, scope: HashSet<String>) -> Result<NotifySubscription> {
        notify_update::update(&self.state, topic, scope).await
    }

    pub async fn delete(&self, topic: &Topic) -> Result<()> {
        notify_delete::delete(&self.state, topic).await
    }

    pub async fn watch_subscriptions(&self, account: &AccountId) -> Result<Vec<NotifySubscription>> {
        notify_watch_subscriptions::watch_subscriptions(&self.state, account).await
    }

    /// Drops everything stored for `account` and stops listening on its
    /// topics. Nothing is sent to the notify service.
    #[instrument(skip(self))]
    pub async fn clear_database(&self, account: &AccountId) -> Result<()> {
        let topics = self
            .state
            .repository
            .get_subscriptions(account)
            .into_iter()
            .map(|subscription| subscription.topic)
            .collect::<Vec<_>>();
        self.state.repository.clear_database(account)?;
        for topic in topics {
            self.state.release(&topic).await;
            self.state.lifecycle.forget(topic.as_ref());
        }
        Ok(())
    }
}

/// Listens on every stored subscription topic and every registered account's
/// watch topic again.
#[instrument(skip_all)]
async fn resume(state: &ClientState) -> Result<()> {
    let subscriptions = state.repository.get_all_subscriptions();
    for subscription in &subscriptions {
        state.listen(subscription.topic.clone()).await?;
    }

    let identities = state.identities.get_all();
    for identity in &identities {
        resume_watching(state, identity).await;
    }
    info!(
        "Resumed {} subscriptions and {} accounts",
        subscriptions.len(),
        identities.len()
    );
    Ok(())
}

async fn resume_watching(state: &ClientState, identity: &IdentityRecord) {
    if let Err(e) = notify_watch_subscriptions::start_watching(state, identity).await {
        warn!("Could not resume watching {}: {e}", identity.account);
    }
}

async fn dispatch(state: Arc<ClientState>, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
    while let Some(msg) = rx.recv().await {
        let Some(msg) = state.pending.resolve(msg) else {
            continue;
        };
        // Handlers may issue requests of their own, so they must not block
        // the loop that delivers the responses
        let state = state.clone();
        tokio::spawn(async move { handle_msg(msg, &state).await });
    }
}

async fn handle_msg(msg: InboundMessage, state: &ClientState) {
    let topic = msg.topic.clone();
    let tag = msg.tag;

    match tag {
        NOTIFY_MESSAGE_TAG => {
            info!("Received notify message on topic {topic}");
            if let Err(e) = notify_message::handle(msg, state).await {
                warn!("Dropped notify message on topic {topic}: {e}");
            }
        }
        NOTIFY_SUBSCRIPTIONS_CHANGED_TAG => {
            info!("Received notify subscriptions changed on topic {topic}");
            if let Err(e) = notify_subscriptions_changed::handle(msg, state).await {
                warn!("Error handling notify subscriptions changed: {e}");
            }
        }
        _ => {
            debug!("Ignored tag {tag} on topic {topic}");
        }
    }
}
