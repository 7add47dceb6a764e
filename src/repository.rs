//! The single owner of the subscription and message stores.
//!
//! Every mutation goes through here. Consumers observe the results through the
//! streams, which always carry complete snapshots rather than diffs.

use {
    crate::{
        account::AccountProvider,
        model::types::{AccountId, NotifyMessageRecord, NotifySubscription, ScopeValue},
        storage::{KeyedStore, StorageBackend, StorageError},
    },
    chrono::{DateTime, Utc},
    futures::{future, stream::BoxStream, StreamExt},
    itertools::Itertools,
    relay_rpc::domain::Topic,
    std::{collections::HashMap, sync::Arc},
    thiserror::Error,
    tokio::sync::broadcast,
    tokio_stream::wrappers::BroadcastStream,
    tracing::{debug, error, info},
};

pub const SUBSCRIPTIONS_NAMESPACE: &str = "subscriptions";
pub const MESSAGES_NAMESPACE: &str = "messages";

const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Subscription not found for topic {0}")]
    SubscriptionNotFound(Topic),

    #[error("Subscription {topic} belongs to {found}, not {expected}")]
    AccountMismatch {
        topic: Topic,
        expected: AccountId,
        found: AccountId,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

fn subscription_topic(subscription: &NotifySubscription) -> &str {
    subscription.topic.as_ref()
}

fn message_id(record: &NotifyMessageRecord) -> &str {
    &record.id
}

/// Newest first. Ties are broken by id so the order is deterministic.
fn sort_messages(records: Vec<NotifyMessageRecord>) -> Vec<NotifyMessageRecord> {
    records
        .into_iter()
        .sorted_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| a.id.cmp(&b.id))
        })
        .collect()
}

fn stream_of<T: Clone + Send + 'static>(sender: &broadcast::Sender<T>) -> BoxStream<'static, T> {
    // A lagging consumer skips to the next event; every event is a full
    // snapshot so nothing is lost by dropping older ones.
    BroadcastStream::new(sender.subscribe())
        .filter_map(|event| future::ready(event.ok()))
        .boxed()
}

pub struct SubscriptionRepository {
    subscriptions: KeyedStore<NotifySubscription>,
    messages: KeyedStore<NotifyMessageRecord>,
    new_subscription: broadcast::Sender<NotifySubscription>,
    updated_subscription: broadcast::Sender<NotifySubscription>,
    deleted_subscription: broadcast::Sender<Topic>,
    account_subscriptions: broadcast::Sender<Vec<NotifySubscription>>,
    all_messages: broadcast::Sender<Vec<NotifyMessageRecord>>,
    new_message: broadcast::Sender<NotifyMessageRecord>,
}

impl SubscriptionRepository {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        account_provider: Arc<dyn AccountProvider>,
    ) -> std::result::Result<Self, StorageError> {
        let subscriptions =
            KeyedStore::open(SUBSCRIPTIONS_NAMESPACE, backend.clone(), subscription_topic)?;
        let messages = KeyedStore::open(MESSAGES_NAMESPACE, backend, message_id)?;

        let (account_subscriptions, _) = broadcast::channel(CHANNEL_CAPACITY);
        subscriptions.on_update({
            let sender = account_subscriptions.clone();
            move |store: &KeyedStore<NotifySubscription>| {
                let account = match account_provider.current_account() {
                    Ok(account) => account,
                    Err(e) => {
                        debug!("Not publishing subscriptions: {e}");
                        return;
                    }
                };
                // No receivers is fine
                let _ = sender.send(store.get_all_in(account.as_ref()));
            }
        });

        let (all_messages, _) = broadcast::channel(CHANNEL_CAPACITY);
        messages.on_update({
            let sender = all_messages.clone();
            move |store: &KeyedStore<NotifyMessageRecord>| {
                let _ = sender.send(store.get_all());
            }
        });

        Ok(Self {
            subscriptions,
            messages,
            new_subscription: broadcast::channel(CHANNEL_CAPACITY).0,
            updated_subscription: broadcast::channel(CHANNEL_CAPACITY).0,
            deleted_subscription: broadcast::channel(CHANNEL_CAPACITY).0,
            account_subscriptions,
            all_messages,
            new_message: broadcast::channel(CHANNEL_CAPACITY).0,
        })
    }

    pub fn get_all_subscriptions(&self) -> Vec<NotifySubscription> {
        self.subscriptions.get_all()
    }

    pub fn get_subscriptions(&self, account: &AccountId) -> Vec<NotifySubscription> {
        self.subscriptions.get_all_in(account.as_ref())
    }

    /// Looks across every account, callers may not know the owner up front.
    pub fn get_subscription(&self, topic: &Topic) -> Option<NotifySubscription> {
        self.subscriptions
            .find(topic.as_ref())
            .map(|(subscription, _)| subscription)
    }

    /// Stores `subscription` under its account. A topic previously held by
    /// another account moves: the new record is written first and only then
    /// removed from the old account, so a failed write keeps the old record.
    pub fn set_subscription(&self, subscription: NotifySubscription) -> Result<()> {
        let moved = self.held_by_other_accounts(std::slice::from_ref(&subscription));
        self.subscriptions
            .set(subscription.clone(), subscription.account.as_ref())?;
        if let Err(e) = self.evict(&moved) {
            self.roll_back("set", || {
                self.subscriptions
                    .delete(subscription.topic.as_ref(), subscription.account.as_ref())
            });
            return Err(e);
        }
        let _ = self.new_subscription.send(subscription);
        Ok(())
    }

    /// Stores `subscription` with a new scope and expiry. Every other field is
    /// kept as is.
    pub fn update_subscription(
        &self,
        subscription: &NotifySubscription,
        scope: HashMap<String, ScopeValue>,
        expiry: DateTime<Utc>,
    ) -> Result<NotifySubscription> {
        let updated = subscription.with_scope(scope, expiry);
        self.subscriptions
            .set(updated.clone(), updated.account.as_ref())?;
        let _ = self.updated_subscription.send(updated.clone());
        Ok(updated)
    }

    /// Removes the subscription only. Its messages stay until
    /// [`Self::delete_messages`] is called.
    pub fn delete_subscription(&self, topic: &Topic) -> Result<()> {
        let (_, partition) = self
            .subscriptions
            .find(topic.as_ref())
            .ok_or_else(|| RepositoryError::SubscriptionNotFound(topic.clone()))?;
        self.subscriptions.delete(topic.as_ref(), &partition)?;
        let _ = self.deleted_subscription.send(topic.clone());
        Ok(())
    }

    /// Deletes every message of every subscription of `account`, then the
    /// subscriptions themselves.
    pub fn clear_database(&self, account: &AccountId) -> Result<()> {
        let subscriptions = self.get_subscriptions(account);
        info!(
            "Clearing {} subscriptions of {account}",
            subscriptions.len()
        );
        for subscription in &subscriptions {
            self.delete_messages(&subscription.topic)?;
        }
        self.subscriptions.delete_all(account.as_ref())?;
        Ok(())
    }

    /// Makes `subscriptions` the complete set for `account`. Every element
    /// must belong to `account`. Either the whole set lands or nothing
    /// changes.
    pub fn replace_all_subscriptions(
        &self,
        subscriptions: Vec<NotifySubscription>,
        account: &AccountId,
    ) -> Result<()> {
        if let Some(foreign) = subscriptions.iter().find(|s| &s.account != account) {
            return Err(RepositoryError::AccountMismatch {
                topic: foreign.topic.clone(),
                expected: account.clone(),
                found: foreign.account.clone(),
            });
        }

        let previous = self.get_subscriptions(account);
        let moved = self.held_by_other_accounts(&subscriptions);
        self.subscriptions
            .replace(subscriptions, account.as_ref())?;
        if let Err(e) = self.evict(&moved) {
            self.roll_back("replace", || {
                self.subscriptions.replace(previous, account.as_ref())
            });
            return Err(e);
        }
        Ok(())
    }

    pub fn get_messages(&self, topic: &Topic) -> Vec<NotifyMessageRecord> {
        sort_messages(self.messages.get_all_in(topic.as_ref()))
    }

    pub fn delete_messages(&self, topic: &Topic) -> Result<()> {
        Ok(self.messages.delete_all(topic.as_ref())?)
    }

    pub fn delete_message(&self, id: &str) -> Result<()> {
        if let Some((_, partition)) = self.messages.find(id) {
            self.messages.delete(id, &partition)?;
        }
        Ok(())
    }

    /// Stores a newly received message. Returns false without writing when a
    /// record with the same id is already stored.
    pub fn set_message(&self, record: NotifyMessageRecord) -> Result<bool> {
        if self.messages.find(&record.id).is_some() {
            debug!("Message {} already stored", record.id);
            return Ok(false);
        }
        self.messages.set(record.clone(), record.topic.as_ref())?;
        let _ = self.new_message.send(record);
        Ok(true)
    }

    pub fn new_subscriptions(&self) -> BoxStream<'static, NotifySubscription> {
        stream_of(&self.new_subscription)
    }

    pub fn updated_subscriptions(&self) -> BoxStream<'static, NotifySubscription> {
        stream_of(&self.updated_subscription)
    }

    pub fn deleted_subscriptions(&self) -> BoxStream<'static, Topic> {
        stream_of(&self.deleted_subscription)
    }

    /// The full subscription list of the current account after each change.
    pub fn subscriptions_publisher(&self) -> BoxStream<'static, Vec<NotifySubscription>> {
        stream_of(&self.account_subscriptions)
    }

    pub fn new_messages(&self) -> BoxStream<'static, NotifyMessageRecord> {
        stream_of(&self.new_message)
    }

    /// The messages of `topic`, newest first, after each message change.
    pub fn messages_publisher(&self, topic: Topic) -> BoxStream<'static, Vec<NotifyMessageRecord>> {
        stream_of(&self.all_messages)
            .map(move |records| {
                sort_messages(
                    records
                        .into_iter()
                        .filter(|record| record.topic == topic)
                        .collect(),
                )
            })
            .boxed()
    }

    /// Records of the same topics currently stored under a different account.
    fn held_by_other_accounts(
        &self,
        subscriptions: &[NotifySubscription],
    ) -> Vec<(NotifySubscription, String)> {
        subscriptions
            .iter()
            .filter_map(|subscription| {
                self.subscriptions
                    .find(subscription.topic.as_ref())
                    .filter(|(_, partition)| partition != subscription.account.as_ref())
            })
            .collect()
    }

    /// Deletes each record from its old partition. On failure the ones
    /// already deleted are put back.
    fn evict(&self, moved: &[(NotifySubscription, String)]) -> Result<()> {
        for (done, (subscription, partition)) in moved.iter().enumerate() {
            info!("Topic {} moves away from {partition}", subscription.topic);
            if let Err(e) = self
                .subscriptions
                .delete(subscription.topic.as_ref(), partition)
            {
                for (evicted, partition) in &moved[..done] {
                    self.roll_back("evict", || {
                        self.subscriptions.set(evicted.clone(), partition)
                    });
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn roll_back(
        &self,
        operation: &str,
        undo: impl FnOnce() -> std::result::Result<(), StorageError>,
    ) {
        if let Err(e) = undo() {
            error!("Failed to roll back {operation}: {e}");
        }
    }
}
