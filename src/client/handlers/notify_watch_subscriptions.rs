use {
    super::{ensure_issuer, open_response, seal_type1, Result},
    crate::{
        auth::{
            sign_jwt, NotifyServerSubscription, SharedClaims, WatchSubscriptionsRequestAuth,
            WatchSubscriptionsResponseAuth,
        },
        client::{
            error::NotifyClientError,
            identity::IdentityRecord,
            lifecycle::LifecycleState,
            state::{ClientState, WatchContext},
        },
        model::types::{AccountId, AppMetadata, NotifySubscription, RelayProtocolOptions, ScopeValue, SymKey},
        rpc::{derive_key, JsonRpcRequest, NotifyWatchSubscriptions},
        spec::{
            NOTIFY_WATCH_SUBSCRIPTIONS_ACT, NOTIFY_WATCH_SUBSCRIPTIONS_METHOD,
            NOTIFY_WATCH_SUBSCRIPTIONS_RESPONSE_TAG, NOTIFY_WATCH_SUBSCRIPTIONS_TAG,
            NOTIFY_WATCH_SUBSCRIPTIONS_TTL,
        },
        utils::{from_unix_timestamp, topic_from_key},
    },
    relay_rpc::domain::Topic,
    std::collections::HashSet,
    tracing::{info, instrument, warn},
};

/// Derives the watch topic of `identity` and starts listening on it.
pub async fn start_watching(state: &ClientState, identity: &IdentityRecord) -> Result<(Topic, WatchContext)> {
    let notify_server = state.resolver.resolve(&state.notify_server_domain).await?;
    let key = derive_key(&notify_server.key_agreement, &identity.watch_secret()?)
        .map_err(|_| NotifyClientError::KeyDerivation)?;
    let topic = topic_from_key(&key);
    let context = WatchContext {
        account: identity.account.clone(),
        key,
        notify_server: notify_server.authentication,
        notify_server_topic: topic_from_key(notify_server.key_agreement.as_bytes()),
    };

    state.listen(topic.clone()).await?;
    state.watch(topic.clone(), context.clone());
    Ok((topic, context))
}

/// Fetches every subscription the notify service holds for `account` and
/// makes the local store match it.
#[instrument(name = "wc_notifyWatchSubscriptions", skip_all, fields(account = %account))]
pub async fn watch_subscriptions(
    state: &ClientState,
    account: &AccountId,
) -> Result<Vec<NotifySubscription>> {
    let _watching = state.watch_lock.lock().await;

    let identity = state.require_identity(account)?;
    let identity_key = identity.signing_key()?;
    let (watch_topic, context) = start_watching(state, &identity).await?;

    let watch_subscriptions_auth = WatchSubscriptionsRequestAuth {
        shared_claims: SharedClaims::new(
            &identity_key,
            &context.notify_server,
            NOTIFY_WATCH_SUBSCRIPTIONS_ACT,
            NOTIFY_WATCH_SUBSCRIPTIONS_TTL,
        ),
        ksu: state.keyserver.url().to_string(),
        sub: account.to_did_pkh(),
        app: None,
    };
    let request = JsonRpcRequest::new(
        NOTIFY_WATCH_SUBSCRIPTIONS_METHOD,
        NotifyWatchSubscriptions {
            watch_subscriptions_auth: sign_jwt(watch_subscriptions_auth, &identity_key)?,
        },
    );
    let message = seal_type1(
        &context.key,
        &request,
        identity.watch_public_key()?.to_bytes(),
    )?;

    let pending = state
        .pending
        .register(watch_topic.clone(), NOTIFY_WATCH_SUBSCRIPTIONS_RESPONSE_TAG);
    state
        .publish(
            &context.notify_server_topic,
            message,
            NOTIFY_WATCH_SUBSCRIPTIONS_TAG,
            NOTIFY_WATCH_SUBSCRIPTIONS_TTL,
        )
        .await?;
    let response = pending
        .wait(state.request_timeout, NOTIFY_WATCH_SUBSCRIPTIONS_METHOD)
        .await?;

    let response_auth = open_response::<WatchSubscriptionsResponseAuth>(&response, &context.key)?;
    ensure_issuer(&response_auth, &context.notify_server.to_did_key())?;

    apply_subscriptions(state, account, response_auth.sbs).await
}

/// Replaces `account`'s subscriptions with `sbs`. Topics that appear are
/// listened to, topics that disappear are released along with their
/// messages.
pub async fn apply_subscriptions(
    state: &ClientState,
    account: &AccountId,
    sbs: Vec<NotifyServerSubscription>,
) -> Result<Vec<NotifySubscription>> {
    let mut subscriptions = Vec::with_capacity(sbs.len());
    for sbs in sbs.into_iter().filter(|sbs| sbs.account.is_same_address(account)) {
        subscriptions.push(to_subscription(state, account, sbs).await?);
    }

    let previous = state
        .repository
        .get_subscriptions(account)
        .into_iter()
        .map(|subscription| subscription.topic)
        .collect::<HashSet<_>>();
    let current = subscriptions
        .iter()
        .map(|subscription| subscription.topic.clone())
        .collect::<HashSet<_>>();

    for topic in current.difference(&previous) {
        state.listen(topic.clone()).await?;
        state.lifecycle.set(topic.to_string(), LifecycleState::Active);
    }

    state
        .repository
        .replace_all_subscriptions(subscriptions.clone(), account)?;

    for topic in previous.difference(&current) {
        if let Err(e) = state.repository.delete_messages(topic) {
            warn!("Failed to delete messages of removed subscription {topic}: {e}");
        }
        state.release(topic).await;
        state.lifecycle.set(topic.to_string(), LifecycleState::Removed);
    }

    info!(
        "Applied {} subscriptions, {} new, {} removed",
        current.len(),
        current.difference(&previous).count(),
        previous.difference(&current).count()
    );
    Ok(subscriptions)
}

async fn to_subscription(
    state: &ClientState,
    account: &AccountId,
    sbs: NotifyServerSubscription,
) -> Result<NotifySubscription> {
    let sym_key = SymKey::from_hex(&sbs.sym_key)?;
    let topic = sym_key.topic();
    let stored = state.repository.get_subscription(&topic);

    let (metadata, scope) = match state.resolver.resolve(&sbs.app_domain).await {
        Ok(app) => (app.metadata.clone(), app.scope_for(&sbs.scope)),
        Err(e) => {
            warn!("Could not resolve {}: {e}", sbs.app_domain);
            let metadata = stored
                .as_ref()
                .map(|stored| stored.metadata.clone())
                .unwrap_or_else(|| AppMetadata {
                    name: sbs.app_domain.clone(),
                    url: format!("https://{}", sbs.app_domain),
                    ..Default::default()
                });
            let scope = sbs
                .scope
                .iter()
                .map(|id| {
                    let description = stored
                        .as_ref()
                        .and_then(|stored| stored.scope.get(id))
                        .map(|value| value.description.clone())
                        .unwrap_or_default();
                    (
                        id.clone(),
                        ScopeValue {
                            description,
                            enabled: true,
                        },
                    )
                })
                .collect();
            (metadata, scope)
        }
    };

    Ok(NotifySubscription {
        topic,
        account: account.clone(),
        relay: RelayProtocolOptions::default(),
        metadata,
        scope,
        expiry: from_unix_timestamp(sbs.expiry),
        sym_key,
        app_authentication_key: sbs.app_authentication_key,
    })
}
