use {
    super::{ensure_issuer, open_response, seal_type1, Result},
    crate::{
        auth::{sign_jwt, SharedClaims, SubscriptionRequestAuth, SubscriptionResponseAuth},
        client::{
            error::NotifyClientError,
            lifecycle::LifecycleState,
            state::ClientState,
        },
        model::types::{AccountId, NotifySubscription, RelayProtocolOptions, SymKey},
        rpc::{derive_key, JsonRpcRequest, NotifySubscribe},
        spec::{
            NOTIFY_SUBSCRIBE_ACT, NOTIFY_SUBSCRIBE_METHOD, NOTIFY_SUBSCRIBE_RESPONSE_TAG,
            NOTIFY_SUBSCRIBE_TAG, NOTIFY_SUBSCRIBE_TTL,
        },
        types::encode_scope,
        utils::{from_unix_timestamp, topic_from_key},
    },
    rand::rngs::OsRng,
    tracing::{info, instrument},
    x25519_dalek::{PublicKey, StaticSecret},
};

/// Subscribes `account` to every notification type `app_domain` offers.
///
/// Nothing is stored until the app has confirmed the subscription.
#[instrument(name = "wc_notifySubscribe", skip_all, fields(app_domain = %app_domain, account = %account))]
pub async fn subscribe(
    state: &ClientState,
    app_domain: &str,
    account: &AccountId,
) -> Result<NotifySubscription> {
    let identity = state.require_identity(account)?;
    let transition = state.lifecycle.begin(
        format!("{account}/{app_domain}"),
        LifecycleState::Idle,
        LifecycleState::Subscribing,
    )?;

    let app = state.resolver.resolve(app_domain).await?;
    let identity_key = identity.signing_key()?;

    let secret = StaticSecret::random_from_rng(OsRng);
    let response_key =
        derive_key(&app.key_agreement, &secret).map_err(|_| NotifyClientError::KeyDerivation)?;
    let response_topic = topic_from_key(&response_key);
    let request_topic = topic_from_key(app.key_agreement.as_bytes());

    let subscription_auth = SubscriptionRequestAuth {
        shared_claims: SharedClaims::new(
            &identity_key,
            &app.authentication,
            NOTIFY_SUBSCRIBE_ACT,
            NOTIFY_SUBSCRIBE_TTL,
        ),
        ksu: state.keyserver.url().to_string(),
        sub: account.to_did_pkh(),
        app: app.did_web(),
        scp: encode_scope(app.types.iter().map(|t| &t.id)),
    };
    let request = JsonRpcRequest::new(
        NOTIFY_SUBSCRIBE_METHOD,
        NotifySubscribe {
            subscription_auth: sign_jwt(subscription_auth, &identity_key)?,
        },
    );
    let message = seal_type1(&response_key, &request, PublicKey::from(&secret).to_bytes())?;

    state.listen(response_topic.clone()).await?;
    let response = {
        let pending = state
            .pending
            .register(response_topic.clone(), NOTIFY_SUBSCRIBE_RESPONSE_TAG);
        match state
            .publish(&request_topic, message, NOTIFY_SUBSCRIBE_TAG, NOTIFY_SUBSCRIBE_TTL)
            .await
        {
            Ok(()) => pending.wait(state.request_timeout, NOTIFY_SUBSCRIBE_METHOD).await,
            Err(e) => Err(e),
        }
    };
    state.release(&response_topic).await;
    let response = response?;

    let response_auth = open_response::<SubscriptionResponseAuth>(&response, &response_key)?;
    ensure_issuer(&response_auth, &app.authentication_did_key())?;

    let confirmed = response_auth
        .sbs
        .into_iter()
        .find(|sbs| sbs.app_domain == app.domain && sbs.account.is_same_address(account))
        .ok_or_else(|| NotifyClientError::MissingSubscription(app.domain.clone()))?;
    let sym_key = SymKey::from_hex(&confirmed.sym_key)?;

    let subscription = NotifySubscription {
        topic: sym_key.topic(),
        account: account.clone(),
        relay: RelayProtocolOptions::default(),
        metadata: app.metadata.clone(),
        scope: app.scope_for(&confirmed.scope),
        expiry: from_unix_timestamp(confirmed.expiry),
        sym_key,
        app_authentication_key: confirmed.app_authentication_key,
    };

    state.listen(subscription.topic.clone()).await?;
    if let Err(e) = state.repository.set_subscription(subscription.clone()) {
        state.release(&subscription.topic).await;
        return Err(e.into());
    }
    state
        .lifecycle
        .set(subscription.topic.to_string(), LifecycleState::Active);
    transition.complete(None);

    info!("Subscribed to {} on {}", app.domain, subscription.topic);
    Ok(subscription)
}
