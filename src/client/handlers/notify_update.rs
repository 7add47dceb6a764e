use {
    super::{ensure_issuer, open_response, seal_type0, Result},
    crate::{
        auth::{sign_jwt, DidWeb, SharedClaims, SubscriptionUpdateRequestAuth, SubscriptionUpdateResponseAuth},
        client::{error::NotifyClientError, lifecycle::LifecycleState, state::ClientState},
        model::types::{NotifySubscription, ScopeValue},
        rpc::{JsonRpcRequest, NotifyUpdate},
        spec::{
            NOTIFY_UPDATE_ACT, NOTIFY_UPDATE_METHOD, NOTIFY_UPDATE_RESPONSE_TAG, NOTIFY_UPDATE_TAG,
            NOTIFY_UPDATE_TTL,
        },
        types::encode_scope,
        utils::from_unix_timestamp,
    },
    relay_rpc::domain::Topic,
    std::collections::{HashMap, HashSet},
    tracing::{info, instrument, warn},
};

/// Asks the app to deliver only the notification types in `scope` on
/// `topic`, then stores the scope and expiry the app confirmed.
#[instrument(name = "wc_notifyUpdate", skip_all, fields(topic = %topic))]
pub async fn update(
    state: &ClientState,
    topic: &Topic,
    scope: HashSet<String>,
) -> Result<NotifySubscription> {
    let subscription = state
        .repository
        .get_subscription(topic)
        .ok_or_else(|| NotifyClientError::SubscriptionNotFound(topic.clone()))?;
    let transition = state.lifecycle.begin(
        topic.to_string(),
        LifecycleState::Active,
        LifecycleState::Updating,
    )?;

    let identity = state.require_identity(&subscription.account)?;
    let identity_key = identity.signing_key()?;
    let app_authentication = subscription
        .app_authentication_client_id()
        .ok_or(NotifyClientError::InvalidAppAuthenticationKey)?;
    let app_domain = subscription
        .metadata
        .app_domain()
        .ok_or(NotifyClientError::MissingAppDomain)?;

    let update_auth = SubscriptionUpdateRequestAuth {
        shared_claims: SharedClaims::new(
            &identity_key,
            &app_authentication,
            NOTIFY_UPDATE_ACT,
            NOTIFY_UPDATE_TTL,
        ),
        ksu: state.keyserver.url().to_string(),
        sub: subscription.account.to_did_pkh(),
        app: DidWeb::from_domain(app_domain.as_str()),
        scp: encode_scope(&scope),
    };
    let request = JsonRpcRequest::new(
        NOTIFY_UPDATE_METHOD,
        NotifyUpdate {
            update_auth: sign_jwt(update_auth, &identity_key)?,
        },
    );
    let message = seal_type0(subscription.sym_key.as_bytes(), &request)?;

    let pending = state.pending.register(topic.clone(), NOTIFY_UPDATE_RESPONSE_TAG);
    state
        .publish(topic, message, NOTIFY_UPDATE_TAG, NOTIFY_UPDATE_TTL)
        .await?;
    let response = pending
        .wait(state.request_timeout, NOTIFY_UPDATE_METHOD)
        .await?;

    let response_auth =
        open_response::<SubscriptionUpdateResponseAuth>(&response, subscription.sym_key.as_bytes())?;
    ensure_issuer(&response_auth, &subscription.app_authentication_key)?;

    let sym_key = subscription.sym_key.to_hex();
    let confirmed = response_auth
        .sbs
        .into_iter()
        .find(|sbs| sbs.sym_key.eq_ignore_ascii_case(&sym_key))
        .ok_or_else(|| NotifyClientError::MissingSubscription(app_domain.clone()))?;

    let scope = describe_scope(state, &app_domain, &subscription, &confirmed.scope).await;
    let updated = state.repository.update_subscription(
        &subscription,
        scope,
        from_unix_timestamp(confirmed.expiry),
    )?;
    transition.complete(Some(LifecycleState::Active));

    info!("Updated scope to [{}]", encode_scope(&confirmed.scope));
    Ok(updated)
}

/// Descriptions come from the app's current config. Types the app no longer
/// describes keep the description already stored.
async fn describe_scope(
    state: &ClientState,
    app_domain: &str,
    subscription: &NotifySubscription,
    confirmed: &HashSet<String>,
) -> HashMap<String, ScopeValue> {
    let described = match state.resolver.resolve(app_domain).await {
        Ok(app) => app.scope_for(confirmed),
        Err(e) => {
            warn!("Could not resolve {app_domain}, keeping stored descriptions: {e}");
            HashMap::new()
        }
    };
    confirmed
        .iter()
        .map(|id| {
            let description = described
                .get(id)
                .map(|value| value.description.clone())
                .filter(|description| !description.is_empty())
                .or_else(|| subscription.scope.get(id).map(|value| value.description.clone()))
                .unwrap_or_default();
            (
                id.clone(),
                ScopeValue {
                    description,
                    enabled: true,
                },
            )
        })
        .collect()
}
