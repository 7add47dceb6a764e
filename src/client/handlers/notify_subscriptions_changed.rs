use {
    super::{ensure_issuer, notify_watch_subscriptions::watch_subscriptions, seal_type0, Result},
    crate::{
        auth::{
            from_jwt, sign_jwt, SharedClaims, WatchSubscriptionsChangedRequestAuth,
            WatchSubscriptionsChangedResponseAuth,
        },
        client::{error::NotifyClientError, state::ClientState},
        rpc::{JsonRpcRequest, JsonRpcResponse, NotifySubscriptionsChanged, ResponseAuth},
        spec::{
            NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_ACT, NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_TAG,
            NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_TTL,
        },
        transport::InboundMessage,
        types::{decode_payload, Envelope, EnvelopeType0},
    },
    tracing::{info, instrument},
};

/// Another client of the account changed its subscriptions. Acknowledges the
/// push and re-fetches the full list.
#[instrument(name = "wc_notifySubscriptionsChanged", skip_all, fields(topic = %msg.topic))]
pub async fn handle(msg: InboundMessage, state: &ClientState) -> Result<()> {
    let context = state
        .watch_context(&msg.topic)
        .ok_or_else(|| NotifyClientError::UnknownWatchTopic(msg.topic.clone()))?;
    let identity = state.require_identity(&context.account)?;
    let identity_key = identity.signing_key()?;

    let envelope = Envelope::<EnvelopeType0>::from_bytes(&decode_payload(&msg.message)?)?;
    let request = envelope.open::<JsonRpcRequest<NotifySubscriptionsChanged>>(&context.key)?;
    let changed_auth = from_jwt::<WatchSubscriptionsChangedRequestAuth>(
        &request.params.subscriptions_changed_auth,
    )?;
    ensure_issuer(&changed_auth, &context.notify_server.to_did_key())?;
    info!("{} subscriptions announced", changed_auth.sbs.len());

    let response_auth = WatchSubscriptionsChangedResponseAuth {
        shared_claims: SharedClaims::new(
            &identity_key,
            &context.notify_server,
            NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_ACT,
            NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_TTL,
        ),
        ksu: state.keyserver.url().to_string(),
        sub: context.account.to_did_pkh(),
    };
    let response = JsonRpcResponse::new(
        request.id,
        ResponseAuth {
            response_auth: sign_jwt(response_auth, &identity_key)?,
        },
    );
    state
        .publish(
            &msg.topic,
            seal_type0(&context.key, &response)?,
            NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_TAG,
            NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_TTL,
        )
        .await?;

    watch_subscriptions(state, &context.account).await?;
    Ok(())
}
