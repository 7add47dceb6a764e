use {
    super::seal_type0,
    crate::{
        auth::{from_jwt, sign_jwt, MessageResponseAuth, SharedClaims},
        client::{
            error::{InboundMessageError, NotifyClientError},
            state::ClientState,
        },
        model::types::{AccountId, NotifyMessageRecord, NotifySubscription},
        notify_message::NotifyMessageClaims,
        rpc::{JsonRpcRequest, JsonRpcResponse, MessageId, NotifyMessageAuth, ResponseAuth},
        spec::{
            NOTIFY_MESSAGE_RESPONSE_ACT, NOTIFY_MESSAGE_RESPONSE_TAG, NOTIFY_MESSAGE_RESPONSE_TTL,
        },
        transport::InboundMessage,
        types::{decode_payload, Envelope, EnvelopeType0},
    },
    chrono::Utc,
    tracing::{debug, info, instrument, warn},
};

/// Verifies and stores a notification pushed by the subscribed app.
#[instrument(name = "wc_notifyMessage", skip_all, fields(topic = %msg.topic))]
pub async fn handle(msg: InboundMessage, state: &ClientState) -> Result<(), InboundMessageError> {
    let topic = msg.topic.clone();
    let subscription = state
        .repository
        .get_subscription(&topic)
        .ok_or_else(|| InboundMessageError::UnknownTopic(topic.clone()))?;
    if subscription.is_expired(Utc::now()) {
        return Err(InboundMessageError::SubscriptionExpired(topic));
    }

    let envelope = Envelope::<EnvelopeType0>::from_bytes(&decode_payload(&msg.message)?)?;
    let request = envelope.open::<JsonRpcRequest<NotifyMessageAuth>>(subscription.sym_key.as_bytes())?;
    let claims = from_jwt::<NotifyMessageClaims>(&request.params.message_auth)?;

    if claims.shared_claims.iss != subscription.app_authentication_key {
        return Err(InboundMessageError::WrongIssuer(claims.shared_claims.iss));
    }
    match AccountId::from_did_pkh(&claims.sub) {
        Ok(account) if account.is_same_address(&subscription.account) => {}
        _ => return Err(InboundMessageError::WrongAccount(claims.sub)),
    }

    let notification = &claims.msg;
    if !subscription.enabled_scope().contains(&notification.r#type) {
        return Err(InboundMessageError::ScopeMismatch(notification.r#type.clone()));
    }
    let message = notification.to_message();
    message.validate()?;

    let record = NotifyMessageRecord {
        id: notification.id.to_string(),
        topic: topic.clone(),
        message,
        published_at: notification.sent_at().unwrap_or(msg.published_at),
    };
    if state.repository.set_message(record)? {
        info!("Stored message {}", notification.id);
    } else {
        debug!("Message {} already stored", notification.id);
    }

    // Duplicates are acknowledged too, the first acknowledgement may have
    // been lost
    if let Err(e) = acknowledge(state, &subscription, request.id, &claims).await {
        warn!("Failed to acknowledge message {}: {e}", notification.id);
    }
    Ok(())
}

async fn acknowledge(
    state: &ClientState,
    subscription: &NotifySubscription,
    id: MessageId,
    claims: &NotifyMessageClaims,
) -> Result<(), NotifyClientError> {
    let identity = state.require_identity(&subscription.account)?;
    let identity_key = identity.signing_key()?;
    let app_authentication = subscription
        .app_authentication_client_id()
        .ok_or(NotifyClientError::InvalidAppAuthenticationKey)?;

    let response_auth = MessageResponseAuth {
        shared_claims: SharedClaims::new(
            &identity_key,
            &app_authentication,
            NOTIFY_MESSAGE_RESPONSE_ACT,
            NOTIFY_MESSAGE_RESPONSE_TTL,
        ),
        ksu: state.keyserver.url().to_string(),
        sub: subscription.account.to_did_pkh(),
        app: claims.app.clone(),
    };
    let response = JsonRpcResponse::new(
        id,
        ResponseAuth {
            response_auth: sign_jwt(response_auth, &identity_key)?,
        },
    );
    state
        .publish(
            &subscription.topic,
            seal_type0(subscription.sym_key.as_bytes(), &response)?,
            NOTIFY_MESSAGE_RESPONSE_TAG,
            NOTIFY_MESSAGE_RESPONSE_TTL,
        )
        .await
}
