use {
    super::{seal_type0, Result},
    crate::{
        auth::{sign_jwt, DidWeb, SharedClaims, SubscriptionDeleteRequestAuth},
        client::{error::NotifyClientError, lifecycle::LifecycleState, state::ClientState},
        model::types::NotifySubscription,
        rpc::{JsonRpcRequest, NotifyDelete},
        spec::{NOTIFY_DELETE_ACT, NOTIFY_DELETE_METHOD, NOTIFY_DELETE_TAG, NOTIFY_DELETE_TTL},
        transport::publish_relay_message,
    },
    relay_rpc::domain::Topic,
    std::sync::Arc,
    tracing::{info, instrument, warn, Instrument},
};

/// Removes the subscription and its messages locally, then tells the app
/// the subscription is gone. The notice is sent in the background and is best
/// effort: local cleanup never waits on the relay.
#[instrument(name = "wc_notifyDelete", skip_all, fields(topic = %topic))]
pub async fn delete(state: &Arc<ClientState>, topic: &Topic) -> Result<()> {
    let subscription = state
        .repository
        .get_subscription(topic)
        .ok_or_else(|| NotifyClientError::SubscriptionNotFound(topic.clone()))?;
    let transition = state.lifecycle.begin(
        topic.to_string(),
        LifecycleState::Active,
        LifecycleState::Deleting,
    )?;

    // Sealed before cleanup, the identity and keys may not outlive it
    let notice = match seal_delete(state, &subscription) {
        Ok(notice) => Some(notice),
        Err(e) => {
            warn!("Not notifying the app of the deletion: {e}");
            None
        }
    };

    // Messages first: if either step fails the subscription is still there
    state.repository.delete_messages(topic)?;
    state.repository.delete_subscription(topic)?;
    state.release(topic).await;
    transition.complete(Some(LifecycleState::Removed));
    info!("Deleted subscription");

    if let Some(notice) = notice {
        let transport = state.transport.clone();
        let topic = topic.clone();
        tokio::spawn(
            async move {
                if let Err(e) = publish_relay_message(
                    transport.as_ref(),
                    &topic,
                    notice,
                    NOTIFY_DELETE_TAG,
                    NOTIFY_DELETE_TTL,
                )
                .await
                {
                    warn!("Failed to notify the app of the deletion: {e}");
                }
            }
            .in_current_span(),
        );
    }
    Ok(())
}

fn seal_delete(state: &ClientState, subscription: &NotifySubscription) -> Result<Arc<str>> {
    let identity = state.require_identity(&subscription.account)?;
    let identity_key = identity.signing_key()?;
    let app_authentication = subscription
        .app_authentication_client_id()
        .ok_or(NotifyClientError::InvalidAppAuthenticationKey)?;
    let app_domain = subscription
        .metadata
        .app_domain()
        .ok_or(NotifyClientError::MissingAppDomain)?;

    let delete_auth = SubscriptionDeleteRequestAuth {
        shared_claims: SharedClaims::new(
            &identity_key,
            &app_authentication,
            NOTIFY_DELETE_ACT,
            NOTIFY_DELETE_TTL,
        ),
        ksu: state.keyserver.url().to_string(),
        sub: subscription.account.to_did_pkh(),
        app: DidWeb::from_domain(app_domain),
    };
    let request = JsonRpcRequest::new(
        NOTIFY_DELETE_METHOD,
        NotifyDelete {
            delete_auth: sign_jwt(delete_auth, &identity_key)?,
        },
    );
    seal_type0(subscription.sym_key.as_bytes(), &request)
}
