use {
    super::{notify_watch_subscriptions::watch_subscriptions, Result},
    crate::{
        auth::{sign_jwt, SharedClaims, UnregisterIdentityRequestAuth},
        client::{
            error::NotifyClientError,
            identity::IdentityRecord,
            lifecycle::LifecycleState,
            state::ClientState,
        },
        keyserver::{Cacao, CacaoPayload, SigningResult, STATEMENT_ALL_DOMAINS},
        model::types::AccountId,
        spec::{UNREGISTER_IDENTITY_ACT, UNREGISTER_IDENTITY_TTL},
        utils::{add_ttl, unix_timestamp},
    },
    chrono::Utc,
    tracing::{info, instrument, warn},
};

fn account_state(state: &ClientState, account: &AccountId) -> LifecycleState {
    if state.identity(account).is_some() {
        LifecycleState::Registered
    } else {
        LifecycleState::Idle
    }
}

/// Binds a fresh identity key to `account` at the keys server, or reuses the
/// one already bound. Returns the identity's did:key.
///
/// `on_sign` is handed the SIWE message to sign with the account's wallet. It
/// is only called when a new identity is registered.
///
/// The identity is in place once this returns `Ok`. Fetching the account's
/// subscriptions afterwards is best effort: a failure there is logged and can
/// be retried with [`watch_subscriptions`].
///
/// [`watch_subscriptions`]: crate::client::NotifyClient::watch_subscriptions
#[instrument(skip_all, fields(account = %account, domain = %domain))]
pub async fn register(
    state: &ClientState,
    account: &AccountId,
    domain: &str,
    on_sign: impl FnOnce(&str) -> SigningResult + Send,
) -> Result<String> {
    let transition = state.lifecycle.begin(
        account.to_string(),
        account_state(state, account),
        LifecycleState::Registering,
    )?;

    let identity = match state.identity(account) {
        Some(identity) => {
            info!("Reusing registered identity");
            identity
        }
        None => {
            let identity = IdentityRecord::generate(account.clone());
            let payload = CacaoPayload::new(
                domain,
                account,
                identity.did_key()?,
                STATEMENT_ALL_DOMAINS,
                state.keyserver.url(),
            );
            let signature = match on_sign(&payload.siwe_message()?) {
                SigningResult::Signed(signature) => signature,
                SigningResult::Rejected => return Err(NotifyClientError::SignatureRejected),
            };
            state
                .keyserver
                .register_identity(&Cacao::new(payload, signature))
                .await?;
            state.identities.set(identity.clone(), account.as_ref())?;
            info!("Registered identity");
            identity
        }
    };
    state.account_provider.set_current_account(Some(account.clone()));
    transition.complete(Some(LifecycleState::Registered));

    if let Err(e) = watch_subscriptions(state, account).await {
        warn!("Registered, but failed to fetch subscriptions: {e}");
    }
    Ok(identity.did_key()?)
}

/// Removes `account`'s identity from the keys server and from this device.
/// Stored subscriptions are kept until [`clear_database`] is called.
///
/// [`clear_database`]: crate::client::NotifyClient::clear_database
#[instrument(skip_all, fields(account = %account))]
pub async fn unregister(state: &ClientState, account: &AccountId) -> Result<()> {
    let identity = state.require_identity(account)?;
    // Holding the account in Registering keeps a register from overlapping
    let transition = state.lifecycle.begin(
        account.to_string(),
        LifecycleState::Registered,
        LifecycleState::Registering,
    )?;

    let identity_key = identity.signing_key()?;
    let now = Utc::now();
    let unregister_auth = UnregisterIdentityRequestAuth {
        shared_claims: SharedClaims {
            iat: unix_timestamp(now),
            exp: unix_timestamp(add_ttl(now, UNREGISTER_IDENTITY_TTL)),
            iss: identity.did_key()?,
            aud: state.keyserver.url().to_string(),
            act: UNREGISTER_IDENTITY_ACT.to_owned(),
            mjv: "1".to_owned(),
        },
        pkh: account.to_did_pkh(),
    };
    state
        .keyserver
        .unregister_identity(&sign_jwt(unregister_auth, &identity_key)?)
        .await?;

    state.identities.delete(account.as_ref(), account.as_ref())?;
    for topic in state.stop_watching(account) {
        state.release(&topic).await;
    }
    if state
        .account_provider
        .current_account()
        .is_ok_and(|current| &current == account)
    {
        state.account_provider.set_current_account(None);
    }
    transition.complete(None);

    info!("Unregistered identity");
    Ok(())
}
