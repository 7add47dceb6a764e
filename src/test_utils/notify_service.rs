//! The server side of the notify protocol, scripted over the loopback relay.

use {
    crate::{
        auth::{
            from_jwt, sign_jwt, DidWeb, JwtError, MessageResponseAuth, NotifyServerSubscription,
            SharedClaims, SubscriptionDeleteRequestAuth, SubscriptionDeleteResponseAuth,
            SubscriptionRequestAuth, SubscriptionResponseAuth, SubscriptionUpdateRequestAuth,
            SubscriptionUpdateResponseAuth, WatchSubscriptionsChangedRequestAuth,
            WatchSubscriptionsRequestAuth, WatchSubscriptionsResponseAuth,
        },
        model::types::{AccountId, AccountIdParseError, AppMetadata, SymKey},
        notify_message::{sign_message, AppSigningDetails, JwtNotification},
        resolver::{AppDescriptor, NotificationType},
        rpc::{
            derive_key, JsonRpcRequest, JsonRpcResponse, NotifyDelete, NotifyMessageAuth,
            NotifySubscribe, NotifySubscriptionsChanged, NotifyUpdate, NotifyWatchSubscriptions,
            ResponseAuth,
        },
        spec::*,
        transport::{InboundMessage, LoopbackConnection, LoopbackRelay, Transport, TransportError},
        types::{decode_payload, encode_payload, parse_scope, Envelope, EnvelopeError, EnvelopeType0, EnvelopeType1},
        utils::{add_ttl, get_client_id, topic_from_key, unix_timestamp},
    },
    chrono::Utc,
    futures::StreamExt,
    parking_lot::Mutex,
    rand::RngCore,
    rand_chacha::{rand_core::SeedableRng, ChaCha20Rng},
    relay_rpc::{
        auth::ed25519_dalek::SigningKey,
        domain::{DecodedClientId, Topic},
    },
    serde::Serialize,
    std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    thiserror::Error,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, warn},
    x25519_dalek::{PublicKey, StaticSecret},
};

#[derive(Debug, Error)]
enum ServiceError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Jwt(#[from] JwtError),

    #[error(transparent)]
    Account(#[from] AccountIdParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("{0}")]
    Unknown(&'static str),
}

struct MockApp {
    domain: String,
    key_agreement: StaticSecret,
    authentication: SigningKey,
    types: Vec<NotificationType>,
}

impl MockApp {
    fn request_topic(&self) -> Topic {
        topic_from_key(PublicKey::from(&self.key_agreement).as_bytes())
    }

    fn descriptor(&self) -> AppDescriptor {
        AppDescriptor {
            domain: self.domain.clone(),
            key_agreement: PublicKey::from(&self.key_agreement),
            authentication: get_client_id(&self.authentication.verifying_key()),
            metadata: AppMetadata {
                name: self.domain.clone(),
                description: format!("Notifications from {}", self.domain),
                icons: vec![],
                url: format!("https://{}", self.domain),
            },
            types: self.types.clone(),
        }
    }

    /// Keeps the requested ids the app actually offers. An empty request
    /// means all of them.
    fn confirm_scope(&self, requested: &str) -> HashSet<String> {
        let requested = parse_scope(requested);
        self.types
            .iter()
            .map(|t| t.id.clone())
            .filter(|id| requested.is_empty() || requested.contains(id))
            .collect()
    }
}

struct ServerSubscription {
    app_domain: String,
    account: AccountId,
    sym_key: SymKey,
    scope: HashSet<String>,
    expiry: u64,
}

impl ServerSubscription {
    fn to_wire(&self, app: &MockApp) -> NotifyServerSubscription {
        NotifyServerSubscription {
            app_domain: self.app_domain.clone(),
            app_authentication_key: get_client_id(&app.authentication.verifying_key()).to_did_key(),
            sym_key: self.sym_key.to_hex(),
            account: self.account.clone(),
            scope: self.scope.clone(),
            expiry: self.expiry,
        }
    }
}

struct Watcher {
    account: AccountId,
    /// did:key of the watching client's identity
    did_key: String,
    sym_key: [u8; 32],
    topic: Topic,
}

struct ServiceState {
    connection: LoopbackConnection,
    domain: String,
    key_agreement: StaticSecret,
    authentication: SigningKey,
    rng: Mutex<ChaCha20Rng>,
    apps: Mutex<Vec<Arc<MockApp>>>,
    subscriptions: Mutex<Vec<ServerSubscription>>,
    watchers: Mutex<Vec<Watcher>>,
    responsive: AtomicBool,
    acknowledged: AtomicUsize,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

/// Plays the notify service and any number of apps registered with it.
pub struct MockNotifyService {
    state: Arc<ServiceState>,
    task: JoinHandle<()>,
}

impl Drop for MockNotifyService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockNotifyService {
    pub async fn start(relay: &LoopbackRelay, domain: &str) -> Self {
        let mut rng = ChaCha20Rng::from_entropy();
        let key_agreement = StaticSecret::random_from_rng(&mut rng);
        let mut authentication = [0u8; 32];
        rng.fill_bytes(&mut authentication);

        let (inbound, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(ServiceState {
            connection: relay.connect(),
            domain: domain.to_owned(),
            key_agreement,
            authentication: SigningKey::from_bytes(&authentication),
            rng: Mutex::new(rng),
            apps: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            responsive: AtomicBool::new(true),
            acknowledged: AtomicUsize::new(0),
            inbound,
        });

        let topic = topic_from_key(PublicKey::from(&state.key_agreement).as_bytes());
        listen(&state, topic).await;

        let task = tokio::spawn({
            let state = state.clone();
            async move {
                while let Some(msg) = rx.recv().await {
                    if !state.responsive.load(Ordering::SeqCst) {
                        debug!("Ignoring tag {} on {}", msg.tag, msg.topic);
                        continue;
                    }
                    if let Err(e) = handle(&state, msg).await {
                        warn!("Mock notify service failed to handle message: {e}");
                    }
                }
            }
        });

        Self { state, task }
    }

    /// The notify service itself, as clients resolve it for
    /// watch-subscriptions.
    pub fn descriptor(&self) -> AppDescriptor {
        AppDescriptor {
            domain: self.state.domain.clone(),
            key_agreement: PublicKey::from(&self.state.key_agreement),
            authentication: get_client_id(&self.state.authentication.verifying_key()),
            metadata: AppMetadata::default(),
            types: vec![],
        }
    }

    /// Registers an app offering notification types `types` and starts
    /// accepting subscriptions for it.
    pub async fn add_app(&self, domain: &str, types: &[&str]) -> AppDescriptor {
        let app = {
            let mut rng = self.state.rng.lock();
            let key_agreement = StaticSecret::random_from_rng(&mut *rng);
            let mut authentication = [0u8; 32];
            rng.fill_bytes(&mut authentication);
            MockApp {
                domain: domain.to_owned(),
                key_agreement,
                authentication: SigningKey::from_bytes(&authentication),
                types: types
                    .iter()
                    .map(|id| NotificationType {
                        id: (*id).to_owned(),
                        name: id.to_uppercase(),
                        description: format!("{id} notifications"),
                    })
                    .collect(),
            }
        };
        let descriptor = app.descriptor();
        let topic = app.request_topic();
        self.state.apps.lock().push(Arc::new(app));
        listen(&self.state, topic).await;
        descriptor
    }

    /// While unresponsive every request is dropped unanswered.
    pub fn set_responsive(&self, responsive: bool) {
        self.state.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn subscriptions(&self, account: &AccountId) -> Vec<NotifyServerSubscription> {
        account_subscriptions(&self.state, account)
    }

    /// Number of `wc_notifyMessage` acknowledgements received so far.
    pub fn acknowledged_messages(&self) -> usize {
        self.state.acknowledged.load(Ordering::SeqCst)
    }

    pub fn signing_details(&self, app_domain: &str) -> Option<AppSigningDetails> {
        find_app(&self.state, app_domain).map(|app| AppSigningDetails {
            private_key: app.authentication.clone(),
            app: DidWeb::from_domain(app.domain.as_str()),
        })
    }

    /// The topic and key of `account`'s subscription to `app_domain`.
    pub fn subscription_key(&self, app_domain: &str, account: &AccountId) -> Option<(Topic, SymKey)> {
        self.state
            .subscriptions
            .lock()
            .iter()
            .find(|s| s.app_domain == app_domain && s.account.is_same_address(account))
            .map(|s| (s.sym_key.topic(), s.sym_key.clone()))
    }

    /// Sends `notification` from `app_domain` to `account`. Returns the topic
    /// it went out on, or None without a subscription.
    pub async fn notify(
        &self,
        app_domain: &str,
        account: &AccountId,
        notification: JwtNotification,
    ) -> Option<Topic> {
        let details = self.signing_details(app_domain)?;
        let (topic, sym_key) = self.subscription_key(app_domain, account)?;
        let message_auth = sign_message(Arc::new(notification), account, &details).ok()?;
        self.publish_message_auth(&topic, &sym_key, message_auth).await;
        Some(topic)
    }

    /// Publishes an arbitrary `wc_notifyMessage` JWT.
    pub async fn publish_message_auth(&self, topic: &Topic, sym_key: &SymKey, message_auth: String) {
        let request = JsonRpcRequest::new(NOTIFY_MESSAGE_METHOD, NotifyMessageAuth { message_auth });
        if let Err(e) = publish_type0(
            &self.state,
            topic.clone(),
            sym_key.as_bytes(),
            &request,
            NOTIFY_MESSAGE_TAG,
            NOTIFY_MESSAGE_TTL,
        )
        .await
        {
            warn!("Failed to publish message: {e}");
        }
    }

    /// Publishes `message` verbatim.
    pub async fn publish_raw(&self, topic: &Topic, message: &str, tag: u32) {
        let _ = self
            .state
            .connection
            .publish(topic.clone(), Arc::from(message), tag, NOTIFY_MESSAGE_TTL)
            .await;
    }
}

fn find_app(state: &ServiceState, domain: &str) -> Option<Arc<MockApp>> {
    state.apps.lock().iter().find(|app| app.domain == domain).cloned()
}

fn account_subscriptions(state: &ServiceState, account: &AccountId) -> Vec<NotifyServerSubscription> {
    let apps = state.apps.lock();
    state
        .subscriptions
        .lock()
        .iter()
        .filter(|s| s.account.is_same_address(account))
        .filter_map(|s| {
            apps.iter()
                .find(|app| app.domain == s.app_domain)
                .map(|app| s.to_wire(app))
        })
        .collect()
}

async fn listen(state: &Arc<ServiceState>, topic: Topic) {
    let Ok(mut stream) = state.connection.subscribe(topic).await else {
        return;
    };
    let inbound = state.inbound.clone();
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            if inbound.send(msg).is_err() {
                break;
            }
        }
    });
}

async fn publish_type0(
    state: &ServiceState,
    topic: Topic,
    key: &[u8; 32],
    payload: &impl Serialize,
    tag: u32,
    ttl: Duration,
) -> Result<(), ServiceError> {
    let envelope = Envelope::<EnvelopeType0>::new(key, payload)?;
    state
        .connection
        .publish(topic, Arc::from(encode_payload(&envelope.to_bytes())), tag, ttl)
        .await?;
    Ok(())
}

fn claims(signer: &SigningKey, aud: &str, act: &str, ttl: Duration) -> Result<SharedClaims, ServiceError> {
    let aud = DecodedClientId::try_from_did_key(aud).map_err(|_| ServiceError::Unknown("aud is not a did:key"))?;
    Ok(SharedClaims::new(signer, &aud, act, ttl))
}

/// Decodes a type 1 request addressed to `secret`. Returns the response key
/// and the request.
fn open_type1<T: serde::de::DeserializeOwned>(
    secret: &StaticSecret,
    msg: &InboundMessage,
) -> Result<([u8; 32], JsonRpcRequest<T>), ServiceError> {
    let envelope = Envelope::<EnvelopeType1>::from_bytes(&decode_payload(&msg.message)?)?;
    let key = derive_key(&PublicKey::from(envelope.pubkey()), secret)
        .map_err(|_| ServiceError::KeyDerivation)?;
    Ok((key, envelope.open(&key)?))
}

async fn handle(state: &Arc<ServiceState>, msg: InboundMessage) -> Result<(), ServiceError> {
    match msg.tag {
        NOTIFY_WATCH_SUBSCRIPTIONS_TAG => handle_watch_subscriptions(state, msg).await,
        NOTIFY_SUBSCRIBE_TAG => handle_subscribe(state, msg).await,
        NOTIFY_UPDATE_TAG => handle_update(state, msg).await,
        NOTIFY_DELETE_TAG => handle_delete(state, msg).await,
        NOTIFY_MESSAGE_RESPONSE_TAG => handle_message_response(state, msg),
        tag => {
            debug!("Ignoring tag {tag} on {}", msg.topic);
            Ok(())
        }
    }
}

async fn handle_watch_subscriptions(state: &Arc<ServiceState>, msg: InboundMessage) -> Result<(), ServiceError> {
    let (key, request) = open_type1::<NotifyWatchSubscriptions>(&state.key_agreement, &msg)?;
    let request_auth =
        from_jwt::<WatchSubscriptionsRequestAuth>(&request.params.watch_subscriptions_auth)?;
    let account = AccountId::from_did_pkh(&request_auth.sub)?;
    let topic = topic_from_key(&key);

    let is_new = {
        let mut watchers = state.watchers.lock();
        watchers.retain(|w| w.did_key != request_auth.shared_claims.iss);
        let is_new = !watchers.iter().any(|w| w.topic == topic);
        watchers.push(Watcher {
            account: account.clone(),
            did_key: request_auth.shared_claims.iss.clone(),
            sym_key: key,
            topic: topic.clone(),
        });
        is_new
    };
    if is_new {
        // Acknowledgements of changes land here
        listen(state, topic.clone()).await;
    }

    let response_auth = WatchSubscriptionsResponseAuth {
        shared_claims: claims(
            &state.authentication,
            &request_auth.shared_claims.iss,
            NOTIFY_WATCH_SUBSCRIPTIONS_RESPONSE_ACT,
            NOTIFY_WATCH_SUBSCRIPTIONS_RESPONSE_TTL,
        )?,
        sub: request_auth.sub,
        sbs: account_subscriptions(state, &account),
    };
    let response = JsonRpcResponse::new(
        request.id,
        ResponseAuth {
            response_auth: sign_jwt(response_auth, &state.authentication)?,
        },
    );
    publish_type0(
        state,
        topic,
        &key,
        &response,
        NOTIFY_WATCH_SUBSCRIPTIONS_RESPONSE_TAG,
        NOTIFY_WATCH_SUBSCRIPTIONS_RESPONSE_TTL,
    )
    .await
}

async fn handle_subscribe(state: &Arc<ServiceState>, msg: InboundMessage) -> Result<(), ServiceError> {
    let app = state
        .apps
        .lock()
        .iter()
        .find(|app| app.request_topic() == msg.topic)
        .cloned()
        .ok_or(ServiceError::Unknown("no app on this topic"))?;
    let (key, request) = open_type1::<NotifySubscribe>(&app.key_agreement, &msg)?;
    let request_auth = from_jwt::<SubscriptionRequestAuth>(&request.params.subscription_auth)?;
    let account = AccountId::from_did_pkh(&request_auth.sub)?;
    let scope = app.confirm_scope(&request_auth.scp);
    let expiry = unix_timestamp(add_ttl(Utc::now(), NOTIFY_SUBSCRIBE_TTL));

    let (sym_key, is_new) = {
        let mut subscriptions = state.subscriptions.lock();
        match subscriptions
            .iter()
            .position(|s| s.app_domain == app.domain && s.account.is_same_address(&account))
        {
            Some(index) => {
                let existing = &mut subscriptions[index];
                existing.scope = scope;
                existing.expiry = expiry;
                (existing.sym_key.clone(), false)
            }
            None => {
                let mut bytes = [0u8; 32];
                state.rng.lock().fill_bytes(&mut bytes);
                let sym_key = SymKey::from(bytes);
                subscriptions.push(ServerSubscription {
                    app_domain: app.domain.clone(),
                    account: account.clone(),
                    sym_key: sym_key.clone(),
                    scope,
                    expiry,
                });
                (sym_key, true)
            }
        }
    };
    if is_new {
        listen(state, sym_key.topic()).await;
    }

    let response_auth = SubscriptionResponseAuth {
        shared_claims: claims(
            &app.authentication,
            &request_auth.shared_claims.iss,
            NOTIFY_SUBSCRIBE_RESPONSE_ACT,
            NOTIFY_SUBSCRIBE_RESPONSE_TTL,
        )?,
        sub: request_auth.sub.clone(),
        app: DidWeb::from_domain(app.domain.as_str()),
        sbs: account_subscriptions(state, &account),
    };
    let response = JsonRpcResponse::new(
        request.id,
        ResponseAuth {
            response_auth: sign_jwt(response_auth, &app.authentication)?,
        },
    );
    publish_type0(
        state,
        topic_from_key(&key),
        &key,
        &response,
        NOTIFY_SUBSCRIBE_RESPONSE_TAG,
        NOTIFY_SUBSCRIBE_RESPONSE_TTL,
    )
    .await?;

    notify_watchers(state, &account, &request_auth.shared_claims.iss).await
}

/// Finds the subscription living on `topic` with its app.
fn subscription_on(state: &ServiceState, topic: &Topic) -> Option<(SymKey, Arc<MockApp>)> {
    let domain_and_key = state
        .subscriptions
        .lock()
        .iter()
        .find(|s| &s.sym_key.topic() == topic)
        .map(|s| (s.sym_key.clone(), s.app_domain.clone()))?;
    find_app(state, &domain_and_key.1).map(|app| (domain_and_key.0, app))
}

async fn handle_update(state: &Arc<ServiceState>, msg: InboundMessage) -> Result<(), ServiceError> {
    let (sym_key, app) =
        subscription_on(state, &msg.topic).ok_or(ServiceError::Unknown("no subscription on topic"))?;
    let envelope = Envelope::<EnvelopeType0>::from_bytes(&decode_payload(&msg.message)?)?;
    let request = envelope.open::<JsonRpcRequest<NotifyUpdate>>(sym_key.as_bytes())?;
    let request_auth = from_jwt::<SubscriptionUpdateRequestAuth>(&request.params.update_auth)?;
    let account = AccountId::from_did_pkh(&request_auth.sub)?;

    let scope = app.confirm_scope(&request_auth.scp);
    let expiry = unix_timestamp(add_ttl(Utc::now(), NOTIFY_SUBSCRIBE_TTL));
    if let Some(subscription) = state
        .subscriptions
        .lock()
        .iter_mut()
        .find(|s| s.sym_key == sym_key)
    {
        subscription.scope = scope;
        subscription.expiry = expiry;
    }

    let response_auth = SubscriptionUpdateResponseAuth {
        shared_claims: claims(
            &app.authentication,
            &request_auth.shared_claims.iss,
            NOTIFY_UPDATE_RESPONSE_ACT,
            NOTIFY_UPDATE_RESPONSE_TTL,
        )?,
        sub: request_auth.sub.clone(),
        app: DidWeb::from_domain(app.domain.as_str()),
        sbs: account_subscriptions(state, &account),
    };
    let response = JsonRpcResponse::new(
        request.id,
        ResponseAuth {
            response_auth: sign_jwt(response_auth, &app.authentication)?,
        },
    );
    publish_type0(
        state,
        msg.topic,
        sym_key.as_bytes(),
        &response,
        NOTIFY_UPDATE_RESPONSE_TAG,
        NOTIFY_UPDATE_RESPONSE_TTL,
    )
    .await?;

    notify_watchers(state, &account, &request_auth.shared_claims.iss).await
}

async fn handle_delete(state: &Arc<ServiceState>, msg: InboundMessage) -> Result<(), ServiceError> {
    let (sym_key, app) =
        subscription_on(state, &msg.topic).ok_or(ServiceError::Unknown("no subscription on topic"))?;
    let envelope = Envelope::<EnvelopeType0>::from_bytes(&decode_payload(&msg.message)?)?;
    let request = envelope.open::<JsonRpcRequest<NotifyDelete>>(sym_key.as_bytes())?;
    let request_auth = from_jwt::<SubscriptionDeleteRequestAuth>(&request.params.delete_auth)?;
    let account = AccountId::from_did_pkh(&request_auth.sub)?;

    state.subscriptions.lock().retain(|s| s.sym_key != sym_key);

    let response_auth = SubscriptionDeleteResponseAuth {
        shared_claims: claims(
            &app.authentication,
            &request_auth.shared_claims.iss,
            NOTIFY_DELETE_RESPONSE_ACT,
            NOTIFY_DELETE_RESPONSE_TTL,
        )?,
        sub: request_auth.sub.clone(),
        app: DidWeb::from_domain(app.domain.as_str()),
        sbs: account_subscriptions(state, &account),
    };
    let response = JsonRpcResponse::new(
        request.id,
        ResponseAuth {
            response_auth: sign_jwt(response_auth, &app.authentication)?,
        },
    );
    publish_type0(
        state,
        msg.topic.clone(),
        sym_key.as_bytes(),
        &response,
        NOTIFY_DELETE_RESPONSE_TAG,
        NOTIFY_DELETE_RESPONSE_TTL,
    )
    .await?;
    state.connection.unsubscribe(&msg.topic).await?;

    notify_watchers(state, &account, &request_auth.shared_claims.iss).await
}

fn handle_message_response(state: &ServiceState, msg: InboundMessage) -> Result<(), ServiceError> {
    let (sym_key, _) =
        subscription_on(state, &msg.topic).ok_or(ServiceError::Unknown("no subscription on topic"))?;
    let envelope = Envelope::<EnvelopeType0>::from_bytes(&decode_payload(&msg.message)?)?;
    let response = envelope.open::<JsonRpcResponse<ResponseAuth>>(sym_key.as_bytes())?;
    from_jwt::<MessageResponseAuth>(&response.result.response_auth)?;
    state.acknowledged.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

/// Tells every other client watching `account` about its current
/// subscriptions.
async fn notify_watchers(
    state: &Arc<ServiceState>,
    account: &AccountId,
    requester: &str,
) -> Result<(), ServiceError> {
    let targets = state
        .watchers
        .lock()
        .iter()
        .filter(|w| w.account.is_same_address(account) && w.did_key != requester)
        .map(|w| (w.did_key.clone(), w.sym_key, w.topic.clone()))
        .collect::<Vec<_>>();
    let sbs = account_subscriptions(state, account);

    for (did_key, sym_key, topic) in targets {
        let changed_auth = WatchSubscriptionsChangedRequestAuth {
            shared_claims: claims(
                &state.authentication,
                &did_key,
                NOTIFY_SUBSCRIPTIONS_CHANGED_ACT,
                NOTIFY_SUBSCRIPTIONS_CHANGED_TTL,
            )?,
            sub: account.to_did_pkh(),
            sbs: sbs.clone(),
        };
        let request = JsonRpcRequest::new(
            NOTIFY_SUBSCRIPTIONS_CHANGED_METHOD,
            NotifySubscriptionsChanged {
                subscriptions_changed_auth: sign_jwt(
                    changed_auth,
                    &state.authentication,
                )?,
            },
        );
        publish_type0(
            state,
            topic,
            &sym_key,
            &request,
            NOTIFY_SUBSCRIPTIONS_CHANGED_TAG,
            NOTIFY_SUBSCRIPTIONS_CHANGED_TTL,
        )
        .await?;
    }
    Ok(())
}
