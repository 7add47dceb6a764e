use {
    async_trait::async_trait,
    futures::{future, stream::BoxStream, StreamExt},
    k256::ecdsa::SigningKey as AccountSigningKey,
    notify_client::{
        client::lifecycle::LifecycleState,
        config::Configuration,
        keyserver::SigningResult,
        log,
        model::types::{AccountId, NotifySubscription},
        notify_message::sign_message,
        resolver::StaticAppResolver,
        spec::{NOTIFY_DELETE_TAG, NOTIFY_MESSAGE_TAG},
        storage::{FileBackend, MemoryBackend, StorageBackend},
        test_utils::{generate_account, generate_notification, sign_siwe_message, MockNotifyService},
        transport::{InboundMessage, LoopbackConnection, LoopbackRelay, Transport, TransportError},
        NotifyClient, NotifyClientError,
    },
    relay_rpc::domain::Topic,
    std::{collections::HashSet, sync::Arc, time::Duration},
    test_context::{test_context, AsyncTestContext},
    tokio::time::{sleep, timeout},
    url::Url,
    wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    },
};

const NOTIFY_SERVER_DOMAIN: &str = "notify.example";
const APP_DOMAIN: &str = "gm.example";
const WALLET_DOMAIN: &str = "wallet.example";
const WAIT: Duration = Duration::from_secs(5);

struct NotifyClientContext {
    relay: LoopbackRelay,
    service: MockNotifyService,
    resolver: Arc<StaticAppResolver>,
    config: Configuration,
    client: NotifyClient,
    account: AccountId,
    account_signing_key: AccountSigningKey,
    // Kept alive for the duration of the test
    _keys_server: MockServer,
}

#[async_trait]
impl AsyncTestContext for NotifyClientContext {
    async fn setup() -> Self {
        let keys_server = MockServer::start().await;
        for verb in ["POST", "DELETE"] {
            Mock::given(method(verb))
                .and(path("/identity"))
                .respond_with(ResponseTemplate::new(200))
                .mount(&keys_server)
                .await;
        }

        let relay = LoopbackRelay::new();
        let service = MockNotifyService::start(&relay, NOTIFY_SERVER_DOMAIN).await;
        let resolver = Arc::new(StaticAppResolver::new());
        resolver.insert(service.descriptor());
        resolver.insert(service.add_app(APP_DOMAIN, &["alerts", "promotions"]).await);

        let config = Configuration {
            keyserver_url: keys_server.uri().parse::<Url>().unwrap(),
            notify_server_domain: NOTIFY_SERVER_DOMAIN.to_owned(),
            request_timeout_secs: 1,
            storage_path: None,
            log_level: "WARN,notify_client=DEBUG".to_owned(),
            app_resolver_scheme: "http".to_owned(),
        };
        // Every test installs it, only the first one wins
        let _ = log::init(&config.log_level);
        let client = NotifyClient::new(
            &config,
            Arc::new(relay.connect()),
            Arc::new(MemoryBackend::new()),
            resolver.clone(),
        )
        .await
        .unwrap();
        let (account_signing_key, account) = generate_account();

        Self {
            relay,
            service,
            resolver,
            config,
            client,
            account,
            account_signing_key,
            _keys_server: keys_server,
        }
    }
}

impl NotifyClientContext {
    /// Another device on the same relay.
    async fn connect(&self, backend: Arc<dyn StorageBackend>) -> NotifyClient {
        NotifyClient::new(
            &self.config,
            Arc::new(self.relay.connect()),
            backend,
            self.resolver.clone(),
        )
        .await
        .unwrap()
    }

    async fn register(&self, client: &NotifyClient) -> String {
        client
            .register(&self.account, WALLET_DOMAIN, |message| {
                SigningResult::Signed(sign_siwe_message(message, &self.account_signing_key))
            })
            .await
            .unwrap()
    }

    async fn subscribe(&self) -> NotifySubscription {
        self.register(&self.client).await;
        self.client.subscribe(APP_DOMAIN, &self.account).await.unwrap()
    }
}

/// Relays everything except unsubscribe notices, which either never complete
/// or are rejected.
struct BlockedDeleteNotices {
    inner: LoopbackConnection,
    hang: bool,
}

#[async_trait]
impl Transport for BlockedDeleteNotices {
    async fn publish(
        &self,
        topic: Topic,
        message: Arc<str>,
        tag: u32,
        ttl: Duration,
    ) -> Result<(), TransportError> {
        if tag == NOTIFY_DELETE_TAG {
            if self.hang {
                return future::pending().await;
            }
            return Err(TransportError::Rejected("notice blocked".to_owned()));
        }
        self.inner.publish(topic, message, tag, ttl).await
    }

    async fn subscribe(
        &self,
        topic: Topic,
    ) -> Result<BoxStream<'static, InboundMessage>, TransportError> {
        self.inner.subscribe(topic).await
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        self.inner.unsubscribe(topic).await
    }
}

async fn delete_with_blocked_notice(ctx: &NotifyClientContext, hang: bool) {
    let client = NotifyClient::new(
        &ctx.config,
        Arc::new(BlockedDeleteNotices {
            inner: ctx.relay.connect(),
            hang,
        }),
        Arc::new(MemoryBackend::new()),
        ctx.resolver.clone(),
    )
    .await
    .unwrap();
    ctx.register(&client).await;
    let subscription = client.subscribe(APP_DOMAIN, &ctx.account).await.unwrap();
    ctx.service
        .notify(APP_DOMAIN, &ctx.account, generate_notification("alerts"))
        .await
        .unwrap();
    wait_until(|| client.repository().get_messages(&subscription.topic).len() == 1).await;

    // Well under the publish retry interval
    timeout(Duration::from_millis(500), client.delete(&subscription.topic))
        .await
        .expect("delete waited for the notice")
        .unwrap();
    assert!(client.repository().get_subscription(&subscription.topic).is_none());
    assert!(client.repository().get_messages(&subscription.topic).is_empty());
    assert_eq!(
        client.lifecycle_state(&subscription.topic.to_string()),
        Some(LifecycleState::Removed)
    );
    // The notice never arrived
    assert_eq!(ctx.service.subscriptions(&ctx.account).len(), 1);
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

fn scope(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|id| (*id).to_owned()).collect()
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn register_subscribe_update_delete(ctx: &NotifyClientContext) {
    let did_key = ctx.register(&ctx.client).await;
    assert!(did_key.starts_with("did:key:"));
    assert!(ctx.client.is_registered(&ctx.account));
    assert_eq!(ctx.client.current_account().unwrap(), ctx.account);
    assert_eq!(
        ctx.client.lifecycle_state(ctx.account.as_ref()),
        Some(LifecycleState::Registered)
    );
    let mut snapshots = ctx.client.repository().subscriptions_publisher();

    let subscription = ctx.client.subscribe(APP_DOMAIN, &ctx.account).await.unwrap();
    let snapshot = timeout(WAIT, async {
        loop {
            let snapshot = snapshots.next().await.unwrap();
            if !snapshot.is_empty() {
                break snapshot;
            }
        }
    })
    .await
    .expect("subscription was not published");
    assert_eq!(snapshot, vec![subscription.clone()]);
    assert_eq!(subscription.metadata.url, format!("https://{APP_DOMAIN}"));
    assert_eq!(subscription.enabled_scope(), scope(&["alerts", "promotions"]));
    assert_eq!(
        ctx.client.repository().get_subscription(&subscription.topic),
        Some(subscription.clone())
    );
    assert_eq!(ctx.service.subscriptions(&ctx.account).len(), 1);
    assert_eq!(
        ctx.client.lifecycle_state(&subscription.topic.to_string()),
        Some(LifecycleState::Active)
    );
    assert_eq!(
        ctx.client
            .lifecycle_state(&format!("{}/{APP_DOMAIN}", ctx.account)),
        None
    );

    let updated = ctx
        .client
        .update(&subscription.topic, scope(&["promotions"]))
        .await
        .unwrap();
    assert_eq!(updated.enabled_scope(), scope(&["promotions"]));
    assert_eq!(
        ctx.service.subscriptions(&ctx.account)[0].scope,
        scope(&["promotions"])
    );
    assert_eq!(
        ctx.client
            .repository()
            .get_subscription(&subscription.topic)
            .unwrap()
            .enabled_scope(),
        scope(&["promotions"])
    );

    ctx.client.delete(&subscription.topic).await.unwrap();
    assert!(ctx.client.repository().get_subscription(&subscription.topic).is_none());
    assert_eq!(
        ctx.client.lifecycle_state(&subscription.topic.to_string()),
        Some(LifecycleState::Removed)
    );
    wait_until(|| ctx.service.subscriptions(&ctx.account).is_empty()).await;
    timeout(WAIT, async {
        while !snapshots.next().await.unwrap().is_empty() {}
    })
    .await
    .expect("deletion was not published");
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn register_survives_unresponsive_notify_service(ctx: &NotifyClientContext) {
    ctx.service.set_responsive(false);
    let did_key = ctx.register(&ctx.client).await;
    assert!(did_key.starts_with("did:key:"));
    assert!(ctx.client.is_registered(&ctx.account));
    assert_eq!(
        ctx.client.lifecycle_state(ctx.account.as_ref()),
        Some(LifecycleState::Registered)
    );

    ctx.service.set_responsive(true);
    assert!(ctx
        .client
        .watch_subscriptions(&ctx.account)
        .await
        .unwrap()
        .is_empty());
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn register_twice_reuses_identity(ctx: &NotifyClientContext) {
    let first = ctx.register(&ctx.client).await;
    let second = ctx
        .client
        .register(&ctx.account, WALLET_DOMAIN, |_| {
            panic!("a registered account must not be asked to sign again")
        })
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn rejected_signature_registers_nothing(ctx: &NotifyClientContext) {
    let result = ctx
        .client
        .register(&ctx.account, WALLET_DOMAIN, |_| SigningResult::Rejected)
        .await;
    assert!(matches!(result, Err(NotifyClientError::SignatureRejected)));
    assert!(!ctx.client.is_registered(&ctx.account));
    assert_eq!(ctx.client.lifecycle_state(ctx.account.as_ref()), None);
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn subscribe_requires_registration(ctx: &NotifyClientContext) {
    let result = ctx.client.subscribe(APP_DOMAIN, &ctx.account).await;
    assert!(matches!(result, Err(NotifyClientError::NotRegistered(_))));
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn subscribe_timeout_leaves_store_untouched(ctx: &NotifyClientContext) {
    ctx.register(&ctx.client).await;
    ctx.service.set_responsive(false);

    let result = ctx.client.subscribe(APP_DOMAIN, &ctx.account).await;
    assert!(matches!(result, Err(NotifyClientError::Timeout { .. })));
    assert!(ctx.client.repository().get_subscriptions(&ctx.account).is_empty());
    assert_eq!(
        ctx.client
            .lifecycle_state(&format!("{}/{APP_DOMAIN}", ctx.account)),
        None
    );

    // The attempt is over, so a retry is allowed once the service is back
    ctx.service.set_responsive(true);
    ctx.client.subscribe(APP_DOMAIN, &ctx.account).await.unwrap();
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn concurrent_subscribe_is_rejected(ctx: &NotifyClientContext) {
    ctx.register(&ctx.client).await;
    ctx.service.set_responsive(false);

    let (first, second) = tokio::join!(
        ctx.client.subscribe(APP_DOMAIN, &ctx.account),
        ctx.client.subscribe(APP_DOMAIN, &ctx.account),
    );
    assert!(matches!(first, Err(NotifyClientError::Timeout { .. })));
    assert!(matches!(
        second,
        Err(NotifyClientError::OperationInProgress(_))
    ));
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn update_timeout_leaves_store_untouched(ctx: &NotifyClientContext) {
    let subscription = ctx.subscribe().await;
    ctx.service.set_responsive(false);

    let result = ctx
        .client
        .update(&subscription.topic, scope(&["promotions"]))
        .await;
    assert!(matches!(result, Err(NotifyClientError::Timeout { .. })));
    assert_eq!(
        ctx.client.repository().get_subscription(&subscription.topic),
        Some(subscription.clone())
    );
    assert_eq!(
        ctx.client.lifecycle_state(&subscription.topic.to_string()),
        Some(LifecycleState::Active)
    );
    assert_eq!(
        ctx.service.subscriptions(&ctx.account)[0].scope,
        scope(&["alerts", "promotions"])
    );

    ctx.service.set_responsive(true);
    let updated = ctx
        .client
        .update(&subscription.topic, scope(&["promotions"]))
        .await
        .unwrap();
    assert_eq!(updated.enabled_scope(), scope(&["promotions"]));
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn delete_does_not_wait_for_a_hanging_notice(ctx: &NotifyClientContext) {
    delete_with_blocked_notice(ctx, true).await;
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn delete_cleans_up_when_the_notice_is_rejected(ctx: &NotifyClientContext) {
    delete_with_blocked_notice(ctx, false).await;
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn update_unknown_topic(ctx: &NotifyClientContext) {
    let topic = Topic::generate();
    let result = ctx.client.update(&topic, scope(&["alerts"])).await;
    assert!(matches!(result, Err(NotifyClientError::SubscriptionNotFound(_))));

    let result = ctx.client.delete(&topic).await;
    assert!(matches!(result, Err(NotifyClientError::SubscriptionNotFound(_))));
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn messages_are_stored_once_and_acknowledged(ctx: &NotifyClientContext) {
    let subscription = ctx.subscribe().await;
    let notification = generate_notification("alerts");

    let topic = ctx
        .service
        .notify(APP_DOMAIN, &ctx.account, notification.clone())
        .await
        .unwrap();
    assert_eq!(topic, subscription.topic);
    wait_until(|| ctx.service.acknowledged_messages() == 1).await;

    let messages = ctx.client.repository().get_messages(&topic);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, notification.id.to_string());
    assert_eq!(messages[0].message.title, notification.title);
    assert_eq!(messages[0].message.r#type, "alerts");

    // Redelivery is acknowledged again but stored once
    ctx.service
        .notify(APP_DOMAIN, &ctx.account, notification)
        .await
        .unwrap();
    wait_until(|| ctx.service.acknowledged_messages() == 2).await;
    assert_eq!(ctx.client.repository().get_messages(&topic).len(), 1);
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn invalid_messages_are_dropped(ctx: &NotifyClientContext) {
    let subscription = ctx.subscribe().await;
    ctx.client
        .update(&subscription.topic, scope(&["promotions"]))
        .await
        .unwrap();

    // Not an envelope at all
    ctx.service
        .publish_raw(&subscription.topic, "garbage", NOTIFY_MESSAGE_TAG)
        .await;
    // A type the account opted out of
    ctx.service
        .notify(APP_DOMAIN, &ctx.account, generate_notification("alerts"))
        .await
        .unwrap();
    // Signed by some other app
    ctx.service.add_app("spoof.example", &["promotions"]).await;
    let spoofed = sign_message(
        Arc::new(generate_notification("promotions")),
        &ctx.account,
        &ctx.service.signing_details("spoof.example").unwrap(),
    )
    .unwrap();
    ctx.service
        .publish_message_auth(&subscription.topic, &subscription.sym_key, spoofed)
        .await;

    let accepted = generate_notification("promotions");
    ctx.service
        .notify(APP_DOMAIN, &ctx.account, accepted.clone())
        .await
        .unwrap();
    wait_until(|| ctx.service.acknowledged_messages() == 1).await;
    sleep(Duration::from_millis(100)).await;

    let messages = ctx.client.repository().get_messages(&subscription.topic);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, accepted.id.to_string());
    assert_eq!(ctx.service.acknowledged_messages(), 1);
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn other_devices_follow_subscription_changes(ctx: &NotifyClientContext) {
    ctx.register(&ctx.client).await;
    let other = ctx.connect(Arc::new(MemoryBackend::new())).await;
    ctx.register(&other).await;
    assert!(other.repository().get_subscriptions(&ctx.account).is_empty());

    let subscription = ctx.client.subscribe(APP_DOMAIN, &ctx.account).await.unwrap();
    wait_until(|| other.repository().get_subscription(&subscription.topic).is_some()).await;
    let mirrored = other.repository().get_subscription(&subscription.topic).unwrap();
    assert_eq!(mirrored.sym_key, subscription.sym_key);
    assert_eq!(mirrored.enabled_scope(), subscription.enabled_scope());

    ctx.client
        .update(&subscription.topic, scope(&["alerts"]))
        .await
        .unwrap();
    wait_until(|| {
        other
            .repository()
            .get_subscription(&subscription.topic)
            .is_some_and(|s| s.enabled_scope() == scope(&["alerts"]))
    })
    .await;

    ctx.client.delete(&subscription.topic).await.unwrap();
    wait_until(|| other.repository().get_subscriptions(&ctx.account).is_empty()).await;
    assert_eq!(
        other.lifecycle_state(&subscription.topic.to_string()),
        Some(LifecycleState::Removed)
    );
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn registering_on_a_new_device_fetches_subscriptions(ctx: &NotifyClientContext) {
    let subscription = ctx.subscribe().await;

    let other = ctx.connect(Arc::new(MemoryBackend::new())).await;
    ctx.register(&other).await;
    let fetched = other.repository().get_subscriptions(&ctx.account);
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].topic, subscription.topic);
    assert_eq!(fetched[0].metadata, subscription.metadata);
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn restart_resumes_subscriptions(ctx: &NotifyClientContext) {
    let dir = tempfile::tempdir().unwrap();
    let backend = || -> Arc<dyn StorageBackend> { Arc::new(FileBackend::new(dir.path()).unwrap()) };

    let client = ctx.connect(backend()).await;
    ctx.register(&client).await;
    let subscription = client.subscribe(APP_DOMAIN, &ctx.account).await.unwrap();
    drop(client);
    // Only the notify service is left on the topic
    wait_until(|| ctx.relay.subscriber_count(&subscription.topic) == 1).await;

    // Sent while no client is connected
    let notification = generate_notification("alerts");
    ctx.service
        .notify(APP_DOMAIN, &ctx.account, notification.clone())
        .await
        .unwrap();

    let client = ctx.connect(backend()).await;
    assert!(client.is_registered(&ctx.account));
    assert_eq!(
        client.repository().get_subscription(&subscription.topic),
        Some(subscription.clone())
    );
    wait_until(|| client.repository().get_messages(&subscription.topic).len() == 1).await;
    assert_eq!(
        client.repository().get_messages(&subscription.topic)[0].id,
        notification.id.to_string()
    );
    wait_until(|| ctx.service.acknowledged_messages() == 1).await;
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn clear_database_forgets_account(ctx: &NotifyClientContext) {
    let subscription = ctx.subscribe().await;
    ctx.service
        .notify(APP_DOMAIN, &ctx.account, generate_notification("alerts"))
        .await
        .unwrap();
    wait_until(|| ctx.service.acknowledged_messages() == 1).await;

    ctx.client.clear_database(&ctx.account).await.unwrap();
    assert!(ctx.client.repository().get_subscriptions(&ctx.account).is_empty());
    assert!(ctx.client.repository().get_messages(&subscription.topic).is_empty());
    assert_eq!(ctx.client.lifecycle_state(&subscription.topic.to_string()), None);
    assert_eq!(ctx.relay.subscriber_count(&subscription.topic), 1);
    // The notify service still has it
    assert_eq!(ctx.service.subscriptions(&ctx.account).len(), 1);
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn unregister_removes_identity(ctx: &NotifyClientContext) {
    let subscription = ctx.subscribe().await;

    ctx.client.unregister(&ctx.account).await.unwrap();
    assert!(!ctx.client.is_registered(&ctx.account));
    assert!(ctx.client.current_account().is_err());
    assert_eq!(ctx.client.lifecycle_state(ctx.account.as_ref()), None);
    assert!(ctx
        .client
        .repository()
        .get_subscription(&subscription.topic)
        .is_some());

    let result = ctx.client.unregister(&ctx.account).await;
    assert!(matches!(result, Err(NotifyClientError::NotRegistered(_))));
}

#[test_context(NotifyClientContext)]
#[tokio::test]
async fn from_config_persists_to_storage_path(ctx: &NotifyClientContext) {
    let subscription = ctx.subscribe().await;
    let dir = tempfile::tempdir().unwrap();
    let config = Configuration {
        storage_path: Some(dir.path().to_owned()),
        ..ctx.config.clone()
    };

    let client = NotifyClient::from_config(&config, Arc::new(ctx.relay.connect()))
        .await
        .unwrap();
    client.repository().set_subscription(subscription.clone()).unwrap();
    drop(client);

    let client = NotifyClient::from_config(&config, Arc::new(ctx.relay.connect()))
        .await
        .unwrap();
    assert_eq!(
        client.repository().get_subscription(&subscription.topic),
        Some(subscription)
    );
    assert!(!client.is_registered(&ctx.account));
}
