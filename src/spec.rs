use std::time::Duration;

// https://specs.walletconnect.com/2.0/specs/clients/notify/rpc-methods
pub const NOTIFY_SUBSCRIBE_METHOD: &str = "wc_notifySubscribe";
pub const NOTIFY_MESSAGE_METHOD: &str = "wc_notifyMessage";
pub const NOTIFY_DELETE_METHOD: &str = "wc_notifyDelete";
pub const NOTIFY_UPDATE_METHOD: &str = "wc_notifyUpdate";
pub const NOTIFY_WATCH_SUBSCRIPTIONS_METHOD: &str = "wc_notifyWatchSubscriptions";
pub const NOTIFY_SUBSCRIPTIONS_CHANGED_METHOD: &str = "wc_notifySubscriptionsChanged";

pub const NOTIFY_SUBSCRIBE_TAG: u32 = 4000;
pub const NOTIFY_SUBSCRIBE_RESPONSE_TAG: u32 = 4001;
pub const NOTIFY_MESSAGE_TAG: u32 = 4002;
pub const NOTIFY_MESSAGE_RESPONSE_TAG: u32 = 4003;
pub const NOTIFY_DELETE_TAG: u32 = 4004;
pub const NOTIFY_DELETE_RESPONSE_TAG: u32 = 4005;
pub const NOTIFY_UPDATE_TAG: u32 = 4008;
pub const NOTIFY_UPDATE_RESPONSE_TAG: u32 = 4009;
pub const NOTIFY_WATCH_SUBSCRIPTIONS_TAG: u32 = 4010;
pub const NOTIFY_WATCH_SUBSCRIPTIONS_RESPONSE_TAG: u32 = 4011;
pub const NOTIFY_SUBSCRIPTIONS_CHANGED_TAG: u32 = 4012;
pub const NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_TAG: u32 = 4013;

const T30_DAYS: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const T5_MINUTES: Duration = Duration::from_secs(5 * 60);

pub const NOTIFY_SUBSCRIBE_TTL: Duration = T30_DAYS;
pub const NOTIFY_SUBSCRIBE_RESPONSE_TTL: Duration = T30_DAYS;
pub const NOTIFY_MESSAGE_TTL: Duration = T30_DAYS;
pub const NOTIFY_MESSAGE_RESPONSE_TTL: Duration = T30_DAYS;
pub const NOTIFY_DELETE_TTL: Duration = T30_DAYS;
pub const NOTIFY_DELETE_RESPONSE_TTL: Duration = T30_DAYS;
pub const NOTIFY_UPDATE_TTL: Duration = T30_DAYS;
pub const NOTIFY_UPDATE_RESPONSE_TTL: Duration = T30_DAYS;
pub const NOTIFY_WATCH_SUBSCRIPTIONS_TTL: Duration = T5_MINUTES;
pub const NOTIFY_WATCH_SUBSCRIPTIONS_RESPONSE_TTL: Duration = T5_MINUTES;
pub const NOTIFY_SUBSCRIPTIONS_CHANGED_TTL: Duration = T5_MINUTES;
pub const NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_TTL: Duration = T5_MINUTES;

// JWT `act` claims
pub const NOTIFY_SUBSCRIBE_ACT: &str = "notify_subscription";
pub const NOTIFY_SUBSCRIBE_RESPONSE_ACT: &str = "notify_subscription_response";
pub const NOTIFY_MESSAGE_ACT: &str = "notify_message";
pub const NOTIFY_MESSAGE_RESPONSE_ACT: &str = "notify_message_response";
pub const NOTIFY_DELETE_ACT: &str = "notify_delete";
pub const NOTIFY_DELETE_RESPONSE_ACT: &str = "notify_delete_response";
pub const NOTIFY_UPDATE_ACT: &str = "notify_update";
pub const NOTIFY_UPDATE_RESPONSE_ACT: &str = "notify_update_response";
pub const NOTIFY_WATCH_SUBSCRIPTIONS_ACT: &str = "notify_watch_subscriptions";
pub const NOTIFY_WATCH_SUBSCRIPTIONS_RESPONSE_ACT: &str = "notify_watch_subscriptions_response";
pub const NOTIFY_SUBSCRIPTIONS_CHANGED_ACT: &str = "notify_subscriptions_changed";
pub const NOTIFY_SUBSCRIPTIONS_CHANGED_RESPONSE_ACT: &str =
    "notify_subscriptions_changed_response";

// Keys server
pub const KEYS_SERVER_IDENTITY_ENDPOINT: &str = "/identity";
pub const UNREGISTER_IDENTITY_ACT: &str = "unregister_identity";
pub const UNREGISTER_IDENTITY_TTL: Duration = Duration::from_secs(60 * 60);
