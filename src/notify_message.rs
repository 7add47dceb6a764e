use {
    crate::{
        auth::{sign_jwt, DidWeb, JwtError, SharedClaims},
        model::types::{AccountId, NotifyMessage},
        spec::{NOTIFY_MESSAGE_ACT, NOTIFY_MESSAGE_TTL},
        utils::{add_ttl, get_client_id, unix_timestamp},
    },
    chrono::{DateTime, Utc},
    relay_rpc::auth::ed25519_dalek::SigningKey,
    serde::{Deserialize, Serialize},
    std::sync::Arc,
    uuid::Uuid,
};

/// Claims of a `wc_notifyMessage` JWT, signed by the app's authentication key.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NotifyMessageClaims {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// did:pkh of the receiving account
    pub sub: String,
    pub app: DidWeb,
    pub msg: Arc<JwtNotification>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct JwtNotification {
    pub id: Uuid,
    /// Milliseconds since epoch
    pub sent_at: i64,
    pub r#type: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub url: String,
}

impl JwtNotification {
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.sent_at)
    }

    pub fn to_message(&self) -> NotifyMessage {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_owned());
        NotifyMessage {
            title: self.title.clone(),
            body: self.body.clone(),
            icon: non_empty(&self.icon),
            url: non_empty(&self.url),
            r#type: self.r#type.clone(),
        }
    }
}

pub struct AppSigningDetails {
    pub private_key: SigningKey,
    pub app: DidWeb,
}

pub fn sign_message(
    msg: Arc<JwtNotification>,
    account: &AccountId,
    AppSigningDetails { private_key, app }: &AppSigningDetails,
) -> Result<String, JwtError> {
    let now = Utc::now();
    let message = NotifyMessageClaims {
        shared_claims: SharedClaims {
            iat: unix_timestamp(now),
            exp: unix_timestamp(add_ttl(now, NOTIFY_MESSAGE_TTL)),
            iss: get_client_id(&private_key.verifying_key()).to_did_key(),
            // any client of the account may receive this message
            aud: account.to_did_pkh(),
            act: NOTIFY_MESSAGE_ACT.to_owned(),
            mjv: "1".to_owned(),
        },
        sub: account.to_did_pkh(),
        app: app.clone(),
        msg,
    };

    sign_jwt(message, private_key)
}
