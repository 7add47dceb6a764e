use {
    crate::{
        model::types::AccountId,
        utils::{add_ttl, get_client_id, unix_timestamp},
    },
    base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine},
    chrono::Utc,
    relay_rpc::{
        auth::ed25519_dalek::{Signer, SigningKey},
        domain::DecodedClientId,
    },
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::{collections::HashSet, sync::Arc, time::Duration},
    thiserror::Error,
};

pub const JWT_HEADER_TYP: &str = "JWT";
pub const JWT_HEADER_ALG: &str = "EdDSA";
/// Clock skew tolerated on `iat` and `exp`, in seconds.
pub const JWT_LEEWAY: u64 = 30;

const DID_WEB_PREFIX: &str = "did:web:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedClaims {
    /// iat - timestamp when jwt was issued
    pub iat: u64,
    /// exp - timestamp when jwt must expire
    pub exp: u64,
    /// iss - did:key of the signing key
    pub iss: String,
    /// aud - did:key of the intended recipient
    #[serde(default)]
    pub aud: String,
    /// act - description of action intent
    pub act: String,
    /// mjv - major version of the API level being used
    #[serde(default = "default_mjv")]
    pub mjv: String,
}

fn default_mjv() -> String {
    "0".to_owned()
}

impl SharedClaims {
    pub fn new(
        signer: &SigningKey,
        aud: &DecodedClientId,
        act: &str,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            iat: unix_timestamp(now),
            exp: unix_timestamp(add_ttl(now, ttl)),
            iss: get_client_id(&signer.verifying_key()).to_did_key(),
            aud: aud.to_did_key(),
            act: act.to_owned(),
            mjv: "1".to_owned(),
        }
    }
}

pub trait GetSharedClaims {
    fn get_shared_claims(&self) -> &SharedClaims;
}

macro_rules! impl_shared_claims {
    ($($claims:ty),* $(,)?) => {
        $(
            impl GetSharedClaims for $claims {
                fn get_shared_claims(&self) -> &SharedClaims {
                    &self.shared_claims
                }
            }
        )*
    };
}

/// `did:web` identifier of an app domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DidWeb {
    domain: Arc<str>,
}

impl DidWeb {
    pub fn from_domain(domain: impl Into<Arc<str>>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    pub fn from(did_web: &str) -> Result<Self, DidWebError> {
        did_web
            .strip_prefix(DID_WEB_PREFIX)
            .filter(|domain| !domain.is_empty())
            .map(Self::from_domain)
            .ok_or(DidWebError::Format)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl std::fmt::Display for DidWeb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{DID_WEB_PREFIX}{}", self.domain)
    }
}

impl Serialize for DidWeb {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'a> Deserialize<'a> for DidWeb {
    fn deserialize<D: serde::Deserializer<'a>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum DidWebError {
    #[error("Not a did:web identifier")]
    Format,
}

/// A subscription as described by the notify service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyServerSubscription {
    /// App domain that the subscription refers to
    pub app_domain: String,
    /// did:key of the app's authentication key
    pub app_authentication_key: String,
    /// Symetric key used for notify topic. sha256 to get notify topic to manage
    /// the subscription and call wc_notifySubscriptionUpdate and
    /// wc_notifySubscriptionDelete
    pub sym_key: String,
    /// CAIP-10 account
    pub account: AccountId,
    /// Array of notification types enabled for this subscription
    pub scope: HashSet<String>,
    /// Unix timestamp of expiration
    pub expiry: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSubscriptionsRequestAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// ksu - key server for identity key verification
    pub ksu: String,
    /// did:pkh
    pub sub: String,
    /// did:web of app domain to watch, or `null` for all domains
    pub app: Option<DidWeb>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSubscriptionsResponseAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// did:pkh
    pub sub: String,
    /// array of Notify Server Subscriptions
    pub sbs: Vec<NotifyServerSubscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSubscriptionsChangedRequestAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// did:pkh
    pub sub: String,
    /// array of Notify Server Subscriptions
    pub sbs: Vec<NotifyServerSubscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSubscriptionsChangedResponseAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// ksu - key server for identity key verification
    pub ksu: String,
    /// did:pkh
    pub sub: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequestAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// ksu - key server for identity key verification
    pub ksu: String,
    /// did:pkh
    pub sub: String,
    /// did:web of app domain
    pub app: DidWeb,
    /// space-delimited scope of notification types authorized by the user
    pub scp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResponseAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// did:pkh
    pub sub: String,
    /// did:web of app domain
    pub app: DidWeb,
    pub sbs: Vec<NotifyServerSubscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionUpdateRequestAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// ksu - key server for identity key verification
    pub ksu: String,
    /// did:pkh
    pub sub: String,
    /// did:web of app domain
    pub app: DidWeb,
    /// space-delimited scope of notification types authorized by the user
    pub scp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionUpdateResponseAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// did:pkh
    pub sub: String,
    /// did:web of app domain
    pub app: DidWeb,
    pub sbs: Vec<NotifyServerSubscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDeleteRequestAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// ksu - key server for identity key verification
    pub ksu: String,
    /// did:pkh
    pub sub: String,
    /// did:web of app domain
    pub app: DidWeb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDeleteResponseAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// did:pkh
    pub sub: String,
    /// did:web of app domain
    pub app: DidWeb,
    pub sbs: Vec<NotifyServerSubscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponseAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// ksu - key server for identity key verification
    pub ksu: String,
    /// did:pkh
    pub sub: String,
    /// did:web of app domain
    pub app: DidWeb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterIdentityRequestAuth {
    #[serde(flatten)]
    pub shared_claims: SharedClaims,
    /// did:pkh
    pub pkh: String,
}

impl_shared_claims!(
    WatchSubscriptionsRequestAuth,
    WatchSubscriptionsResponseAuth,
    WatchSubscriptionsChangedRequestAuth,
    WatchSubscriptionsChangedResponseAuth,
    SubscriptionRequestAuth,
    SubscriptionResponseAuth,
    SubscriptionUpdateRequestAuth,
    SubscriptionUpdateResponseAuth,
    SubscriptionDeleteRequestAuth,
    SubscriptionDeleteResponseAuth,
    MessageResponseAuth,
    UnregisterIdentityRequestAuth,
    crate::notify_message::NotifyMessageClaims,
);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JwtHeader<'a> {
    typ: &'a str,
    alg: &'a str,
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Invalid format")]
    Format,

    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid algorithm")]
    Algorithm,

    #[error("Expired")]
    Expired,

    #[error("Not yet valid")]
    NotYetValid,

    #[error("iss is not a did:key")]
    IssNotDidKey,

    #[error("Invalid signature")]
    InvalidSignature,
}

pub fn sign_jwt<T: Serialize>(message: T, private_key: &SigningKey) -> Result<String, JwtError> {
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&JwtHeader {
        typ: JWT_HEADER_TYP,
        alg: JWT_HEADER_ALG,
    })?);
    let claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&message)?);
    let message = format!("{header}.{claims}");
    let signature = URL_SAFE_NO_PAD.encode(private_key.sign(message.as_bytes()).to_bytes());
    Ok(format!("{message}.{signature}"))
}

/// Decodes `jwt`, checks its validity window and verifies the signature
/// against the did:key in `iss`.
pub fn from_jwt<T: DeserializeOwned + GetSharedClaims>(jwt: &str) -> Result<T, JwtError> {
    let mut parts = jwt.splitn(3, '.');
    let (Some(header), Some(claims), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(JwtError::Format);
    };

    let header = URL_SAFE_NO_PAD.decode(header)?;
    let header = serde_json::from_slice::<JwtHeader>(&header)?;
    if header.alg != JWT_HEADER_ALG {
        return Err(JwtError::Algorithm);
    }

    let claims = URL_SAFE_NO_PAD.decode(claims)?;
    let claims = serde_json::from_slice::<T>(&claims)?;

    let now = unix_timestamp(Utc::now());
    let shared_claims = claims.get_shared_claims();
    if shared_claims.exp + JWT_LEEWAY < now {
        return Err(JwtError::Expired);
    }
    if shared_claims.iat > now + JWT_LEEWAY {
        return Err(JwtError::NotYetValid);
    }

    let mut parts = jwt.rsplitn(2, '.');
    let (Some(signature), Some(message)) = (parts.next(), parts.next()) else {
        return Err(JwtError::Format);
    };

    let client_id = DecodedClientId::try_from_did_key(&shared_claims.iss)
        .map_err(|_| JwtError::IssNotDidKey)?;
    let key = jsonwebtoken::DecodingKey::from_ed_der(&client_id.0);

    match jsonwebtoken::crypto::verify(
        signature,
        message.as_bytes(),
        &key,
        jsonwebtoken::Algorithm::EdDSA,
    ) {
        Ok(true) => Ok(claims),
        Ok(false) | Err(_) => Err(JwtError::InvalidSignature),
    }
}
