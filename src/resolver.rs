//! Looks up what a wallet needs to know about an app before subscribing to
//! it: its keys from `did.json` and its notification types from the notify
//! config, both served under the app domain's `.well-known`.

use {
    crate::{
        auth::DidWeb,
        model::types::{AppMetadata, ScopeValue},
    },
    async_trait::async_trait,
    data_encoding::{BASE64URL, BASE64URL_NOPAD},
    parking_lot::RwLock,
    relay_rpc::{auth::ed25519_dalek::VerifyingKey, domain::DecodedClientId},
    reqwest::StatusCode,
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::collections::{HashMap, HashSet},
    thiserror::Error,
    tracing::{debug, instrument},
    x25519_dalek::PublicKey,
};

pub const DID_JSON_ENDPOINT: &str = "/.well-known/did.json";
pub const NOTIFY_CONFIG_ENDPOINT: &str = "/.well-known/wc-notify-config.json";
pub const WC_NOTIFY_SUBSCRIBE_KEY_ID: &str = "#wc-notify-subscribe-key";
pub const WC_NOTIFY_AUTHENTICATION_KEY_ID: &str = "#wc-notify-authentication-key";

const CONTEXT_DID_V1: &str = "https://www.w3.org/ns/did/v1";
const CONTEXT_JWS_V1: &str = "https://w3id.org/security/suites/jws-2020/v1";
const JSON_WEB_KEY_2020: &str = "JsonWebKey2020";
const OKP: &str = "OKP";
const X25519: &str = "X25519";
const ED25519: &str = "Ed25519";

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{0} answered with {1}")]
    Status(String, StatusCode),

    #[error("did.json has no {0} key")]
    MissingKey(&'static str),

    #[error("Key is not base64url: {0}")]
    KeyEncoding(#[from] data_encoding::DecodeError),

    #[error("Key is not 32 bytes")]
    KeyLength,

    #[error("No app known for domain {0}")]
    UnknownApp(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidJson {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: DidWeb,
    pub verification_method: Vec<VerificationMethod>,
    pub key_agreement: Vec<String>,
    pub authentication: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    pub r#type: String,
    pub controller: DidWeb,
    pub public_key_jwk: PublicKeyJwk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
}

impl DidJson {
    pub fn new(domain: &str, key_agreement: &PublicKey, authentication: &VerifyingKey) -> Self {
        let did_id = DidWeb::from_domain(domain);
        let key_agreement_key_id = format!("{did_id}{WC_NOTIFY_SUBSCRIBE_KEY_ID}");
        let authentication_key_id = format!("{did_id}{WC_NOTIFY_AUTHENTICATION_KEY_ID}");
        let method = |id: &str, crv: &str, key: &[u8]| VerificationMethod {
            id: id.to_owned(),
            r#type: JSON_WEB_KEY_2020.to_owned(),
            controller: did_id.clone(),
            public_key_jwk: PublicKeyJwk {
                kty: OKP.to_owned(),
                crv: crv.to_owned(),
                x: BASE64URL.encode(key),
            },
        };

        Self {
            context: vec![CONTEXT_DID_V1.to_owned(), CONTEXT_JWS_V1.to_owned()],
            verification_method: vec![
                method(&key_agreement_key_id, X25519, key_agreement.as_bytes()),
                method(
                    &authentication_key_id,
                    ED25519,
                    authentication.as_bytes(),
                ),
            ],
            key_agreement: vec![key_agreement_key_id],
            authentication: vec![authentication_key_id],
            id: did_id,
        }
    }

    fn key(&self, suffix: &'static str) -> Result<[u8; 32], ResolverError> {
        let method = self
            .verification_method
            .iter()
            .find(|method| method.id.ends_with(suffix))
            .ok_or(ResolverError::MissingKey(suffix))?;
        let x = method.public_key_jwk.x.as_bytes();
        // Padding is optional in practice
        let bytes = BASE64URL.decode(x).or_else(|_| BASE64URL_NOPAD.decode(x))?;
        bytes.try_into().map_err(|_| ResolverError::KeyLength)
    }

    pub fn key_agreement(&self) -> Result<PublicKey, ResolverError> {
        self.key(WC_NOTIFY_SUBSCRIBE_KEY_ID).map(PublicKey::from)
    }

    pub fn authentication(&self) -> Result<DecodedClientId, ResolverError> {
        self.key(WC_NOTIFY_AUTHENTICATION_KEY_ID)
            .map(DecodedClientId)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationType {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icons: Vec<String>,
    pub types: Vec<NotificationType>,
}

/// Everything needed to subscribe to an app.
#[derive(Debug, Clone)]
pub struct AppDescriptor {
    pub domain: String,
    /// X25519 key subscribe requests are encrypted to
    pub key_agreement: PublicKey,
    /// Ed25519 key the app signs its responses and messages with
    pub authentication: DecodedClientId,
    pub metadata: AppMetadata,
    pub types: Vec<NotificationType>,
}

impl AppDescriptor {
    pub fn from_documents(domain: &str, did_json: &DidJson, config: NotifyConfig) -> Result<Self, ResolverError> {
        Ok(Self {
            domain: domain.to_owned(),
            key_agreement: did_json.key_agreement()?,
            authentication: did_json.authentication()?,
            metadata: AppMetadata {
                name: config.name,
                description: config.description,
                icons: config.icons,
                url: format!("https://{domain}"),
            },
            types: config.types,
        })
    }

    pub fn did_web(&self) -> DidWeb {
        DidWeb::from_domain(self.domain.as_str())
    }

    pub fn authentication_did_key(&self) -> String {
        self.authentication.to_did_key()
    }

    /// Scope entries for the notification type ids the notify service
    /// confirmed, described from the app's advertised types.
    pub fn scope_for(&self, confirmed: &HashSet<String>) -> HashMap<String, ScopeValue> {
        confirmed
            .iter()
            .map(|id| {
                let description = self
                    .types
                    .iter()
                    .find(|t| &t.id == id)
                    .map(|t| t.description.clone())
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
}

#[async_trait]
pub trait AppResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<AppDescriptor, ResolverError>;
}

/// Fetches the app's documents over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpAppResolver {
    http: reqwest::Client,
    scheme: String,
}

impl HttpAppResolver {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            scheme: scheme.into(),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, domain: &str, endpoint: &str) -> Result<T, ResolverError> {
        let url = format!("{}://{domain}{endpoint}", self.scheme);
        debug!("Fetching {url}");
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ResolverError::Status(url, status));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl AppResolver for HttpAppResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, domain: &str) -> Result<AppDescriptor, ResolverError> {
        let did_json = self.fetch::<DidJson>(domain, DID_JSON_ENDPOINT).await?;
        let config = self
            .fetch::<NotifyConfig>(domain, NOTIFY_CONFIG_ENDPOINT)
            .await?;
        AppDescriptor::from_documents(domain, &did_json, config)
    }
}

/// Apps known up front, keyed by domain.
#[derive(Debug, Default)]
pub struct StaticAppResolver {
    apps: RwLock<HashMap<String, AppDescriptor>>,
}

impl StaticAppResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, app: AppDescriptor) {
        self.apps.write().insert(app.domain.clone(), app);
    }
}

#[async_trait]
impl AppResolver for StaticAppResolver {
    async fn resolve(&self, domain: &str) -> Result<AppDescriptor, ResolverError> {
        self.apps
            .read()
            .get(domain)
            .cloned()
            .ok_or_else(|| ResolverError::UnknownApp(domain.to_owned()))
    }
}
