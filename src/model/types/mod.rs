use {
    crate::{
        rpc::{decode_key, DecodeKeyError},
        utils::topic_from_key,
    },
    chrono::{DateTime, Utc},
    rand::{rngs::OsRng, RngCore},
    relay_rpc::domain::{DecodedClientId, Topic},
    serde::{Deserialize, Serialize},
    std::{
        collections::{HashMap, HashSet},
        fmt,
    },
    url::Url,
};

mod account_id;
mod message;

pub use {account_id::*, message::*};

/// 32 bytes of symmetric key material. Serialized as hex, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SymKey([u8; 32]);

impl SymKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_hex(key: &str) -> Result<Self, DecodeKeyError> {
        decode_key(key).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Relay topic for messages encrypted with this key.
    pub fn topic(&self) -> Topic {
        topic_from_key(&self.0)
    }
}

impl From<[u8; 32]> for SymKey {
    fn from(key: [u8; 32]) -> Self {
        Self(key)
    }
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymKey(..)")
    }
}

impl Serialize for SymKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for SymKey {
    fn deserialize<D: serde::Deserializer<'a>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeValue {
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub name: String,
    pub description: String,
    pub icons: Vec<String>,
    pub url: String,
}

impl AppMetadata {
    /// Host part of `url`, which is the domain the app is reachable and
    /// authenticated under.
    pub fn app_domain(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(ToOwned::to_owned))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProtocolOptions {
    pub protocol: String,
    pub data: Option<String>,
}

impl Default for RelayProtocolOptions {
    fn default() -> Self {
        Self {
            protocol: "irn".to_owned(),
            data: None,
        }
    }
}

/// A live binding between an account and a notification-producing app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySubscription {
    /// Unique across all accounts, derived from `sym_key`
    pub topic: Topic,
    pub account: AccountId,
    pub relay: RelayProtocolOptions,
    pub metadata: AppMetadata,
    pub scope: HashMap<String, ScopeValue>,
    pub expiry: DateTime<Utc>,
    pub sym_key: SymKey,
    /// did:key of the app's message signing key
    pub app_authentication_key: String,
}

impl NotifySubscription {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    pub fn enabled_scope(&self) -> HashSet<String> {
        self.scope
            .iter()
            .filter(|(_, value)| value.enabled)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn app_authentication_client_id(&self) -> Option<DecodedClientId> {
        DecodedClientId::try_from_did_key(&self.app_authentication_key).ok()
    }

    /// Returns a copy carrying a new scope and expiry, all identifying fields
    /// kept.
    pub fn with_scope(&self, scope: HashMap<String, ScopeValue>, expiry: DateTime<Utc>) -> Self {
        Self {
            scope,
            expiry,
            ..self.clone()
        }
    }
}
