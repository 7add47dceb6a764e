use {
    chrono::Utc,
    once_cell::sync::Lazy,
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    sha2::Sha256,
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thiserror::Error,
};

pub type MessageId = u64;

pub static JSON_RPC_VERSION: Lazy<Arc<str>> = Lazy::new(|| Arc::from("2.0"));

#[derive(Debug, Error)]
pub enum DecodeKeyError {
    #[error("Key is not hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Key is shorter than 32 bytes")]
    TooShort,
}

pub fn decode_key(key: &str) -> Result<[u8; 32], DecodeKeyError> {
    let bytes = hex::decode(key)?;
    bytes
        .get(..32)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeKeyError::TooShort)
}

/// X25519 agreement followed by HKDF-SHA256 with empty salt and info.
pub fn derive_key(
    public_key: &x25519_dalek::PublicKey,
    private_key: &x25519_dalek::StaticSecret,
) -> Result<[u8; 32], hkdf::InvalidLength> {
    let shared_key = private_key.diffie_hellman(public_key);

    let derived_key = hkdf::Hkdf::<Sha256>::new(None, shared_key.as_bytes());

    let mut expanded_key = [0u8; 32];
    derived_key.expand(b"", &mut expanded_key)?;
    Ok(expanded_key)
}

// Millisecond timestamp shifted left to leave room for a per-process counter,
// so ids stay unique and roughly ordered across restarts.
static MESSAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn next_message_id() -> MessageId {
    let millis = Utc::now().timestamp_millis().unsigned_abs();
    let counter = MESSAGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xff;
    (millis << 8) | counter
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JsonRpcRequest<T> {
    pub id: MessageId,
    pub jsonrpc: Arc<str>,
    pub method: String,
    pub params: T,
}

impl<T> JsonRpcRequest<T> {
    pub fn new(method: &str, params: T) -> Self {
        Self {
            id: next_message_id(),
            jsonrpc: JSON_RPC_VERSION.clone(),
            method: method.to_owned(),
            params,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JsonRpcResponse<T> {
    pub id: MessageId,
    pub jsonrpc: Arc<str>,
    pub result: T,
}

impl<T> JsonRpcResponse<T> {
    pub fn new(id: MessageId, result: T) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            result,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JsonRpcResponseError {
    pub id: MessageId,
    pub jsonrpc: Arc<str>,
    pub error: JsonRpcError,
}

impl JsonRpcResponseError {
    pub fn new(id: MessageId, error: JsonRpcError) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            error,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResponseDecodeError {
    #[error("Response is not valid JSON-RPC: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Peer answered with an error: {0}")]
    Rpc(JsonRpcError),
}

/// Parses either a result or an error response.
pub fn decode_response<T: DeserializeOwned>(
    bytes: &[u8],
) -> Result<JsonRpcResponse<T>, ResponseDecodeError> {
    let value = serde_json::from_slice::<serde_json::Value>(bytes)?;
    if value.get("error").is_some() {
        let response = serde_json::from_value::<JsonRpcResponseError>(value)?;
        return Err(ResponseDecodeError::Rpc(response.error));
    }
    Ok(serde_json::from_value(value)?)
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ResponseAuth {
    pub response_auth: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NotifyWatchSubscriptions {
    pub watch_subscriptions_auth: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NotifySubscriptionsChanged {
    pub subscriptions_changed_auth: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NotifySubscribe {
    pub subscription_auth: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NotifyUpdate {
    pub update_auth: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NotifyDelete {
    pub delete_auth: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyMessageAuth {
    pub message_auth: String,
}

#[cfg(test)]
mod tests {
    use {super::*, x25519_dalek::{PublicKey, StaticSecret}};

    #[test]
    fn both_sides_derive_the_same_key() {
        let a = StaticSecret::from([1u8; 32]);
        let b = StaticSecret::from([2u8; 32]);
        let ab = derive_key(&PublicKey::from(&b), &a).unwrap();
        let ba = derive_key(&PublicKey::from(&a), &b).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn decode_key_lengths() {
        assert_eq!(decode_key(&"ab".repeat(32)).unwrap(), [0xab; 32]);
        assert!(matches!(
            decode_key(&"ab".repeat(31)),
            Err(DecodeKeyError::TooShort)
        ));
        assert!(matches!(decode_key("zz"), Err(DecodeKeyError::Hex(_))));
    }

    #[test]
    fn message_ids_are_unique() {
        let ids = (0..100).map(|_| next_message_id()).collect::<Vec<_>>();
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
    }

    #[test]
    fn error_responses_are_surfaced() {
        let error = serde_json::to_vec(&JsonRpcResponseError::new(
            1,
            JsonRpcError {
                code: -32000,
                message: "nope".to_owned(),
            },
        ))
        .unwrap();
        assert!(matches!(
            decode_response::<ResponseAuth>(&error),
            Err(ResponseDecodeError::Rpc(JsonRpcError { code: -32000, .. }))
        ));

        let ok = serde_json::to_vec(&JsonRpcResponse::new(
            2,
            ResponseAuth {
                response_auth: "jwt".to_owned(),
            },
        ))
        .unwrap();
        let response = decode_response::<ResponseAuth>(&ok).unwrap();
        assert_eq!(response.id, 2);
        assert_eq!(response.result.response_auth, "jwt");
    }
}
