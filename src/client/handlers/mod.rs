use {
    super::error::NotifyClientError,
    crate::{
        auth::{from_jwt, GetSharedClaims},
        rpc::{decode_response, ResponseAuth},
        transport::InboundMessage,
        types::{decode_payload, encode_payload, Envelope, EnvelopeType0, EnvelopeType1},
    },
    serde::{de::DeserializeOwned, Serialize},
    std::sync::Arc,
};

pub mod notify_delete;
pub mod notify_message;
pub mod notify_subscribe;
pub mod notify_subscriptions_changed;
pub mod notify_update;
pub mod notify_watch_subscriptions;
pub mod register;

type Result<T> = std::result::Result<T, NotifyClientError>;

fn seal_type0(key: &[u8; 32], payload: impl Serialize) -> Result<Arc<str>> {
    let envelope = Envelope::<EnvelopeType0>::new(key, payload)?;
    Ok(Arc::from(encode_payload(&envelope.to_bytes())))
}

fn seal_type1(key: &[u8; 32], payload: impl Serialize, sender_public_key: [u8; 32]) -> Result<Arc<str>> {
    let envelope = Envelope::<EnvelopeType1>::new(key, payload, sender_public_key)?;
    Ok(Arc::from(encode_payload(&envelope.to_bytes())))
}

/// Opens a type 0 response, then decodes and verifies the `responseAuth` JWT
/// inside.
fn open_response<T: DeserializeOwned + GetSharedClaims>(
    msg: &InboundMessage,
    key: &[u8; 32],
) -> Result<T> {
    let envelope = Envelope::<EnvelopeType0>::from_bytes(&decode_payload(&msg.message)?)?;
    let response = decode_response::<ResponseAuth>(&envelope.decrypt(key)?)?;
    Ok(from_jwt::<T>(&response.result.response_auth)?)
}

fn ensure_issuer(claims: &impl GetSharedClaims, expected: &str) -> Result<()> {
    let iss = &claims.get_shared_claims().iss;
    if iss != expected {
        return Err(NotifyClientError::WrongIssuer(iss.clone()));
    }
    Ok(())
}
