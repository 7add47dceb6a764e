//! Encrypted relay payloads.
//!
//! Type 0: `[0][iv: 12][sealbox]`, sealed with a key both sides already hold.
//! Type 1: `[1][sender public key: 32][iv: 12][sealbox]`, the receiver derives
//! the key from the embedded public key and its own secret.

use {
    base64::Engine,
    chacha20poly1305::{
        aead::{Aead, OsRng},
        AeadCore, ChaCha20Poly1305, KeyInit,
    },
    serde::{de::DeserializeOwned, Serialize},
    sha2::digest::generic_array::GenericArray,
    std::collections::HashSet,
    thiserror::Error,
};

const TYPE_0: u8 = 0;
const TYPE_1: u8 = 1;
const IV_LEN: usize = 12;
const PUBKEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Payload is not base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Envelope is {0} bytes, too short for its type")]
    TooShort(usize),

    #[error("Unexpected envelope type {0}")]
    UnexpectedType(u8),

    #[error("Serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    Decryption,
}

#[derive(Debug)]
pub struct Envelope<T> {
    pub envelope_type: u8,
    pub iv: [u8; IV_LEN],
    pub sealbox: Vec<u8>,
    pub opts: T,
}

#[derive(Debug)]
pub struct EnvelopeType0 {}

#[derive(Debug)]
pub struct EnvelopeType1 {
    pub pubkey: [u8; PUBKEY_LEN],
}

fn seal(encryption_key: &[u8; 32], data: impl Serialize) -> Result<([u8; IV_LEN], Vec<u8>), EnvelopeError> {
    let serialized = serde_json::to_vec(&data)?;
    let iv = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(encryption_key));
    let sealbox = cipher
        .encrypt(&iv, &*serialized)
        .map_err(|_| EnvelopeError::Encryption)?;
    Ok((iv.into(), sealbox))
}

fn split_iv(bytes: &[u8]) -> Result<([u8; IV_LEN], Vec<u8>), EnvelopeError> {
    let iv = bytes
        .get(..IV_LEN)
        .and_then(|iv| iv.try_into().ok())
        .ok_or(EnvelopeError::TooShort(bytes.len()))?;
    Ok((iv, bytes[IV_LEN..].to_vec()))
}

impl<T> Envelope<T> {
    /// Opens the sealbox and deserializes the JSON inside.
    pub fn open<M: DeserializeOwned>(&self, key: &[u8; 32]) -> Result<M, EnvelopeError> {
        Ok(serde_json::from_slice(&self.decrypt(key)?)?)
    }

    pub fn decrypt(&self, key: &[u8; 32]) -> Result<Vec<u8>, EnvelopeError> {
        let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(key));
        cipher
            .decrypt(GenericArray::from_slice(&self.iv), &*self.sealbox)
            .map_err(|_| EnvelopeError::Decryption)
    }
}

impl Envelope<EnvelopeType0> {
    pub fn new(encryption_key: &[u8; 32], data: impl Serialize) -> Result<Self, EnvelopeError> {
        let (iv, sealbox) = seal(encryption_key, data)?;
        Ok(Self {
            envelope_type: TYPE_0,
            opts: EnvelopeType0 {},
            iv,
            sealbox,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut serialized = Vec::with_capacity(1 + IV_LEN + self.sealbox.len());
        serialized.push(self.envelope_type);
        serialized.extend_from_slice(&self.iv);
        serialized.extend_from_slice(&self.sealbox);
        serialized
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        match bytes.first() {
            Some(&TYPE_0) => {}
            Some(&other) => return Err(EnvelopeError::UnexpectedType(other)),
            None => return Err(EnvelopeError::TooShort(0)),
        }
        let (iv, sealbox) = split_iv(&bytes[1..])?;
        Ok(Self {
            envelope_type: TYPE_0,
            iv,
            sealbox,
            opts: EnvelopeType0 {},
        })
    }
}

impl Envelope<EnvelopeType1> {
    pub fn new(
        encryption_key: &[u8; 32],
        data: impl Serialize,
        pubkey: [u8; PUBKEY_LEN],
    ) -> Result<Self, EnvelopeError> {
        let (iv, sealbox) = seal(encryption_key, data)?;
        Ok(Self {
            envelope_type: TYPE_1,
            opts: EnvelopeType1 { pubkey },
            iv,
            sealbox,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut serialized = Vec::with_capacity(1 + PUBKEY_LEN + IV_LEN + self.sealbox.len());
        serialized.push(self.envelope_type);
        serialized.extend_from_slice(&self.opts.pubkey);
        serialized.extend_from_slice(&self.iv);
        serialized.extend_from_slice(&self.sealbox);
        serialized
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        match bytes.first() {
            Some(&TYPE_1) => {}
            Some(&other) => return Err(EnvelopeError::UnexpectedType(other)),
            None => return Err(EnvelopeError::TooShort(0)),
        }
        let pubkey = bytes
            .get(1..1 + PUBKEY_LEN)
            .and_then(|pubkey| pubkey.try_into().ok())
            .ok_or(EnvelopeError::TooShort(bytes.len()))?;
        let (iv, sealbox) = split_iv(&bytes[1 + PUBKEY_LEN..])?;
        Ok(Self {
            envelope_type: TYPE_1,
            opts: EnvelopeType1 { pubkey },
            iv,
            sealbox,
        })
    }

    pub fn pubkey(&self) -> [u8; PUBKEY_LEN] {
        self.opts.pubkey
    }
}

/// Base64 text as carried by the relay.
pub fn encode_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_payload(message: &str) -> Result<Vec<u8>, EnvelopeError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(message)?)
}

/// Scope travels as space separated notification type ids.
pub fn parse_scope(scope: &str) -> HashSet<String> {
    scope
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

pub fn encode_scope<'a>(notification_types: impl IntoIterator<Item = &'a String>) -> String {
    let mut types = notification_types
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>();
    types.sort_unstable();
    types.join(" ")
}

#[cfg(test)]
mod test {
    use {super::*, serde_json::json};

    #[test]
    fn parse_scope_ignores_repeated_spaces() {
        assert_eq!(parse_scope(""), HashSet::new());
        assert_eq!(
            parse_scope("promotions  alerts "),
            HashSet::from(["promotions".to_owned(), "alerts".to_owned()])
        );
    }

    #[test]
    fn encode_scope_is_sorted() {
        let scope = HashSet::from(["promotions".to_owned(), "alerts".to_owned()]);
        assert_eq!(encode_scope(&scope), "alerts promotions");
        assert_eq!(encode_scope(&HashSet::new()), "");
    }

    #[test]
    fn type0_opens_with_the_same_key_only() {
        let key = [3u8; 32];
        let envelope = Envelope::<EnvelopeType0>::new(&key, json!({"hello": "world"})).unwrap();
        let parsed = Envelope::<EnvelopeType0>::from_bytes(&envelope.to_bytes()).unwrap();

        let value: serde_json::Value = parsed.open(&key).unwrap();
        assert_eq!(value, json!({"hello": "world"}));
        assert!(matches!(
            parsed.open::<serde_json::Value>(&[4u8; 32]),
            Err(EnvelopeError::Decryption)
        ));
    }

    #[test]
    fn type1_carries_the_sender_key() {
        let envelope =
            Envelope::<EnvelopeType1>::new(&[5u8; 32], json!(1), [9u8; PUBKEY_LEN]).unwrap();
        let parsed = Envelope::<EnvelopeType1>::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(parsed.pubkey(), [9u8; PUBKEY_LEN]);
    }

    #[test]
    fn truncated_or_mistyped_envelopes_are_rejected() {
        assert!(matches!(
            Envelope::<EnvelopeType0>::from_bytes(&[]),
            Err(EnvelopeError::TooShort(0))
        ));
        assert!(matches!(
            Envelope::<EnvelopeType0>::from_bytes(&[0, 1, 2]),
            Err(EnvelopeError::TooShort(_))
        ));
        assert!(matches!(
            Envelope::<EnvelopeType1>::from_bytes(&[1; 20]),
            Err(EnvelopeError::TooShort(20))
        ));
        assert!(matches!(
            Envelope::<EnvelopeType0>::from_bytes(&[1; 40]),
            Err(EnvelopeError::UnexpectedType(1))
        ));
    }
}
