use {
    crate::{
        model::types::AccountId,
        rpc::{decode_key, DecodeKeyError},
        utils::get_client_id,
    },
    rand::{rngs::OsRng, RngCore},
    relay_rpc::auth::ed25519_dalek::SigningKey,
    serde::{Deserialize, Serialize},
    std::fmt,
    x25519_dalek::{PublicKey, StaticSecret},
};

pub const IDENTITIES_NAMESPACE: &str = "identities";

/// The keys a registered account acts with on this device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub account: AccountId,
    /// Ed25519 seed of the identity key, hex
    identity_key: String,
    /// X25519 secret the watch topic is derived from, hex
    watch_secret: String,
}

impl fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

fn random_hex() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn identity_account(record: &IdentityRecord) -> &str {
    record.account.as_ref()
}

impl IdentityRecord {
    pub fn generate(account: AccountId) -> Self {
        Self {
            account,
            identity_key: random_hex(),
            watch_secret: random_hex(),
        }
    }

    pub fn signing_key(&self) -> Result<SigningKey, DecodeKeyError> {
        Ok(SigningKey::from_bytes(&decode_key(&self.identity_key)?))
    }

    pub fn did_key(&self) -> Result<String, DecodeKeyError> {
        Ok(get_client_id(&self.signing_key()?.verifying_key()).to_did_key())
    }

    pub fn watch_secret(&self) -> Result<StaticSecret, DecodeKeyError> {
        Ok(StaticSecret::from(decode_key(&self.watch_secret)?))
    }

    pub fn watch_public_key(&self) -> Result<PublicKey, DecodeKeyError> {
        Ok(PublicKey::from(&self.watch_secret()?))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::test_utils::generate_account};

    #[test]
    fn keys_are_stable_across_serialization() {
        let (_, account) = generate_account();
        let identity = IdentityRecord::generate(account);
        let bytes = rmp_serde::to_vec_named(&identity).unwrap();
        let restored = rmp_serde::from_slice::<IdentityRecord>(&bytes).unwrap();

        assert_eq!(restored, identity);
        assert_eq!(restored.did_key().unwrap(), identity.did_key().unwrap());
        assert_eq!(
            restored.watch_public_key().unwrap(),
            identity.watch_public_key().unwrap()
        );
        assert!(identity.did_key().unwrap().starts_with("did:key:z"));
    }

    #[test]
    fn debug_hides_secrets() {
        let (_, account) = generate_account();
        let identity = IdentityRecord::generate(account);
        let printed = format!("{identity:?}");
        assert!(!printed.contains(&identity.identity_key));
        assert!(!printed.contains(&identity.watch_secret));
    }
}
