use {
    self::eip155::{parse_caip_10, AccountIdError},
    relay_rpc::auth::did::{combine_did_data, extract_did_data, DidError},
    serde::{Deserialize, Serialize},
    std::sync::Arc,
};

pub mod eip155;

const DID_METHOD_PKH: &str = "pkh";

/// A CAIP-10 account ID, e.g. `eip155:1:0x9AfEaC202C837df470b5A145e0EfD6a574B21029`.
///
/// Only the `eip155` namespace is accepted, with an ERC-55 checksummed
/// address. The string form is the partition key of an account's
/// subscriptions.
#[derive(
    Debug,
    Hash,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    ::derive_more::Display,
    ::derive_more::AsRef,
)]
#[as_ref(forward)]
pub struct AccountId(Arc<str>);

impl AccountId {
    /// The `0x`-prefixed address part.
    pub fn address(&self) -> &str {
        // Validated on construction, there are always three segments
        self.0.rsplit(':').next().unwrap_or_default()
    }

    pub fn chain_reference(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }

    /// True when both ids point to the same address, ignoring chain and
    /// checksum casing. A subscription made on one chain receives messages
    /// addressed to any chain of the same EOA.
    pub fn is_same_address(&self, other: &AccountId) -> bool {
        self.address().eq_ignore_ascii_case(other.address())
    }

    pub fn from_did_pkh(did: &str) -> Result<Self, AccountIdParseError> {
        Ok(Self::try_from(extract_did_data(did, DID_METHOD_PKH)?)?)
    }

    pub fn to_did_pkh(&self) -> String {
        combine_did_data(DID_METHOD_PKH, self.as_ref())
    }
}

impl TryFrom<String> for AccountId {
    type Error = AccountIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_from(s.as_str())
    }
}

impl TryFrom<&str> for AccountId {
    type Error = AccountIdError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        parse_caip_10(s)?;
        Ok(Self(Arc::from(s)))
    }
}

impl Serialize for AccountId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'a> Deserialize<'a> for AccountId {
    fn deserialize<D: serde::Deserializer<'a>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::try_from(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountIdParseError {
    #[error(transparent)]
    AccountId(#[from] AccountIdError),

    #[error("DID error: {0}")]
    Did(#[from] DidError),
}
