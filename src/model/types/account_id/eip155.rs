//! CAIP-10 parsing restricted to the `eip155` namespace.

use {
    once_cell::sync::Lazy,
    regex::Regex,
    sha2::Digest,
    sha3::Keccak256,
    thiserror::Error,
};

// https://github.com/ChainAgnostic/namespaces/blob/main/eip155/caip10.md
pub const NAMESPACE_EIP155: &str = "eip155";

// https://github.com/ChainAgnostic/CAIPs/blob/main/CAIPs/caip-10.md#syntax
static CAIP_10: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([-a-z0-9]{3,8}):([-_a-zA-Z0-9]{1,32}):([-.%a-zA-Z0-9]{1,128})$")
        .expect("Safe unwrap: panics should be caught by test cases")
});

static CHAIN_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+$").expect("Safe unwrap: panics should be caught by test cases"));

static ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^0x([0-9a-fA-F]{40})$")
        .expect("Safe unwrap: panics should be caught by test cases")
});

#[derive(Debug, PartialEq, Eq, Error)]
pub enum AccountIdError {
    #[error("Account ID is not a valid CAIP-10 account ID")]
    Invalid,

    #[error("Account ID uses an unsupported namespace: {0}")]
    UnsupportedNamespace(String),

    #[error("eip155 chain reference is not numeric")]
    ChainReference,

    #[error("eip155 address is not 20 hex bytes")]
    Address,

    #[error("eip155 address does not pass ERC-55 checksum")]
    Checksum,
}

/// Validates `s` and returns its `(chain reference, address)` parts.
pub fn parse_caip_10(s: &str) -> Result<(&str, &str), AccountIdError> {
    let caps = CAIP_10.captures(s).ok_or(AccountIdError::Invalid)?;
    let (_, [namespace, reference, address]) = caps.extract();

    if namespace != NAMESPACE_EIP155 {
        return Err(AccountIdError::UnsupportedNamespace(namespace.to_owned()));
    }
    if !CHAIN_REFERENCE.is_match(reference) {
        return Err(AccountIdError::ChainReference);
    }

    let caps = ADDRESS.captures(address).ok_or(AccountIdError::Address)?;
    let (_, [hex_part]) = caps.extract();
    if erc_55_checksum_encode(&hex_part.to_ascii_lowercase()) != hex_part {
        return Err(AccountIdError::Checksum);
    }

    Ok((reference, address))
}

// https://eips.ethereum.org/EIPS/eip-55
/// Checksums a lowercase hex address given without its `0x` prefix.
pub fn erc_55_checksum_encode(lowercase_hex: &str) -> String {
    let hash = hex::encode(Keccak256::digest(lowercase_hex.as_bytes()));
    lowercase_hex
        .chars()
        .zip(hash.bytes())
        .map(|(c, h)| {
            if c.is_ascii_alphabetic() && h > b'7' {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_vectors() {
        for address in [
            "5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "fB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "dbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
            "D1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
        ] {
            assert_eq!(
                erc_55_checksum_encode(&address.to_ascii_lowercase()),
                address
            );
        }
    }

    #[test]
    fn caip_10_cases() {
        // https://github.com/ChainAgnostic/namespaces/blob/main/eip155/caip10.md#test-cases
        assert_eq!(
            parse_caip_10("eip155:1:0x22227A31dd842196A246d8f3b775998560eAa61d"),
            Ok(("1", "0x22227A31dd842196A246d8f3b775998560eAa61d"))
        );
        assert_eq!(
            parse_caip_10("eip155:1:0x22227a31dd842196a246d8f3b775998560eaa61d"),
            Err(AccountIdError::Checksum)
        );
        assert!(parse_caip_10("eip155:137:0x0495766cD136138Fc492Dd499B8DC87A92D6685b").is_ok());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert_eq!(parse_caip_10("junk"), Err(AccountIdError::Invalid));
        assert_eq!(
            parse_caip_10("0x62639418051006514eD5Bb5B20aa7aAD642cC2d0"),
            Err(AccountIdError::Invalid)
        );
        assert_eq!(
            parse_caip_10("solana:1:0x62639418051006514eD5Bb5B20aa7aAD642cC2d0"),
            Err(AccountIdError::UnsupportedNamespace("solana".to_owned()))
        );
        assert_eq!(
            parse_caip_10("eip155:abc:0x62639418051006514eD5Bb5B20aa7aAD642cC2d0"),
            Err(AccountIdError::ChainReference)
        );
        assert_eq!(
            parse_caip_10("eip155:1:0x62639418051006514eD5Bb5B20aa7aAD642cC2d"),
            Err(AccountIdError::Address)
        );
    }
}
