use {
    crate::{
        keyserver::{CacaoSignature, CACAO_SIGNATURE_TYPE_EIP191},
        model::types::{eip155::erc_55_checksum_encode, AccountId},
        notify_message::JwtNotification,
    },
    chrono::Utc,
    k256::ecdsa::SigningKey as AccountSigningKey,
    rand::{rngs::OsRng, RngCore},
    relay_rpc::auth::ed25519_dalek::SigningKey,
    sha2::Digest,
    sha3::Keccak256,
    uuid::Uuid,
};

mod notify_service;

pub use notify_service::MockNotifyService;

pub fn generate_signing_key() -> SigningKey {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    SigningKey::from_bytes(&secret)
}

pub fn generate_eoa() -> (AccountSigningKey, String) {
    let account_signing_key = AccountSigningKey::random(&mut OsRng);
    let address = &Keccak256::default()
        .chain_update(
            &account_signing_key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()[1..],
        )
        .finalize()[12..];
    let address = format!("0x{}", erc_55_checksum_encode(&hex::encode(address)));
    (account_signing_key, address)
}

pub fn format_eip155_account(chain_id: u32, address: &str) -> AccountId {
    AccountId::try_from(format!("eip155:{chain_id}:{address}")).unwrap()
}

pub fn generate_account() -> (AccountSigningKey, AccountId) {
    let (account_signing_key, address) = generate_eoa();
    let account = format_eip155_account(1, &address);
    (account_signing_key, account)
}

/// Signs `message` the way `personal_sign` does.
pub fn sign_siwe_message(message: &str, signing_key: &AccountSigningKey) -> CacaoSignature {
    let prefixed = format!("\x19Ethereum Signed Message:\n{}{message}", message.len());
    let (signature, recovery): (k256::ecdsa::Signature, _) = signing_key
        .sign_digest_recoverable(Keccak256::new_with_prefix(prefixed.as_bytes()))
        .unwrap();
    let signature = [&signature.to_bytes()[..], &[recovery.to_byte()]].concat();
    CacaoSignature {
        t: CACAO_SIGNATURE_TYPE_EIP191.to_owned(),
        s: hex::encode(signature),
    }
}

pub fn generate_notification(r#type: &str) -> JwtNotification {
    JwtNotification {
        id: Uuid::new_v4(),
        sent_at: Utc::now().timestamp_millis(),
        r#type: r#type.to_owned(),
        title: "gm".to_owned(),
        body: "good morning".to_owned(),
        icon: String::new(),
        url: "https://gm.example".to_owned(),
    }
}
