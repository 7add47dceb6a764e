//! Identity key registration against the keys server.
//!
//! An identity key is an Ed25519 key the wallet owner authorizes, by signing a
//! SIWE message, to act for their account in the notify protocol.

use {
    crate::{
        model::types::{AccountId, AccountIdParseError},
        spec::KEYS_SERVER_IDENTITY_ENDPOINT,
    },
    chrono::Utc,
    rand::{distributions::Alphanumeric, Rng},
    reqwest::StatusCode,
    serde::{Deserialize, Serialize},
    serde_json::json,
    std::fmt::Write,
    thiserror::Error,
    tracing::{info, instrument},
    url::Url,
};

pub const STATEMENT_ALL_DOMAINS: &str = "I further authorize this app to send and receive \
    messages on my behalf for ALL domains using my WalletConnect identity. Read more at \
    https://walletconnect.com/identity";

const CACAO_HEADER_TYPE: &str = "eip4361";
pub const CACAO_SIGNATURE_TYPE_EIP191: &str = "eip191";
const NONCE_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum KeyserverError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("Keys server responded with {0}: {1}")]
    Status(StatusCode, String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacaoHeader {
    pub t: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacaoPayload {
    pub domain: String,
    /// did:pkh of the signing account
    pub iss: String,
    pub statement: Option<String>,
    /// did:key of the identity key being authorized
    pub aud: String,
    pub version: String,
    pub nonce: String,
    pub iat: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
}

impl CacaoPayload {
    pub fn new(
        domain: &str,
        account: &AccountId,
        identity_did_key: String,
        statement: &str,
        keyserver: &Url,
    ) -> Self {
        let nonce = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self {
            domain: domain.to_owned(),
            iss: account.to_did_pkh(),
            statement: Some(statement.to_owned()),
            aud: identity_did_key,
            version: "1".to_owned(),
            nonce,
            iat: Utc::now().to_rfc3339(),
            exp: None,
            nbf: None,
            request_id: None,
            resources: Some(vec![keyserver.to_string()]),
        }
    }

    pub fn account(&self) -> Result<AccountId, AccountIdParseError> {
        AccountId::from_did_pkh(&self.iss)
    }

    /// The EIP-4361 text the account owner signs.
    pub fn siwe_message(&self) -> Result<String, AccountIdParseError> {
        let account = self.account()?;

        let mut message = format!(
            "{} wants you to sign in with your Ethereum account:\n{}\n",
            self.domain,
            account.address()
        );
        if let Some(statement) = &self.statement {
            let _ = write!(message, "\n{statement}\n");
        }
        let _ = write!(
            message,
            "\nURI: {}\nVersion: {}\nChain ID: {}\nNonce: {}\nIssued At: {}",
            self.aud,
            self.version,
            account.chain_reference(),
            self.nonce,
            self.iat
        );
        if let Some(exp) = &self.exp {
            let _ = write!(message, "\nExpiration Time: {exp}");
        }
        if let Some(nbf) = &self.nbf {
            let _ = write!(message, "\nNot Before: {nbf}");
        }
        if let Some(request_id) = &self.request_id {
            let _ = write!(message, "\nRequest ID: {request_id}");
        }
        if let Some(resources) = &self.resources {
            if !resources.is_empty() {
                message.push_str("\nResources:");
                for resource in resources {
                    let _ = write!(message, "\n- {resource}");
                }
            }
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacaoSignature {
    pub t: String,
    /// Hex encoded signature
    pub s: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cacao {
    pub h: CacaoHeader,
    pub p: CacaoPayload,
    pub s: CacaoSignature,
}

impl Cacao {
    pub fn new(payload: CacaoPayload, signature: CacaoSignature) -> Self {
        Self {
            h: CacaoHeader {
                t: CACAO_HEADER_TYPE.to_owned(),
            },
            p: payload,
            s: signature,
        }
    }
}

/// What the wallet owner did with the SIWE message they were asked to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningResult {
    Signed(CacaoSignature),
    Rejected,
}

#[derive(Debug, Clone)]
pub struct KeyserverClient {
    http: reqwest::Client,
    url: Url,
}

impl KeyserverClient {
    pub fn new(url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn identity_url(&self) -> Result<Url, KeyserverError> {
        Ok(self.url.join(KEYS_SERVER_IDENTITY_ENDPOINT)?)
    }

    #[instrument(skip_all, fields(aud = %cacao.p.aud))]
    pub async fn register_identity(&self, cacao: &Cacao) -> Result<(), KeyserverError> {
        let response = self
            .http
            .post(self.identity_url()?)
            .json(&json!({ "cacao": cacao }))
            .send()
            .await?;
        check_status(response).await?;
        info!("Registered identity key");
        Ok(())
    }

    /// `id_auth` is an `unregister_identity` JWT signed by the identity key.
    #[instrument(skip_all)]
    pub async fn unregister_identity(&self, id_auth: &str) -> Result<(), KeyserverError> {
        let response = self
            .http
            .delete(self.identity_url()?)
            .json(&json!({ "idAuth": id_auth }))
            .send()
            .await?;
        check_status(response).await?;
        info!("Unregistered identity key");
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, KeyserverError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(KeyserverError::Status(status, body))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::test_utils::{generate_account, sign_siwe_message},
        wiremock::{
            matchers::{body_partial_json, method, path},
            Mock, MockServer, ResponseTemplate,
        },
    };

    const IDENTITY_DID_KEY: &str = "did:key:z6MkhaXgBZDvotDkL5257faiztiGiC2QtKLGpbnnEGta2doK";

    fn payload(account: &AccountId, keyserver: &Url) -> CacaoPayload {
        CacaoPayload::new(
            "wallet.example",
            account,
            IDENTITY_DID_KEY.to_owned(),
            STATEMENT_ALL_DOMAINS,
            keyserver,
        )
    }

    #[test]
    fn siwe_message_layout() {
        let (_, account) = generate_account();
        let keyserver = Url::parse("https://keys.example").unwrap();
        let mut payload = payload(&account, &keyserver);
        payload.nonce = "abc".to_owned();
        payload.iat = "2024-01-01T00:00:00+00:00".to_owned();

        let expected = format!(
            "wallet.example wants you to sign in with your Ethereum account:\n{}\n\n\
            {STATEMENT_ALL_DOMAINS}\n\n\
            URI: {IDENTITY_DID_KEY}\n\
            Version: 1\n\
            Chain ID: 1\n\
            Nonce: abc\n\
            Issued At: 2024-01-01T00:00:00+00:00\n\
            Resources:\n\
            - https://keys.example/",
            account.address()
        );
        assert_eq!(payload.siwe_message().unwrap(), expected);
    }

    #[test]
    fn siwe_message_requires_did_pkh() {
        let (_, account) = generate_account();
        let mut payload = payload(&account, &Url::parse("https://keys.example").unwrap());
        payload.iss = "did:key:abc".to_owned();
        assert!(payload.siwe_message().is_err());
    }

    #[tokio::test]
    async fn register_posts_cacao() {
        let server = MockServer::start().await;
        let keyserver = Url::parse(&server.uri()).unwrap();
        let (signing_key, account) = generate_account();
        let payload = payload(&account, &keyserver);
        let signature = sign_siwe_message(&payload.siwe_message().unwrap(), &signing_key);
        let cacao = Cacao::new(payload, signature);

        Mock::given(method("POST"))
            .and(path("/identity"))
            .and(body_partial_json(json!({ "cacao": { "p": { "aud": IDENTITY_DID_KEY } } })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        KeyserverClient::new(keyserver)
            .register_identity(&cacao)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn register_surfaces_rejection() {
        let server = MockServer::start().await;
        let keyserver = Url::parse(&server.uri()).unwrap();
        let (signing_key, account) = generate_account();
        let payload = payload(&account, &keyserver);
        let signature = sign_siwe_message(&payload.siwe_message().unwrap(), &signing_key);

        Mock::given(method("POST"))
            .and(path("/identity"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad signature"))
            .mount(&server)
            .await;

        let result = KeyserverClient::new(keyserver)
            .register_identity(&Cacao::new(payload, signature))
            .await;
        assert!(matches!(
            result,
            Err(KeyserverError::Status(status, body))
                if status == StatusCode::BAD_REQUEST && body == "bad signature"
        ));
    }

    #[tokio::test]
    async fn unregister_sends_id_auth() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/identity"))
            .and(body_partial_json(json!({ "idAuth": "jwt" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        KeyserverClient::new(Url::parse(&server.uri()).unwrap())
            .unregister_identity("jwt")
            .await
            .unwrap();
    }
}
