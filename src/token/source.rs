//! Token source factory
//!
//! A [`TokenSource`] yields fresh `(jwt, expires_at)` pairs for one audience;
//! the [`SourceFactory`] builds sources and is the seam tests replace with a
//! deterministic fake. The production factory exchanges a self-signed
//! service-account assertion for a Google identity token.

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Grant type for the service-account JWT bearer flow
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for the signed assertion
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// A freshly minted identity token
#[derive(Debug, Clone)]
pub struct IdentityToken {
    /// The bearer string
    pub jwt: String,
    /// Expiry reported by the provider, trusted verbatim
    pub expires_at: DateTime<Utc>,
}

/// Yields fresh identity tokens for a single audience.
///
/// `fetch` is network-bound, can block for hundreds of milliseconds, and can
/// fail transiently (network) or permanently (bad credential, wrong
/// audience). The cache does not distinguish the two; the next request
/// retries implicitly.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Mint a fresh token
    async fn fetch(&self) -> Result<IdentityToken>;
}

impl std::fmt::Debug for dyn TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TokenSource")
    }
}

/// Builds token sources for audiences.
///
/// This is the single polymorphism point of the token core: tests swap in a
/// factory yielding scripted tokens.
pub trait SourceFactory: Send + Sync {
    /// Instantiate a source for the given audience
    fn new_source(&self, audience: &str) -> Result<Arc<dyn TokenSource>>;
}

/// Subset of a GCP service-account key file needed to sign assertions
#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    private_key_id: String,
    token_uri: String,
}

/// Claims of the self-signed assertion sent to the token endpoint
#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    target_audience: &'a str,
    iat: i64,
    exp: i64,
}

/// Token endpoint response for the JWT bearer grant
#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
}

/// Claims peeked from the minted identity token (never verified here;
/// the upstream validates signatures)
#[derive(Debug, Deserialize)]
struct PeekedClaims {
    exp: i64,
}

/// Production factory minting Google identity tokens from a service-account
/// key file.
pub struct GoogleSourceFactory {
    credentials_path: PathBuf,
    client: Client,
}

impl GoogleSourceFactory {
    /// Create a factory reading the key file at `credentials_path`.
    ///
    /// The file is re-read on every `new_source` call, so a source cleared
    /// after an upstream rejection is rebuilt from the credential on disk.
    pub fn new(credentials_path: PathBuf) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            credentials_path,
            client,
        })
    }

    fn load_key(&self) -> Result<ServiceAccountKey> {
        let raw = fs::read_to_string(&self.credentials_path).map_err(|e| {
            Error::Credential(format!(
                "failed to read credentials file {}: {e}",
                self.credentials_path.display()
            ))
        })?;

        serde_json::from_str(&raw).map_err(|e| {
            Error::Credential(format!(
                "failed to parse credentials file {}: {e}",
                self.credentials_path.display()
            ))
        })
    }
}

impl SourceFactory for GoogleSourceFactory {
    fn new_source(&self, audience: &str) -> Result<Arc<dyn TokenSource>> {
        let key = self.load_key()?;
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| Error::Credential(format!("invalid private key: {e}")))?;

        debug!(audience = %audience, client_email = %key.client_email, "Token source created");

        Ok(Arc::new(GoogleTokenSource {
            audience: audience.to_string(),
            key,
            encoding_key,
            client: self.client.clone(),
        }))
    }
}

/// Token source for one audience, backed by the service-account JWT grant
struct GoogleTokenSource {
    audience: String,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    client: Client,
}

impl GoogleTokenSource {
    fn sign_assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let iat = now.timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            aud: &self.key.token_uri,
            target_audience: &self.audience,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key.private_key_id.clone());

        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding_key)?)
    }
}

#[async_trait]
impl TokenSource for GoogleTokenSource {
    async fn fetch(&self) -> Result<IdentityToken> {
        let assertion = self.sign_assertion(Utc::now())?;

        let params = [
            ("grant_type", JWT_BEARER_GRANT),
            ("assertion", assertion.as_str()),
        ];
        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Mint(format!("token endpoint request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Mint(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Mint(format!("failed to parse token response: {e}")))?;

        let expires_at = decode_expiry(&token.id_token)?;

        debug!(
            audience = %self.audience,
            expires_at = %expires_at.to_rfc3339(),
            token_length = token.id_token.len(),
            "Identity token minted"
        );

        Ok(IdentityToken {
            jwt: token.id_token,
            expires_at,
        })
    }
}

/// Read the `exp` claim from an identity token without verifying it.
fn decode_expiry(jwt: &str) -> Result<DateTime<Utc>> {
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Mint("malformed identity token".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Mint(format!("malformed identity token payload: {e}")))?;

    let claims: PeekedClaims = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Mint(format!("identity token missing exp claim: {e}")))?;

    DateTime::from_timestamp(claims.exp, 0)
        .ok_or_else(|| Error::Mint(format!("identity token exp out of range: {}", claims.exp)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned_jwt(claims: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.as_bytes());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn decode_expiry_reads_exp_claim() {
        let jwt = unsigned_jwt(r#"{"aud":"https://svc","exp":1735689600,"iat":1735686000}"#);
        let expires_at = decode_expiry(&jwt).unwrap();
        assert_eq!(expires_at.timestamp(), 1_735_689_600);
    }

    #[test]
    fn decode_expiry_rejects_token_without_payload() {
        assert!(decode_expiry("only-one-segment").is_err());
    }

    #[test]
    fn decode_expiry_rejects_missing_exp() {
        let jwt = unsigned_jwt(r#"{"aud":"https://svc"}"#);
        assert!(decode_expiry(&jwt).is_err());
    }

    #[test]
    fn decode_expiry_rejects_invalid_base64() {
        assert!(decode_expiry("a.!!!.c").is_err());
    }

    #[test]
    fn missing_credentials_file_is_a_credential_error() {
        let factory =
            GoogleSourceFactory::new(PathBuf::from("/nonexistent/creds.json")).unwrap();
        let err = factory.new_source("https://svc").unwrap_err();
        assert!(matches!(err, Error::Credential(_)));
    }

    #[test]
    fn malformed_key_file_is_a_credential_error() {
        let dir = std::env::temp_dir().join("token-gateway-source-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad-key.json");
        fs::write(&path, "{not json").unwrap();

        let factory = GoogleSourceFactory::new(path).unwrap();
        let err = factory.new_source("https://svc").unwrap_err();
        assert!(matches!(err, Error::Credential(_)));
    }
}
