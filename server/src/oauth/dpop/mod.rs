//! DPoP (RFC 9449) key pairs and per-request proofs
//!
//! A [`DpopManager`] is the key pair of one grant plus the last nonce the
//! server issued for it. It is a plain value: each authorization record
//! carries its own, so nonces never leak between grants.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p256::{pkcs8::EncodePrivateKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::oauth::jwk::PublicJwk;

/// JWT `typ` for DPoP proofs
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

#[derive(Debug, thiserror::Error)]
pub enum DpopError {
    #[error("no DPoP key pair is loaded")]
    MissingKey,

    #[error("invalid DPoP key: {0}")]
    InvalidKey(String),

    #[error("invalid DPoP target URL: {0}")]
    InvalidUrl(String),

    #[error("failed to sign DPoP proof: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// A P-256 signing key together with its public JWK
#[derive(Clone)]
pub struct DpopKey {
    secret: SecretKey,
    public: PublicJwk,
}

impl DpopKey {
    /// Generate a new random P-256 key
    pub fn generate() -> Result<Self, DpopError> {
        Self::from_secret(SecretKey::random(&mut rand::thread_rng()))
    }

    /// Load a key from its private JWK serialization
    pub fn from_private_jwk(private_jwk: &str) -> Result<Self, DpopError> {
        let secret = SecretKey::from_jwk_str(private_jwk)
            .map_err(|_| DpopError::InvalidKey("private JWK could not be parsed".to_string()))?;
        Self::from_secret(secret)
    }

    fn from_secret(secret: SecretKey) -> Result<Self, DpopError> {
        let public = PublicJwk::from_public_key(&secret.public_key())?;
        Ok(Self { secret, public })
    }

    /// The private JWK. Only the credential store should ever see this.
    pub fn private_jwk(&self) -> String {
        (*self.secret.to_jwk_string()).clone()
    }

    pub fn public_jwk(&self) -> &PublicJwk {
        &self.public
    }

    /// RFC 7638 thumbprint of the public key
    pub fn thumbprint(&self) -> Result<String, DpopError> {
        self.public.thumbprint()
    }

    fn encoding_key(&self) -> Result<EncodingKey, DpopError> {
        let der = self
            .secret
            .to_pkcs8_der()
            .map_err(|_| DpopError::InvalidKey("failed to encode key as PKCS#8".to_string()))?;
        Ok(EncodingKey::from_ec_der(der.as_bytes()))
    }
}

impl fmt::Debug for DpopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpopKey")
            .field("public", &self.public)
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Both halves of a freshly generated key pair, serialized as JWK JSON
#[derive(Clone)]
pub struct KeyPair {
    pub private: String,
    pub public: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"[redacted]")
            .finish()
    }
}

/// Payload of a DPoP proof JWT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpopProofClaims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
}

/// The key pair of a single grant plus the last nonce the server gave us
#[derive(Debug, Clone, Default)]
pub struct DpopManager {
    key: Option<DpopKey>,
    nonce: Option<String>,
}

impl DpopManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: DpopKey, nonce: Option<String>) -> Self {
        Self {
            key: Some(key),
            nonce,
        }
    }

    /// Generate a new key pair and start signing with it
    pub fn generate_key_pair(&mut self) -> Result<KeyPair, DpopError> {
        let key = DpopKey::generate()?;
        let public = serde_json::to_string(key.public_jwk())
            .map_err(|e| DpopError::InvalidKey(format!("failed to serialize JWK: {e}")))?;
        let pair = KeyPair {
            private: key.private_jwk(),
            public,
        };

        self.key = Some(key);
        self.nonce = None;
        Ok(pair)
    }

    /// Resume signing with the key of an already issued grant
    ///
    /// Nonces belong to a key, so any nonce held for a previous key is dropped.
    pub fn set_key_pair(&mut self, private_jwk: &str) -> Result<(), DpopError> {
        self.key = Some(DpopKey::from_private_jwk(private_jwk)?);
        self.nonce = None;
        Ok(())
    }

    pub fn key(&self) -> Option<&DpopKey> {
        self.key.as_ref()
    }

    /// Record the most recent server-issued nonce
    pub fn update_nonce(&mut self, nonce: impl Into<String>) {
        self.nonce = Some(nonce.into());
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    /// Build and sign a proof for one request
    ///
    /// Every call gets a fresh `jti`; proofs must not be cached. When an
    /// access token is given its hash goes in `ath`.
    pub fn generate_proof(
        &self,
        method: &str,
        url: &str,
        access_token: Option<&str>,
    ) -> Result<String, DpopError> {
        let key = self.key.as_ref().ok_or(DpopError::MissingKey)?;

        let claims = DpopProofClaims {
            jti: uuid::Uuid::new_v4().to_string(),
            htm: method.to_ascii_uppercase(),
            htu: proof_target(url)?,
            iat: chrono::Utc::now().timestamp(),
            nonce: self.nonce.clone(),
            ath: access_token.map(access_token_hash),
        };

        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some(DPOP_JWT_TYPE.to_string());
        header.jwk = Some(key.public_jwk().to_header_jwk());

        Ok(jsonwebtoken::encode(&header, &claims, &key.encoding_key()?)?)
    }
}

/// The `htu` of a proof: the request URL without query or fragment
pub fn proof_target(url: &str) -> Result<String, DpopError> {
    let mut parsed = url::Url::parse(url).map_err(|e| DpopError::InvalidUrl(e.to_string()))?;
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}

/// `ath` claim value: base64url(SHA-256(access_token))
pub fn access_token_hash(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};

    fn decode_proof(proof: &str) -> (Header, DpopProofClaims) {
        let header = decode_header(proof).unwrap();
        let jwk = header.jwk.clone().expect("proof header carries a jwk");
        let key = DecodingKey::from_jwk(&jwk).unwrap();

        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<DpopProofClaims>(proof, &key, &validation).unwrap();
        (header, data.claims)
    }

    fn manager() -> DpopManager {
        let mut manager = DpopManager::new();
        manager.generate_key_pair().unwrap();
        manager
    }

    #[test]
    fn test_proof_header_and_claims() {
        let manager = manager();
        let proof = manager
            .generate_proof("post", "https://pds.example/oauth/token", None)
            .unwrap();

        let (header, claims) = decode_proof(&proof);
        assert_eq!(header.typ.as_deref(), Some("dpop+jwt"));
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(claims.htm, "POST");
        assert_eq!(claims.htu, "https://pds.example/oauth/token");
        assert!(claims.nonce.is_none());
        assert!(claims.ath.is_none());
        assert!((chrono::Utc::now().timestamp() - claims.iat).abs() < 5);
    }

    #[test]
    fn test_identical_requests_get_distinct_proofs() {
        let manager = manager();
        let url = "https://pds.example/xrpc/com.atproto.repo.createRecord";

        let first = manager.generate_proof("POST", url, Some("t1")).unwrap();
        let second = manager.generate_proof("POST", url, Some("t1")).unwrap();
        assert_ne!(first, second);

        let (_, first_claims) = decode_proof(&first);
        let (_, second_claims) = decode_proof(&second);
        assert_ne!(first_claims.jti, second_claims.jti);

        let first_sig = first.rsplit('.').next().unwrap();
        let second_sig = second.rsplit('.').next().unwrap();
        assert_ne!(first_sig, second_sig);
    }

    #[test]
    fn test_htu_excludes_query_and_fragment() {
        let manager = manager();
        let proof = manager
            .generate_proof(
                "GET",
                "https://pds.example/xrpc/app.bsky.feed.getTimeline?limit=5&cursor=abc#top",
                None,
            )
            .unwrap();

        let (_, claims) = decode_proof(&proof);
        assert_eq!(
            claims.htu,
            "https://pds.example/xrpc/app.bsky.feed.getTimeline"
        );
    }

    #[test]
    fn test_no_key_is_an_error() {
        let manager = DpopManager::new();
        let err = manager
            .generate_proof("GET", "https://pds.example/", None)
            .unwrap_err();
        assert!(matches!(err, DpopError::MissingKey));
    }

    #[test]
    fn test_nonce_and_ath_are_included() {
        let mut manager = manager();
        manager.update_nonce("server-nonce-1");

        let proof = manager
            .generate_proof("POST", "https://pds.example/oauth/token", Some("t1"))
            .unwrap();
        let (_, claims) = decode_proof(&proof);
        assert_eq!(claims.nonce.as_deref(), Some("server-nonce-1"));
        assert_eq!(claims.ath, Some(access_token_hash("t1")));

        manager.update_nonce("server-nonce-2");
        let proof = manager
            .generate_proof("POST", "https://pds.example/oauth/token", None)
            .unwrap();
        let (_, claims) = decode_proof(&proof);
        assert_eq!(claims.nonce.as_deref(), Some("server-nonce-2"));
    }

    #[test]
    fn test_set_key_pair_resumes_the_same_key() {
        let mut original = DpopManager::new();
        let pair = original.generate_key_pair().unwrap();

        let mut resumed = DpopManager::new();
        resumed.set_key_pair(&pair.private).unwrap();

        let original_key = original.key().unwrap();
        let resumed_key = resumed.key().unwrap();
        assert_eq!(original_key.public_jwk(), resumed_key.public_jwk());
        assert_eq!(
            pair.public,
            serde_json::to_string(resumed_key.public_jwk()).unwrap()
        );
    }

    #[test]
    fn test_key_pairs_never_share_nonces() {
        let mut first = manager();
        let second = manager();
        first.update_nonce("for-first-only");

        assert_eq!(first.nonce(), Some("for-first-only"));
        assert_eq!(second.nonce(), None);
    }

    #[test]
    fn test_debug_output_redacts_private_key() {
        let mut manager = DpopManager::new();
        let pair = manager.generate_key_pair().unwrap();
        let key = DpopKey::from_private_jwk(&pair.private).unwrap();

        let private: serde_json::Value = serde_json::from_str(&pair.private).unwrap();
        let d = private["d"].as_str().unwrap();

        assert!(!format!("{key:?}").contains(d));
        assert!(!format!("{pair:?}").contains(d));
        assert!(!format!("{manager:?}").contains(d));
    }

    #[test]
    fn test_invalid_private_key_is_rejected() {
        let mut manager = DpopManager::new();
        let err = manager.set_key_pair("not a jwk").unwrap_err();
        assert!(matches!(err, DpopError::InvalidKey(_)));
    }
}
