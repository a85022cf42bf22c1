use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk,
};
use p256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::oauth::dpop::DpopError;

/// Public half of a P-256 key as a JSON Web Key
///
/// Fields are declared in lexicographic order so the serialized form is the
/// RFC 7638 canonical input for the thumbprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    pub crv: String,
    pub kty: String,
    pub x: String,
    pub y: String,
}

impl PublicJwk {
    /// Build the JWK from a P-256 public key
    pub fn from_public_key(key: &PublicKey) -> Result<Self, DpopError> {
        let point = key.to_encoded_point(false);

        let x = point
            .x()
            .ok_or_else(|| DpopError::InvalidKey("missing x coordinate".to_string()))?;
        let y = point
            .y()
            .ok_or_else(|| DpopError::InvalidKey("missing y coordinate".to_string()))?;

        Ok(Self {
            crv: "P-256".to_string(),
            kty: "EC".to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        })
    }

    /// Calculate the JWK thumbprint (RFC 7638), base64url without padding
    ///
    /// This is the `jkt` an authorization server binds issued tokens to.
    pub fn thumbprint(&self) -> Result<String, DpopError> {
        let canonical = serde_json::to_string(self)
            .map_err(|e| DpopError::InvalidKey(format!("failed to serialize JWK: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
    }

    /// The same key in the shape `jsonwebtoken` embeds in a JWT header
    pub fn to_header_jwk(&self) -> Jwk {
        Jwk {
            common: CommonParameters::default(),
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: self.x.clone(),
                y: self.y.clone(),
            }),
        }
    }
}
