use std::fmt;

use chrono::{DateTime, Utc};

use crate::oauth::dpop::DpopError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure that can cross the `AuthService` / `AuthorizedClient` boundary.
///
/// Messages never carry verifier, key or token material; the `Api` body is the
/// remote server's error document, which it produced without our secrets.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication error: {0}")]
    Authentication(#[from] AuthFailure),

    #[error("rate limit exceeded for {resource}, resets at {reset_at}")]
    RateLimit {
        resource: RateLimitedResource,
        reset_at: DateTime<Utc>,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("API error: remote returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("network error talking to {endpoint}")]
    TransientNetwork {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error")]
    Storage(#[from] StorageError),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// The OAuth `error` code from an `Api` body, if the body is an OAuth error document
    pub fn oauth_error_code(&self) -> Option<String> {
        match self {
            Error::Api { body, .. } => serde_json::from_str::<serde_json::Value>(body)
                .ok()?
                .get("error")?
                .as_str()
                .map(str::to_owned),
            _ => None,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication(_))
    }
}

/// Why an authentication step was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("invalid or expired authorization state")]
    UnknownState,

    #[error("authorization state expired")]
    StateExpired,

    #[error("authorization state does not match")]
    StateMismatch,

    #[error("PKCE verifier does not match the stored challenge")]
    PkceMismatch,

    #[error("grant rejected by the authorization server: {0}")]
    InvalidGrant(String),

    #[error("DPoP key binding mismatch: {0}")]
    KeyBinding(String),

    #[error("access token expired and could not be refreshed")]
    TokenExpired,

    #[error("authorization has been revoked")]
    Revoked,

    #[error("no authorization on record for this user")]
    NoAuthorization,
}

/// Quota buckets enforced per user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitedResource {
    Posts,
    Uploads,
}

impl fmt::Display for RateLimitedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitedResource::Posts => f.write_str("posts"),
            RateLimitedResource::Uploads => f.write_str("uploads"),
        }
    }
}

/// Failures from the credential store, the context store, or the encryption boundary
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("encryption failure: {0}")]
    Encryption(String),
}

impl From<DpopError> for Error {
    fn from(err: DpopError) -> Self {
        Error::Configuration(err.to_string())
    }
}
