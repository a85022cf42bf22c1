use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::AuthFailure;
use crate::oauth::dpop::DpopManager;

/// Local user identifier the host application assigns
pub type UserId = i64;

/// Body of a successful token endpoint response
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Usually "DPoP" for Bluesky
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub did: Option<String>,
    /// atproto authorization servers put the account DID in `sub`
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
}

impl TokenResponse {
    /// The account DID, from `did` or else `sub`
    pub fn did(&self) -> Option<&str> {
        self.did.as_deref().or(self.sub.as_deref())
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("did", &self.did())
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Where a grant is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStatus {
    /// Token valid and outside the refresh buffer
    Active,
    /// Token still valid but within the refresh buffer of expiry
    Expiring,
    /// Past hard expiry; unusable until a refresh succeeds
    Expired,
    /// Deactivated locally; a new grant must be started
    Revoked,
}

/// One user's grant as the core sees it: plaintext secrets, in memory only
#[derive(Clone)]
pub struct AuthorizationRecord {
    pub user_id: UserId,
    pub did: String,
    pub handle: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Private JWK of the key the current access token is bound to
    pub dpop_private_key: Option<String>,
    /// Last nonce the server issued for that key
    pub dpop_nonce: Option<String>,
    pub token_expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl AuthorizationRecord {
    pub fn status(&self, refresh_buffer: Duration) -> GrantStatus {
        self.status_at(Utc::now(), refresh_buffer)
    }

    pub fn status_at(&self, now: DateTime<Utc>, refresh_buffer: Duration) -> GrantStatus {
        if !self.is_active || self.access_token.is_none() {
            GrantStatus::Revoked
        } else if now >= self.token_expires_at {
            GrantStatus::Expired
        } else if now + chrono_duration(refresh_buffer) >= self.token_expires_at {
            GrantStatus::Expiring
        } else {
            GrantStatus::Active
        }
    }

    /// True when the token is expiring or expired and we hold a refresh token
    pub fn needs_refresh(&self, refresh_buffer: Duration) -> bool {
        self.refresh_token.is_some()
            && matches!(
                self.status(refresh_buffer),
                GrantStatus::Expiring | GrantStatus::Expired
            )
    }

    pub fn has_expired_token(&self) -> bool {
        Utc::now() >= self.token_expires_at
    }

    /// The signer for this grant, with the stored nonce applied
    pub fn dpop_manager(&self) -> Result<DpopManager, AuthFailure> {
        let private_key = self
            .dpop_private_key
            .as_deref()
            .ok_or_else(|| AuthFailure::KeyBinding("no DPoP key stored for grant".to_string()))?;

        let mut manager = DpopManager::new();
        manager
            .set_key_pair(private_key)
            .map_err(|e| AuthFailure::KeyBinding(e.to_string()))?;
        if let Some(nonce) = &self.dpop_nonce {
            manager.update_nonce(nonce.clone());
        }
        Ok(manager)
    }

    /// Drop every secret and mark the grant inactive
    pub fn clear_secrets(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.dpop_private_key = None;
        self.dpop_nonce = None;
        self.is_active = false;
    }
}

impl fmt::Debug for AuthorizationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationRecord")
            .field("user_id", &self.user_id)
            .field("did", &self.did)
            .field("handle", &self.handle)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_expires_at", &self.token_expires_at)
            .field("last_used_at", &self.last_used_at)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

/// Seconds-precision conversion; config values never approach chrono's range
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    let capped = duration.min(Duration::from_secs(u64::from(u32::MAX)));
    chrono::Duration::from_std(capped)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}
