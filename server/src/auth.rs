use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    errors::{AuthFailure, Error, Result},
    oauth::{
        client::{AuthorizedClient, RequestBody},
        db::CredentialStore,
        dpop::DpopManager,
        pkce,
        session::{self, ContextStore, PendingAuthorization},
        token::{chrono_duration, AuthorizationRecord, GrantStatus, TokenResponse, UserId},
    },
    state::BlueskyConfig,
};

/// Where to send the user, and the state token that will identify the callback
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub auth_url: String,
    pub state: String,
}

#[derive(Serialize)]
struct AuthorizeParams<'a> {
    client_id: &'a str,
    redirect_uri: &'a str,
    response_type: &'a str,
    scope: String,
    code_challenge: &'a str,
    code_challenge_method: &'a str,
    state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    login_hint: Option<&'a str>,
}

type RefreshLock = Arc<tokio::sync::Mutex<()>>;

/// Drives a grant through init, callback, refresh and revoke
pub struct AuthService {
    config: Arc<BlueskyConfig>,
    client: AuthorizedClient,
    credentials: Arc<dyn CredentialStore>,
    pending: Arc<dyn ContextStore>,
    /// One lock per user so at most one refresh or revoke runs at a time
    refresh_locks: Mutex<HashMap<UserId, RefreshLock>>,
}

impl AuthService {
    pub fn new(
        config: Arc<BlueskyConfig>,
        credentials: Arc<dyn CredentialStore>,
        pending: Arc<dyn ContextStore>,
    ) -> Result<Self> {
        let client = AuthorizedClient::new(config.clone())?;
        Ok(Self {
            config,
            client,
            credentials,
            pending,
            refresh_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &BlueskyConfig {
        &self.config
    }

    pub fn client(&self) -> &AuthorizedClient {
        &self.client
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Start a new grant for `user_id`
    ///
    /// Generates the PKCE pair, state token and DPoP key pair, parks them in
    /// the context store for `pending_ttl`, and returns the authorize URL.
    #[tracing::instrument(skip_all, fields(user_id = user_id), err)]
    pub async fn initialize_auth(
        &self,
        user_id: UserId,
        handle_hint: Option<&str>,
    ) -> Result<AuthorizationRequest> {
        let handle = handle_hint
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| h.trim_start_matches('@').to_string());

        let code_verifier = pkce::generate_code_verifier();
        let code_challenge = pkce::generate_code_challenge(&code_verifier);
        let state = pkce::generate_state();
        let key_pair = DpopManager::new().generate_key_pair()?;

        let now = Utc::now();
        let pending = PendingAuthorization {
            user_id,
            code_verifier,
            code_challenge,
            dpop_private_key: key_pair.private,
            handle,
            state,
            created_at: now,
            expires_at: now + chrono_duration(self.config.pending_ttl),
        };

        session::store_pending(self.pending.as_ref(), &pending, self.config.pending_ttl).await?;

        let auth_url = self.authorize_url(&pending)?;
        info!("Created pending authorization for user {}", user_id);

        Ok(AuthorizationRequest {
            auth_url,
            state: pending.state,
        })
    }

    fn authorize_url(&self, pending: &PendingAuthorization) -> Result<String> {
        let params = AuthorizeParams {
            client_id: &self.config.client_id,
            redirect_uri: &self.config.redirect_uri,
            response_type: "code",
            scope: self.config.scopes.join(" "),
            code_challenge: &pending.code_challenge,
            code_challenge_method: pkce::CODE_CHALLENGE_METHOD,
            state: &pending.state,
            login_hint: pending.handle.as_deref(),
        };
        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| Error::Configuration(format!("failed to encode authorize URL: {e}")))?;

        Ok(format!(
            "{}?{}",
            self.config.endpoint(&self.config.authorize_path),
            query
        ))
    }

    /// Redeem the authorization code the remote server redirected back with
    ///
    /// The pending context for `state` is taken atomically before anything
    /// else, so a replayed callback always fails even if this one does too.
    #[tracing::instrument(skip_all, err)]
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<AuthorizationRecord> {
        if code.trim().is_empty() {
            return Err(Error::validation("authorization code is missing"));
        }
        if state.trim().is_empty() {
            return Err(Error::validation("state is missing"));
        }

        let pending = match session::take_pending(self.pending.as_ref(), state).await? {
            Some(pending) => pending,
            None => {
                warn!("Callback with unknown or already used state");
                return Err(AuthFailure::UnknownState.into());
            }
        };

        if pending.is_expired() {
            warn!("Callback for expired authorization of user {}", pending.user_id);
            return Err(AuthFailure::StateExpired.into());
        }
        if !pkce::verify_state(&pending.state, state) {
            return Err(AuthFailure::StateMismatch.into());
        }
        if !pkce::verify_challenge(&pending.code_verifier, &pending.code_challenge) {
            return Err(AuthFailure::PkceMismatch.into());
        }

        let mut dpop = DpopManager::new();
        dpop.set_key_pair(&pending.dpop_private_key)
            .map_err(|e| AuthFailure::KeyBinding(e.to_string()))?;

        let response = self
            .client
            .post_form(
                &mut dpop,
                &self.config.token_path,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("code_verifier", pending.code_verifier.as_str()),
                    ("redirect_uri", self.config.redirect_uri.as_str()),
                    ("client_id", self.config.client_id.as_str()),
                ],
            )
            .await
            .map_err(map_grant_error)?;
        let tokens = parse_token_response(response)?;

        let did = tokens
            .did()
            .ok_or_else(|| {
                AuthFailure::InvalidGrant("token response did not identify the account".to_string())
            })?
            .to_string();

        let record = AuthorizationRecord {
            user_id: pending.user_id,
            did,
            handle: tokens.handle.clone().or(pending.handle),
            access_token: Some(tokens.access_token),
            refresh_token: tokens.refresh_token,
            dpop_private_key: Some(pending.dpop_private_key),
            dpop_nonce: dpop.nonce().map(str::to_owned),
            token_expires_at: Utc::now() + chrono_duration(self.config.token_lifetime),
            last_used_at: None,
            is_active: true,
        };

        self.credentials.upsert(&record).await?;
        info!(
            "Authorized user {} as {}",
            record.user_id, record.did
        );

        Ok(record)
    }

    /// Exchange the stored refresh token for a new token pair
    ///
    /// Serialized per user. A caller that waited on another refresh gets the
    /// record that refresh produced instead of spending the refresh token again.
    #[tracing::instrument(skip_all, fields(user_id = record.user_id), err)]
    pub async fn refresh_token(&self, record: &AuthorizationRecord) -> Result<AuthorizationRecord> {
        let lock = self.refresh_lock(record.user_id);
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(record).await
        };
        self.release_refresh_lock(record.user_id, &lock);
        result
    }

    async fn refresh_locked(&self, seen: &AuthorizationRecord) -> Result<AuthorizationRecord> {
        let current = self
            .credentials
            .find_by_user(seen.user_id)
            .await?
            .ok_or(AuthFailure::NoAuthorization)?;

        if !current.is_active {
            return Err(AuthFailure::Revoked.into());
        }
        if current.token_expires_at > seen.token_expires_at {
            debug!("Authorization for user {} was already refreshed", seen.user_id);
            return Ok(current);
        }

        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            AuthFailure::InvalidGrant("no refresh token stored for grant".to_string())
        })?;
        let mut dpop = current.dpop_manager()?;

        let response = self
            .client
            .post_form(
                &mut dpop,
                &self.config.token_path,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token.as_str()),
                    ("client_id", self.config.client_id.as_str()),
                ],
            )
            .await
            .map_err(map_grant_error)?;
        let tokens = parse_token_response(response)?;

        if let Some(did) = tokens.did() {
            if did != current.did {
                error!(
                    "Refresh for user {} returned a token for {} instead of {}",
                    current.user_id, did, current.did
                );
                return Err(AuthFailure::KeyBinding(
                    "refreshed token belongs to a different account".to_string(),
                )
                .into());
            }
        }

        // Strictly later than before, even if the clock moved backwards
        let computed = Utc::now() + chrono_duration(self.config.token_lifetime);
        let floor = current.token_expires_at + chrono::Duration::seconds(1);
        let token_expires_at = computed.max(floor);

        let updated = AuthorizationRecord {
            access_token: Some(tokens.access_token),
            refresh_token: tokens.refresh_token.or(current.refresh_token.clone()),
            dpop_nonce: dpop.nonce().map(str::to_owned),
            token_expires_at,
            ..current
        };

        self.credentials.update_tokens(&updated).await?;
        info!(
            "Refreshed authorization for user {}, expires at {}",
            updated.user_id, updated.token_expires_at
        );

        Ok(updated)
    }

    /// Revoke the grant remotely and deactivate it locally
    ///
    /// Local deactivation always happens. The first remote failure, if any,
    /// is returned afterwards.
    #[tracing::instrument(skip_all, fields(user_id = record.user_id), err)]
    pub async fn revoke_access(&self, record: &mut AuthorizationRecord) -> Result<()> {
        let lock = self.refresh_lock(record.user_id);
        let result = {
            let _guard = lock.lock().await;
            self.revoke_locked(record).await
        };
        self.release_refresh_lock(record.user_id, &lock);
        result
    }

    async fn revoke_locked(&self, record: &mut AuthorizationRecord) -> Result<()> {
        let mut remote_error = None;

        // A refresh may have rotated the tokens since the caller loaded its copy
        let current = match self.credentials.find_by_user(record.user_id).await? {
            Some(stored) => stored,
            None => record.clone(),
        };

        let tokens: Vec<(String, &str)> = [
            (current.access_token.clone(), "access_token"),
            (current.refresh_token.clone(), "refresh_token"),
        ]
        .into_iter()
        .filter_map(|(token, hint)| token.map(|t| (t, hint)))
        .collect();

        if !tokens.is_empty() {
            match current.dpop_manager() {
                Ok(mut dpop) => {
                    for (token, hint) in &tokens {
                        let outcome = self
                            .client
                            .post_form(
                                &mut dpop,
                                &self.config.revoke_path,
                                &[
                                    ("token", token.as_str()),
                                    ("token_type_hint", *hint),
                                    ("client_id", self.config.client_id.as_str()),
                                ],
                            )
                            .await;

                        if let Err(err) = outcome {
                            warn!(
                                "Remote revocation of {} failed for user {}: {}",
                                hint, record.user_id, err
                            );
                            remote_error.get_or_insert(err);
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "Cannot sign revocation for user {}: {}",
                        record.user_id, err
                    );
                    remote_error = Some(err.into());
                }
            }
        }

        record.clear_secrets();
        self.credentials.deactivate(record.user_id).await?;
        info!("Revoked authorization for user {}", record.user_id);

        match remote_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// A record that can be used for a call right now
    ///
    /// Refreshes when the token is within the refresh buffer. If that refresh
    /// fails the existing token is used until it hits hard expiry; past that
    /// the call fails until a refresh succeeds.
    pub async fn valid_record(&self, user_id: UserId) -> Result<AuthorizationRecord> {
        let record = self
            .credentials
            .find_by_user(user_id)
            .await?
            .ok_or(AuthFailure::NoAuthorization)?;

        match record.status(self.config.refresh_buffer) {
            GrantStatus::Active => Ok(record),
            GrantStatus::Revoked => Err(AuthFailure::Revoked.into()),
            GrantStatus::Expiring => match self.refresh_token(&record).await {
                Ok(refreshed) => Ok(refreshed),
                Err(err) => {
                    warn!(
                        "Refresh failed for user {}, using current token until expiry: {}",
                        user_id, err
                    );
                    Ok(record)
                }
            },
            GrantStatus::Expired => self.refresh_token(&record).await.map_err(|err| {
                warn!("Refresh of expired token failed for user {}: {}", user_id, err);
                match err {
                    Error::Authentication(_) => err,
                    _ => AuthFailure::TokenExpired.into(),
                }
            }),
        }
    }

    /// Call the remote service as `user_id`
    ///
    /// Persists the latest nonce and, on success, the last-used time.
    #[tracing::instrument(skip(self, body), err)]
    pub async fn authorized_call(
        &self,
        user_id: UserId,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
    ) -> Result<Value> {
        let mut record = self.valid_record(user_id).await?;
        let nonce_before = record.dpop_nonce.clone();

        let result = self.client.call(&mut record, method, path, body).await;

        let used_at = if result.is_ok() {
            record.last_used_at
        } else {
            None
        };
        let nonce = if record.dpop_nonce != nonce_before {
            record.dpop_nonce.as_deref()
        } else {
            None
        };
        if used_at.is_some() || nonce.is_some() {
            if let Err(err) = self.credentials.record_usage(user_id, used_at, nonce).await {
                error!("Failed to record usage for user {}: {:?}", user_id, err);
            }
        }

        result
    }

    fn refresh_lock(&self, user_id: UserId) -> RefreshLock {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(user_id).or_default().clone()
    }

    fn release_refresh_lock(&self, user_id: UserId, lock: &RefreshLock) {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Held only by the map and by us: nobody else is waiting on it
        if Arc::strong_count(lock) == 2 {
            locks.remove(&user_id);
        }
    }
}

fn parse_token_response(value: Value) -> Result<TokenResponse> {
    serde_json::from_value(value).map_err(|_| Error::Api {
        status: 200,
        body: "token response was missing required fields".to_string(),
    })
}

/// Turn OAuth error documents from the token endpoint into authentication failures
fn map_grant_error(err: Error) -> Error {
    let description = match &err {
        Error::Api { body, .. } => serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| json.get("error_description")?.as_str().map(str::to_owned)),
        _ => None,
    };

    match err.oauth_error_code().as_deref() {
        Some("invalid_grant") => {
            AuthFailure::InvalidGrant(description.unwrap_or_else(|| "invalid_grant".to_string()))
                .into()
        }
        Some("invalid_dpop_proof") => AuthFailure::KeyBinding(
            description.unwrap_or_else(|| "DPoP proof rejected".to_string()),
        )
        .into(),
        _ => err,
    }
}
