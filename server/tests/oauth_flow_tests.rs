//! End-to-end grant lifecycle against the in-process PDS fixture

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use age::x25519::Identity;
use chrono::Utc;
use fixtures::pds::{self, PdsHandle};
use reqwest::Method;
use serde_json::json;
use skypost::{
    cron,
    encryption::TokenCipher,
    errors::{AuthFailure, Error, RateLimitedResource},
    oauth::{
        db::{CredentialStore, SqliteCredentialStore},
        session::MemoryContextStore,
        AuthorizationRecord, RequestBody,
    },
    posts::ImageUpload,
    AuthService, BlueskyConfig, PostService,
};
use sqlx::sqlite::SqlitePoolOptions;

const USER: i64 = 42;
const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

struct Harness {
    pds: PdsHandle,
    auth: Arc<AuthService>,
    store: Arc<SqliteCredentialStore>,
}

fn config_for(pds: &PdsHandle) -> BlueskyConfig {
    BlueskyConfig::new(
        "https://app.test/client-metadata.json",
        "https://app.test/callback",
        pds.base_url.clone(),
    )
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

async fn harness_with(tweak: impl FnOnce(&mut BlueskyConfig)) -> Harness {
    let pds = pds::spawn().await.unwrap();
    let mut config = config_for(&pds);
    tweak(&mut config);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(SqliteCredentialStore::new(
        pool,
        TokenCipher::new(Arc::new(Identity::generate())),
    ));
    store.migrate().await.unwrap();

    let auth = Arc::new(
        AuthService::new(
            Arc::new(config),
            store.clone(),
            Arc::new(MemoryContextStore::new()),
        )
        .unwrap(),
    );

    Harness { pds, auth, store }
}

/// Follow the authorize URL by hand and return the callback's code and state
async fn approve(auth_url: &str) -> (String, String) {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = client.get(auth_url).send().await.unwrap();
    assert!(response.status().is_redirection());

    let location = response.headers()["location"].to_str().unwrap();
    let callback = url::Url::parse(location).unwrap();
    assert_eq!(callback.path(), "/callback");
    let params: HashMap<_, _> = callback.query_pairs().into_owned().collect();
    (params["code"].clone(), params["state"].clone())
}

async fn authorize(h: &Harness) -> AuthorizationRecord {
    let request = h.auth.initialize_auth(USER, Some("alice.test")).await.unwrap();
    let (code, state) = approve(&request.auth_url).await;
    assert_eq!(state, request.state);
    h.auth.handle_callback(&code, &state).await.unwrap()
}

async fn stored(h: &Harness) -> AuthorizationRecord {
    h.store.find_by_user(USER).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_full_authorization_flow() {
    let h = harness().await;
    let record = authorize(&h).await;

    assert_eq!(record.user_id, USER);
    assert_eq!(record.did, pds::DEFAULT_DID);
    assert_eq!(record.handle.as_deref(), Some(pds::DEFAULT_HANDLE));
    assert!(record.is_active);
    assert!(h
        .pds
        .state
        .is_access_token_live(record.access_token.as_deref().unwrap()));

    let saved = stored(&h).await;
    assert_eq!(saved.access_token, record.access_token);
    assert_eq!(saved.dpop_private_key, record.dpop_private_key);
    assert!(saved.is_active);
    assert_eq!(h.pds.state.token_requests(), 1);

    // Expiry comes from the configured lifetime (3600s by default)
    let lifetime = chrono::Duration::seconds(3600);
    for expires_at in [record.token_expires_at, saved.token_expires_at] {
        let drift = (expires_at - (Utc::now() + lifetime)).num_seconds().abs();
        assert!(drift <= 5, "expiry is {drift}s away from now + lifetime");
    }
}

#[tokio::test]
async fn test_callback_cannot_be_replayed() {
    let h = harness().await;
    let request = h.auth.initialize_auth(USER, None).await.unwrap();
    let (code, state) = approve(&request.auth_url).await;

    h.auth.handle_callback(&code, &state).await.unwrap();
    let err = h.auth.handle_callback(&code, &state).await.unwrap_err();

    assert!(matches!(err, Error::Authentication(AuthFailure::UnknownState)));
    // The replay never reached the token endpoint
    assert_eq!(h.pds.state.token_requests(), 1);
}

#[tokio::test]
async fn test_concurrent_callbacks_redeem_once() {
    let h = harness().await;
    let request = h.auth.initialize_auth(USER, None).await.unwrap();
    let (code, state) = approve(&request.auth_url).await;

    let (a, b) = tokio::join!(
        h.auth.handle_callback(&code, &state),
        h.auth.handle_callback(&code, &state)
    );

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    assert_eq!(h.pds.state.token_requests(), 1);
}

#[tokio::test]
async fn test_unknown_state_is_rejected() {
    let h = harness().await;
    h.auth.initialize_auth(USER, None).await.unwrap();

    let err = h
        .auth
        .handle_callback("code-from-nowhere", "forged-state")
        .await
        .unwrap_err();

    assert!(err.is_authentication());
    assert!(h.store.find_by_user(USER).await.unwrap().is_none());
}

#[tokio::test]
async fn test_pending_authorization_expires() {
    let h = harness_with(|config| config.pending_ttl = Duration::from_millis(50)).await;
    let request = h.auth.initialize_auth(USER, None).await.unwrap();
    let (code, state) = approve(&request.auth_url).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = h.auth.handle_callback(&code, &state).await.unwrap_err();
    assert!(matches!(err, Error::Authentication(AuthFailure::UnknownState)));
    assert_eq!(h.pds.state.token_requests(), 0);
}

#[tokio::test]
async fn test_authorized_call_reaches_resource_server() {
    let h = harness().await;
    let record = authorize(&h).await;

    let response = h
        .auth
        .authorized_call(
            USER,
            Method::POST,
            "/xrpc/com.atproto.repo.createRecord",
            Some(RequestBody::Json(json!({
                "repo": record.did,
                "collection": "app.bsky.feed.post",
                "record": {"text": "hello"},
            }))),
        )
        .await
        .unwrap();

    assert!(response["uri"].as_str().unwrap().starts_with("at://"));
    assert_eq!(h.pds.state.record_count(), 1);
    assert!(stored(&h).await.last_used_at.is_some());
}

#[tokio::test]
async fn test_rotated_nonce_is_retried_once_and_persisted() {
    let h = harness().await;
    let record = authorize(&h).await;
    h.pds.state.set_require_nonce(true);
    let fresh = h.pds.state.rotate_nonce();

    let call = h
        .auth
        .authorized_call(
            USER,
            Method::POST,
            "/xrpc/com.atproto.repo.createRecord",
            Some(RequestBody::Json(json!({
                "repo": record.did,
                "collection": "app.bsky.feed.post",
                "record": {"text": "after rotation"},
            }))),
        )
        .await;

    assert!(call.is_ok(), "{call:?}");
    assert_eq!(h.pds.state.api_requests(), 2);
    assert_eq!(h.pds.state.nonce_challenges(), 1);
    assert_eq!(stored(&h).await.dpop_nonce.as_deref(), Some(fresh.as_str()));
}

#[tokio::test]
async fn test_nonce_retry_is_bounded() {
    let h = harness().await;
    let record = authorize(&h).await;
    h.pds.state.set_churn_nonce(true);

    let err = h
        .auth
        .authorized_call(
            USER,
            Method::POST,
            "/xrpc/com.atproto.repo.createRecord",
            Some(RequestBody::Json(json!({
                "repo": record.did,
                "collection": "app.bsky.feed.post",
                "record": {"text": "never lands"},
            }))),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Api { status: 401, .. }));
    assert_eq!(h.pds.state.api_requests(), 2);
    assert_eq!(h.pds.state.record_count(), 0);
}

#[tokio::test]
async fn test_nonce_required_during_code_exchange() {
    let h = harness().await;
    h.pds.state.set_require_nonce(true);

    let record = authorize(&h).await;

    assert_eq!(h.pds.state.token_requests(), 2);
    assert_eq!(
        record.dpop_nonce.as_deref(),
        Some(h.pds.state.current_nonce().as_str())
    );
}

#[tokio::test]
async fn test_refresh_advances_expiry_and_keeps_account() {
    let h = harness().await;
    let record = authorize(&h).await;

    let refreshed = h.auth.refresh_token(&record).await.unwrap();

    assert_eq!(refreshed.did, record.did);
    assert!(refreshed.token_expires_at > record.token_expires_at);
    assert_ne!(refreshed.access_token, record.access_token);
    assert_ne!(refreshed.refresh_token, record.refresh_token);
    assert_eq!(h.pds.state.refresh_grants(), 1);

    let saved = stored(&h).await;
    assert_eq!(saved.access_token, refreshed.access_token);
    assert_eq!(
        saved.token_expires_at.timestamp(),
        refreshed.token_expires_at.timestamp()
    );
}

#[tokio::test]
async fn test_concurrent_refreshes_spend_the_token_once() {
    let h = harness().await;
    let record = authorize(&h).await;
    h.pds.state.set_refresh_delay(Duration::from_millis(200));

    let (a, b, c) = tokio::join!(
        h.auth.refresh_token(&record),
        h.auth.refresh_token(&record),
        h.auth.refresh_token(&record)
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(h.pds.state.refresh_grants(), 1);
    assert_eq!(a.access_token, b.access_token);
    assert_eq!(b.access_token, c.access_token);
}

#[tokio::test]
async fn test_refresh_for_another_account_is_rejected() {
    let h = harness().await;
    let record = authorize(&h).await;
    h.pds.state.set_did("did:plc:somebodyelse");

    let err = h.auth.refresh_token(&record).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Authentication(AuthFailure::KeyBinding(_))
    ));
    assert_eq!(stored(&h).await.access_token, record.access_token);
}

#[tokio::test]
async fn test_valid_record_refreshes_inside_buffer() {
    // Every token is already inside the refresh buffer when issued
    let h = harness_with(|config| {
        config.token_lifetime = Duration::from_secs(120);
        config.refresh_buffer = Duration::from_secs(300);
    })
    .await;
    let record = authorize(&h).await;

    let current = h.auth.valid_record(USER).await.unwrap();

    assert_eq!(h.pds.state.refresh_grants(), 1);
    assert_ne!(current.access_token, record.access_token);
}

#[tokio::test]
async fn test_valid_record_uses_stale_token_when_refresh_fails() {
    let h = harness_with(|config| {
        config.token_lifetime = Duration::from_secs(120);
        config.refresh_buffer = Duration::from_secs(300);
    })
    .await;
    let record = authorize(&h).await;
    // Spend the stored refresh token behind the service's back
    h.auth.refresh_token(&record).await.unwrap();
    let mut stale = stored(&h).await;
    stale.refresh_token = record.refresh_token.clone();
    h.store.update_tokens(&stale).await.unwrap();

    let current = h.auth.valid_record(USER).await.unwrap();

    assert_eq!(current.access_token, stale.access_token);
}

#[tokio::test]
async fn test_revoke_clears_local_secrets() {
    let h = harness().await;
    let mut record = authorize(&h).await;
    let access = record.access_token.clone().unwrap();
    let refresh = record.refresh_token.clone().unwrap();

    h.auth.revoke_access(&mut record).await.unwrap();

    assert!(record.access_token.is_none());
    assert!(record.dpop_private_key.is_none());
    let revoked = h.pds.state.revoked_tokens();
    assert!(revoked.contains(&access));
    assert!(revoked.contains(&refresh));

    let saved = stored(&h).await;
    assert!(!saved.is_active);
    assert!(saved.access_token.is_none());
    assert!(saved.refresh_token.is_none());
    assert!(matches!(
        h.auth.valid_record(USER).await,
        Err(Error::Authentication(AuthFailure::Revoked))
    ));
}

#[tokio::test]
async fn test_revoke_deactivates_even_when_remote_fails() {
    let h = harness().await;
    let mut record = authorize(&h).await;
    h.pds.state.set_fail_revocation(true);

    let err = h.auth.revoke_access(&mut record).await.unwrap_err();

    assert!(matches!(err, Error::Api { status: 503, .. }));
    assert_eq!(h.pds.state.revoke_requests(), 2);
    let saved = stored(&h).await;
    assert!(!saved.is_active);
    assert!(saved.dpop_private_key.is_none());
}

#[tokio::test]
async fn test_revoke_with_outdated_copy_revokes_current_tokens() {
    let h = harness().await;
    let mut outdated = authorize(&h).await;
    let refreshed = h.auth.refresh_token(&outdated).await.unwrap();
    let live_access = refreshed.access_token.clone().unwrap();
    let live_refresh = refreshed.refresh_token.clone().unwrap();

    h.auth.revoke_access(&mut outdated).await.unwrap();

    assert!(!h.pds.state.is_access_token_live(&live_access));
    let revoked = h.pds.state.revoked_tokens();
    assert!(revoked.contains(&live_access));
    assert!(revoked.contains(&live_refresh));
    assert!(outdated.access_token.is_none());
    assert!(!stored(&h).await.is_active);
}

#[tokio::test]
async fn test_revoked_grant_is_not_refreshed() {
    let h = harness().await;
    let mut record = authorize(&h).await;
    let seen = record.clone();
    h.auth.revoke_access(&mut record).await.unwrap();

    let err = h.auth.refresh_token(&seen).await.unwrap_err();

    assert!(matches!(err, Error::Authentication(AuthFailure::Revoked)));
    assert_eq!(h.pds.state.refresh_grants(), 0);
}

#[tokio::test]
async fn test_post_with_image_and_delete() {
    let h = harness().await;
    authorize(&h).await;
    let posts = PostService::new(h.auth.clone());

    let created = posts
        .create_post(
            USER,
            "look at this",
            vec![ImageUpload {
                data: PNG.to_vec(),
                content_type: "image/png".to_string(),
                alt: "a tiny png".to_string(),
            }],
        )
        .await
        .unwrap();

    // uploadBlob then createRecord
    assert_eq!(h.pds.state.api_requests(), 2);
    assert_eq!(h.pds.state.record_count(), 1);

    posts.delete_post(USER, &created.uri).await.unwrap();
    assert_eq!(h.pds.state.record_count(), 0);
}

#[tokio::test]
async fn test_invalid_post_makes_no_network_calls() {
    let h = harness().await;
    authorize(&h).await;
    let posts = PostService::new(h.auth.clone());

    let err = posts
        .create_post(USER, &"x".repeat(301), vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = posts
        .delete_post(USER, "at://did:plc:other/app.bsky.feed.post/abc")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    assert_eq!(h.pds.state.api_requests(), 0);
}

#[tokio::test]
async fn test_unauthorized_post_keeps_its_quota() {
    let h = harness_with(|config| config.rate_limits.posts_per_hour = 1).await;
    let posts = PostService::new(h.auth.clone());

    for _ in 0..3 {
        let err = posts.create_post(USER, "too early", vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(AuthFailure::NoAuthorization)
        ));
    }

    authorize(&h).await;
    posts.create_post(USER, "now it counts", vec![]).await.unwrap();
    assert_eq!(h.pds.state.record_count(), 1);
}

#[tokio::test]
async fn test_post_rate_limit() {
    let h = harness_with(|config| config.rate_limits.posts_per_hour = 2).await;
    authorize(&h).await;
    let posts = PostService::new(h.auth.clone());

    posts.create_post(USER, "one", vec![]).await.unwrap();
    posts.create_post(USER, "two", vec![]).await.unwrap();
    let err = posts.create_post(USER, "three", vec![]).await.unwrap_err();

    assert!(matches!(
        err,
        Error::RateLimit {
            resource: RateLimitedResource::Posts,
            ..
        }
    ));
    assert_eq!(h.pds.state.record_count(), 2);
}

#[tokio::test]
async fn test_cron_refreshes_expiring_grants() {
    let h = harness_with(|config| {
        config.token_lifetime = Duration::from_secs(60);
        config.refresh_buffer = Duration::from_secs(300);
    })
    .await;
    let record = authorize(&h).await;

    let summary = cron::refresh_expiring_authorizations(&h.auth).await.unwrap();

    assert_eq!(summary.found, 1);
    assert_eq!(summary.refreshed, 1);
    assert_eq!(summary.failed, 0);
    assert!(stored(&h).await.token_expires_at > record.token_expires_at);
}

#[tokio::test]
async fn test_cron_skips_fresh_grants() {
    let h = harness().await;
    authorize(&h).await;

    let summary = cron::refresh_expiring_authorizations(&h.auth).await.unwrap();

    assert_eq!(summary, cron::RefreshSummary::default());
    assert_eq!(h.pds.state.refresh_grants(), 0);
}
