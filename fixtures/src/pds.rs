//! In-process mock of a Bluesky PDS acting as OAuth authorization server
//! and resource server
//!
//! Everything a client would get wrong is checked: PKCE S256, one-time
//! codes, DPoP proof signature/htm/htu/iat/jti, `ath` on resource calls,
//! nonces, and that tokens are only ever presented with the key they were
//! issued to.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{
    decode, decode_header,
    jwk::{AlgorithmParameters, Jwk},
    Algorithm, DecodingKey, Validation,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";
pub const DEFAULT_DID: &str = "did:plc:fixtureuser";
pub const DEFAULT_HANDLE: &str = "fixture.test";

/// How far a proof's `iat` may drift from the server clock
const MAX_IAT_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct CodeGrant {
    code_challenge: String,
    redirect_uri: String,
    client_id: String,
}

struct PdsInner {
    base_url: String,
    did: String,
    handle: String,
    codes: HashMap<String, CodeGrant>,
    /// token -> jkt of the key it was issued to
    access_tokens: HashMap<String, String>,
    refresh_tokens: HashMap<String, String>,
    records: HashMap<String, Value>,
    seen_jtis: HashSet<String>,
    nonce: String,
    require_nonce: bool,
    churn_nonce: bool,
    fail_revocation: bool,
    refresh_delay: Duration,
    token_requests: usize,
    refresh_grants: usize,
    revoke_requests: usize,
    api_requests: usize,
    nonce_challenges: usize,
    revoked: Vec<String>,
}

/// Shared state of a fixture PDS plus the knobs tests turn
#[derive(Clone)]
pub struct PdsState {
    inner: Arc<Mutex<PdsInner>>,
}

impl PdsState {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PdsInner {
                base_url: base_url.into(),
                did: DEFAULT_DID.to_string(),
                handle: DEFAULT_HANDLE.to_string(),
                codes: HashMap::new(),
                access_tokens: HashMap::new(),
                refresh_tokens: HashMap::new(),
                records: HashMap::new(),
                seen_jtis: HashSet::new(),
                nonce: new_nonce(),
                require_nonce: false,
                churn_nonce: false,
                fail_revocation: false,
                refresh_delay: Duration::ZERO,
                token_requests: 0,
                refresh_grants: 0,
                revoke_requests: 0,
                api_requests: 0,
                nonce_challenges: 0,
                revoked: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PdsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn base_url(&self) -> String {
        self.lock().base_url.clone()
    }

    pub fn did(&self) -> String {
        self.lock().did.clone()
    }

    pub fn set_did(&self, did: impl Into<String>) {
        self.lock().did = did.into();
    }

    /// Reject proofs that do not carry the current nonce
    pub fn set_require_nonce(&self, require: bool) {
        self.lock().require_nonce = require;
    }

    /// Issue a new nonce on every request and reject every proof
    pub fn set_churn_nonce(&self, churn: bool) {
        self.lock().churn_nonce = churn;
    }

    pub fn set_fail_revocation(&self, fail: bool) {
        self.lock().fail_revocation = fail;
    }

    /// Hold refresh grants this long before answering
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.lock().refresh_delay = delay;
    }

    pub fn current_nonce(&self) -> String {
        self.lock().nonce.clone()
    }

    pub fn rotate_nonce(&self) -> String {
        let mut inner = self.lock();
        inner.nonce = new_nonce();
        inner.nonce.clone()
    }

    pub fn token_requests(&self) -> usize {
        self.lock().token_requests
    }

    pub fn refresh_grants(&self) -> usize {
        self.lock().refresh_grants
    }

    pub fn revoke_requests(&self) -> usize {
        self.lock().revoke_requests
    }

    pub fn api_requests(&self) -> usize {
        self.lock().api_requests
    }

    pub fn nonce_challenges(&self) -> usize {
        self.lock().nonce_challenges
    }

    pub fn revoked_tokens(&self) -> Vec<String> {
        self.lock().revoked.clone()
    }

    pub fn is_access_token_live(&self, token: &str) -> bool {
        self.lock().access_tokens.contains_key(token)
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }
}

/// A fixture PDS running on an ephemeral local port
pub struct PdsHandle {
    pub base_url: String,
    pub state: PdsState,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for PdsHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a fixture PDS on 127.0.0.1 with a random port
pub async fn spawn() -> anyhow::Result<PdsHandle> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let state = PdsState::new(base_url.clone());
    let app = router(state.clone());

    let task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("Fixture PDS stopped: {err}");
        }
    });

    Ok(PdsHandle {
        base_url,
        state,
        task,
    })
}

pub fn router(state: PdsState) -> Router {
    Router::new()
        .route("/oauth/authorize", get(authorize))
        .route("/oauth/token", post(token))
        .route("/oauth/revoke", post(revoke))
        .route("/xrpc/com.atproto.repo.createRecord", post(create_record))
        .route("/xrpc/com.atproto.repo.uploadBlob", post(upload_blob))
        .route("/xrpc/com.atproto.repo.deleteRecord", post(delete_record))
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
        .with_state(state)
}

fn new_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_token(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

fn s256(value: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(value.as_bytes()))
}

/// RFC 7638 thumbprint of an EC public JWK
pub fn jwk_thumbprint(x: &str, y: &str) -> String {
    let canonical = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct ProofClaims {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    ath: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    AuthorizationServer,
    ResourceServer,
}

fn error_response(
    role: Role,
    status: StatusCode,
    nonce: &str,
    error: &str,
    description: &str,
) -> Response {
    let mut response = (
        status,
        Json(json!({ "error": error, "error_description": description })),
    )
        .into_response();

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(nonce) {
        headers.insert(DPOP_NONCE_HEADER, value);
    }
    if role == Role::ResourceServer && status == StatusCode::UNAUTHORIZED {
        let challenge = format!(r#"DPoP error="{error}", error_description="{description}""#);
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}

fn with_nonce(mut response: Response, nonce: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(nonce) {
        response.headers_mut().insert(DPOP_NONCE_HEADER, value);
    }
    response
}

/// Validate the request's DPoP proof and return the key thumbprint
fn verify_proof(
    inner: &mut PdsInner,
    role: Role,
    headers: &HeaderMap,
    method: &str,
    uri: &Uri,
    access_token: Option<&str>,
) -> Result<String, Response> {
    let invalid_status = match role {
        Role::AuthorizationServer => StatusCode::BAD_REQUEST,
        Role::ResourceServer => StatusCode::UNAUTHORIZED,
    };
    let nonce = inner.nonce.clone();
    let reject = |description: &str| {
        error_response(role, invalid_status, &nonce, "invalid_dpop_proof", description)
    };

    let proof = headers
        .get("DPoP")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| reject("missing DPoP proof"))?;

    let jwt_header = decode_header(proof).map_err(|_| reject("malformed DPoP proof"))?;
    if jwt_header.typ.as_deref() != Some("dpop+jwt") {
        return Err(reject("wrong proof typ"));
    }
    if jwt_header.alg != Algorithm::ES256 {
        return Err(reject("unsupported proof alg"));
    }
    let jwk: Jwk = jwt_header.jwk.ok_or_else(|| reject("proof has no jwk"))?;
    let (x, y) = match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(params) => (params.x.clone(), params.y.clone()),
        _ => return Err(reject("proof jwk is not an EC key")),
    };
    let key = DecodingKey::from_jwk(&jwk).map_err(|_| reject("unusable proof jwk"))?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let claims = decode::<ProofClaims>(proof, &key, &validation)
        .map_err(|_| reject("bad proof signature"))?
        .claims;

    if claims.htm != method {
        return Err(reject("htm mismatch"));
    }
    let expected_htu = format!("{}{}", inner.base_url, uri.path());
    if claims.htu != expected_htu {
        return Err(reject("htu mismatch"));
    }
    if (chrono::Utc::now().timestamp() - claims.iat).abs() > MAX_IAT_SKEW_SECS {
        return Err(reject("iat outside allowed window"));
    }
    if !inner.seen_jtis.insert(claims.jti.clone()) {
        return Err(reject("jti replayed"));
    }

    if inner.churn_nonce {
        inner.nonce = new_nonce();
        inner.nonce_challenges += 1;
        let nonce = inner.nonce.clone();
        return Err(nonce_challenge(role, &nonce));
    }
    if inner.require_nonce && claims.nonce.as_deref() != Some(inner.nonce.as_str()) {
        inner.nonce_challenges += 1;
        return Err(nonce_challenge(role, &inner.nonce));
    }

    if let Some(token) = access_token {
        if claims.ath.as_deref() != Some(s256(token).as_str()) {
            return Err(error_response(
                role,
                StatusCode::UNAUTHORIZED,
                &inner.nonce,
                "invalid_token",
                "ath does not match access token",
            ));
        }
    }

    Ok(jwk_thumbprint(&x, &y))
}

fn nonce_challenge(role: Role, nonce: &str) -> Response {
    match role {
        Role::AuthorizationServer => error_response(
            role,
            StatusCode::BAD_REQUEST,
            nonce,
            "use_dpop_nonce",
            "Authorization server requires nonce in DPoP proof",
        ),
        Role::ResourceServer => error_response(
            role,
            StatusCode::UNAUTHORIZED,
            nonce,
            "use_dpop_nonce",
            "Resource server requires nonce in DPoP proof",
        ),
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    client_id: String,
    redirect_uri: String,
    response_type: String,
    code_challenge: String,
    code_challenge_method: String,
    state: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    login_hint: Option<String>,
}

#[derive(Serialize)]
struct OAuthRedirectParams<'a> {
    code: &'a str,
    state: &'a str,
}

async fn authorize(State(state): State<PdsState>, Query(query): Query<AuthorizeQuery>) -> Response {
    info!(
        "PDS: authorize for client {} (hint {:?}, scope {:?})",
        query.client_id, query.login_hint, query.scope
    );

    if query.response_type != "code" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "unsupported_response_type"})),
        )
            .into_response();
    }
    if query.code_challenge_method != "S256" || query.code_challenge.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_request", "error_description": "S256 PKCE required"})),
        )
            .into_response();
    }

    let code = new_token("code");
    state.lock().codes.insert(
        code.clone(),
        CodeGrant {
            code_challenge: query.code_challenge,
            redirect_uri: query.redirect_uri.clone(),
            client_id: query.client_id,
        },
    );

    let params = OAuthRedirectParams {
        code: &code,
        state: &query.state,
    };
    let query_string = serde_urlencoded::to_string(&params).unwrap_or_default();
    let separator = if query.redirect_uri.contains('?') { '&' } else { '?' };
    Redirect::to(&format!("{}{}{}", query.redirect_uri, separator, query_string)).into_response()
}

async fn token(
    State(state): State<PdsState>,
    uri: Uri,
    headers: HeaderMap,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let grant_type = params.get("grant_type").cloned().unwrap_or_default();

    if grant_type == "refresh_token" {
        let delay = state.lock().refresh_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    let mut inner = state.lock();
    inner.token_requests += 1;
    let role = Role::AuthorizationServer;

    let jkt = match verify_proof(&mut inner, role, &headers, "POST", &uri, None) {
        Ok(jkt) => jkt,
        Err(response) => return response,
    };
    let nonce = inner.nonce.clone();
    let invalid_grant = |description: &str| {
        error_response(role, StatusCode::BAD_REQUEST, &nonce, "invalid_grant", description)
    };

    match grant_type.as_str() {
        "authorization_code" => {
            let code = params.get("code").cloned().unwrap_or_default();
            let verifier = params.get("code_verifier").cloned().unwrap_or_default();

            // Codes are single use even when the exchange fails
            let Some(grant) = inner.codes.remove(&code) else {
                return invalid_grant("unknown or already used authorization code");
            };
            if s256(&verifier) != grant.code_challenge {
                return invalid_grant("PKCE verification failed");
            }
            if params.get("redirect_uri") != Some(&grant.redirect_uri) {
                return invalid_grant("redirect_uri mismatch");
            }
            if params.get("client_id") != Some(&grant.client_id) {
                return invalid_grant("client_id mismatch");
            }

            info!("PDS: exchanged authorization code");
            issue_tokens(&mut inner, jkt)
        }
        "refresh_token" => {
            let refresh_token = params.get("refresh_token").cloned().unwrap_or_default();

            // Rotation: a refresh token is spent by its first use
            let Some(bound_jkt) = inner.refresh_tokens.remove(&refresh_token) else {
                return invalid_grant("unknown or already used refresh token");
            };
            if bound_jkt != jkt {
                return invalid_grant("refresh token is bound to a different DPoP key");
            }

            inner.refresh_grants += 1;
            info!("PDS: refreshed tokens");
            issue_tokens(&mut inner, jkt)
        }
        _ => error_response(
            role,
            StatusCode::BAD_REQUEST,
            &nonce,
            "unsupported_grant_type",
            "grant type not supported",
        ),
    }
}

fn issue_tokens(inner: &mut PdsInner, jkt: String) -> Response {
    let access_token = new_token("at");
    let refresh_token = new_token("rt");
    inner.access_tokens.insert(access_token.clone(), jkt.clone());
    inner.refresh_tokens.insert(refresh_token.clone(), jkt);

    with_nonce(
        Json(json!({
            "access_token": access_token,
            "token_type": "DPoP",
            "expires_in": 3600,
            "refresh_token": refresh_token,
            "scope": "atproto transition:generic",
            "sub": inner.did,
            "handle": inner.handle,
        }))
        .into_response(),
        &inner.nonce,
    )
}

async fn revoke(
    State(state): State<PdsState>,
    uri: Uri,
    headers: HeaderMap,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let mut inner = state.lock();
    inner.revoke_requests += 1;
    let role = Role::AuthorizationServer;

    if let Err(response) = verify_proof(&mut inner, role, &headers, "POST", &uri, None) {
        return response;
    }
    if inner.fail_revocation {
        let nonce = inner.nonce.clone();
        return error_response(
            role,
            StatusCode::SERVICE_UNAVAILABLE,
            &nonce,
            "temporarily_unavailable",
            "revocation is down",
        );
    }

    // RFC 7009: unknown tokens are not an error
    let token = params.get("token").cloned().unwrap_or_default();
    inner.access_tokens.remove(&token);
    inner.refresh_tokens.remove(&token);
    inner.revoked.push(token);

    with_nonce(StatusCode::OK.into_response(), &inner.nonce)
}

/// Check the access token and its proof; returns nothing on success
fn authorize_resource_call(
    inner: &mut PdsInner,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<(), Response> {
    inner.api_requests += 1;
    let role = Role::ResourceServer;

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("DPoP "))
        .map(str::to_owned);
    let Some(token) = token else {
        return Err(error_response(
            role,
            StatusCode::UNAUTHORIZED,
            &inner.nonce,
            "invalid_token",
            "missing access token",
        ));
    };
    let Some(bound_jkt) = inner.access_tokens.get(&token).cloned() else {
        return Err(error_response(
            role,
            StatusCode::UNAUTHORIZED,
            &inner.nonce,
            "invalid_token",
            "unknown or revoked access token",
        ));
    };

    let jkt = verify_proof(inner, role, headers, "POST", uri, Some(&token))?;
    if jkt != bound_jkt {
        return Err(error_response(
            role,
            StatusCode::UNAUTHORIZED,
            &inner.nonce,
            "invalid_token",
            "access token is bound to a different DPoP key",
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CreateRecordInput {
    repo: String,
    collection: String,
    record: Value,
}

async fn create_record(
    State(state): State<PdsState>,
    uri: Uri,
    headers: HeaderMap,
    Json(input): Json<CreateRecordInput>,
) -> Response {
    let mut inner = state.lock();
    if let Err(response) = authorize_resource_call(&mut inner, &headers, &uri) {
        return response;
    }
    if input.repo != inner.did {
        let nonce = inner.nonce.clone();
        return error_response(
            Role::ResourceServer,
            StatusCode::BAD_REQUEST,
            &nonce,
            "InvalidRequest",
            "repo does not match authenticated account",
        );
    }

    let rkey = Uuid::new_v4().simple().to_string();
    let at_uri = format!("at://{}/{}/{}", input.repo, input.collection, rkey);
    inner.records.insert(at_uri.clone(), input.record);

    with_nonce(
        Json(json!({ "uri": at_uri, "cid": format!("bafyrei{rkey}") })).into_response(),
        &inner.nonce,
    )
}

async fn upload_blob(
    State(state): State<PdsState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut inner = state.lock();
    if let Err(response) = authorize_resource_call(&mut inner, &headers, &uri) {
        return response;
    }

    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let digest = URL_SAFE_NO_PAD.encode(Sha256::digest(&body));
    let cid = format!("bafkrei{}", &digest[..20]);

    with_nonce(
        Json(json!({
            "blob": {
                "$type": "blob",
                "ref": { "$link": cid },
                "mimeType": mime_type,
                "size": body.len(),
            }
        }))
        .into_response(),
        &inner.nonce,
    )
}

#[derive(Debug, Deserialize)]
struct DeleteRecordInput {
    repo: String,
    collection: String,
    rkey: String,
}

async fn delete_record(
    State(state): State<PdsState>,
    uri: Uri,
    headers: HeaderMap,
    Json(input): Json<DeleteRecordInput>,
) -> Response {
    let mut inner = state.lock();
    if let Err(response) = authorize_resource_call(&mut inner, &headers, &uri) {
        return response;
    }

    let at_uri = format!("at://{}/{}/{}", input.repo, input.collection, input.rkey);
    inner.records.remove(&at_uri);

    with_nonce(Json(json!({})).into_response(), &inner.nonce)
}
