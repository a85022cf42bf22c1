use std::sync::Arc;

use chrono::Utc;
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE},
    Method, StatusCode,
};
use serde_json::Value;

use crate::errors::{AuthFailure, Error, Result};
use crate::oauth::dpop::DpopManager;
use crate::oauth::token::AuthorizationRecord;
use crate::state::BlueskyConfig;

/// Response header carrying a fresh server nonce
pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";

const NONCE_ERROR: &str = "use_dpop_nonce";

/// Request payloads the client knows how to send
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Bytes { content_type: String, data: Vec<u8> },
    Form(Vec<(String, String)>),
}

/// HTTP client that signs every request with the grant's DPoP key
#[derive(Clone)]
pub struct AuthorizedClient {
    http: reqwest::Client,
    config: Arc<BlueskyConfig>,
}

impl AuthorizedClient {
    pub fn new(config: Arc<BlueskyConfig>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .user_agent(concat!("skypost/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &BlueskyConfig {
        &self.config
    }

    /// Call the remote service on behalf of `record`'s grant
    ///
    /// The nonce the server hands back and the time of a successful call are
    /// written into `record`; persisting them is up to the caller.
    pub async fn call(
        &self,
        record: &mut AuthorizationRecord,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
    ) -> Result<Value> {
        if !record.is_active {
            return Err(AuthFailure::Revoked.into());
        }
        let access_token = record
            .access_token
            .clone()
            .ok_or(AuthFailure::Revoked)?;
        if record.has_expired_token() {
            return Err(AuthFailure::TokenExpired.into());
        }

        let mut dpop = record.dpop_manager()?;
        let url = self.config.endpoint(path);

        let result = self
            .send_with_dpop(&mut dpop, method, &url, Some(&access_token), body.as_ref())
            .await;

        record.dpop_nonce = dpop.nonce().map(str::to_owned);
        if result.is_ok() {
            record.last_used_at = Some(Utc::now());
        }
        result
    }

    /// Form POST to an authorization server endpoint (token, revoke)
    pub(crate) async fn post_form(
        &self,
        dpop: &mut DpopManager,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<Value> {
        let url = self.config.endpoint(path);
        let body = RequestBody::Form(
            form.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self.send_with_dpop(dpop, Method::POST, &url, None, Some(&body))
            .await
    }

    /// Send one request, retrying at most once if the server demands a new nonce
    async fn send_with_dpop(
        &self,
        dpop: &mut DpopManager,
        method: Method,
        url: &str,
        access_token: Option<&str>,
        body: Option<&RequestBody>,
    ) -> Result<Value> {
        let mut retried = false;

        loop {
            // A fresh proof every attempt: new jti, current nonce
            let proof = dpop.generate_proof(method.as_str(), url, access_token)?;

            let mut request = self
                .http
                .request(method.clone(), url)
                .header("DPoP", proof);
            if let Some(token) = access_token {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            request = match body {
                Some(RequestBody::Json(json)) => request.json(json),
                Some(RequestBody::Bytes { content_type, data }) => request
                    .header(CONTENT_TYPE, content_type.as_str())
                    .body(data.clone()),
                Some(RequestBody::Form(pairs)) => request.form(pairs),
                None => request,
            };

            let response = request.send().await.map_err(|source| Error::TransientNetwork {
                endpoint: url.to_string(),
                source,
            })?;

            let status = response.status();
            let header_nonce = header_str(&response, DPOP_NONCE_HEADER);
            let www_authenticate = header_str(&response, WWW_AUTHENTICATE.as_str());
            let text = response.text().await.map_err(|source| Error::TransientNetwork {
                endpoint: url.to_string(),
                source,
            })?;

            let new_nonce = header_nonce.or_else(|| body_nonce(&text));
            let got_nonce = new_nonce.is_some();
            if let Some(nonce) = new_nonce {
                dpop.update_nonce(nonce);
            }

            if status.is_success() {
                return parse_json_body(status, &text);
            }

            if !retried
                && got_nonce
                && is_nonce_error(status, www_authenticate.as_deref(), &text)
            {
                tracing::debug!("Server requested a new DPoP nonce for {} {}", method, url);
                retried = true;
                continue;
            }

            tracing::warn!("{} {} failed with status {}", method, url, status);
            return Err(Error::Api {
                status: status.as_u16(),
                body: text,
            });
        }
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

/// Some servers return the nonce in the error document instead of a header
fn body_nonce(text: &str) -> Option<String> {
    serde_json::from_str::<Value>(text)
        .ok()?
        .get("dpop_nonce")?
        .as_str()
        .map(str::to_owned)
}

/// Authorization servers answer `400 {"error":"use_dpop_nonce"}`, resource
/// servers `401` with `WWW-Authenticate: DPoP error="use_dpop_nonce"`
fn is_nonce_error(status: StatusCode, www_authenticate: Option<&str>, text: &str) -> bool {
    if www_authenticate.is_some_and(|header| header.contains(NONCE_ERROR)) {
        return true;
    }
    if status != StatusCode::BAD_REQUEST && status != StatusCode::UNAUTHORIZED {
        return false;
    }
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|json| json.get("error")?.as_str().map(|e| e == NONCE_ERROR))
        .unwrap_or(false)
}

fn parse_json_body(status: StatusCode, text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|_| Error::Api {
        status: status.as_u16(),
        body: "response body was not valid JSON".to_string(),
    })
}
