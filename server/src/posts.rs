use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    auth::AuthService,
    errors::{Error, RateLimitedResource, Result},
    oauth::{client::RequestBody, token::UserId},
    rate_limit::RateLimiter,
    state::MediaLimits,
};

pub const POST_COLLECTION: &str = "app.bsky.feed.post";
pub const MAX_POST_CHARS: usize = 300;
pub const MAX_ALT_TEXT_CHARS: usize = 1000;

/// An image to attach to a post
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub data: Vec<u8>,
    pub content_type: String,
    pub alt: String,
}

/// The record the PDS created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPost {
    pub uri: String,
    pub cid: String,
}

/// Posting and media upload on behalf of authorized users
pub struct PostService {
    auth: Arc<AuthService>,
    limiter: RateLimiter,
}

impl PostService {
    pub fn new(auth: Arc<AuthService>) -> Self {
        let limiter = RateLimiter::new(auth.config().rate_limits.clone());
        Self { auth, limiter }
    }

    fn media(&self) -> &MediaLimits {
        &self.auth.config().media
    }

    /// Publish a text post, optionally with images
    ///
    /// All input is validated before the first network call. The post and
    /// each image take a slot from their hourly quotas.
    #[tracing::instrument(skip(self, text, images), fields(images = images.len()), err)]
    pub async fn create_post(
        &self,
        user_id: UserId,
        text: &str,
        images: Vec<ImageUpload>,
    ) -> Result<CreatedPost> {
        validate_post_text(text)?;
        if images.len() > self.media().max_items_per_post {
            return Err(Error::validation(format!(
                "a post can carry at most {} images",
                self.media().max_items_per_post
            )));
        }
        for image in &images {
            if image.alt.chars().count() > MAX_ALT_TEXT_CHARS {
                return Err(Error::validation(format!(
                    "alt text is limited to {MAX_ALT_TEXT_CHARS} characters"
                )));
            }
            if !image.content_type.starts_with("image/") {
                return Err(Error::validation("only images can be embedded in a post"));
            }
            validate_media(&image.data, &image.content_type, self.media())?;
        }

        let record = self.auth.valid_record(user_id).await?;
        self.limiter
            .check_and_record(user_id, RateLimitedResource::Posts)?;

        let mut embedded = Vec::with_capacity(images.len());
        for image in images {
            let blob = self
                .upload_blob(user_id, image.data, &image.content_type)
                .await?;
            embedded.push(json!({ "alt": image.alt, "image": blob }));
        }

        let mut post = json!({
            "$type": POST_COLLECTION,
            "text": text,
            "createdAt": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
        if !embedded.is_empty() {
            post["embed"] = json!({
                "$type": "app.bsky.embed.images",
                "images": embedded,
            });
        }

        let response = self
            .auth
            .authorized_call(
                user_id,
                Method::POST,
                "/xrpc/com.atproto.repo.createRecord",
                Some(RequestBody::Json(json!({
                    "repo": record.did,
                    "collection": POST_COLLECTION,
                    "record": post,
                }))),
            )
            .await?;

        let created = CreatedPost {
            uri: string_field(&response, "uri")?,
            cid: string_field(&response, "cid")?,
        };
        info!("User {} created post {}", user_id, created.uri);
        Ok(created)
    }

    /// Upload media and return the blob reference the PDS assigned
    #[tracing::instrument(skip(self, data), fields(size = data.len()), err)]
    pub async fn upload_blob(
        &self,
        user_id: UserId,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<Value> {
        validate_media(&data, content_type, self.media())?;
        self.limiter
            .check_and_record(user_id, RateLimitedResource::Uploads)?;

        let response = self
            .auth
            .authorized_call(
                user_id,
                Method::POST,
                "/xrpc/com.atproto.repo.uploadBlob",
                Some(RequestBody::Bytes {
                    content_type: content_type.to_string(),
                    data,
                }),
            )
            .await?;

        response.get("blob").cloned().ok_or_else(|| Error::Api {
            status: 200,
            body: "uploadBlob response did not include a blob".to_string(),
        })
    }

    /// Delete one of the user's own posts by its `at://` URI
    #[tracing::instrument(skip(self), err)]
    pub async fn delete_post(&self, user_id: UserId, at_uri: &str) -> Result<()> {
        let (repo, collection, rkey) = parse_at_uri(at_uri)?;
        if collection != POST_COLLECTION {
            return Err(Error::validation("URI does not name a post"));
        }

        let record = self.auth.valid_record(user_id).await?;
        if repo != record.did {
            return Err(Error::validation("post belongs to a different account"));
        }

        self.auth
            .authorized_call(
                user_id,
                Method::POST,
                "/xrpc/com.atproto.repo.deleteRecord",
                Some(RequestBody::Json(json!({
                    "repo": record.did,
                    "collection": collection,
                    "rkey": rkey,
                }))),
            )
            .await?;

        info!("User {} deleted post {}", user_id, at_uri);
        Ok(())
    }
}

fn string_field(response: &Value, name: &str) -> Result<String> {
    response
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::Api {
            status: 200,
            body: format!("createRecord response did not include {name}"),
        })
}

pub fn validate_post_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::validation("post text cannot be empty"));
    }
    if text.chars().count() > MAX_POST_CHARS {
        return Err(Error::validation(format!(
            "post text is limited to {MAX_POST_CHARS} characters"
        )));
    }
    Ok(())
}

/// Check size, declared type, and that the bytes are what the type claims
pub fn validate_media(data: &[u8], content_type: &str, limits: &MediaLimits) -> Result<()> {
    if data.is_empty() {
        return Err(Error::validation("media is empty"));
    }
    if data.len() > limits.max_size {
        return Err(Error::validation(format!(
            "media exceeds the {} byte limit",
            limits.max_size
        )));
    }

    let declared: mime::Mime = content_type
        .parse()
        .map_err(|_| Error::validation("invalid content type"))?;
    let essence = declared.essence_str().to_ascii_lowercase();
    if !limits.allowed_types.iter().any(|allowed| *allowed == essence) {
        return Err(Error::validation(format!(
            "content type {essence} is not allowed"
        )));
    }

    match infer::get(data) {
        Some(kind) if kind.mime_type() == essence => Ok(()),
        Some(kind) => Err(Error::validation(format!(
            "content looks like {} but was declared as {essence}",
            kind.mime_type()
        ))),
        None => Err(Error::validation("unrecognized media content")),
    }
}

/// Split `at://<repo>/<collection>/<rkey>`
pub fn parse_at_uri(uri: &str) -> Result<(&str, &str, &str)> {
    let rest = uri
        .strip_prefix("at://")
        .ok_or_else(|| Error::validation("not an at:// URI"))?;
    let mut parts = rest.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(repo), Some(collection), Some(rkey), None)
            if !repo.is_empty() && !collection.is_empty() && !rkey.is_empty() =>
        {
            Ok((repo, collection, rkey))
        }
        _ => Err(Error::validation("at:// URI must name a repo, collection and record key")),
    }
}
