use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use age::x25519::Identity;
use color_eyre::eyre::{eyre, WrapErr};

use crate::{
    auth::AuthService,
    encryption::TokenCipher,
    oauth::{
        db::{CredentialStore, SqliteCredentialStore},
        session::{ContextStore, MemoryContextStore},
    },
};

/// Everything the OAuth/DPoP core needs to talk to the remote service
///
/// Built once and handed to each component; nothing reads the environment
/// after startup.
#[derive(Debug, Clone)]
pub struct BlueskyConfig {
    /// Client ID (the URL of our client metadata document)
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Base URL of the authorization server / PDS, without trailing slash
    pub base_url: String,
    pub authorize_path: String,
    pub token_path: String,
    pub revoke_path: String,
    /// How long an issued access token is considered valid
    pub token_lifetime: Duration,
    /// Refresh this long before `token_expires_at`
    pub refresh_buffer: Duration,
    /// Lifetime of a pending authorization between init and callback
    pub pending_ttl: Duration,
    pub request_timeout: Duration,
    pub verify_tls: bool,
    pub rate_limits: RateLimits,
    pub media: MediaLimits,
}

#[derive(Debug, Clone)]
pub struct RateLimits {
    pub posts_per_hour: u32,
    pub uploads_per_hour: u32,
    pub window: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            posts_per_hour: 50,
            uploads_per_hour: 100,
            window: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaLimits {
    pub max_size: usize,
    pub allowed_types: Vec<String>,
    pub max_items_per_post: usize,
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            max_size: 10 * 1024 * 1024,
            allowed_types: [
                "image/jpeg",
                "image/png",
                "image/gif",
                "video/mp4",
                "video/quicktime",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_items_per_post: 4,
        }
    }
}

impl BlueskyConfig {
    pub fn new(
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scopes: vec!["atproto".to_string(), "transition:generic".to_string()],
            base_url: base_url.into().trim_end_matches('/').to_string(),
            authorize_path: "/oauth/authorize".to_string(),
            token_path: "/oauth/token".to_string(),
            revoke_path: "/oauth/revoke".to_string(),
            token_lifetime: Duration::from_secs(3600),
            refresh_buffer: Duration::from_secs(300),
            pending_ttl: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(30),
            verify_tls: true,
            rate_limits: RateLimits::default(),
            media: MediaLimits::default(),
        }
    }

    pub fn from_env() -> color_eyre::Result<Self> {
        let client_id = std::env::var("BLUESKY_CLIENT_ID")
            .map_err(|_| eyre!("BLUESKY_CLIENT_ID environment variable not set"))?;
        let redirect_uri = std::env::var("BLUESKY_REDIRECT_URI")
            .map_err(|_| eyre!("BLUESKY_REDIRECT_URI environment variable not set"))?;
        let base_url =
            std::env::var("BLUESKY_API_URL").unwrap_or_else(|_| "https://bsky.social".to_string());

        let mut config = Self::new(client_id, redirect_uri, base_url);

        if let Ok(scopes) = std::env::var("BLUESKY_SCOPES") {
            config.scopes = scopes.split_whitespace().map(String::from).collect();
        }
        if let Some(secs) = env_parse::<u64>("BLUESKY_TOKEN_EXPIRES")? {
            config.token_lifetime = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("BLUESKY_REFRESH_BUFFER")? {
            config.refresh_buffer = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("BLUESKY_REQUEST_TIMEOUT")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(verify) = env_parse::<bool>("BLUESKY_VERIFY_SSL")? {
            config.verify_tls = verify;
        }
        if let Some(limit) = env_parse::<u32>("BLUESKY_POSTS_PER_HOUR")? {
            config.rate_limits.posts_per_hour = limit;
        }
        if let Some(limit) = env_parse::<u32>("BLUESKY_UPLOADS_PER_HOUR")? {
            config.rate_limits.uploads_per_hour = limit;
        }

        if !config.verify_tls {
            tracing::warn!("TLS certificate verification is disabled for Bluesky requests");
        }

        Ok(config)
    }

    /// Absolute URL for a path on the remote service
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

fn env_parse<T>(name: &str) -> color_eyre::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .wrap_err_with(|| format!("Failed to parse {name}")),
        Err(_) => Ok(None),
    }
}

/// This struct holds the age identity used to encrypt credentials at rest
#[derive(Clone)]
pub struct EncryptionConfig {
    pub key: Arc<Identity>,
}

impl EncryptionConfig {
    pub fn from_env() -> color_eyre::Result<Self> {
        let key_str = std::env::var("ENCRYPTION_KEY")
            .map_err(|_| eyre!("ENCRYPTION_KEY environment variable not set"))?;

        let key = Identity::from_str(key_str.trim())
            .map_err(|e| eyre!("Failed to parse ENCRYPTION_KEY: {}", e))?;

        Ok(Self { key: Arc::new(key) })
    }
}

/// Wiring for the background binary
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BlueskyConfig>,
    pub credentials: Arc<dyn CredentialStore>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub async fn from_env() -> color_eyre::Result<Self> {
        let config = Arc::new(BlueskyConfig::from_env()?);
        let encryption = EncryptionConfig::from_env()?;
        let cipher = TokenCipher::new(encryption.key);

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://skypost.db".to_string());
        let store = SqliteCredentialStore::connect(&database_url, cipher)
            .await
            .wrap_err("Failed to open credential store")?;
        store
            .migrate()
            .await
            .wrap_err("Failed to migrate credential store")?;
        let credentials: Arc<dyn CredentialStore> = Arc::new(store);

        let pending = context_store_from_env().await?;

        let auth = Arc::new(
            AuthService::new(config.clone(), credentials.clone(), pending)
                .wrap_err("Failed to build auth service")?,
        );

        Ok(Self {
            config,
            credentials,
            auth,
        })
    }
}

#[cfg(feature = "redis")]
async fn context_store_from_env() -> color_eyre::Result<Arc<dyn ContextStore>> {
    match std::env::var("REDIS_URL") {
        Ok(url) => {
            tracing::info!("Using Redis for pending authorizations");
            let store = crate::oauth::session::RedisContextStore::connect(&url)
                .await
                .wrap_err("Failed to connect to Redis")?;
            Ok(Arc::new(store))
        }
        Err(_) => Ok(Arc::new(MemoryContextStore::default())),
    }
}

#[cfg(not(feature = "redis"))]
async fn context_store_from_env() -> color_eyre::Result<Arc<dyn ContextStore>> {
    if std::env::var("REDIS_URL").is_ok() {
        tracing::warn!("REDIS_URL is set but skypost was built without the redis feature");
    }
    Ok(Arc::new(MemoryContextStore::default()))
}
