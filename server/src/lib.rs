//! DPoP-bound OAuth for Bluesky accounts, and the posting service built on it

pub mod auth;
pub mod cron;
pub mod encryption;
pub mod errors;
pub mod oauth;
pub mod posts;
pub mod rate_limit;
pub mod setup;
pub mod state;

pub use auth::{AuthService, AuthorizationRequest};
pub use errors::{AuthFailure, Error, Result};
pub use posts::PostService;
pub use state::{AppState, BlueskyConfig};
