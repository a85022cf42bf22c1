//! OAuth module for Bluesky authorization with DPoP-bound tokens
//! This includes PKCE, DPoP proofs and keys, pending sessions, and credential storage

pub mod client;
pub mod db;
pub mod dpop;
pub mod jwk;
pub mod pkce;
pub mod session;
pub mod token;

pub use client::{AuthorizedClient, RequestBody};
pub use dpop::{DpopKey, DpopManager, KeyPair};
pub use token::{AuthorizationRecord, GrantStatus, TokenResponse, UserId};
