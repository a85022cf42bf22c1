//! PKCE (RFC 7636) verifier/challenge pairs and the anti-CSRF `state` token

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{distributions::Alphanumeric, Rng};
use ring::constant_time::verify_slices_are_equal;
use sha2::{Digest, Sha256};

/// Length of a generated code verifier. RFC 7636 allows 43..=128.
pub const CODE_VERIFIER_LENGTH: usize = 128;

/// Length of a generated `state` token
pub const STATE_LENGTH: usize = 40;

/// The only challenge method we send
pub const CODE_CHALLENGE_METHOD: &str = "S256";

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a fresh code verifier over `[A-Za-z0-9]`
pub fn generate_code_verifier() -> String {
    random_alphanumeric(CODE_VERIFIER_LENGTH)
}

/// S256 challenge for a verifier: base64url(SHA-256(verifier)), no padding
pub fn generate_code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Recompute the challenge for `verifier` and compare it to `challenge` in constant time
pub fn verify_challenge(verifier: &str, challenge: &str) -> bool {
    let expected = generate_code_challenge(verifier);
    verify_slices_are_equal(expected.as_bytes(), challenge.as_bytes()).is_ok()
}

/// Generate an unpredictable opaque `state` token
pub fn generate_state() -> String {
    random_alphanumeric(STATE_LENGTH)
}

/// Constant-time equality of two `state` tokens
pub fn verify_state(expected: &str, received: &str) -> bool {
    verify_slices_are_equal(expected.as_bytes(), received.as_bytes()).is_ok()
}
