//! PKCE (RFC 7636) S256 code challenges.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

/// Value of the `code_challenge_method` authorization parameter.
pub const CHALLENGE_METHOD: &str = "S256";

/// BASE64URL(SHA256(verifier)), unpadded.
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}
