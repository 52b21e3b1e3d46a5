//! Random opaque secrets for OAuth state, PKCE verifiers and encryption keys.

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Number of random bytes drawn per secret.
const ENTROPY_BYTES: usize = 256;

/// Longest secret `generate_secret` can return (unpadded base64 of `ENTROPY_BYTES`).
///
/// Longer requests are not rejected: they silently come back at this length.
pub const MAX_SECRET_LEN: usize = (ENTROPY_BYTES * 4 + 2) / 3;

/// Output alphabet for a generated secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alphabet {
    /// `A-Z a-z 0-9 - _`, safe inside URLs and query strings.
    UrlSafe,
    /// `A-Z a-z 0-9 + /`, used for configuration secrets.
    Standard,
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("failed to read from the OS random source: {0}")]
    Entropy(#[from] rand::Error),
}

/// Generates a random secret of `length` characters.
///
/// Callers must keep `length <= MAX_SECRET_LEN`.
pub fn generate_secret(alphabet: Alphabet, length: usize) -> Result<String, SecretError> {
    let mut buf = [0u8; ENTROPY_BYTES];
    OsRng.try_fill_bytes(&mut buf)?;

    let mut secret = match alphabet {
        Alphabet::UrlSafe => URL_SAFE_NO_PAD.encode(buf),
        Alphabet::Standard => STANDARD_NO_PAD.encode(buf),
    };
    secret.truncate(length);

    Ok(secret)
}
