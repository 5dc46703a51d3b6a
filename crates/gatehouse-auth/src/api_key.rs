//! API keys
//!
//! Keys look like `ghk_<random>`. Only the SHA-256 hex digest is stored; the
//! first characters after the prefix are kept separately so operators can
//! tell keys apart.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Reserved prefix; a Bearer token starting with this is treated as an API key
pub const API_KEY_PREFIX: &str = "ghk_";

const KEY_BYTES: usize = 32;
const DISPLAY_PREFIX_LEN: usize = 8;

/// A freshly generated key. `plaintext` is shown once and never stored.
#[derive(Debug, Clone)]
pub struct GeneratedApiKey {
    pub plaintext: String,
    pub display_prefix: String,
    pub hash: String,
}

pub fn generate_api_key() -> GeneratedApiKey {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let body = URL_SAFE_NO_PAD.encode(bytes);
    let plaintext = format!("{}{}", API_KEY_PREFIX, body);

    GeneratedApiKey {
        display_prefix: plaintext[..API_KEY_PREFIX.len() + DISPLAY_PREFIX_LEN].to_string(),
        hash: hash_api_key(&plaintext),
        plaintext,
    }
}

/// SHA-256 hex digest used as the storage lookup key
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn looks_like_api_key(value: &str) -> bool {
    value.len() > API_KEY_PREFIX.len() && value.starts_with(API_KEY_PREFIX)
}
