//! Credential primitives used by the gateway
//!
//! The gateway treats these as black boxes: it hashes and verifies
//! passwords, validates account tokens, recognises and hashes API keys, and
//! mints opaque session tokens. Nothing here touches storage.

pub mod api_key;
pub mod jwt;
pub mod password;
pub mod session;

pub use api_key::{generate_api_key, hash_api_key, looks_like_api_key, GeneratedApiKey, API_KEY_PREFIX};
pub use jwt::{AccountClaims, JwtError, JwtValidator};
pub use password::{hash_password, verify_password, PasswordChecker, PasswordError};
pub use session::{generate_session_token, hash_session_token, SESSION_COOKIE};

// Re-export useful types
pub use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation};
