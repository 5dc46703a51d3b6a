//! Account tokens (HS256 JWT)
//!
//! Tunnel clients present an account token when registering. The token names
//! the account and, when the account belongs to one, its organization.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by an account token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountClaims {
    /// Account ID
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl AccountClaims {
    pub fn new(account_id: impl Into<String>, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: account_id.into(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
            org_id: None,
        }
    }

    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,
}

/// Validates and issues account tokens with a shared HMAC secret.
///
/// Only the signature and `exp` are checked.
#[derive(Clone)]
pub struct JwtValidator {
    secret: Vec<u8>,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            secret: secret.to_vec(),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<AccountClaims, JwtError> {
        let token_data = decode::<AccountClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &self.validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
            _ => JwtError::InvalidToken,
        })?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    pub fn issue(&self, claims: &AccountClaims) -> Result<String, JwtError> {
        Self::encode(&self.secret, claims)
    }

    pub fn encode(secret: &[u8], claims: &AccountClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        Ok(encode(&header, claims, &EncodingKey::from_secret(secret))?)
    }
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator").finish_non_exhaustive()
    }
}
