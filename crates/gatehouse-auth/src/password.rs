//! Argon2id hashes for Basic-auth users

use argon2::password_hash::{self, rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("Password hashing failed: {0}")]
    Hash(password_hash::Error),

    #[error("Stored password hash is malformed: {0}")]
    Malformed(password_hash::Error),
}

/// Hash a password into a PHC string (`$argon2id$v=19$...`).
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(PasswordError::Hash)
}

/// `Ok(false)` on mismatch; an error only when `phc` cannot be parsed.
pub fn verify_password(password: &str, phc: &str) -> Result<bool, PasswordError> {
    let parsed = PasswordHash::new(phc).map_err(PasswordError::Malformed)?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::Hash(e)),
    }
}

/// Verifies passwords for users that may not exist.
///
/// An unknown user is checked against a decoy hash, so a miss costs one
/// Argon2 verification just like a wrong password does.
#[derive(Debug, Clone)]
pub struct PasswordChecker {
    decoy: String,
}

impl PasswordChecker {
    pub fn new() -> Self {
        Self {
            decoy: hash_password("gatehouse-decoy").unwrap_or_default(),
        }
    }

    pub fn check(&self, password: &str, stored: Option<&str>) -> Result<bool, PasswordError> {
        match stored {
            Some(phc) => verify_password(password, phc),
            None => {
                let _ = verify_password(password, &self.decoy);
                Ok(false)
            }
        }
    }
}

impl Default for PasswordChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_argon2id_phc() {
        let hash = hash_password("open sesame").unwrap();
        assert!(hash.starts_with("$argon2id$v=19$"));
        assert_ne!(hash, hash_password("open sesame").unwrap());
    }

    #[test]
    fn test_verify_is_exact() {
        let hash = hash_password("Hunter2").unwrap();
        assert!(verify_password("Hunter2", &hash).unwrap());
        assert!(!verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("", &hash).unwrap());
    }

    #[test]
    fn test_malformed_hash_is_an_error() {
        assert!(matches!(
            verify_password("anything", "plaintext-password"),
            Err(PasswordError::Malformed(_))
        ));
    }

    #[test]
    fn test_checker_unknown_user_never_matches() {
        let checker = PasswordChecker::new();
        let hash = hash_password("pw").unwrap();

        assert!(checker.check("pw", Some(&hash)).unwrap());
        assert!(!checker.check("pw", None).unwrap());
        assert!(!checker.check("gatehouse-decoy", None).unwrap());
    }
}
