//! Subdomain label validation

use thiserror::Error;

pub const MAX_SUBDOMAIN_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubdomainError {
    #[error("Subdomain must not be empty")]
    Empty,

    #[error("Subdomain is longer than 63 characters")]
    TooLong,

    #[error("Subdomain may only contain lowercase letters, digits and hyphens")]
    InvalidCharacter,

    #[error("Subdomain must not start or end with a hyphen")]
    HyphenEdge,
}

/// Validate a DNS label used as a tunnel subdomain.
///
/// Uppercase input is rejected, not normalised.
pub fn validate_subdomain(subdomain: &str) -> Result<(), SubdomainError> {
    if subdomain.is_empty() {
        return Err(SubdomainError::Empty);
    }
    if subdomain.len() > MAX_SUBDOMAIN_LEN {
        return Err(SubdomainError::TooLong);
    }
    if !subdomain
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(SubdomainError::InvalidCharacter);
    }
    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return Err(SubdomainError::HyphenEdge);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_labels() {
        assert!(validate_subdomain("demo").is_ok());
        assert!(validate_subdomain("my-app-2").is_ok());
        assert!(validate_subdomain("a").is_ok());
        assert!(validate_subdomain(&"x".repeat(63)).is_ok());
    }

    #[test]
    fn test_invalid_labels() {
        assert_eq!(validate_subdomain(""), Err(SubdomainError::Empty));
        assert_eq!(
            validate_subdomain(&"x".repeat(64)),
            Err(SubdomainError::TooLong)
        );
        assert_eq!(
            validate_subdomain("Demo"),
            Err(SubdomainError::InvalidCharacter)
        );
        assert_eq!(
            validate_subdomain("a.b"),
            Err(SubdomainError::InvalidCharacter)
        );
        assert_eq!(validate_subdomain("-demo"), Err(SubdomainError::HyphenEdge));
        assert_eq!(validate_subdomain("demo-"), Err(SubdomainError::HyphenEdge));
    }
}
