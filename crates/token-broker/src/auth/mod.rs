//! Caller identity verification
//!
//! The broker trusts one identity provider: bearer tokens must carry the
//! configured issuer and audience and a subject that names a store principal.
//!
//! # Key sources
//!
//! - JWKS (RS*/ES*), discovered through `{issuer}/.well-known/openid-configuration`
//!   unless a JWKS URI is configured; keys are cached and refreshed on TTL or
//!   on an unknown `kid`
//! - Shared HS* secret, accepted only in local deployment mode

mod claims;
mod config;
mod error;
mod jwks;
mod jwt;

use std::fmt::Debug;

use async_trait::async_trait;

pub use claims::{JwtClaims, VerifiedClaims};
pub use config::JwtConfig;
pub use error::{AuthError, Result};
pub use jwks::{JwkSet, JwksCache};
pub use jwt::JwtVerifier;

/// Validates bearer tokens against a fixed issuer and audience
#[async_trait]
pub trait IdentityVerifier: Send + Sync + Debug {
    async fn verify(&self, bearer: &str) -> Result<VerifiedClaims>;
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    let header = header.ok_or(AuthError::MissingCredentials)?;
    let (scheme, token) = header
        .split_once(' ')
        .ok_or(AuthError::MalformedHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MalformedHeader);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_ok() {
        assert_eq!(bearer_token(Some("Bearer abc.def")).unwrap(), "abc.def");
        assert_eq!(bearer_token(Some("bearer  abc")).unwrap(), "abc");
    }

    #[test]
    fn test_bearer_token_missing() {
        assert!(matches!(
            bearer_token(None),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn test_bearer_token_wrong_scheme() {
        assert!(matches!(
            bearer_token(Some("Basic dXNlcjpwYXNz")),
            Err(AuthError::MalformedHeader)
        ));
        assert!(matches!(
            bearer_token(Some("Bearer")),
            Err(AuthError::MalformedHeader)
        ));
        assert!(matches!(
            bearer_token(Some("Bearer   ")),
            Err(AuthError::MalformedHeader)
        ));
    }
}
