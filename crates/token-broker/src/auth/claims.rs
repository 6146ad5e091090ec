//! JWT claims types

use serde::Deserialize;

use super::error::AuthError;
use crate::types::PrincipalId;

/// Registered claims the broker reads from a bearer token
///
/// `aud` and `nbf` are checked by `jsonwebtoken` during decoding and are not kept.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub iss: String,
    pub exp: i64,
}

/// Claims that passed verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims {
    pub subject: PrincipalId,
    pub issuer: String,
    pub expires_at: i64,
}

impl TryFrom<JwtClaims> for VerifiedClaims {
    type Error = AuthError;

    fn try_from(claims: JwtClaims) -> Result<Self, Self::Error> {
        let subject = PrincipalId::new(claims.sub).map_err(AuthError::InvalidSubject)?;
        Ok(Self {
            subject,
            issuer: claims.iss,
            expires_at: claims.exp,
        })
    }
}
