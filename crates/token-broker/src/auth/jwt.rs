//! JWT parsing and validation

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode_header};

use super::IdentityVerifier;
use super::claims::{JwtClaims, VerifiedClaims};
use super::config::JwtConfig;
use super::error::{AuthError, Result};
use super::jwks::JwksCache;

/// Bearer token verifier bound to one issuer and audience
pub struct JwtVerifier {
    config: JwtConfig,
    jwks_cache: Option<Arc<JwksCache>>,
    hs_key: Option<DecodingKey>,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("issuer", &self.config.issuer)
            .field("audience", &self.config.audience)
            .field("has_jwks_cache", &self.jwks_cache.is_some())
            .field("has_hs_key", &self.hs_key.is_some())
            .finish()
    }
}

impl JwtVerifier {
    #[must_use]
    pub fn new(config: JwtConfig, jwks_cache: Option<Arc<JwksCache>>) -> Self {
        let hs_key = config
            .hs_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));
        Self {
            config,
            jwks_cache,
            hs_key,
        }
    }

    /// Build a verifier from configuration, setting up a JWKS cache unless a
    /// shared secret is the only key source.
    pub async fn from_config(config: JwtConfig) -> Result<Self> {
        if config.hs_secret.is_some() && config.jwks_uri.is_none() {
            return Ok(Self::new(config, None));
        }

        let cache = JwksCache::from_config(&config).await?;
        Ok(Self::new(config, Some(Arc::new(cache))))
    }

    pub async fn validate(&self, token: &str) -> Result<VerifiedClaims> {
        let header = decode_header(token).map_err(|_| AuthError::InvalidToken)?;

        let key = self
            .get_decoding_key(header.kid.as_deref(), header.alg)
            .await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.config.expected_issuer()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.validate_nbf = true;
        validation.leeway = self.config.clock_skew.as_secs();

        let token_data = jsonwebtoken::decode::<JwtClaims>(token, &key, &validation)?;

        VerifiedClaims::try_from(token_data.claims)
    }

    async fn get_decoding_key(&self, kid: Option<&str>, alg: Algorithm) -> Result<DecodingKey> {
        if matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return self.hs_key.clone().ok_or(AuthError::NoMatchingKey);
        }

        let jwks_cache = self.jwks_cache.as_ref().ok_or(AuthError::NoMatchingKey)?;

        jwks_cache.get_key(kid, alg).await
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, bearer: &str) -> Result<VerifiedClaims> {
        self.validate(bearer).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;
    use url::Url;

    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-bytes-long";
    const ISSUER: &str = "https://login.example.com/tenant/v2.0";

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        iss: String,
        exp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        aud: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nbf: Option<i64>,
    }

    impl TestClaims {
        fn valid(sub: &str) -> Self {
            Self {
                sub: sub.to_string(),
                iss: ISSUER.to_string(),
                exp: current_time() + 3600,
                aud: Some("broker".to_string()),
                nbf: None,
            }
        }
    }

    fn create_test_token(claims: &TestClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn current_time() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn verifier() -> JwtVerifier {
        let config = JwtConfig::new(Url::parse(&format!("{ISSUER}/")).unwrap(), "broker")
            .with_hs_secret(SECRET.to_string())
            .with_clock_skew(Duration::from_secs(5));
        JwtVerifier::new(config, None)
    }

    #[tokio::test]
    async fn test_validate_valid_token() {
        let token = create_test_token(&TestClaims::valid("svc-a"), SECRET);
        let claims = verifier().verify(&token).await.unwrap();

        assert_eq!(claims.subject.as_str(), "svc-a");
        assert_eq!(claims.issuer, ISSUER);
    }

    #[tokio::test]
    async fn test_validate_expired_token() {
        let mut claims = TestClaims::valid("svc-a");
        claims.exp = current_time() - 3600;
        let token = create_test_token(&claims, SECRET);

        let result = verifier().verify(&token).await;
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }

    #[tokio::test]
    async fn test_validate_not_yet_valid_token() {
        let mut claims = TestClaims::valid("svc-a");
        claims.nbf = Some(current_time() + 600);
        let token = create_test_token(&claims, SECRET);

        let result = verifier().verify(&token).await;
        assert!(matches!(result, Err(AuthError::TokenNotYetValid)));
    }

    #[tokio::test]
    async fn test_validate_wrong_issuer() {
        let mut claims = TestClaims::valid("svc-a");
        claims.iss = "https://wrong-issuer.com".to_string();
        let token = create_test_token(&claims, SECRET);

        let result = verifier().verify(&token).await;
        assert!(matches!(result, Err(AuthError::InvalidIssuer)));
    }

    #[tokio::test]
    async fn test_validate_wrong_secret() {
        let token = create_test_token(
            &TestClaims::valid("svc-a"),
            "wrong-secret-key-at-least-32-bytes",
        );

        let result = verifier().verify(&token).await;
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[tokio::test]
    async fn test_validate_wrong_audience() {
        let mut claims = TestClaims::valid("svc-a");
        claims.aud = Some("someone-else".to_string());
        let token = create_test_token(&claims, SECRET);

        let result = verifier().verify(&token).await;
        assert!(matches!(result, Err(AuthError::InvalidAudience)));
    }

    #[tokio::test]
    async fn test_validate_missing_audience() {
        let mut claims = TestClaims::valid("svc-a");
        claims.aud = None;
        let token = create_test_token(&claims, SECRET);

        assert!(verifier().verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_malformed_token() {
        let result = verifier().verify("not.a.valid.token").await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_hs_token_without_secret() {
        let config = JwtConfig::new(Url::parse(ISSUER).unwrap(), "broker");
        let verifier = JwtVerifier::new(config, None);
        let token = create_test_token(&TestClaims::valid("svc-a"), SECRET);

        let result = verifier.verify(&token).await;
        assert!(matches!(result, Err(AuthError::NoMatchingKey)));
    }

    #[tokio::test]
    async fn test_from_config_with_secret_skips_jwks() {
        let config =
            JwtConfig::new(Url::parse(ISSUER).unwrap(), "broker").with_hs_secret(SECRET.into());
        let verifier = JwtVerifier::from_config(config).await.unwrap();
        assert!(verifier.jwks_cache.is_none());
    }
}
