//! Identity verification settings

use std::time::Duration;

use url::Url;

/// JWT/OIDC configuration
#[derive(Clone)]
pub struct JwtConfig {
    /// Expected `iss` claim; also the base for OIDC discovery
    pub issuer: Url,
    /// Expected `aud` claim
    pub audience: String,
    /// JWKS URI (if not using OIDC discovery)
    pub jwks_uri: Option<Url>,
    /// Clock skew tolerance for exp/nbf validation
    pub clock_skew: Duration,
    /// HS256/384/512 secret for symmetric signing (local mode only)
    pub hs_secret: Option<String>,
    /// JWKS cache TTL
    pub jwks_cache_ttl: Duration,
    /// Timeout for discovery and JWKS requests
    pub http_timeout: Duration,
}

// Custom Debug impl that redacts hs_secret
impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("jwks_uri", &self.jwks_uri)
            .field("clock_skew", &self.clock_skew)
            .field("has_hs_secret", &self.hs_secret.is_some())
            .field("jwks_cache_ttl", &self.jwks_cache_ttl)
            .finish_non_exhaustive()
    }
}

impl JwtConfig {
    pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(60);
    pub const DEFAULT_JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);
    pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

    #[must_use]
    pub fn new(issuer: Url, audience: impl Into<String>) -> Self {
        Self {
            issuer,
            audience: audience.into(),
            jwks_uri: None,
            clock_skew: Self::DEFAULT_CLOCK_SKEW,
            hs_secret: None,
            jwks_cache_ttl: Self::DEFAULT_JWKS_CACHE_TTL,
            http_timeout: Self::DEFAULT_HTTP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_jwks_uri(mut self, uri: Url) -> Self {
        self.jwks_uri = Some(uri);
        self
    }

    #[must_use]
    pub fn with_hs_secret(mut self, secret: String) -> Self {
        self.hs_secret = Some(secret);
        self
    }

    #[must_use]
    pub const fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// `iss` as it appears in tokens: the configured URL without a trailing slash.
    #[must_use]
    pub fn expected_issuer(&self) -> &str {
        self.issuer.as_str().trim_end_matches('/')
    }

    /// `{issuer}/.well-known/openid-configuration`
    pub fn discovery_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!(
            "{}/.well-known/openid-configuration",
            self.expected_issuer()
        ))
    }
}
