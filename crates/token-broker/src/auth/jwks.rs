//! JWKS fetching and caching

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::RwLock;
use serde::Deserialize;
use url::Url;

use super::config::JwtConfig;
use super::error::{AuthError, Result};

/// Minimum spacing between forced refreshes triggered by unknown `kid`s
const FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// JSON Web Key
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    #[serde(default)]
    pub kid: Option<String>,
    pub kty: String,
    #[serde(default)]
    pub alg: Option<String>,
    // RSA components
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    // EC components
    #[serde(default)]
    pub crv: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
}

/// JSON Web Key Set
#[derive(Debug, Clone, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// The part of an OpenID provider metadata document we need
#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    jwks_uri: Url,
}

#[derive(Clone)]
struct JwkEntry {
    key: DecodingKey,
    algorithm: Algorithm,
}

/// Thread-safe JWKS cache
pub struct JwksCache {
    keys: RwLock<HashMap<String, JwkEntry>>,
    unnamed_keys: RwLock<Vec<JwkEntry>>,
    jwks_uri: Url,
    client: reqwest::Client,
    ttl: Duration,
    last_refresh: RwLock<Option<Instant>>,
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache")
            .field("jwks_uri", &self.jwks_uri)
            .field("ttl", &self.ttl)
            .field("keys_count", &self.keys.read().len())
            .finish_non_exhaustive()
    }
}

impl JwksCache {
    pub fn new(jwks_uri: Url, ttl: Duration, http_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| AuthError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(jwks_uri, ttl, client))
    }

    #[must_use]
    pub fn with_client(jwks_uri: Url, ttl: Duration, client: reqwest::Client) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            unnamed_keys: RwLock::new(Vec::new()),
            jwks_uri,
            client,
            ttl,
            last_refresh: RwLock::new(None),
        }
    }

    /// Build a cache for `config`, resolving the JWKS URI through OIDC
    /// discovery when it is not configured.
    pub async fn from_config(config: &JwtConfig) -> Result<Self> {
        if let Some(uri) = &config.jwks_uri {
            return Self::new(uri.clone(), config.jwks_cache_ttl, config.http_timeout);
        }

        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AuthError::Config(format!("Failed to build HTTP client: {e}")))?;

        let discovery = config
            .discovery_url()
            .map_err(|e| AuthError::Config(format!("Invalid issuer URL: {e}")))?;

        tracing::debug!(url = %discovery, "Fetching OpenID provider metadata");

        let metadata: ProviderMetadata = client
            .get(discovery.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::DiscoveryFailed(format!("{discovery}: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::DiscoveryFailed(format!("{discovery}: {e}")))?;

        tracing::info!(jwks_uri = %metadata.jwks_uri, "OIDC discovery complete");
        Ok(Self::with_client(metadata.jwks_uri, config.jwks_cache_ttl, client))
    }

    #[must_use]
    pub const fn jwks_uri(&self) -> &Url {
        &self.jwks_uri
    }

    /// Get key for validation
    pub async fn get_key(&self, kid: Option<&str>, alg: Algorithm) -> Result<DecodingKey> {
        if self.needs_refresh() {
            self.refresh().await?;
        }

        if let Some(key) = self.lookup(kid, alg) {
            return Ok(key);
        }

        // Signing keys rotate; an unknown kid may be newer than our copy.
        if kid.is_some() && self.may_force_refresh() {
            self.refresh().await?;
            if let Some(key) = self.lookup(kid, alg) {
                return Ok(key);
            }
        }

        match kid {
            Some(kid) => Err(AuthError::KeyNotFound(kid.to_string())),
            None => Err(AuthError::NoMatchingKey),
        }
    }

    fn lookup(&self, kid: Option<&str>, alg: Algorithm) -> Option<DecodingKey> {
        if let Some(kid) = kid {
            return self
                .keys
                .read()
                .get(kid)
                .filter(|entry| entry.algorithm == alg)
                .map(|entry| entry.key.clone());
        }

        let unnamed = self
            .unnamed_keys
            .read()
            .iter()
            .find(|entry| entry.algorithm == alg)
            .map(|entry| entry.key.clone());

        unnamed.or_else(|| {
            self.keys
                .read()
                .values()
                .find(|entry| entry.algorithm == alg)
                .map(|entry| entry.key.clone())
        })
    }

    /// Refresh JWKS from remote
    pub async fn refresh(&self) -> Result<()> {
        tracing::debug!(jwks_uri = %self.jwks_uri, "Refreshing JWKS");

        let response = self
            .client
            .get(self.jwks_uri.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(AuthError::JwksFetch)?;

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::JwksParse(e.to_string()))?;

        self.install(jwks)
    }

    fn install(&self, jwks: JwkSet) -> Result<()> {
        let mut keys = HashMap::new();
        let mut unnamed = Vec::new();

        for jwk in jwks.keys {
            if let Some((key, algorithm)) = decode_jwk(&jwk)? {
                let entry = JwkEntry { key, algorithm };
                match jwk.kid {
                    Some(kid) => {
                        keys.insert(kid, entry);
                    }
                    None => unnamed.push(entry),
                }
            }
        }

        let count = keys.len() + unnamed.len();
        *self.keys.write() = keys;
        *self.unnamed_keys.write() = unnamed;
        *self.last_refresh.write() = Some(Instant::now());

        tracing::info!(keys_count = count, "JWKS refreshed successfully");
        Ok(())
    }

    fn needs_refresh(&self) -> bool {
        self.last_refresh
            .read()
            .is_none_or(|t| t.elapsed() > self.ttl)
    }

    fn may_force_refresh(&self) -> bool {
        self.last_refresh
            .read()
            .is_none_or(|t| t.elapsed() > FORCED_REFRESH_INTERVAL)
    }
}

fn decode_jwk(jwk: &Jwk) -> Result<Option<(DecodingKey, Algorithm)>> {
    let alg = match jwk.alg.as_deref() {
        Some("RS256") => Algorithm::RS256,
        Some("RS384") => Algorithm::RS384,
        Some("RS512") => Algorithm::RS512,
        Some("ES256") => Algorithm::ES256,
        Some("ES384") => Algorithm::ES384,
        None => match (jwk.kty.as_str(), jwk.crv.as_deref()) {
            ("RSA", _) => Algorithm::RS256,
            ("EC", Some("P-256")) => Algorithm::ES256,
            ("EC", Some("P-384")) => Algorithm::ES384,
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };

    let key = match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk
                .n
                .as_ref()
                .ok_or_else(|| AuthError::JwksParse("Missing 'n' in RSA key".into()))?;
            let e = jwk
                .e
                .as_ref()
                .ok_or_else(|| AuthError::JwksParse("Missing 'e' in RSA key".into()))?;
            DecodingKey::from_rsa_components(n, e)
                .map_err(|e| AuthError::JwksParse(format!("Invalid RSA components: {e}")))?
        }
        "EC" => {
            let x = jwk
                .x
                .as_ref()
                .ok_or_else(|| AuthError::JwksParse("Missing 'x' in EC key".into()))?;
            let y = jwk
                .y
                .as_ref()
                .ok_or_else(|| AuthError::JwksParse("Missing 'y' in EC key".into()))?;
            DecodingKey::from_ec_components(x, y)
                .map_err(|e| AuthError::JwksParse(format!("Invalid EC components: {e}")))?
        }
        other => {
            tracing::debug!(kty = other, "Skipping unsupported key type");
            return Ok(None);
        }
    };

    Ok(Some((key, alg)))
}
