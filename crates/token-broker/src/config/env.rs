//! Environment variable loading for configuration

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use super::builder::{ConfigBuilder, DeploymentMode};
use crate::types::KnownPrincipal;
use crate::{Error, Result};

/// Environment variable names
mod vars {
    pub const BROKER_MODE: &str = "BROKER_MODE";
    pub const BROKER_BIND: &str = "BROKER_BIND";
    pub const BROKER_TLS_CERT: &str = "BROKER_TLS_CERT";
    pub const BROKER_TLS_KEY: &str = "BROKER_TLS_KEY";
    pub const BROKER_ISSUER: &str = "BROKER_ISSUER";
    pub const BROKER_AUDIENCE: &str = "BROKER_AUDIENCE";
    pub const BROKER_JWKS_URI: &str = "BROKER_JWKS_URI";
    pub const BROKER_HS_SECRET: &str = "BROKER_HS_SECRET";
    pub const BROKER_DATABASE: &str = "BROKER_DATABASE";
    pub const BROKER_TOKEN_TTL_SECS: &str = "BROKER_TOKEN_TTL_SECS";
    pub const BROKER_PRINCIPALS: &str = "BROKER_PRINCIPALS";
    pub const BROKER_CALL_TIMEOUT_SECS: &str = "BROKER_CALL_TIMEOUT_SECS";
    pub const BROKER_DRAIN_TIMEOUT_SECS: &str = "BROKER_DRAIN_TIMEOUT_SECS";
    pub const BROKER_CACHE_ENABLED: &str = "BROKER_CACHE_ENABLED";
    pub const BROKER_AUDIT_LOG: &str = "BROKER_AUDIT_LOG";
    pub const OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
    pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
    pub const RUST_LOG: &str = "RUST_LOG";
    pub const BROKER_JSON_LOGS: &str = "BROKER_JSON_LOGS";
}

/// Load configuration from environment variables
pub fn load_from_env(mut builder: ConfigBuilder) -> Result<ConfigBuilder> {
    if let Ok(mode) = env::var(vars::BROKER_MODE) {
        builder = builder.mode(mode.parse::<DeploymentMode>()?);
    }

    if let Ok(bind) = env::var(vars::BROKER_BIND) {
        let addr = bind
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("Invalid {}: {e}", vars::BROKER_BIND)))?;
        builder = builder.bind(addr);
    }

    // TLS
    if let Ok(path) = env::var(vars::BROKER_TLS_CERT) {
        builder = builder.tls_cert(PathBuf::from(path));
    }
    if let Ok(path) = env::var(vars::BROKER_TLS_KEY) {
        builder = builder.tls_key(PathBuf::from(path));
    }

    // Identity
    if let Ok(issuer) = env::var(vars::BROKER_ISSUER) {
        builder = builder.issuer(parse_url(vars::BROKER_ISSUER, &issuer)?);
    }
    if let Ok(audience) = env::var(vars::BROKER_AUDIENCE) {
        builder = builder.audience(audience);
    }
    if let Ok(uri) = env::var(vars::BROKER_JWKS_URI) {
        builder = builder.jwks_uri(parse_url(vars::BROKER_JWKS_URI, &uri)?);
    }
    if let Ok(secret) = env::var(vars::BROKER_HS_SECRET) {
        builder = builder.hs_secret(secret);
    }

    // Store
    if let Ok(database) = env::var(vars::BROKER_DATABASE) {
        builder = builder.database(database);
    }
    if let Ok(secs) = env::var(vars::BROKER_TOKEN_TTL_SECS)
        && let Ok(secs) = secs.parse::<u64>()
    {
        builder = builder.token_ttl(Duration::from_secs(secs));
    }

    if let Ok(list) = env::var(vars::BROKER_PRINCIPALS) {
        builder = builder.principals(parse_principals(&list)?);
    }

    // Timeouts
    if let Ok(secs) = env::var(vars::BROKER_CALL_TIMEOUT_SECS)
        && let Ok(secs) = secs.parse::<u64>()
    {
        builder = builder.call_timeout(Duration::from_secs(secs));
    }
    if let Ok(secs) = env::var(vars::BROKER_DRAIN_TIMEOUT_SECS)
        && let Ok(secs) = secs.parse::<u64>()
    {
        builder = builder.drain_timeout(Duration::from_secs(secs));
    }

    if let Ok(val) = env::var(vars::BROKER_CACHE_ENABLED) {
        builder = builder.cache_enabled(parse_bool(&val));
    }

    if let Ok(path) = env::var(vars::BROKER_AUDIT_LOG) {
        builder = builder.audit_path(PathBuf::from(path));
    }

    // Telemetry
    if let Ok(endpoint) = env::var(vars::OTEL_EXPORTER_OTLP_ENDPOINT) {
        builder = builder.otlp_endpoint(Some(endpoint));
    }

    if let Ok(name) = env::var(vars::OTEL_SERVICE_NAME) {
        builder = builder.service_name(name);
    }

    if let Ok(level) = env::var(vars::RUST_LOG) {
        builder = builder.log_level(level);
    }

    if let Ok(val) = env::var(vars::BROKER_JSON_LOGS) {
        builder = builder.json_logs(parse_bool(&val));
    }

    Ok(builder)
}

fn parse_url(var: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| Error::Config(format!("Invalid {var}: {e}")))
}

/// Comma-separated `id:permission:collection[:mode[:partition]]` entries
fn parse_principals(list: &str) -> Result<Vec<KnownPrincipal>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<KnownPrincipal>()
                .map_err(|e| Error::Config(format!("Invalid {}: {e}", vars::BROKER_PRINCIPALS)))
        })
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
