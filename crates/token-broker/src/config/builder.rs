//! Configuration builder

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::Error;
use crate::auth::JwtConfig;
use crate::cache::CacheConfig;
use crate::types::KnownPrincipal;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: DeploymentMode,
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub identity: JwtConfig,
    pub store: StoreConfig,
    pub principals: Vec<KnownPrincipal>,
    pub cache: CacheConfig,
    pub audit: AuditConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    #[must_use]
    pub const fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.mode, DeploymentMode::Local)
    }
}

/// Local development or production deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeploymentMode {
    #[default]
    Local,
    Production,
}

impl DeploymentMode {
    pub const DEFAULT_PORT: u16 = 8445;

    /// Loopback in local mode, all interfaces in production
    #[must_use]
    pub const fn default_bind(self) -> SocketAddr {
        let ip = match self {
            Self::Local => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::Production => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, Self::DEFAULT_PORT)
    }
}

impl FromStr for DeploymentMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "dev" | "development" => Ok(Self::Local),
            "production" | "prod" => Ok(Self::Production),
            other => Err(Error::Config(format!("Unknown deployment mode: {other}"))),
        }
    }
}

/// Listener settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Upper bound on a TLS handshake
    pub handshake_timeout: Duration,
    /// How long in-flight requests may run after shutdown starts
    pub drain_timeout: Duration,
    /// Upper bound on each identity or store call
    pub call_timeout: Duration,
    /// Upper bound on receiving request headers
    pub header_read_timeout: Duration,
}

impl ServerConfig {
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Server certificate and key, PEM encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Backing store settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Database holding every principal's collection
    pub database: String,
    /// Lifetime of tokens minted by the in-memory directory
    pub token_ttl: Duration,
}

impl StoreConfig {
    pub const DEFAULT_DATABASE: &'static str = "broker";
    pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);
}

/// Audit sink settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    /// Records buffered before new ones are dropped
    pub capacity: usize,
    /// Optional JSON-lines file, in addition to the access log
    pub path: Option<PathBuf>,
}

impl AuditConfig {
    pub const DEFAULT_CAPACITY: usize = 1024;
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
            path: None,
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "token-broker".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Configuration builder with fluent API
#[derive(Debug)]
pub struct ConfigBuilder {
    mode: DeploymentMode,
    bind: Option<SocketAddr>,
    handshake_timeout: Duration,
    drain_timeout: Duration,
    call_timeout: Duration,
    header_read_timeout: Duration,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    issuer: Option<Url>,
    audience: Option<String>,
    jwks_uri: Option<Url>,
    hs_secret: Option<String>,
    clock_skew: Duration,
    database: Option<String>,
    token_ttl: Duration,
    principals: Vec<KnownPrincipal>,
    cache: CacheConfig,
    audit_capacity: usize,
    audit_path: Option<PathBuf>,
    telemetry: TelemetryConfig,
}

impl ConfigBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: DeploymentMode::Local,
            bind: None,
            handshake_timeout: ServerConfig::DEFAULT_HANDSHAKE_TIMEOUT,
            drain_timeout: ServerConfig::DEFAULT_DRAIN_TIMEOUT,
            call_timeout: ServerConfig::DEFAULT_CALL_TIMEOUT,
            header_read_timeout: ServerConfig::DEFAULT_HEADER_READ_TIMEOUT,
            cert_path: None,
            key_path: None,
            issuer: None,
            audience: None,
            jwks_uri: None,
            hs_secret: None,
            clock_skew: JwtConfig::DEFAULT_CLOCK_SKEW,
            database: None,
            token_ttl: StoreConfig::DEFAULT_TOKEN_TTL,
            principals: Vec::new(),
            cache: CacheConfig::new(),
            audit_capacity: AuditConfig::DEFAULT_CAPACITY,
            audit_path: None,
            telemetry: TelemetryConfig {
                otlp_endpoint: None,
                service_name: String::new(),
                log_level: String::new(),
                json_logs: false,
            },
        }
    }

    #[must_use]
    pub const fn mode(mut self, mode: DeploymentMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn tls_cert(mut self, path: PathBuf) -> Self {
        self.cert_path = Some(path);
        self
    }

    #[must_use]
    pub fn tls_key(mut self, path: PathBuf) -> Self {
        self.key_path = Some(path);
        self
    }

    #[must_use]
    pub fn issuer(mut self, issuer: Url) -> Self {
        self.issuer = Some(issuer);
        self
    }

    #[must_use]
    pub fn audience(mut self, audience: String) -> Self {
        self.audience = Some(audience);
        self
    }

    #[must_use]
    pub fn jwks_uri(mut self, uri: Url) -> Self {
        self.jwks_uri = Some(uri);
        self
    }

    /// Shared HS256 secret. Only accepted in local mode.
    #[must_use]
    pub fn hs_secret(mut self, secret: String) -> Self {
        self.hs_secret = Some(secret);
        self
    }

    #[must_use]
    pub const fn clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    #[must_use]
    pub fn database(mut self, database: String) -> Self {
        self.database = Some(database);
        self
    }

    #[must_use]
    pub const fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Append one known principal
    #[must_use]
    pub fn add_principal(mut self, principal: KnownPrincipal) -> Self {
        self.principals.push(principal);
        self
    }

    /// Replace the known principal list. Used by higher-precedence sources.
    #[must_use]
    pub fn principals(mut self, principals: Vec<KnownPrincipal>) -> Self {
        self.principals = principals;
        self
    }

    #[must_use]
    pub const fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache.enabled = enabled;
        self
    }

    #[must_use]
    pub const fn cache_max_entries(mut self, max: usize) -> Self {
        self.cache.max_entries = max;
        self
    }

    #[must_use]
    pub const fn cache_refresh_margin(mut self, margin: Duration) -> Self {
        self.cache.refresh_margin = margin;
        self
    }

    #[must_use]
    pub const fn audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = capacity;
        self
    }

    #[must_use]
    pub fn audit_path(mut self, path: PathBuf) -> Self {
        self.audit_path = Some(path);
        self
    }

    #[must_use]
    pub fn otlp_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.telemetry.otlp_endpoint = endpoint;
        self
    }

    #[must_use]
    pub fn service_name(mut self, name: String) -> Self {
        self.telemetry.service_name = name;
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: String) -> Self {
        self.telemetry.log_level = level;
        self
    }

    #[must_use]
    pub const fn json_logs(mut self, enabled: bool) -> Self {
        self.telemetry.json_logs = enabled;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> crate::Result<Config> {
        let issuer = self
            .issuer
            .ok_or_else(|| Error::Config("identity issuer is required".into()))?;
        let audience = self
            .audience
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::Config("identity audience is required".into()))?;

        if self.principals.is_empty() {
            return Err(Error::Config(
                "at least one known principal is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for principal in &self.principals {
            principal.validate().map_err(Error::Config)?;
            if !seen.insert(&principal.id) {
                return Err(Error::Config(format!(
                    "duplicate known principal: {}",
                    principal.id
                )));
            }
        }
        for (i, a) in self.principals.iter().enumerate() {
            if let Some(b) = self.principals[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(Error::Config(format!(
                    "principals {} and {} share a scope in collection {}",
                    a.id, b.id, a.collection
                )));
            }
        }

        let cert_path = self
            .cert_path
            .ok_or_else(|| Error::Config("TLS certificate path is required".into()))?;
        let key_path = self
            .key_path
            .ok_or_else(|| Error::Config("TLS private key path is required".into()))?;

        let mut identity = JwtConfig::new(issuer, audience).with_clock_skew(self.clock_skew);
        if let Some(uri) = self.jwks_uri {
            identity = identity.with_jwks_uri(uri);
        }
        if let Some(secret) = self.hs_secret {
            if self.mode == DeploymentMode::Production {
                return Err(Error::Config(
                    "a shared HS secret is only allowed in local mode".into(),
                ));
            }
            identity = identity.with_hs_secret(secret);
        }

        for (name, value) in [
            ("handshake", self.handshake_timeout),
            ("header read", self.header_read_timeout),
            ("call", self.call_timeout),
            ("drain", self.drain_timeout),
            ("token TTL", self.token_ttl),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} duration must be non-zero")));
            }
        }

        let database = self
            .database
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| StoreConfig::DEFAULT_DATABASE.to_string());

        // Apply defaults for telemetry
        let defaults = TelemetryConfig::default();
        let telemetry = TelemetryConfig {
            service_name: non_empty_or(self.telemetry.service_name, defaults.service_name),
            log_level: non_empty_or(self.telemetry.log_level, defaults.log_level),
            ..self.telemetry
        };

        Ok(Config {
            mode: self.mode,
            server: ServerConfig {
                bind: self.bind.unwrap_or_else(|| self.mode.default_bind()),
                handshake_timeout: self.handshake_timeout,
                drain_timeout: self.drain_timeout,
                call_timeout: self.call_timeout,
                header_read_timeout: self.header_read_timeout,
            },
            tls: TlsConfig {
                cert_path,
                key_path,
            },
            identity,
            store: StoreConfig {
                database,
                token_ttl: self.token_ttl,
            },
            principals: self.principals,
            cache: self.cache,
            audit: AuditConfig {
                capacity: self.audit_capacity.max(1),
                path: self.audit_path,
            },
            telemetry,
        })
    }
}

fn non_empty_or(value: String, default: String) -> String {
    if value.is_empty() { default } else { value }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
