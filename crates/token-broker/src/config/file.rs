//! TOML configuration file loading

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::builder::{ConfigBuilder, DeploymentMode};
use crate::Result;
use crate::types::KnownPrincipal;

/// Configuration file locations checked in order
const CONFIG_PATHS: &[&str] = &[
    "./token-broker.toml",
    "~/.config/token-broker/config.toml",
    "/etc/token-broker/config.toml",
];

/// Find the first existing configuration file
pub fn find_config_file() -> Option<PathBuf> {
    for path_str in CONFIG_PATHS {
        let path = if path_str.starts_with('~') {
            if let Ok(home) = std::env::var("HOME") {
                PathBuf::from(path_str.replacen('~', &home, 1))
            } else {
                continue;
            }
        } else {
            PathBuf::from(path_str)
        };

        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Load configuration from a TOML file
pub fn load_from_file(path: &Path, mut builder: ConfigBuilder) -> Result<ConfigBuilder> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        crate::Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let file_config: FileConfig = toml::from_str(&content).map_err(|e| {
        crate::Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })?;

    builder = apply_file_config(builder, file_config)?;
    Ok(builder)
}

fn apply_file_config(mut builder: ConfigBuilder, config: FileConfig) -> Result<ConfigBuilder> {
    if let Some(server) = config.server {
        if let Some(mode) = server.mode {
            builder = builder.mode(mode.parse::<DeploymentMode>()?);
        }
        if let Some(bind) = server.bind {
            builder = builder.bind(bind);
        }
        if let Some(secs) = server.handshake_timeout_secs {
            builder = builder.handshake_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = server.drain_timeout_secs {
            builder = builder.drain_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = server.call_timeout_secs {
            builder = builder.call_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = server.header_read_timeout_secs {
            builder = builder.header_read_timeout(Duration::from_secs(secs));
        }
    }

    if let Some(tls) = config.tls {
        if let Some(cert) = tls.cert {
            builder = builder.tls_cert(cert);
        }
        if let Some(key) = tls.key {
            builder = builder.tls_key(key);
        }
    }

    if let Some(identity) = config.identity {
        if let Some(issuer) = identity.issuer {
            builder = builder.issuer(parse_url("issuer", &issuer)?);
        }
        if let Some(audience) = identity.audience {
            builder = builder.audience(audience);
        }
        if let Some(uri) = identity.jwks_uri {
            builder = builder.jwks_uri(parse_url("jwks_uri", &uri)?);
        }
        if let Some(secret) = identity.hs_secret {
            builder = builder.hs_secret(secret);
        }
        if let Some(secs) = identity.clock_skew_secs {
            builder = builder.clock_skew(Duration::from_secs(secs));
        }
    }

    if let Some(store) = config.store {
        if let Some(database) = store.database {
            builder = builder.database(database);
        }
        if let Some(secs) = store.token_ttl_secs {
            builder = builder.token_ttl(Duration::from_secs(secs));
        }
    }

    if !config.principals.is_empty() {
        let principals = config
            .principals
            .into_iter()
            .map(|p| {
                p.validate().map_err(crate::Error::Config)?;
                Ok(p)
            })
            .collect::<Result<Vec<_>>>()?;
        builder = builder.principals(principals);
    }

    if let Some(cache) = config.cache {
        if let Some(enabled) = cache.enabled {
            builder = builder.cache_enabled(enabled);
        }
        if let Some(max) = cache.max_entries {
            builder = builder.cache_max_entries(max);
        }
        if let Some(secs) = cache.refresh_margin_secs {
            builder = builder.cache_refresh_margin(Duration::from_secs(secs));
        }
    }

    if let Some(audit) = config.audit {
        if let Some(capacity) = audit.buffer {
            builder = builder.audit_capacity(capacity);
        }
        if let Some(path) = audit.path {
            builder = builder.audit_path(path);
        }
    }

    // Observability settings
    if let Some(obs) = config.observability {
        if let Some(endpoint) = obs.otlp_endpoint {
            builder = builder.otlp_endpoint(Some(endpoint));
        }

        if let Some(name) = obs.service_name {
            builder = builder.service_name(name);
        }

        if let Some(level) = obs.log_level {
            builder = builder.log_level(level);
        }

        if let Some(json) = obs.json_logs {
            builder = builder.json_logs(json);
        }
    }

    Ok(builder)
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| crate::Error::Config(format!("Invalid identity {field}: {e}")))
}

/// Root configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server: Option<ServerSection>,
    tls: Option<TlsSection>,
    identity: Option<IdentitySection>,
    store: Option<StoreSection>,
    #[serde(default)]
    principals: Vec<KnownPrincipal>,
    cache: Option<CacheSection>,
    audit: Option<AuditSection>,
    observability: Option<ObservabilitySection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    mode: Option<String>,
    bind: Option<SocketAddr>,
    handshake_timeout_secs: Option<u64>,
    drain_timeout_secs: Option<u64>,
    call_timeout_secs: Option<u64>,
    header_read_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TlsSection {
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
}

#[derive(Deserialize)]
struct IdentitySection {
    issuer: Option<String>,
    audience: Option<String>,
    jwks_uri: Option<String>,
    hs_secret: Option<String>,
    clock_skew_secs: Option<u64>,
}

impl std::fmt::Debug for IdentitySection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySection")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("jwks_uri", &self.jwks_uri)
            .field("has_hs_secret", &self.hs_secret.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct StoreSection {
    database: Option<String>,
    token_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CacheSection {
    enabled: Option<bool>,
    max_entries: Option<usize>,
    refresh_margin_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AuditSection {
    buffer: Option<usize>,
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ObservabilitySection {
    otlp_endpoint: Option<String>,
    service_name: Option<String>,
    log_level: Option<String>,
    json_logs: Option<bool>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::types::AccessMode;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const FULL: &str = r#"
[server]
mode = "production"
bind = "0.0.0.0:9443"
drain_timeout_secs = 5
call_timeout_secs = 2

[tls]
cert = "/etc/token-broker/cert.pem"
key = "/etc/token-broker/key.pem"

[identity]
issuer = "https://login.example.com/tenant/v2.0/"
audience = "api://token-broker"
jwks_uri = "https://login.example.com/tenant/discovery/v2.0/keys"
clock_skew_secs = 30

[store]
database = "tenants"
token_ttl_secs = 900

[[principals]]
id = "svc-a"
permission = "gateway"
collection = "Gateway"

[[principals]]
id = "svc-b"
permission = "audit"
collection = "Audit"
mode = "all"
partition_key = "tenant-1"

[cache]
enabled = true
max_entries = 64
refresh_margin_secs = 120

[audit]
buffer = 256
path = "/var/log/token-broker/audit.jsonl"

[observability]
otlp_endpoint = "http://localhost:4317"
service_name = "broker-file"
log_level = "debug"
json_logs = true
"#;

    #[test]
    fn test_parse_full_config() {
        let config: FileConfig = toml::from_str(FULL).unwrap();

        assert!(config.server.is_some());
        assert!(config.tls.is_some());
        assert!(config.identity.is_some());
        assert_eq!(config.principals.len(), 2);
        assert_eq!(config.principals[1].mode, AccessMode::All);
        assert_eq!(config.principals[1].partition_key.as_deref(), Some("tenant-1"));
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_content = r#"
[identity]
issuer = "https://idp.example.com"
"#;

        let config: FileConfig = toml::from_str(toml_content).unwrap();
        assert!(config.identity.is_some());
        assert!(config.server.is_none());
        assert!(config.principals.is_empty());
    }

    #[test]
    fn test_unknown_section_rejected() {
        let result: std::result::Result<FileConfig, _> = toml::from_str("[connection]\nurl = \"x\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file_success() {
        let temp_file = create_temp_config(FULL);

        let config = load_from_file(temp_file.path(), ConfigBuilder::new())
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.mode, DeploymentMode::Production);
        assert_eq!(config.server.bind, "0.0.0.0:9443".parse().unwrap());
        assert_eq!(config.server.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.server.call_timeout, Duration::from_secs(2));
        assert_eq!(config.identity.audience, "api://token-broker");
        assert_eq!(config.identity.clock_skew, Duration::from_secs(30));
        assert_eq!(config.store.database, "tenants");
        assert_eq!(config.store.token_ttl, Duration::from_secs(900));
        assert_eq!(config.principals.len(), 2);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_entries, 64);
        assert_eq!(config.audit.capacity, 256);
        assert_eq!(config.telemetry.service_name, "broker-file");
        assert!(config.telemetry.json_logs);
    }

    #[test]
    fn test_file_overrides_lower_sources() {
        let temp_file = create_temp_config(FULL);
        let base = ConfigBuilder::new()
            .database("from-cli".into())
            .add_principal("svc-z:other:Other".parse().unwrap());

        let config = load_from_file(temp_file.path(), base)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.store.database, "tenants");
        assert!(config.principals.iter().all(|p| p.id.as_str() != "svc-z"));
    }

    #[test]
    fn test_load_from_file_not_found() {
        let result = load_from_file(
            Path::new("/nonexistent/path/config.toml"),
            ConfigBuilder::new(),
        );
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_from_file_invalid_toml() {
        let temp_file = create_temp_config("this is not valid toml {{{{");

        let result = load_from_file(temp_file.path(), ConfigBuilder::new());
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_from_file_invalid_issuer() {
        let toml_content = r#"
[identity]
issuer = "not a valid url"
"#;
        let temp_file = create_temp_config(toml_content);

        let result = load_from_file(temp_file.path(), ConfigBuilder::new());
        assert!(result.unwrap_err().to_string().contains("issuer"));
    }

    #[test]
    fn test_load_from_file_invalid_principal() {
        let toml_content = r#"
[[principals]]
id = "svc-a"
permission = "Not Valid"
collection = "Gateway"
"#;
        let temp_file = create_temp_config(toml_content);

        let result = load_from_file(temp_file.path(), ConfigBuilder::new());
        assert!(result.unwrap_err().is_config());
    }

    #[test]
    fn test_load_from_file_invalid_mode() {
        let temp_file = create_temp_config("[server]\nmode = \"staging\"\n");
        let result = load_from_file(temp_file.path(), ConfigBuilder::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_identity_section_debug_redacts_secret() {
        let section = IdentitySection {
            issuer: None,
            audience: None,
            jwks_uri: None,
            hs_secret: Some("hunter2".into()),
            clock_skew_secs: None,
        };
        let debug = format!("{section:?}");
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_find_config_file_does_not_panic() {
        let _ = find_config_file();
    }
}
