use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use token_broker::config::{self, ConfigBuilder, DeploymentMode};
use token_broker::observability::{init_observability, shutdown_observability};
use token_broker::{InMemoryDirectory, JwtVerifier, KnownPrincipal, server};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "token-broker")]
#[command(about = "Exchange workload identities for scoped database tokens", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Deployment mode (local or production)
    #[arg(long)]
    mode: Option<DeploymentMode>,

    /// Listen address (default depends on mode)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Server certificate chain (PEM)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Identity issuer URL
    #[arg(long)]
    issuer: Option<Url>,

    /// Expected identity token audience
    #[arg(long)]
    audience: Option<String>,

    /// JWKS endpoint (discovered from the issuer when unset)
    #[arg(long)]
    jwks_uri: Option<Url>,

    /// Known principal as id:permission:collection[:mode[:partition]], repeatable
    #[arg(long = "principal", value_name = "ID:PERMISSION:COLLECTION")]
    principals: Vec<KnownPrincipal>,

    /// Store database name
    #[arg(long)]
    database: Option<String>,

    /// Reuse issued tokens until they near expiry
    #[arg(long)]
    cache: bool,

    /// Append audit records as JSON lines to this file
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Enable JSON logging output
    #[arg(long)]
    json_logs: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// CLI layer; file and environment are applied over it.
    fn into_builder(self) -> ConfigBuilder {
        let mut builder = ConfigBuilder::new()
            .principals(self.principals)
            .cache_enabled(self.cache)
            .json_logs(self.json_logs);

        if let Some(mode) = self.mode {
            builder = builder.mode(mode);
        }
        if let Some(addr) = self.bind {
            builder = builder.bind(addr);
        }
        if let Some(path) = self.tls_cert {
            builder = builder.tls_cert(path);
        }
        if let Some(path) = self.tls_key {
            builder = builder.tls_key(path);
        }
        if let Some(issuer) = self.issuer {
            builder = builder.issuer(issuer);
        }
        if let Some(audience) = self.audience {
            builder = builder.audience(audience);
        }
        if let Some(uri) = self.jwks_uri {
            builder = builder.jwks_uri(uri);
        }
        if let Some(database) = self.database {
            builder = builder.database(database);
        }
        if let Some(path) = self.audit_log {
            builder = builder.audit_path(path);
        }
        if self.verbose {
            builder = builder.log_level("debug".to_string());
        }
        builder
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone();
    let base = args.into_builder();

    // Precedence: env > file > CLI > defaults
    let builder = match config_path {
        Some(path) => config::load_config_from_path(&path, base)?,
        None => config::load_config(base)?,
    };
    let config = builder.build()?;

    init_observability(&config.telemetry)?;

    tracing::info!("Starting token broker");
    tracing::info!("Mode: {:?}", config.mode);
    tracing::info!("Bind: {}", config.server.bind);
    tracing::info!("Issuer: {}", config.identity.expected_issuer());
    tracing::info!("Database: {}", config.store.database);
    tracing::info!("Known principals: {}", config.principals.len());
    tracing::info!("Token cache enabled: {}", config.cache.enabled);
    if let Some(path) = &config.audit.path {
        tracing::info!("Audit log: {}", path.display());
    }

    let verifier = Arc::new(JwtVerifier::from_config(config.identity.clone()).await?);
    let directory = Arc::new(InMemoryDirectory::new().with_token_ttl(config.store.token_ttl));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        signal.cancel();
    });

    let result = server::serve(&config, verifier, directory, shutdown).await;

    shutdown_observability();

    result.map_err(Into::into)
}
