//! Broker that exchanges verified workload identities for scoped database tokens
//!
//! A caller presents an identity token over TLS; the broker verifies it, looks the
//! caller up in the store directory and returns a short-lived token limited to the
//! caller's own permission. Every attempt leaves one audit record.

pub mod audit;
pub mod auth;
pub mod bootstrap;
pub mod cache;
pub mod client;
pub mod config;
mod constants;
pub mod directory;
mod error;
pub mod issuer;
pub mod observability;
pub mod server;
pub mod types;

pub use audit::{AuditRecord, AuditSink, AuditWorker, AuditWriter, Outcome};
pub use auth::{AuthError, IdentityVerifier, JwtConfig, JwtVerifier, VerifiedClaims};
pub use bootstrap::{BootstrapAction, BootstrapReport, configure_permissions};
pub use cache::{CacheConfig, CacheStats, TokenCache};
pub use client::{ClientError, ClientResult, TokenClient};
pub use config::{Config, ConfigBuilder, DeploymentMode, TelemetryConfig};
pub use directory::{InMemoryDirectory, StoreDirectory, StoreError, StorePermission, StoreUser};
pub use error::{Error, Result};
pub use issuer::{IssuanceError, IssueRequest, TokenIssuer, TokenResponse};
pub use server::{BrokerServer, ServerState, serve};
pub use types::*;
