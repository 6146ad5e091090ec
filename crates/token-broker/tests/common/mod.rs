//! Shared fixtures: self-signed TLS material, HS256 identity tokens, a
//! counting/faulting store directory and a broker running on an ephemeral port.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use token_broker::audit::{self, AuditError, AuditRecord, AuditWorker, AuditWriter};
use token_broker::directory::StoreResult;
use token_broker::{
    BrokerServer, Config, ConfigBuilder, InMemoryDirectory, JwtVerifier, KnownPrincipal,
    PrincipalId, ScopedAccessToken, ServerState, StoreDirectory, StoreError, StorePermission,
    StoreUser, TokenClient, TokenIssuer, configure_permissions,
};

pub const ISSUER: &str = "https://login.test.local/tenant";
pub const AUDIENCE: &str = "token-broker";
pub const SECRET: &str = "integration-secret-at-least-32-bytes";

/// Self-signed certificate for `localhost` written to a temp dir
pub struct TestCerts {
    _dir: TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_pem: String,
}

impl TestCerts {
    pub fn generate() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_pem = cert.serialize_pem().unwrap();
        let key_pem = cert.serialize_private_key_pem();

        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, &cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();

        Self {
            _dir: dir,
            cert_path,
            key_path,
            cert_pem,
        }
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    iss: &'a str,
    aud: &'a str,
    exp: i64,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn sign(claims: &Claims<'_>, secret: &str) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

/// Identity token for `subject`, valid for an hour
pub fn valid_token(subject: &str) -> String {
    sign(
        &Claims {
            sub: subject,
            iss: ISSUER,
            aud: AUDIENCE,
            exp: now() + 3600,
        },
        SECRET,
    )
}

/// Identity token that expired well beyond the clock-skew leeway
pub fn expired_token(subject: &str) -> String {
    sign(
        &Claims {
            sub: subject,
            iss: ISSUER,
            aud: AUDIENCE,
            exp: now() - 3600,
        },
        SECRET,
    )
}

/// Correct claims signed with the wrong key
pub fn forged_token(subject: &str) -> String {
    sign(
        &Claims {
            sub: subject,
            iss: ISSUER,
            aud: AUDIENCE,
            exp: now() + 3600,
        },
        "some-other-secret-that-is-also-long-enough",
    )
}

pub fn principal(spec: &str) -> KnownPrincipal {
    spec.parse().unwrap()
}

pub fn id(value: &str) -> PrincipalId {
    PrincipalId::new(value).unwrap()
}

/// Wraps the in-memory directory, counting calls and injecting faults
#[derive(Debug, Default)]
pub struct CountingDirectory {
    pub inner: InMemoryDirectory,
    gets: AtomicUsize,
    creates: AtomicUsize,
    mints: AtomicUsize,
    unavailable: AtomicBool,
    mint_delay: Mutex<Option<Duration>>,
}

impl CountingDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn mints(&self) -> usize {
        self.mints.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.gets() + self.creates() + self.mints()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn set_mint_delay(&self, delay: Option<Duration>) {
        *self.mint_delay.lock() = delay;
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreDirectory for CountingDirectory {
    async fn get_user(&self, principal: &PrincipalId) -> StoreResult<StoreUser> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get_user(principal).await
    }

    async fn create_user_with_permission(
        &self,
        principal: &PrincipalId,
        permission: &StorePermission,
    ) -> StoreResult<StoreUser> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner
            .create_user_with_permission(principal, permission)
            .await
    }

    async fn create_permission(
        &self,
        principal: &PrincipalId,
        permission: &StorePermission,
    ) -> StoreResult<StorePermission> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.create_permission(principal, permission).await
    }

    async fn mint_token(
        &self,
        user: &StoreUser,
        permission: &str,
    ) -> StoreResult<ScopedAccessToken> {
        self.mints.fetch_add(1, Ordering::SeqCst);
        let delay = *self.mint_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.inner.mint_token(user, permission).await
    }
}

/// Audit writer keeping every record in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryAudit {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAudit {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AuditWriter for MemoryAudit {
    async fn write(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Config pointing at `certs`, accepting HS256 identity tokens
pub fn config_builder(certs: &TestCerts, principals: &[&str]) -> ConfigBuilder {
    let mut builder = ConfigBuilder::new()
        .bind("127.0.0.1:0".parse().unwrap())
        .tls_cert(certs.cert_path.clone())
        .tls_key(certs.key_path.clone())
        .issuer(ISSUER.parse().unwrap())
        .audience(AUDIENCE.to_string())
        .hs_secret(SECRET.to_string())
        .database("appdb".to_string());
    for spec in principals {
        builder = builder.add_principal(principal(spec));
    }
    builder
}

/// Broker running in a background task
pub struct Harness {
    pub certs: TestCerts,
    pub config: Config,
    pub directory: Arc<CountingDirectory>,
    pub audit: MemoryAudit,
    pub client: TokenClient,
    pub state: watch::Receiver<ServerState>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<token_broker::Result<()>>>,
    worker: Option<AuditWorker>,
}

impl Harness {
    pub async fn start(principals: &[&str]) -> Self {
        Self::start_with(principals, |b| b).await
    }

    /// Bootstrap the directory and serve with a config adjusted by `tweak`.
    pub async fn start_with(
        principals: &[&str],
        tweak: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
    ) -> Self {
        let certs = TestCerts::generate();
        let config = tweak(config_builder(&certs, principals)).build().unwrap();

        let directory = Arc::new(CountingDirectory::new());
        configure_permissions(directory.as_ref(), &config.store.database, &config.principals)
            .await
            .unwrap();

        let audit_writer = MemoryAudit::default();
        let writers: Vec<Box<dyn AuditWriter>> = vec![Box::new(audit_writer.clone())];
        let (sink, worker) = audit::open(config.audit.capacity, writers);

        let verifier = Arc::new(JwtVerifier::new(config.identity.clone(), None));
        let mut issuer = TokenIssuer::new(
            verifier,
            directory.clone(),
            sink,
            config.server.call_timeout,
        );
        if config.cache.enabled {
            issuer = issuer.with_cache(token_broker::TokenCache::new(&config.cache));
        }

        let acceptor = token_broker::server::tls::acceptor(&config.tls).unwrap();
        let server = BrokerServer::bind(config.server, acceptor, Arc::new(issuer))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let mut state = server.subscribe();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));
        state
            .wait_for(|s| *s == ServerState::Listening)
            .await
            .unwrap();

        let client = TokenClient::new(addr, "localhost", certs.cert_pem.as_bytes())
            .unwrap()
            .with_timeout(Duration::from_secs(10));

        Self {
            certs,
            config,
            directory,
            audit: audit_writer,
            client,
            state,
            shutdown,
            server: Some(handle),
            worker: Some(worker),
        }
    }

    /// Cancel the run context without waiting
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel, wait for the server to stop and flush the audit worker.
    pub async fn stop(&mut self) -> token_broker::Result<()> {
        self.shutdown.cancel();
        let result = match self.server.take() {
            Some(handle) => handle.await.unwrap(),
            None => Ok(()),
        };
        if let Some(worker) = self.worker.take() {
            worker.close().await;
        }
        result
    }
}
