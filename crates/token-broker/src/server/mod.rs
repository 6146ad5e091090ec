//! TLS broker server
//!
//! # Lifecycle
//!
//! `Idle -> Listening -> Draining -> Stopped`, published on a watch channel.
//!
//! - `run` moves to `Listening` and accepts connections, one task each
//! - Cancelling the run context stops accepting; open connections finish the
//!   request in flight and close
//! - After `drain_timeout` the abandon token fires, blocked handlers answer
//!   `Cancelled`, and whatever is left after [`ABANDON_GRACE`] is aborted

mod routes;
pub mod tls;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::audit::{self, AuditSink, AuditWorker, AuditWriter, JsonLinesAuditWriter, TracingAuditWriter};
use crate::auth::IdentityVerifier;
use crate::bootstrap::configure_permissions;
use crate::cache::TokenCache;
use crate::config::{AuditConfig, Config, ServerConfig};
use crate::constants::{
    ABANDON_GRACE, ACCEPT_BACKOFF_MAX, ACCEPT_BACKOFF_START, MAX_ACCEPT_RETRIES,
};
use crate::directory::StoreDirectory;
use crate::issuer::TokenIssuer;
use crate::{Error, Result};

/// Listener lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Draining,
    Stopped,
}

/// Bound TLS listener serving the token routes
pub struct BrokerServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    settings: ServerConfig,
    state: watch::Sender<ServerState>,
    abandon: CancellationToken,
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl BrokerServer {
    /// Bind `settings.bind`. The server stays `Idle` until [`run`](Self::run).
    pub async fn bind(
        settings: ServerConfig,
        acceptor: TlsAcceptor,
        issuer: Arc<TokenIssuer>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(settings.bind)
            .await
            .map_err(|source| Error::Bind {
                addr: settings.bind,
                source,
            })?;

        let (state, state_rx) = watch::channel(ServerState::Idle);
        let abandon = CancellationToken::new();
        let router = routes::router(routes::AppState {
            issuer,
            state: state_rx,
            abandon: abandon.clone(),
        });

        Ok(Self {
            listener,
            acceptor,
            router,
            settings,
            state,
            abandon,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::ListenerFatal)
    }

    /// Observe lifecycle transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Serve until `shutdown` is cancelled, then drain.
    ///
    /// Returns `Err(ListenerFatal)` only when accepting keeps failing for reasons
    /// unrelated to any single connection.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            listener,
            acceptor,
            router,
            settings,
            state,
            abandon,
        } = self;

        state.send_replace(ServerState::Listening);
        tracing::info!(
            addr = %listener.local_addr().map_err(Error::ListenerFatal)?,
            "Token broker listening"
        );

        let mut connections = JoinSet::new();
        let mut consecutive_errors = 0u32;

        let result = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        consecutive_errors = 0;
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            acceptor.clone(),
                            router.clone(),
                            settings,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) if is_connection_error(&e) => {
                        tracing::debug!(error = %e, "Accept failed for one connection");
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors > MAX_ACCEPT_RETRIES {
                            tracing::error!(error = %e, "Listener failed permanently");
                            break Err(Error::ListenerFatal(e));
                        }
                        let backoff = accept_backoff(consecutive_errors);
                        tracing::warn!(
                            error = %e,
                            attempt = consecutive_errors,
                            backoff_ms = backoff.as_millis(),
                            "Accept failed, retrying"
                        );
                        tokio::select! {
                            () = tokio::time::sleep(backoff) => {}
                            () = shutdown.cancelled() => {}
                        }
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join(joined);
                }
            }
        };

        drop(listener);
        state.send_replace(ServerState::Draining);
        tracing::info!(in_flight = connections.len(), "Draining connections");

        let drained = tokio::time::timeout(settings.drain_timeout, async {
            while let Some(joined) = connections.join_next().await {
                log_join(joined);
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(
                remaining = connections.len(),
                "Drain timeout elapsed, abandoning in-flight requests"
            );
            abandon.cancel();
            let _ = tokio::time::timeout(ABANDON_GRACE, async {
                while let Some(joined) = connections.join_next().await {
                    log_join(joined);
                }
            })
            .await;
            connections.shutdown().await;
        }

        state.send_replace(ServerState::Stopped);
        tracing::info!("Token broker stopped");
        result
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
    settings: ServerConfig,
    shutdown: CancellationToken,
) {
    let _guard = ConnectionGuard::open();

    let handshake = tokio::select! {
        result = tokio::time::timeout(settings.handshake_timeout, acceptor.accept(stream)) => result,
        () = shutdown.cancelled() => return,
    };
    let tls = match handshake {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            tracing::debug!(%peer, error = %e, "TLS handshake failed");
            #[cfg(feature = "metrics")]
            crate::observability::record_handshake_failure();
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, "TLS handshake timed out");
            #[cfg(feature = "metrics")]
            crate::observability::record_handshake_failure();
            return;
        }
    };

    let service = TowerToHyperService::new(router.layer(axum::Extension(ConnectInfo(peer))));
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.header_read_timeout)
        .keep_alive(true)
        .serve_connection(TokioIo::new(tls), service);
    tokio::pin!(conn);

    let mut closing = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            () = shutdown.cancelled(), if !closing => {
                conn.as_mut().graceful_shutdown();
                closing = true;
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "Connection closed with error");
    }
}

/// Tracks the open-connection gauge
struct ConnectionGuard;

impl ConnectionGuard {
    fn open() -> Self {
        #[cfg(feature = "metrics")]
        crate::observability::record_connection_opened();
        Self
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        #[cfg(feature = "metrics")]
        crate::observability::record_connection_closed();
    }
}

/// Accept errors that concern only the connection being accepted
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

fn accept_backoff(attempt: u32) -> Duration {
    ACCEPT_BACKOFF_START
        .saturating_mul(1 << attempt.saturating_sub(1).min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        tracing::error!(error = %e, "Connection task panicked");
    }
}

/// Bootstrap the store, then serve until `shutdown` is cancelled.
///
/// The audit sink is opened before the listener and flushed after it stops.
pub async fn serve(
    config: &Config,
    verifier: Arc<dyn IdentityVerifier>,
    directory: Arc<dyn StoreDirectory>,
    shutdown: CancellationToken,
) -> Result<()> {
    configure_permissions(directory.as_ref(), &config.store.database, &config.principals)
        .await?;

    let acceptor = tls::acceptor(&config.tls)?;
    let (sink, worker) = open_audit(&config.audit).await?;

    let mut issuer = TokenIssuer::new(verifier, directory, sink, config.server.call_timeout);
    if config.cache.enabled {
        issuer = issuer.with_cache(TokenCache::new(&config.cache));
    }

    let server = match BrokerServer::bind(config.server, acceptor, Arc::new(issuer)).await {
        Ok(server) => server,
        Err(e) => {
            worker.close().await;
            return Err(e);
        }
    };

    let result = server.run(shutdown).await;

    let written = worker.close().await;
    tracing::info!(written, "Audit sink closed");
    result
}

async fn open_audit(config: &AuditConfig) -> Result<(AuditSink, AuditWorker)> {
    let mut writers: Vec<Box<dyn AuditWriter>> = vec![Box::new(TracingAuditWriter)];
    if let Some(path) = &config.path {
        let writer = JsonLinesAuditWriter::open(path)
            .await
            .map_err(|e| Error::Audit(format!("{}: {e}", path.display())))?;
        writers.push(Box::new(writer));
    }
    Ok(audit::open(config.capacity, writers))
}
