//! Client for the broker's token endpoint

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Method, Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::issuer::{ErrorDetail, ErrorResponse, TokenResponse};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("request timed out")]
    Timeout,

    #[error("broker refused the request ({status}): {}", .detail.code)]
    Refused { status: u16, detail: ErrorDetail },

    #[error("unexpected response ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },
}

impl ClientError {
    /// Error code returned by the broker, if it answered with one
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Refused { detail, .. } => Some(detail.code.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Refused { detail, .. } => detail.retryable,
            Self::Connect(_) | Self::Timeout => true,
            _ => false,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// HTTPS client that trusts only the given roots
#[derive(Clone)]
pub struct TokenClient {
    addr: SocketAddr,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
}

impl std::fmt::Debug for TokenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenClient")
            .field("addr", &self.addr)
            .field("server_name", &self.server_name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TokenClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// `roots_pem` holds the CA (or self-signed) certificates to trust.
    pub fn new(addr: SocketAddr, server_name: &str, roots_pem: &[u8]) -> ClientResult<Self> {
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(roots_pem) {
            let cert = cert.map_err(|e| ClientError::Tls(format!("invalid root PEM: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("root rejected: {e}")))?;
        }
        if roots.is_empty() {
            return Err(ClientError::Tls("no root certificates".into()));
        }

        let mut config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| ClientError::Tls(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;

        Ok(Self {
            addr,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Exchange an identity token for a scoped store token.
    pub async fn token(&self, bearer: &str, permission: Option<&str>) -> ClientResult<TokenResponse> {
        let path = match permission {
            Some(name) => format!(
                "/token?permission={}",
                url::form_urlencoded::byte_serialize(name.as_bytes()).collect::<String>()
            ),
            None => "/token".to_string(),
        };

        let (status, body) = self
            .send(Method::POST, &path, Some(&format!("Bearer {bearer}")))
            .await?;

        if status == StatusCode::OK {
            return serde_json::from_slice(&body).map_err(|e| ClientError::UnexpectedResponse {
                status: status.as_u16(),
                body: format!("undecodable token body: {e}"),
            });
        }

        match serde_json::from_slice::<ErrorResponse>(&body) {
            Ok(ErrorResponse { error }) => Err(ClientError::Refused {
                status: status.as_u16(),
                detail: error,
            }),
            Err(_) => Err(ClientError::UnexpectedResponse {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    /// Status of `GET /healthz`
    pub async fn health(&self) -> ClientResult<StatusCode> {
        let (status, _) = self.send(Method::GET, "/healthz", None).await?;
        Ok(status)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        authorization: Option<&str>,
    ) -> ClientResult<(StatusCode, Bytes)> {
        tokio::time::timeout(self.timeout, self.exchange(method, path, authorization))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        authorization: Option<&str>,
    ) -> ClientResult<(StatusCode, Bytes)> {
        let tcp = TcpStream::connect(self.addr).await?;
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(tls)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "Client connection closed with error");
            }
        });

        let mut request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, self.server_name.to_str().as_ref());
        if let Some(value) = authorization {
            request = request.header(header::AUTHORIZATION, value);
        }
        let request = request.body(Full::new(Bytes::new()))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }
}
