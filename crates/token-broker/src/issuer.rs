//! Per-request token issuance: verify, resolve, mint, audit

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditRecord, AuditSink, Outcome};
use crate::auth::{IdentityVerifier, bearer_token};
use crate::cache::TokenCache;
use crate::directory::{StoreDirectory, StoreError};
use crate::types::{AccessMode, PrincipalId, ScopedAccessToken, validate_permission_name};

/// Per-request failure, mapped onto a status code and a stable error code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IssuanceError {
    #[error("authentication failed: {reason}")]
    Unauthenticated { reason: &'static str },

    #[error("principal {principal} has no provisioned {}", .permission.as_deref().unwrap_or("user"))]
    UnknownPrincipal {
        principal: PrincipalId,
        permission: Option<String>,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("scope denied for principal {principal}: {reason}")]
    ScopeDenied {
        principal: PrincipalId,
        reason: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled")]
    Cancelled,
}

impl IssuanceError {
    /// Stable error code carried in response bodies
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "Unauthenticated",
            Self::UnknownPrincipal { .. } => "UnknownPrincipal",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::ScopeDenied { .. } => "ScopeDenied",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Cancelled => "Cancelled",
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::UnknownPrincipal { .. } | Self::ScopeDenied { .. } => StatusCode::FORBIDDEN,
            Self::StoreUnavailable(_) | Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the same request may succeed later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Cancelled)
    }

    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        match self {
            Self::Unauthenticated { .. } => Outcome::Unauthenticated,
            Self::UnknownPrincipal { .. } => Outcome::UnknownPrincipal,
            Self::StoreUnavailable(_) => Outcome::StoreUnavailable,
            Self::ScopeDenied { .. } => Outcome::ScopeDenied,
            Self::InvalidRequest(_) => Outcome::InvalidRequest,
            Self::Cancelled => Outcome::Cancelled,
        }
    }

    /// Message safe to return to the caller. Verification and store details stay in logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthenticated { .. } => "identity token rejected".to_string(),
            Self::UnknownPrincipal { .. } => "principal is not provisioned".to_string(),
            Self::StoreUnavailable(_) => "backing store unavailable, retry later".to_string(),
            Self::ScopeDenied { .. } => "store denied the principal's scope".to_string(),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::Cancelled => "server is shutting down, retry later".to_string(),
        }
    }
}

/// Successful issuance body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub resource: String,
    pub partition_key: Option<String>,
    pub mode: AccessMode,
    pub expires_at: DateTime<Utc>,
}

impl From<ScopedAccessToken> for TokenResponse {
    fn from(token: ScopedAccessToken) -> Self {
        Self {
            token: token.token,
            resource: token.scope.resource,
            partition_key: token.scope.partition_key,
            mode: token.mode,
            expires_at: token.expires_at,
        }
    }
}

/// Error body: `{"error": {"code", "message", "retryable"}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&IssuanceError> for ErrorResponse {
    fn from(err: &IssuanceError) -> Self {
        Self {
            error: ErrorDetail {
                code: err.code().to_string(),
                message: err.public_message(),
                retryable: err.is_retryable(),
            },
        }
    }
}

impl IntoResponse for IssuanceError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorResponse::from(&self))).into_response()
    }
}

/// One incoming token request
#[derive(Debug, Clone, Default)]
pub struct IssueRequest {
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
    /// Optional permission selector; the user's first permission otherwise
    pub permission: Option<String>,
    pub peer: Option<SocketAddr>,
}

enum Interrupted {
    TimedOut,
    Cancelled,
}

/// What the audit record needs to know beyond the outcome
#[derive(Default)]
struct Attempt {
    principal: Option<PrincipalId>,
    cached: bool,
}

/// Token issuance handler shared by every connection
#[derive(Debug)]
pub struct TokenIssuer {
    verifier: Arc<dyn IdentityVerifier>,
    directory: Arc<dyn StoreDirectory>,
    cache: Option<TokenCache>,
    audit: AuditSink,
    call_timeout: Duration,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        directory: Arc<dyn StoreDirectory>,
        audit: AuditSink,
        call_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            directory,
            cache: None,
            audit,
            call_timeout,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: TokenCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub const fn cache(&self) -> Option<&TokenCache> {
        self.cache.as_ref()
    }

    /// Issue a scoped token for the caller. Emits exactly one audit record.
    pub async fn issue(
        &self,
        request: IssueRequest,
        cancel: &CancellationToken,
    ) -> Result<ScopedAccessToken, IssuanceError> {
        let started = Instant::now();
        let mut attempt = Attempt::default();

        let result = self.run(&request, cancel, &mut attempt).await;

        match &result {
            Ok(token) => tracing::debug!(
                principal = attempt.principal.as_ref().map(PrincipalId::as_str),
                permission = %token.permission,
                cached = attempt.cached,
                "Token issued"
            ),
            Err(e @ (IssuanceError::StoreUnavailable(_) | IssuanceError::ScopeDenied { .. })) => {
                tracing::warn!(error = %e, "Token issuance failed");
            }
            Err(e) => tracing::debug!(error = %e, "Token issuance refused"),
        }

        self.audit.record(AuditRecord {
            timestamp: Utc::now(),
            principal: attempt.principal,
            permission: request.permission,
            outcome: result.as_ref().map_or_else(IssuanceError::outcome, |_| Outcome::Success),
            latency: started.elapsed(),
            peer: request.peer,
            cached: attempt.cached,
        });

        result
    }

    /// Record a request rejected before issuance could start.
    pub fn refuse(&self, request: IssueRequest, err: IssuanceError) -> IssuanceError {
        tracing::debug!(error = %err, "Token request rejected");
        self.audit.record(AuditRecord {
            timestamp: Utc::now(),
            principal: None,
            permission: request.permission,
            outcome: err.outcome(),
            latency: Duration::ZERO,
            peer: request.peer,
            cached: false,
        });
        err
    }

    async fn run(
        &self,
        request: &IssueRequest,
        cancel: &CancellationToken,
        attempt: &mut Attempt,
    ) -> Result<ScopedAccessToken, IssuanceError> {
        let bearer = bearer_token(request.authorization.as_deref()).map_err(|e| {
            IssuanceError::Unauthenticated { reason: e.kind() }
        })?;

        let claims = match self.bounded(cancel, self.verifier.verify(bearer)).await {
            Ok(Ok(claims)) => claims,
            Ok(Err(e)) => return Err(IssuanceError::Unauthenticated { reason: e.kind() }),
            Err(Interrupted::TimedOut) => {
                return Err(IssuanceError::Unauthenticated {
                    reason: "verifier_timeout",
                });
            }
            Err(Interrupted::Cancelled) => return Err(IssuanceError::Cancelled),
        };
        let principal = claims.subject;
        attempt.principal = Some(principal.clone());

        let selector = request.permission.as_deref();
        if let Some(name) = selector {
            validate_permission_name(name).map_err(IssuanceError::InvalidRequest)?;
        }

        if let Some(cache) = &self.cache
            && let Some(token) = cache.get(&principal, selector)
        {
            attempt.cached = true;
            return Ok(token);
        }

        let user = match self.bounded(cancel, self.directory.get_user(&principal)).await {
            Ok(Ok(user)) => user,
            Ok(Err(StoreError::NotFound(_))) => {
                return Err(IssuanceError::UnknownPrincipal {
                    principal,
                    permission: None,
                });
            }
            Ok(Err(e)) => return Err(store_failure(&principal, e)),
            Err(interrupted) => return Err(interrupted.into_error("get_user")),
        };

        let permission = match selector {
            Some(name) => user.permission(name),
            None => user.default_permission(),
        }
        .map(|p| p.id.clone())
        .ok_or_else(|| IssuanceError::UnknownPrincipal {
            principal: principal.clone(),
            permission: selector.map(ToString::to_string),
        })?;

        let token = match self
            .bounded(cancel, self.directory.mint_token(&user, &permission))
            .await
        {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => {
                let err = store_failure(&principal, e);
                if matches!(err, IssuanceError::ScopeDenied { .. })
                    && let Some(cache) = &self.cache
                {
                    cache.invalidate_principal(&principal);
                }
                return Err(err);
            }
            Err(interrupted) => return Err(interrupted.into_error("mint_token")),
        };

        if let Some(cache) = &self.cache {
            cache.insert(&principal, selector, &token);
        }
        Ok(token)
    }

    /// Bound a collaborator call by `call_timeout` and the abandon token.
    async fn bounded<F: Future>(
        &self,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Interrupted::Cancelled),
            result = tokio::time::timeout(self.call_timeout, call) => {
                result.map_err(|_| Interrupted::TimedOut)
            }
        }
    }
}

impl Interrupted {
    fn into_error(self, call: &str) -> IssuanceError {
        match self {
            Self::TimedOut => IssuanceError::StoreUnavailable(format!("{call} timed out")),
            Self::Cancelled => IssuanceError::Cancelled,
        }
    }
}

/// Store failure after the user lookup. `NotFound` here means the permission
/// vanished between lookup and mint.
fn store_failure(principal: &PrincipalId, err: StoreError) -> IssuanceError {
    match err {
        StoreError::NotFound(reason) | StoreError::Forbidden(reason) => {
            IssuanceError::ScopeDenied {
                principal: principal.clone(),
                reason,
            }
        }
        StoreError::Conflict(reason) | StoreError::Unavailable(reason) | StoreError::Other(reason) => {
            IssuanceError::StoreUnavailable(reason)
        }
    }
}
