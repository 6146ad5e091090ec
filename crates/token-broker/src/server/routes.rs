//! HTTP routes served on every TLS connection

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::QueryRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::ServerState;
use crate::issuer::{IssuanceError, IssueRequest, TokenIssuer, TokenResponse};

/// Shared by every connection's router
#[derive(Clone)]
pub(super) struct AppState {
    pub issuer: Arc<TokenIssuer>,
    pub state: watch::Receiver<ServerState>,
    /// Fired when the drain deadline passes
    pub abandon: CancellationToken,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    permission: Option<String>,
}

pub(super) fn router(app: AppState) -> Router {
    #[allow(unused_mut)]
    let mut router = Router::new()
        .route("/token", post(token_handler))
        .route("/healthz", get(health_handler));

    #[cfg(feature = "metrics")]
    {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(app)
}

async fn token_handler(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    query: Result<Query<TokenQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());

    let request = IssueRequest {
        authorization,
        permission: None,
        peer: Some(peer),
    };

    let result = match query {
        Ok(Query(query)) => {
            let request = IssueRequest {
                permission: query.permission,
                ..request
            };
            app.issuer.issue(request, &app.abandon).await
        }
        Err(rejection) => Err(app.issuer.refuse(
            request,
            IssuanceError::InvalidRequest(rejection.body_text()),
        )),
    };

    match result {
        Ok(token) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "no-store")],
            Json(TokenResponse::from(token)),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health_handler(State(app): State<AppState>) -> impl IntoResponse {
    let listening = matches!(*app.state.borrow(), ServerState::Listening);
    let (status, label) = if listening {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    };

    (
        status,
        Json(HealthResponse {
            status: label,
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        crate::observability::render_metrics(),
    )
}
