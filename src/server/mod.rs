//! Token proxy HTTP server.
//!
//! Keeps the provider API key on the server and hands browsers a
//! short-lived streaming token instead.

pub mod token;

pub use token::{MintError, TokenMinter};

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;

const MISSING_API_KEY: &str = "Missing API key";
const TOKEN_FAILURE: &str = "Failed to retrieve access token";
const NOT_FOUND: &str = "Not found";
const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>avatar-relay</title>
  <style>
    body { font-family: system-ui, sans-serif; max-width: 40rem; margin: 3rem auto; }
    pre { background: #f3f3f3; padding: 1rem; white-space: pre-wrap; word-break: break-all; }
  </style>
</head>
<body>
  <h1>avatar-relay token proxy</h1>
  <p>Requests a streaming token from <code>POST /api/get-access-token</code>.</p>
  <button id="fetch">Get access token</button>
  <pre id="result"></pre>
  <script>
    document.getElementById('fetch').addEventListener('click', async () => {
      const out = document.getElementById('result');
      out.textContent = '...';
      try {
        const res = await fetch('/api/get-access-token', { method: 'POST' });
        out.textContent = res.status + ' ' + await res.text();
      } catch (e) {
        out.textContent = 'request failed: ' + e;
      }
    });
  </script>
</body>
</html>
"#;

pub fn router(minter: TokenMinter) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/", get(index))
        .route("/api/get-access-token", post(get_access_token))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(Arc::new(minter))
        .layer(cors)
        .layer(middleware::from_fn(preflight))
        .layer(TraceLayer::new_for_http())
}

/// Bind `config.bind` and serve until `shutdown` fires.
pub async fn serve(config: &ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let minter = TokenMinter::new(config);
    if !minter.has_api_key() {
        warn!("AVATAR_API_KEY is not set; token requests will fail");
    }

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(
        addr = %listener.local_addr()?,
        upstream = %minter.endpoint(),
        "Token proxy listening"
    );

    axum::serve(listener, router(minter))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("token proxy server error")?;

    info!("Token proxy stopped");
    Ok(())
}

/// Answer every OPTIONS request with the CORS headers, whatever the path.
async fn preflight(request: Request, next: Next) -> Response {
    if request.method() != Method::OPTIONS {
        return next.run(request).await;
    }
    (
        StatusCode::OK,
        [
            (ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
            (
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static(ALLOWED_METHODS),
            ),
            (
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type"),
            ),
        ],
    )
        .into_response()
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn get_access_token(State(minter): State<Arc<TokenMinter>>) -> Response {
    match minter.mint().await {
        Ok(token) => (StatusCode::OK, token).into_response(),
        Err(MintError::MissingApiKey) => {
            error!("AVATAR_API_KEY is not set");
            (StatusCode::INTERNAL_SERVER_ERROR, MISSING_API_KEY).into_response()
        }
        Err(e) => {
            error!("Error retrieving access token: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, TOKEN_FAILURE).into_response()
        }
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, NOT_FOUND)
}
