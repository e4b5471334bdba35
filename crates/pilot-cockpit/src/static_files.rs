//! [`StaticServer`] – serves the built UI bundle over plain HTTP.
//!
//! Independent of the event core.  Files come from `tower_http`'s
//! [`ServeDir`] (`GET`/`HEAD`, content type from the extension).  Requests
//! it cannot satisfy land in [`client_route`]: paths without an extension
//! get `index.html` so client-side routes survive a reload, `..` segments
//! are refused and anything else is a 404.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::Router;
use axum::http::{StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{MethodRouter, get};
use pilot_types::PilotError;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Default TCP port for the static asset server.
pub const DEFAULT_STATIC_PORT: u16 = 8002;

const INDEX: &str = "index.html";

#[derive(Debug, Clone)]
pub struct StaticServer {
    root: PathBuf,
    port: u16,
}

impl StaticServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            port: DEFAULT_STATIC_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files under `root`, with the client-route fallback.
    pub fn router(&self) -> Router {
        let index = self.root.join(INDEX);
        let fallback: MethodRouter = get(move |uri: Uri| {
            let index = index.clone();
            async move { client_route(&index, &uri).await }
        });
        Router::new().fallback_service(ServeDir::new(&self.root).fallback(fallback))
    }

    /// Bind `0.0.0.0:<port>` and serve forever.
    pub async fn run(self) -> Result<(), PilotError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PilotError::Io(format!("static server bind error on {addr}: {e}")))?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), PilotError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, root = %self.root.display(), "static UI server listening");
        }
        if !self.root.join(INDEX).is_file() {
            warn!(root = %self.root.display(), "no index.html in static directory");
        }
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn client_route(index: &Path, uri: &Uri) -> Response {
    let path = uri.path();
    if path.split('/').any(|segment| segment == "..") {
        warn!(%path, "path traversal rejected");
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    if Path::new(path).extension().is_some() {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    match tokio::fs::read_to_string(index).await {
        Ok(page) => {
            debug!(%path, "client route");
            Html(page).into_response()
        }
        Err(e) => {
            warn!(file = %index.display(), error = %e, "index.html unreadable");
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
