//! HTTP server hosting the gated application.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::gated;
use crate::error::{Result, SlomoError};
use crate::ratelimit::Gate;

/// The application served behind the gate.
pub fn app() -> Router {
    Router::new().route("/", get(index))
}

async fn index() -> Json<&'static str> {
    Json("ok")
}

/// HTTP server with the admission gate in front of every route.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Bind `addr` and wrap `app` with `gate`.
    pub async fn bind(addr: SocketAddr, gate: Arc<Gate>, app: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: gated(app, gate),
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(addr = %self.local_addr()?, "Starting HTTP server");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                SlomoError::Io(e)
            })
    }
}
