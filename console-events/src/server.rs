//! HTTP server with graceful shutdown

use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{
    error::Result, middleware::sensitive_headers_layer, state::EventsState, websocket::router,
};

/// Server instance
pub struct Server {
    state: EventsState,
}

impl Server {
    /// Create a new server for the given gateway state
    pub fn new(state: EventsState) -> Self {
        Self { state }
    }

    /// Get the gateway state
    pub fn state(&self) -> &EventsState {
        &self.state
    }

    /// Run the server on the configured port until SIGINT or SIGTERM
    pub async fn serve(self) -> Result<()> {
        let config = self.state.config();
        let addr = SocketAddr::from(([0, 0, 0, 0], config.service.port));

        tracing::info!("Starting {} on {}", config.service.name, addr);
        let listener = TcpListener::bind(&addr).await?;

        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Run the server on a bound listener until `signal` completes
    ///
    /// On shutdown every open events connection is cancelled and closed with
    /// a normal closure.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.app();
        let shutdown = self.state.shutdown_token().clone();

        tracing::info!("Server listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            signal.await;
            tracing::info!("Closing events connections");
            shutdown.cancel();
        })
        .await?;

        tracing::info!("Server shutdown complete");

        Ok(())
    }

    fn app(&self) -> Router {
        let config = self.state.config();

        tracing::info!("Middleware configuration:");
        tracing::info!("  - Sensitive header masking: enabled");
        tracing::info!(
            "  - Upgrade timeout: {} seconds",
            config.service.timeout_secs
        );
        tracing::info!(
            "  - Request rate limit: {} req / {} sec (burst: {})",
            config.rate_limit.requests.requests_per_period,
            config.rate_limit.requests.period_secs,
            config.rate_limit.requests.burst_size
        );
        tracing::info!(
            "  - Accept rate limit: {} req / {} sec (burst: {})",
            config.rate_limit.accept.requests_per_period,
            config.rate_limit.accept.period_secs,
            config.rate_limit.accept.burst_size
        );

        // Layers run top to bottom; credentials are masked before tracing
        router(self.state.clone()).layer(
            ServiceBuilder::new()
                .layer(sensitive_headers_layer())
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().include_headers(true))
                        .on_response(DefaultOnResponse::new().include_headers(true)),
                )
                // Upgrade timeout; upgraded connections are not affected
                .layer(TimeoutLayer::with_status_code(
                    http::StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(config.service.timeout_secs),
                )),
        )
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
