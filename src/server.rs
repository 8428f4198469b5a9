//! HTTP server wiring
//!
//! Composes the idempotency middleware, an application router, a health
//! endpoint that bypasses the layer, and the expiry sweeper into a server
//! with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::middleware::{IdempotencyService, idempotency_middleware};
use crate::store::{InMemoryStore, Sweeper};
use crate::{Error, Result};

/// Idempotency gateway server.
pub struct Server {
    config: Config,
    service: IdempotencyService,
    store: Arc<InMemoryStore>,
}

impl Server {
    /// Create a server over a fresh in-process store.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let service = IdempotencyService::new(
            Arc::clone(&store) as Arc<dyn crate::store::IdempotencyStore>,
            config.idempotency.clone(),
        );
        Self {
            config,
            service,
            store,
        }
    }

    /// The middleware state, for composing custom routers.
    #[must_use]
    pub fn service(&self) -> IdempotencyService {
        self.service.clone()
    }

    /// Layer the idempotency middleware onto `app` and add the
    /// health/stats endpoints, which bypass the layer.
    #[must_use]
    pub fn router(&self, app: Router) -> Router {
        let service = self.service.clone();
        let stats_service = self.service.clone();
        app.layer(middleware::from_fn_with_state(
            service,
            idempotency_middleware,
        ))
        .route("/health", get(|| async { Json(serde_json::json!({ "status": "ok" })) }))
        .route(
            "/stats",
            get(move || {
                let snapshot = stats_service.stats().snapshot();
                async move { Json(snapshot) }
            }),
        )
        .layer(TraceLayer::new_for_http())
    }

    /// Serve `app` until ctrl-c, then drain the sweeper.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the configured
    /// address or if an unrecoverable runtime error occurs.
    pub async fn run(self, app: Router) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let sweeper = Sweeper::spawn(
            Arc::clone(&self.store) as Arc<dyn crate::store::IdempotencyStore>,
            self.config.idempotency.cleanup_interval(),
        );

        let app = self.router(app);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Cannot bind {addr}: {e}")))?;
        info!(%addr, "Idempotency gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        sweeper.shutdown().await;
        info!("Server drained");
        Ok(())
    }
}

/// Minimal application used by the `idemgate` binary: accepts a payment
/// request and responds with a generated id.
#[must_use]
pub fn demo_router() -> Router {
    Router::new().route("/api/payments", post(create_payment))
}

async fn create_payment(Json(payload): Json<serde_json::Value>) -> impl axum::response::IntoResponse {
    let id = format!("p-{}", Uuid::new_v4().simple());
    (
        axum::http::StatusCode::CREATED,
        Json(serde_json::json!({ "id": id, "request": payload })),
    )
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for ctrl-c");
    }
}
