use std::{future::IntoFuture as _, sync::Arc};

use bucket_operator::{
    config::Config,
    handler::BucketHandler,
    operator::{self, State},
    storage::{S3Store, Storage},
    telemetry,
};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Grab needed env
    let config = Config::from_env()?;
    telemetry::init(config.log_format).await?;

    // Connect to the object storage backend
    let store = S3Store::connect(&config.storage).await;
    let storage = Storage::new(Arc::new(store), config.storage.external_endpoint.clone());
    let handler = BucketHandler::new(Arc::new(storage), config.relist_interval);

    // Initialize Kubernetes controller state
    let state = State::default();
    let controller = operator::BucketController::new(state.clone(), handler);

    // Stop long running purges as soon as we are asked to go away
    let mut terminate = signal(SignalKind::terminate())?;
    let signalled = state.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
        info!("Shutdown requested");
        signalled.shutdown();
    });

    // Start web server
    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    let router = handlers::router();
    let server = axum::serve(listener, router.with_state(state));

    // Run both the http server and the controllers until either finishes
    tokio::select! {
        c = controller.run() => c,
        s = server.into_future() => {
            s?;
            anyhow::bail!("server exited early")
        }
    }
}

/// Handlers for the web server portion of the operator
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use bucket_operator::operator::State as OperatorState;

    /// Construct the router for all the handlers
    pub fn router() -> Router<OperatorState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/health", routing::get(health))
            .route("/", routing::get(index))
    }

    /// Handler for exposing prometheus metrics
    async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
        let metrics = state.metrics();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        match encoder.encode(&metrics, &mut buffer) {
            Ok(()) => (StatusCode::OK, buffer),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
        }
    }

    /// Handler for checking the health of the server
    async fn health() -> impl IntoResponse {
        (StatusCode::OK, Json("healthy"))
    }

    /// Handler for interacting with the operator
    async fn index(State(state): State<OperatorState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
