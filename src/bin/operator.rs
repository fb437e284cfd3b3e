use std::future::IntoFuture as _;

use anyhow::Context as _;
use clap::Parser;
use infisical_operator::{
    config::{Args, OperatorConfig},
    leader_election::LeaderElector,
    operator::{SecretsController, State},
    telemetry,
};
use kube::Client;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init().await?;

    let config = OperatorConfig::from(&args);
    let client = Client::try_default()
        .await
        .context("failed to create kube Client")?;

    // Initialize Kubernetes controller state
    let state = State::default();
    let controller = SecretsController::new(state.clone(), config.clone());
    let shutdown = CancellationToken::new();

    // Start web servers
    let metrics = axum::serve(
        TcpListener::bind(args.metrics_bind_address).await?,
        handlers::metrics_router().with_state(state.clone()),
    );
    let probes = axum::serve(
        TcpListener::bind(args.health_probe_bind_address).await?,
        handlers::probe_router().with_state(state),
    );
    info!(metrics = %args.metrics_bind_address, probes = %args.health_probe_bind_address, "serving");

    let elector = args.leader_elect.then(|| {
        let identity = args
            .pod_name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        LeaderElector::new(client.clone(), &config.config_namespace, &identity)
    });

    let run = async {
        if let Some(elector) = &elector {
            elector.acquire().await;
            tokio::select! {
                c = controller.run(client, shutdown.clone()) => c,
                _ = elector.hold() => {
                    shutdown.cancel();
                    anyhow::bail!("leadership lost")
                }
            }
        } else {
            controller.run(client, shutdown.clone()).await
        }
    };

    // Run the http servers and the controllers, stopping when any of them finishes
    tokio::select! {
        c = run => c.context("controller exited"),
        s = metrics.into_future() => s.context("metrics server exited"),
        s = probes.into_future() => s.context("probe server exited"),
    }
}

/// Handlers for the web server portion of the operator
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use infisical_operator::operator::State as OperatorState;

    /// Prometheus metrics and diagnostics
    pub fn metrics_router() -> Router<OperatorState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/", routing::get(index))
    }

    /// Liveness and readiness probes
    pub fn probe_router() -> Router<OperatorState> {
        Router::new()
            .route("/healthz", routing::get(health))
            .route("/readyz", routing::get(ready))
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

    /// Ready once the controllers run, which for followers means never
    async fn ready(State(state): State<OperatorState>) -> impl IntoResponse {
        if state.is_ready() {
            (StatusCode::OK, Json("ready"))
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, Json("waiting"))
        }
    }

    /// Handler for interacting with the operator
    async fn index(State(state): State<OperatorState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
