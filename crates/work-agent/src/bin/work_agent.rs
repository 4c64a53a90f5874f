/*
 * 5D Labs Agent Platform - Spoke Work Agent
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Work Agent Service - runs on each managed cluster
//!
//! This service:
//! - Watches `ManifestWork`s addressed to this cluster on the hub
//! - Applies their manifests and records the created objects
//! - Finalizes `AppliedManifestWork` records once their objects are gone
//! - Serves health and queue metrics endpoints

use anyhow::Context as _;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use work_agent::tasks::naming::RecordNaming;
use work_agent::tasks::types::Context as AgentContext;
use work_agent::{run_work_agent, AgentConfig, AgentQueues};

/// Spoke work agent: applies hub work and finalizes its records
#[derive(Parser)]
#[command(name = "work-agent")]
#[command(version)]
struct Args {
    /// Path to the agent configuration file
    #[arg(long, env = "WORK_AGENT_CONFIG")]
    config: Option<String>,

    /// Kubeconfig for the hub cluster (defaults to the in-cluster config)
    #[arg(long, env = "HUB_KUBECONFIG")]
    hub_kubeconfig: Option<PathBuf>,

    /// Managed cluster name, overrides agent.clusterName
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Address of the health and metrics listener
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Clone)]
struct AppState {
    queues: AgentQueues,
    shutdown: CancellationToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(
        "Starting 5D Labs Work Agent v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = AgentConfig::load(args.config.as_deref());
    if let Some(cluster_name) = args.cluster_name {
        config.agent.cluster_name = cluster_name;
    }
    config.validate().context("invalid agent configuration")?;
    let config = Arc::new(config);

    let spoke = kube::Client::try_default()
        .await
        .context("failed to connect to the managed cluster")?;
    info!("Connected to managed cluster");

    let hub_config = match &args.hub_kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read hub kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => kube::Config::infer().await?,
    };
    let hub_hash = config
        .agent
        .hub_hash
        .clone()
        .unwrap_or_else(|| RecordNaming::hub_hash(&hub_config.cluster_url.to_string()));
    let hub = kube::Client::try_from(hub_config).context("failed to build hub client")?;
    info!(
        cluster = %config.agent.cluster_name,
        agent_id = config.agent.agent_id.as_deref().unwrap_or("-"),
        hub_hash = %hub_hash,
        "Connected to hub"
    );

    let queues = AgentQueues::new(&config);
    let shutdown = CancellationToken::new();
    let context = AgentContext {
        config: config.clone(),
        hub_hash,
    };

    let agent_handle = {
        let queues = queues.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_work_agent(spoke, hub, context, queues, shutdown).await {
                error!("Work agent error: {}", e);
            }
        })
    };

    let state = AppState {
        queues,
        shutdown: shutdown.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!("Work agent HTTP server listening on {}", args.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // let in-flight passes finish
    shutdown.cancel();
    if let Err(e) = agent_handle.await {
        error!("Work agent task join error: {:?}", e);
    }
    info!("Work agent stopped");

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,work_agent=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "work-agent",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.shutdown.is_cancelled() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "work-agent",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "work-agent",
        "version": env!("CARGO_PKG_VERSION"),
        "queues": state.queues.snapshots().await
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
