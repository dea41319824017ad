/*
 * 5D Labs Agent Platform - Controller Service
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

//! Agent Controller Service - supervises one agent pod per running `Workflow`
//!
//! This service:
//! - Watches `Workflow` resources and their agent pods
//! - Creates the agent pod (with plugin sidecars) once a workflow has HTTP/plugin tasks
//! - Marks workflows as errored when their agent pod fails
//! - Provides health and readiness endpoints

use agent_controller::agent::run_agent_controller;
use agent_controller::ControllerConfig;
use anyhow::Context as _;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";
const DEFAULT_CONFIGMAP_NAMESPACE: &str = "argo";
const DEFAULT_CONFIGMAP_NAME: &str = "agent-controller-config";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting agent controller service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let config = load_controller_config(&client).await;
    config
        .validate()
        .context("controller configuration is invalid")?;
    let config = Arc::new(config);

    let controller_handle = {
        let client = client.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = run_agent_controller(client, config).await {
                error!("Controller error: {}", e);
            }
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        );

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("Controller HTTP server listening on 0.0.0.0:8080");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("Agent controller service stopped");

    Ok(())
}

/// `RUST_LOG` filters, `LOG_FORMAT=json` switches to structured output
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,agent_controller=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "agent-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "agent-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Mounted file first; the API-served `ConfigMap` when no file is mounted
async fn load_controller_config(client: &kube::Client) -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let loaded = if Path::new(config_path).exists() {
        ControllerConfig::from_mounted_file(config_path)
            .map(|cfg| (cfg, format!("file {config_path}")))
    } else {
        let namespace = std::env::var("CONTROLLER_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_CONFIGMAP_NAMESPACE.to_string());
        let name = std::env::var("CONTROLLER_CONFIGMAP")
            .unwrap_or_else(|_| DEFAULT_CONFIGMAP_NAME.to_string());
        debug!(
            "No config file at {}, reading ConfigMap {}/{}",
            config_path, namespace, name
        );
        ControllerConfig::from_configmap(client, &namespace, &name)
            .await
            .map(|cfg| (cfg, format!("ConfigMap {namespace}/{name}")))
    };

    match loaded {
        Ok((cfg, source)) => {
            info!("Loaded controller configuration from {}", source);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load controller configuration: {}. Using defaults.",
                err
            );
            ControllerConfig::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
