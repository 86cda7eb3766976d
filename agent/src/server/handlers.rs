//! HTTP request handlers

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::deploy::record::{DeploymentState, DeploymentSummary, DeploySpec};
use crate::errors::AgentError;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "slipway-agent".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Deploy request
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub repo_url: String,

    #[serde(default)]
    pub build_cmd: Option<String>,

    pub run_cmd: String,

    /// Extra environment variables for the run command
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Optional proxy URL handed to the child process
    #[serde(default)]
    pub proxy: Option<String>,
}

/// Deploy response
#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub id: String,
    pub state: DeploymentState,
}

/// Deploy handler: registers the deployment and returns immediately;
/// clone/build/run progress is only visible through the log stream and
/// the listing.
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DeployRequest>,
) -> Response {
    let spec = DeploySpec {
        repo_url: request.repo_url,
        build_cmd: request.build_cmd,
        run_cmd: request.run_cmd,
        env: request.env,
        proxy: request.proxy,
    };

    match state.orchestrator.deploy(spec).await {
        Ok(snapshot) => (
            StatusCode::ACCEPTED,
            Json(DeployResponse {
                id: snapshot.id,
                state: snapshot.state,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Deployments listing response
#[derive(Debug, Serialize)]
pub struct ListDeploymentsResponse {
    pub deployments: Vec<DeploymentSummary>,
    pub total: usize,
}

/// Deployments listing handler
pub async fn list_deployments_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let deployments = state.store.list_all().await;
    let total = deployments.len();
    Json(ListDeploymentsResponse { deployments, total })
}

/// Deployment detail response. The environment map is withheld: operator
/// variables and proxy URLs may carry credentials.
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub id: String,
    pub repo_url: String,
    pub repo_name: String,
    pub build_cmd: Option<String>,
    pub run_cmd: String,
    pub workdir: String,
    pub state: DeploymentState,
    pub created_at: DateTime<Utc>,
}

/// Deployment detail handler
pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get(&id).await {
        Some(snapshot) => Json(DeploymentResponse {
            id: snapshot.id,
            repo_url: snapshot.repo_url,
            repo_name: snapshot.repo_name,
            build_cmd: snapshot.build_cmd,
            run_cmd: snapshot.run_cmd,
            workdir: snapshot.workdir.display().to_string(),
            state: snapshot.state,
            created_at: snapshot.created_at,
        })
        .into_response(),
        None => error_response(AgentError::NotFound(id)),
    }
}

/// Command acknowledgement
#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Stop handler
pub async fn stop_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.orchestrator.stop(&id).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(e) => error_response(e),
    }
}

/// Restart handler
pub async fn restart_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.orchestrator.restart(&id).await {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(e) => error_response(e),
    }
}

/// Log stream handler: every line published after the subscription, for
/// every deployment, as server-sent events. No history is replayed.
pub async fn logs_stream_handler(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.hub.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| {
        let line = match result {
            Ok(line) => line,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Log subscriber lagged, {} lines dropped", skipped);
                return None;
            }
        };
        match Event::default().event("log").json_data(&line) {
            Ok(event) => Some(Ok::<_, Infallible>(event)),
            Err(e) => {
                warn!("Failed to encode log line: {}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(error: AgentError) -> Response {
    let status = match &error {
        AgentError::ValidationError(_) => StatusCode::BAD_REQUEST,
        AgentError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}
