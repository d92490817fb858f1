use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::bus::envelope::Rank;
use crate::error::FleetError;
use crate::job::{JobId, JobSpec};
use crate::scheduler::SchedulerHandle;
use crate::status::JobView;

#[derive(Clone)]
pub struct DashboardState {
    pub scheduler: SchedulerHandle,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub success: bool,
    pub job_id: Option<JobId>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KillRequest {
    pub rank: Option<Rank>,
}

#[derive(Serialize, Deserialize)]
pub struct KillResponse {
    pub success: bool,
    pub error: Option<String>,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/cluster", get(cluster_status_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/jobs/:id/kill", post(kill_job_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn cluster_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.scheduler.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.scheduler.status().await {
        Ok(status) => {
            let jobs: Vec<JobView> = status.jobs.into_iter().chain(status.finished).collect();
            Json(jobs).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(spec): Json<JobSpec>,
) -> impl IntoResponse {
    match state.scheduler.submit(spec).await {
        Ok(job_id) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e @ FleetError::InvalidJob(_)) => (
            StatusCode::BAD_REQUEST,
            Json(SubmitJobResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SubmitJobResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn kill_job_handler(
    State(state): State<DashboardState>,
    Path(job): Path<JobId>,
    body: Option<Json<KillRequest>>,
) -> impl IntoResponse {
    let rank = body.and_then(|Json(req)| req.rank);
    let (code, error) = match state.scheduler.kill(job, rank).await {
        Ok(()) => (StatusCode::OK, None),
        Err(e @ (FleetError::JobNotFound(_) | FleetError::ProcessNotFound(_))) => {
            (StatusCode::NOT_FOUND, Some(e.to_string()))
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Some(e.to_string())),
    };
    (
        code,
        Json(KillResponse {
            success: error.is_none(),
            error,
        }),
    )
}
