mod test_harness;

use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use fleet_rm::dashboard::{router, DashboardState};
use fleet_rm::node::LocalCluster;
use test_harness::{start_cluster, test_scheduler_config, wait_for_job};

/// Create a test app backed by a scheduler with no daemons
fn create_test_app() -> (Router, LocalCluster) {
    let cluster = LocalCluster::start(test_scheduler_config());
    let state = DashboardState {
        scheduler: cluster.scheduler.clone(),
    };
    (router(state), cluster)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn job_body(name: &str, procs: u32) -> Value {
    json!({
        "name": name,
        "apps": [{ "name": "worker", "argv": ["worker"], "num_procs": procs }]
    })
}

#[tokio::test]
async fn test_index_serves_html() {
    let (app, cluster) = create_test_app();

    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("<html"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_cluster_status_endpoint() {
    let (app, cluster) = create_test_app();

    let (status, json) = send(&app, get("/api/cluster")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["jobs"].as_array().unwrap().is_empty());
    assert!(json["daemons"].as_array().unwrap().is_empty());
    assert!(json["bootstrapped"].is_boolean());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_list_jobs_empty() {
    let (app, cluster) = create_test_app();

    let (status, json) = send(&app, get("/api/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json.as_array().unwrap().is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_submit_and_list_jobs() {
    let (app, cluster) = create_test_app();

    let (status, json) = send(&app, post_json("/api/jobs", job_body("first", 2))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["job_id"], 1);

    let (status, json) = send(&app, post_json("/api/jobs", job_body("second", 1))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job_id"], 2);

    let (_, json) = send(&app, get("/api/jobs")).await;
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["name"], "first");
    assert_eq!(jobs[0]["state"], "pending");
    assert_eq!(jobs[0]["recovery_enabled"], true);
    assert_eq!(jobs[0]["procs"].as_array().unwrap().len(), 2);
    assert_eq!(jobs[0]["procs"][1]["app"], "worker");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_submit_invalid_job_is_rejected() {
    let (app, cluster) = create_test_app();

    let (status, json) = send(&app, post_json("/api/jobs", json!({ "name": "empty", "apps": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("no apps"));

    let zero = json!({
        "name": "zero",
        "apps": [{ "name": "w", "argv": ["w"], "num_procs": 0 }]
    });
    let (status, _) = send(&app, post_json("/api/jobs", zero)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, json) = send(&app, get("/api/jobs")).await;
    assert!(json.as_array().unwrap().is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_submit_oversized_job_is_rejected() {
    let (app, cluster) = create_test_app();

    let (status, json) = send(&app, post_json("/api/jobs", job_body("huge", 1_000_000))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("limit"));

    let overflow = json!({
        "name": "overflow",
        "apps": [
            { "name": "a", "argv": ["a"], "num_procs": u32::MAX },
            { "name": "b", "argv": ["b"], "num_procs": 1 }
        ]
    });
    let (status, _) = send(&app, post_json("/api/jobs", overflow)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_kill_endpoint() {
    let (app, cluster) = create_test_app();
    send(&app, post_json("/api/jobs", job_body("target", 2))).await;

    let (status, json) = send(&app, post_json("/api/jobs/1/kill", json!({ "rank": 7 }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);

    let (status, json) = send(&app, post_json("/api/jobs/99/kill", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("99"));

    // No body kills the whole job
    let kill_all = Request::builder()
        .method("POST")
        .uri("/api/jobs/1/kill")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app, kill_all).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (_, json) = send(&app, get("/api/jobs")).await;
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["state"], "drained");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_dashboard_reflects_running_job() {
    let (cluster, _daemons) = start_cluster(&[("n1", 4)]).await;
    let app = router(DashboardState {
        scheduler: cluster.scheduler.clone(),
    });

    let (_, json) = send(&app, post_json("/api/jobs", job_body("live", 2))).await;
    let id = json["job_id"].as_u64().unwrap() as u32;
    wait_for_job(
        &cluster.scheduler,
        id,
        |j| j.state == fleet_rm::job::JobState::Running,
        Duration::from_secs(5),
    )
    .await
    .expect("Job should reach running");

    let (status, json) = send(&app, get("/api/cluster")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["bootstrapped"], true);
    assert_eq!(json["nodes"][0]["name"], "n1");
    assert_eq!(json["nodes"][0]["state"], "up");
    assert_eq!(json["nodes"][0]["hosted"], 2);
    assert_eq!(json["jobs"][0]["state"], "running");
    assert!(json["jobs"][0]["procs"][0]["pid"].is_u64());
    assert_eq!(json["daemons"][0]["state"], "up");

    cluster.shutdown().await;
}
