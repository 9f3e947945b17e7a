//! JSON API for peers and the operator dashboard.

mod error;

pub use error::{AppError, AppResult};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cluster::protocol::{
    AcceptJobRequest, AcceptJobResponse, ConfirmFilesResponse, JobCompleteRequest,
    JobCompleteResponse, ACCEPT_JOB_PATH, CAPACITY_PATH, CONFIRM_FILES_PATH, JOB_COMPLETE_PATH,
    PING_PATH,
};
use crate::cluster::CapacityReport;
use crate::context::AppContext;
use crate::locks::{FamilyStatus, LockFamily};
use crate::process::{self, PipelineProcess};
use crate::state::{PendingItem, QueuePage, Stage, QUEUE_ITEMS_PER_PAGE};
use crate::supervisor::StepOutcome;

type SharedContext = Arc<AppContext>;

pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route(CAPACITY_PATH, get(worker_capacity))
        .route(ACCEPT_JOB_PATH, post(accept_job))
        .route(CONFIRM_FILES_PATH, post(confirm_files))
        .route(JOB_COMPLETE_PATH, post(job_complete))
        .route(PING_PATH, post(ping))
        .route("/api/cluster/status", get(cluster_status))
        .route("/api/cluster/peers", get(cluster_peers))
        .route("/api/cluster/jobs", get(cluster_jobs))
        .route("/api/queue", get(queue))
        .route("/api/queue/{state_file}/cancel", post(cancel))
        .route("/api/kill/{pid}", post(kill))
        .route("/api/locks", get(locks))
        .route("/api/counts", get(counts))
        .route("/api/processes", get(processes))
        .route("/api/identify/pending", get(identify_pending))
        .route("/api/identify/{state_file}/rename", post(identify_rename))
        .route("/api/identify/{state_file}/dismiss", post(identify_dismiss))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Outcome of a kill or cancel
#[derive(Debug, Serialize)]
struct CleanupResponse {
    status: &'static str,
    message: String,
    steps: Vec<StepOutcome>,
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    delete_files: bool,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    year: Option<String>,
}

#[derive(Debug, Serialize)]
struct RenameResponse {
    status: &'static str,
    new_state_file: String,
    new_title: String,
    new_year: Option<String>,
    steps: Vec<StepOutcome>,
}

#[derive(Debug, Deserialize)]
struct QueueParams {
    page: Option<usize>,
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> AppResult<T> {
    if body.is_empty() {
        return Err(AppError::bad_request("No JSON data provided"));
    }
    serde_json::from_slice(body).map_err(|e| AppError::bad_request(format!("Invalid JSON: {e}")))
}

async fn worker_capacity(State(ctx): State<SharedContext>) -> AppResult<Json<CapacityReport>> {
    Ok(Json(ctx.coordinator().capacity_report().await?))
}

async fn accept_job(
    State(ctx): State<SharedContext>,
    body: Bytes,
) -> AppResult<Json<AcceptJobResponse>> {
    let request: AcceptJobRequest = parse_body(&body)?;
    Ok(Json(ctx.coordinator().accept_job(request).await?))
}

async fn confirm_files(
    State(ctx): State<SharedContext>,
    body: Bytes,
) -> AppResult<Json<ConfirmFilesResponse>> {
    let value: Value = parse_body(&body)?;
    let Some(files) = value.get("files").and_then(Value::as_array) else {
        return Err(AppError::bad_request("files must be a list"));
    };
    let files: Vec<String> = files
        .iter()
        .filter_map(|f| f.as_str().map(str::to_string))
        .collect();
    Ok(Json(ctx.coordinator().confirm_files(&files).await))
}

async fn job_complete(
    State(ctx): State<SharedContext>,
    body: Bytes,
) -> AppResult<Json<JobCompleteResponse>> {
    let request: JobCompleteRequest = parse_body(&body)?;
    Ok(Json(ctx.coordinator().job_complete(request).await?))
}

async fn ping(State(ctx): State<SharedContext>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node_name": ctx.config.node_name,
        "cluster_enabled": ctx.config.cluster_enabled,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn cluster_status(State(ctx): State<SharedContext>) -> AppResult<Json<Value>> {
    let coordinator = ctx.coordinator();
    let capacity = coordinator.capacity().await?;
    Ok(Json(json!({
        "node_name": ctx.config.node_name,
        "cluster_enabled": ctx.config.cluster_enabled,
        "transfer_mode": ctx.config.transfer_mode,
        "peers": ctx.config.peers,
        "capacity": capacity,
    })))
}

async fn cluster_peers(State(ctx): State<SharedContext>) -> Json<Value> {
    if !ctx.config.cluster_enabled {
        return Json(json!({
            "cluster_enabled": false,
            "peers": [],
            "message": "Cluster mode is not enabled",
        }));
    }
    let peers = ctx.coordinator().peer_statuses().await;
    Json(json!({
        "cluster_enabled": true,
        "this_node": ctx.config.node_name,
        "peers": peers,
    }))
}

async fn cluster_jobs(State(ctx): State<SharedContext>) -> AppResult<Json<Value>> {
    let coordinator = ctx.coordinator();
    Ok(Json(json!({
        "distributed": coordinator.distributed_jobs().await?,
        "received": coordinator.received_jobs().await?,
    })))
}

async fn queue(
    State(ctx): State<SharedContext>,
    Query(params): Query<QueueParams>,
) -> AppResult<Json<QueuePage>> {
    Ok(Json(
        ctx.store()
            .queue_items(params.page, QUEUE_ITEMS_PER_PAGE)
            .await?,
    ))
}

async fn cancel(
    State(ctx): State<SharedContext>,
    Path(state_file): Path<String>,
    body: Bytes,
) -> AppResult<Json<CleanupResponse>> {
    // An empty body means "keep the files"
    let request: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        parse_body(&body)?
    };
    let report = ctx
        .supervisor()
        .cancel_queue_item(&state_file, request.delete_files)
        .await?;
    info!("🗑️ Cancelled {}: {}", state_file, report.summary());
    Ok(Json(CleanupResponse {
        status: "ok",
        message: report.summary(),
        steps: report.steps,
    }))
}

async fn kill(
    State(ctx): State<SharedContext>,
    Path(pid): Path<String>,
) -> AppResult<Json<CleanupResponse>> {
    let pid: u32 = pid
        .parse()
        .map_err(|_| AppError::bad_request(format!("Invalid PID: {pid}")))?;
    let outcome = ctx.supervisor().kill_with_cleanup(pid).await?;
    Ok(Json(CleanupResponse {
        status: "ok",
        message: outcome.message(),
        steps: outcome.report.steps,
    }))
}

async fn locks(State(ctx): State<SharedContext>) -> Json<BTreeMap<LockFamily, FamilyStatus>> {
    Json(ctx.locks().status_all())
}

async fn counts(State(ctx): State<SharedContext>) -> AppResult<Json<BTreeMap<Stage, usize>>> {
    Ok(Json(ctx.store().count_by_stage().await?))
}

async fn processes(State(ctx): State<SharedContext>) -> Json<Vec<PipelineProcess>> {
    Json(process::scan_processes(ctx.processes.clone(), |t| t.pipeline_processes()).await)
}

async fn identify_pending(State(ctx): State<SharedContext>) -> AppResult<Json<Vec<PendingItem>>> {
    Ok(Json(ctx.store().pending_identification().await?))
}

async fn identify_rename(
    State(ctx): State<SharedContext>,
    Path(state_file): Path<String>,
    body: Bytes,
) -> AppResult<Json<RenameResponse>> {
    let request: RenameRequest = parse_body(&body)?;
    let store = ctx.store();
    let record = store.open(&state_file).await?;
    let renamed = store
        .rename_item(&record, &request.title, request.year.as_deref())
        .await?;
    Ok(Json(RenameResponse {
        status: "renamed",
        new_state_file: renamed.state_file,
        new_title: renamed.title,
        new_year: renamed.year,
        steps: renamed.report.steps,
    }))
}

async fn identify_dismiss(
    State(ctx): State<SharedContext>,
    Path(state_file): Path<String>,
) -> AppResult<Json<CleanupResponse>> {
    let store = ctx.store();
    let record = store.open(&state_file).await?;
    let report = store.dismiss_identification(&record).await?;
    Ok(Json(CleanupResponse {
        status: "dismissed",
        message: format!("Dismissed {state_file}"),
        steps: report.steps,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticLoad;
    use crate::config::Config;
    use crate::process::InMemoryProcessTable;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(temp: &TempDir, cluster_enabled: bool) -> Router {
        let config = Config {
            staging_dir: temp.path().join("staging"),
            lock_dir: temp.path().join("locks"),
            cluster_enabled,
            node_name: "plex".to_string(),
            ..Config::default()
        };
        std::fs::create_dir_all(&config.staging_dir).unwrap();
        std::fs::create_dir_all(&config.lock_dir).unwrap();
        let ctx = AppContext::with_parts(
            config,
            Arc::new(InMemoryProcessTable::new()),
            Arc::new(StaticLoad::idle(4)),
        );
        router(Arc::new(ctx))
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_capacity_endpoint() {
        let temp = TempDir::new().unwrap();
        let (status, body) = call(app(&temp, true), "GET", CAPACITY_PATH, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_name"], "plex");
        assert_eq!(body["available"], true);
        assert_eq!(body["slots_total"], 1);
    }

    #[tokio::test]
    async fn test_accept_job_disabled_cluster_is_bad_request() {
        let temp = TempDir::new().unwrap();
        let (status, body) = call(
            app(&temp, false),
            "POST",
            ACCEPT_JOB_PATH,
            Some(json!({ "metadata": { "title": "M", "timestamp": "1" }, "origin": "cart" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Cluster mode is not enabled");
    }

    #[tokio::test]
    async fn test_accept_job_missing_image_is_404_with_expected_path() {
        let temp = TempDir::new().unwrap();
        let (status, body) = call(
            app(&temp, true),
            "POST",
            ACCEPT_JOB_PATH,
            Some(json!({
                "metadata": { "title": "M", "timestamp": "1", "iso_path": "/src/M.iso" },
                "origin": "cart"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let expected = temp.path().join("staging").join("M.iso");
        assert_eq!(body["expected_path"], expected.to_string_lossy().as_ref());
    }

    #[tokio::test]
    async fn test_confirm_files_requires_list() {
        let temp = TempDir::new().unwrap();
        let (status, _) = call(
            app(&temp, true),
            "POST",
            CONFIRM_FILES_PATH,
            Some(json!({ "files": "M.iso" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        std::fs::write(temp.path().join("staging").join("M.iso"), "").unwrap();
        let (status, body) = call(
            app(&temp, true),
            "POST",
            CONFIRM_FILES_PATH,
            Some(json!({ "files": ["M.iso", "N.iso", "../../etc/shadow"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["confirmed"], json!(["M.iso"]));
        assert_eq!(body["missing"], json!(["N.iso"]));
    }

    #[tokio::test]
    async fn test_job_complete_without_shadow_is_noop() {
        let temp = TempDir::new().unwrap();
        let (status, body) = call(
            app(&temp, true),
            "POST",
            JOB_COMPLETE_PATH,
            Some(json!({ "title": "M", "timestamp": 1, "success": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body.get("state_file").is_none());
    }

    #[tokio::test]
    async fn test_cancel_without_body_and_unknown_record() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("staging")).unwrap();
        std::fs::write(temp.path().join("staging").join("M-1.image-ready"), "{}").unwrap();

        let (status, body) = call(app(&temp, true), "POST", "/api/queue/M-1.image-ready/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(!temp.path().join("staging").join("M-1.image-ready").exists());

        let (status, body) = call(app(&temp, true), "POST", "/api/queue/M-1.image-ready/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_kill_unrecognized_pid_is_rejected() {
        let temp = TempDir::new().unwrap();
        let (status, body) = call(app(&temp, true), "POST", "/api/kill/4242", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "PID 4242 is not a recognized process");

        let (status, body) = call(app(&temp, true), "POST", "/api/kill/abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid PID: abc");
    }

    #[tokio::test]
    async fn test_queue_counts_and_locks() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("staging")).unwrap();
        std::fs::write(temp.path().join("staging").join("M-1.encoding"), "{}").unwrap();

        let (status, body) = call(app(&temp, true), "GET", "/api/queue?page=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["state"], "encoding");

        let (_, counts) = call(app(&temp, true), "GET", "/api/counts", None).await;
        assert_eq!(counts["encoding"], 1);
        assert_eq!(counts["image-ready"], 0);

        let (_, locks) = call(app(&temp, true), "GET", "/api/locks", None).await;
        assert_eq!(locks["encoder"]["active"], false);
    }

    #[tokio::test]
    async fn test_peers_when_cluster_disabled() {
        let temp = TempDir::new().unwrap();
        let (_, body) = call(app(&temp, false), "GET", "/api/cluster/peers", None).await;
        assert_eq!(body["cluster_enabled"], false);
        assert_eq!(body["peers"], json!([]));
    }

    #[tokio::test]
    async fn test_identify_pending_and_rename() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(
            staging.join("DVD_VIDEO-1700000000.image-ready"),
            r#"{"title":"DVD_VIDEO","timestamp":"1700000000"}"#,
        )
        .unwrap();

        let (status, body) = call(app(&temp, false), "GET", "/api/identify/pending", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["state_file"], "DVD_VIDEO-1700000000.image-ready");

        let (status, body) = call(
            app(&temp, false),
            "POST",
            "/api/identify/DVD_VIDEO-1700000000.image-ready/rename",
            Some(json!({ "title": "Heat", "year": "19x5" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Year must be 4 digits");

        let (status, body) = call(
            app(&temp, false),
            "POST",
            "/api/identify/DVD_VIDEO-1700000000.image-ready/rename",
            Some(json!({ "title": "Heat", "year": "1995" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "renamed");
        assert_eq!(body["new_state_file"], "Heat-1700000000.image-ready");
        assert_eq!(body["new_year"], "1995");
        assert!(staging.join("Heat-1700000000.image-ready").exists());

        let (_, body) = call(app(&temp, false), "GET", "/api/identify/pending", None).await;
        assert_eq!(body, json!([]));

        let (status, _) = call(
            app(&temp, false),
            "POST",
            "/api/identify/DVD_VIDEO-1700000000.image-ready/rename",
            Some(json!({ "title": "Heat" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_identify_dismiss() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(
            staging.join("Heat-1.encoded-ready"),
            r#"{"title":"Heat","needs_identification":true}"#,
        )
        .unwrap();

        let (status, body) = call(
            app(&temp, false),
            "POST",
            "/api/identify/Heat-1.encoded-ready/dismiss",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "dismissed");

        let (_, body) = call(app(&temp, false), "GET", "/api/identify/pending", None).await;
        assert_eq!(body, json!([]));
    }
}
