//! The daemon-side control API: instance CRUD, exec, logs, port exposure,
//! and the tether ingress/poll/stream surface. Served over a Unix socket
//! per the rest of the pack's convention for long-running daemons.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router as AxumRouter};
use futures_util::stream::unfold;
use serde::{Deserialize, Serialize};

use crate::backend::{ExposePortSpec, Protocol};
use crate::error::Error;
use crate::instance::InstanceSnapshot;
use crate::lifecycle::manager::CreateRequest;
use crate::lifecycle::LifecycleManager;
use crate::observe::LogEntry;
use crate::router::Router;
use crate::tether::{Filter, Session, TetherFrame};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    pub router: Arc<Router>,
}

pub fn app(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/instances", post(create_instance).get(list_instances))
        .route("/v1/instances/{id}", get(inspect_instance).delete(delete_instance))
        .route("/v1/instances/{id}/start", post(start_instance))
        .route("/v1/instances/{id}/stop", post(stop_instance))
        .route("/v1/instances/{id}/pause", post(pause_instance))
        .route("/v1/instances/{id}/resume", post(resume_instance))
        .route("/v1/instances/{id}/disable", post(disable_instance))
        .route("/v1/instances/{id}/exec", post(exec_instance))
        .route("/v1/instances/{id}/logs", get(instance_logs))
        .route("/v1/instances/{id}/expose", post(expose_port))
        .route("/v1/instances/{id}/expose/{port}", delete(unexpose_port))
        .route("/v1/instances/{id}/tether", post(tether_push))
        .route("/v1/instances/{id}/tether/poll", get(tether_poll))
        .route("/v1/instances/{id}/tether/stream", get(tether_stream))
        .with_state(state)
}

struct ApiErrorResponse(Error);

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let api = self.0.api_error();
        let status = StatusCode::from_u16(api.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, [(header::CONTENT_TYPE, "application/json")], api.to_json()).into_response();
        if let Some(secs) = api.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<Error> for ApiErrorResponse {
    fn from(e: Error) -> Self {
        ApiErrorResponse(e)
    }
}

type ApiResult<T> = Result<T, ApiErrorResponse>;

#[derive(Deserialize)]
struct CreateInstanceBody {
    handle_alias: Option<String>,
    command: Vec<String>,
    #[serde(default)]
    expose_ports: Vec<ExposePortSpec>,
    image_ref: Option<String>,
    workspace_path: Option<String>,
    #[serde(default)]
    env: Vec<(String, String)>,
    memory_mb: Option<u32>,
    vcpus: Option<u32>,
}

async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceBody>,
) -> ApiResult<Json<InstanceSnapshot>> {
    let instance = state
        .manager
        .create(CreateRequest {
            handle_alias: body.handle_alias,
            parent_id: None,
            command: body.command,
            expose_ports: body.expose_ports,
            image_ref: body.image_ref,
            workspace_path: body.workspace_path,
            env: body.env,
            memory_mb: body.memory_mb,
            vcpus: body.vcpus,
        })
        .await?;
    Ok(Json(instance.snapshot().await))
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceSnapshot>> {
    let instances = state.manager.list().await;
    let mut snapshots = Vec::with_capacity(instances.len());
    for instance in instances {
        snapshots.push(instance.snapshot().await);
    }
    Json(snapshots)
}

async fn inspect_instance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<InstanceSnapshot>> {
    let instance = state.manager.lookup(&id).await.ok_or(Error::NotFound(id))?;
    Ok(Json(instance.snapshot().await))
}

async fn delete_instance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_instance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<InstanceSnapshot>> {
    let instance = state.manager.ensure(&id).await?;
    Ok(Json(instance.snapshot().await))
}

async fn stop_instance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.manager.stop(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_instance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.manager.pause(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_instance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<InstanceSnapshot>> {
    let instance = state.manager.ensure(&id).await?;
    Ok(Json(instance.snapshot().await))
}

async fn disable_instance(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.manager.disable(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ExecBody {
    command: Vec<String>,
    #[serde(default)]
    env: Vec<(String, String)>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Serialize)]
struct ExecLogLine {
    stream: &'static str,
    line: String,
    exec_id: String,
    source: &'static str,
}

#[derive(Serialize)]
struct ExecDone {
    done: bool,
    exit_code: i32,
}

/// Runs a command and streams its output as newline-delimited JSON: one
/// `{stream, line, exec_id, source}` entry per guest log line tagged with
/// this exec, followed by a final `{done:true, exit_code}`. The guest's
/// own log lines carrying a different (or no) `exec_id` are not this
/// exec's output and are skipped.
async fn exec_instance(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<ExecBody>) -> ApiResult<Response> {
    let timeout = Duration::from_secs(body.timeout_secs.unwrap_or(30));
    let handle = state.manager.exec_stream(&id, body.command, body.env, timeout).await?;
    let exec_id = handle.exec_id;
    let mut log_rx = handle.log_rx;
    let mut waiter = handle.waiter;
    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Vec<u8>>>(64);
    tokio::spawn(async move {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        // Disabled once the log store's sender side is gone, so this
        // branch stops firing instead of busy-looping on repeated
        // `Closed` errors while still waiting on the exec result below.
        let mut log_closed = false;
        loop {
            tokio::select! {
                log_entry = log_rx.recv(), if !log_closed => {
                    match log_entry {
                        Ok(entry) if entry.exec_id.as_deref() == Some(exec_id.as_str()) => {
                            let stream = if entry.stream == crate::observe::LogStream::Stderr { "stderr" } else { "stdout" };
                            let line = ExecLogLine { stream, line: entry.line, exec_id: exec_id.clone(), source: "exec" };
                            if send_line(&tx, &line).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            log_closed = true;
                        }
                    }
                }
                exit = &mut waiter => {
                    let exit_code = exit.unwrap_or(-1);
                    let _ = send_line(&tx, &ExecDone { done: true, exit_code }).await;
                    return;
                }
                _ = &mut deadline => {
                    let _ = send_line(&tx, &ExecDone { done: true, exit_code: -1 }).await;
                    return;
                }
            }
        }
    });

    let stream = unfold(rx, |mut rx| async move { rx.recv().await.map(|line| (line, rx)) });
    let body = Body::from_stream(stream);
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

async fn send_line<T: Serialize>(
    tx: &tokio::sync::mpsc::Sender<std::io::Result<Vec<u8>>>,
    value: &T,
) -> Result<(), tokio::sync::mpsc::error::SendError<std::io::Result<Vec<u8>>>> {
    let mut line = serde_json::to_vec(value).unwrap_or_default();
    line.push(b'\n');
    tx.send(Ok(line)).await
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_tail")]
    tail: usize,
}

fn default_log_tail() -> usize {
    200
}

async fn instance_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Json<Vec<LogEntry>> {
    Json(state.manager.log_tail(&id, query.tail).await)
}

#[derive(Deserialize)]
struct ExposePortBody {
    guest_port: u16,
    #[serde(default)]
    #[allow(dead_code)]
    protocol: Option<Protocol>,
}

#[derive(Serialize)]
struct ExposePortResponse {
    guest_port: u16,
    public_port: u16,
    url: String,
}

async fn expose_port(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExposePortBody>,
) -> ApiResult<Json<ExposePortResponse>> {
    state.manager.lookup(&id).await.ok_or_else(|| Error::NotFound(id.clone()))?;
    let public_port = state.router.expose_port(&id, body.guest_port).await?;
    let url = format!("http://{}:{}", state.manager.config().proxy_addr.ip(), public_port);
    Ok(Json(ExposePortResponse { guest_port: body.guest_port, public_port, url }))
}

async fn unexpose_port(State(state): State<AppState>, Path((id, port)): Path<(String, u16)>) -> StatusCode {
    state.router.unexpose_port(&id, port);
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct TetherPushBody {
    channel: String,
    session_id: String,
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(default)]
    payload: Vec<u8>,
}

#[derive(Serialize)]
struct TetherPushResponse {
    msg_id: Option<String>,
    session_id: String,
    ingress_seq: u64,
}

async fn tether_push(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TetherPushBody>,
) -> ApiResult<(StatusCode, Json<TetherPushResponse>)> {
    state.manager.lookup(&id).await.ok_or_else(|| Error::NotFound(id.clone()))?;
    let session_id = body.session_id.clone();
    let msg_id = body.msg_id.clone();
    let frame = TetherFrame::new(
        body.frame_type,
        Session { channel: body.channel, id: body.session_id },
        body.msg_id,
        body.payload,
    );
    let ingress_seq = state.manager.tether().append(&id, frame);
    Ok((StatusCode::ACCEPTED, Json(TetherPushResponse { msg_id, session_id, ingress_seq })))
}

#[derive(Deserialize)]
struct TetherPollQuery {
    #[serde(default)]
    after_seq: u64,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default = "default_poll_limit")]
    limit: usize,
    #[serde(default)]
    wait_ms: u64,
}

fn default_poll_limit() -> usize {
    100
}

#[derive(Serialize, Deserialize)]
struct TetherPollResponse {
    frames: Vec<TetherFrame>,
    next_seq: u64,
    timed_out: bool,
}

async fn tether_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TetherPollQuery>,
) -> ApiResult<Json<TetherPollResponse>> {
    state.manager.lookup(&id).await.ok_or_else(|| Error::NotFound(id.clone()))?;
    let filter = Filter { channel: query.channel, session_id: query.session_id, types: None, reply_to_msg_id: None };
    let result = state
        .manager
        .tether()
        .poll(&id, &filter, query.after_seq, query.limit, Duration::from_millis(query.wait_ms))
        .await;
    Ok(Json(TetherPollResponse { frames: result.frames, next_seq: result.next_seq, timed_out: result.timed_out }))
}

/// Live subscription to an instance's tether egress, as newline-delimited
/// JSON frames. Only frames appended after this call connects are sent;
/// callers that need history first should `Poll` from `seq 0` before
/// switching to this endpoint.
async fn tether_stream(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    state.manager.lookup(&id).await.ok_or_else(|| Error::NotFound(id.clone()))?;
    let subscription = state.manager.tether().subscribe(&id);
    let lines = unfold(subscription, |mut sub| async move {
        let frame = sub.rx.recv().await?;
        let mut line = serde_json::to_vec(&frame).unwrap_or_default();
        line.push(b'\n');
        Some((Ok::<_, std::io::Error>(line), sub))
    });
    let body = Body::from_stream(lines);
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::process::ProcessBackend;
    use crate::capability::TokenCodec;
    use crate::config::DaemonConfig;
    use crate::registry::MemoryRegistry;
    use crate::tether::TetherStore;
    use axum_test::TestServer;

    fn state() -> AppState {
        let manager = LifecycleManager::new(
            DaemonConfig::default(),
            Arc::new(ProcessBackend::new()),
            Arc::new(TetherStore::default()),
            Arc::new(MemoryRegistry::default()),
            Arc::new(TokenCodec::generate()),
        );
        let router = Router::new(manager.clone());
        AppState { manager, router }
    }

    #[tokio::test]
    async fn create_then_list_round_trips() {
        let server = TestServer::new(app(state())).unwrap();
        let response = server
            .post("/v1/instances")
            .json(&serde_json::json!({ "command": ["sleep", "5"] }))
            .await;
        response.assert_status_ok();
        let created: InstanceSnapshot = response.json();

        let list = server.get("/v1/instances").await;
        list.assert_status_ok();
        let instances: Vec<InstanceSnapshot> = list.json();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, created.id);
    }

    #[tokio::test]
    async fn inspect_missing_instance_is_404() {
        let server = TestServer::new(app(state())).unwrap();
        let response = server.get("/v1/instances/does-not-exist").await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tether_push_then_poll_round_trips() {
        let server = TestServer::new(app(state())).unwrap();
        let created: InstanceSnapshot = server
            .post("/v1/instances")
            .json(&serde_json::json!({ "command": ["sleep", "5"] }))
            .await
            .json();

        server
            .post(&format!("/v1/instances/{}/tether", created.id))
            .json(&serde_json::json!({
                "channel": "host",
                "session_id": "s1",
                "type": "user.message",
                "payload": []
            }))
            .await
            .assert_status(StatusCode::ACCEPTED);

        let poll = server.get(&format!("/v1/instances/{}/tether/poll", created.id)).await;
        poll.assert_status_ok();
        let parsed: TetherPollResponse = poll.json();
        assert_eq!(parsed.frames.len(), 1);
    }
}
