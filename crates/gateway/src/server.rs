//! Upward HTTP surface.
//!
//! Every handler is a thin pass-through to the fleet, the launcher registry or
//! the setup agent. Upstream failures come back as `{"message": ...}` bodies.

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::attach::{socket::serve_socket, AttachError};
use crate::correlator::CorrelatorError;
use crate::docker::client::DockerError;
use crate::fleet::FleetError;
use crate::rpc::RpcError;
use crate::service::boltz::{BoltzService, Currency};
use crate::service::opendexd::OpendexdService;
use crate::service::ServiceError;
use crate::setup::{SetupStatus, DONE};
use crate::state::AppState;

const DEFAULT_LOG_SINCE: &str = "1h";
const DEFAULT_LOG_TAIL: &str = "all";

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Timeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Timeout(m) => (StatusCode::GATEWAY_TIMEOUT, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::ServiceNotFound(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RpcError> for ApiError {
    fn from(err: RpcError) -> Self {
        if err.is_unreachable() {
            return ApiError::Unavailable(err.to_string());
        }
        match err {
            RpcError::Status(status) if status.code() == tonic::Code::InvalidArgument => {
                ApiError::BadRequest(status.message().to_string())
            }
            RpcError::Status(status) => ApiError::Internal(status.message().to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidArgument(m) => ApiError::BadRequest(m),
            ServiceError::ContainerMissing(_)
            | ServiceError::Runtime(DockerError::ContainerNotFound(_)) => {
                ApiError::NotFound(err.to_string())
            }
            ServiceError::Runtime(DockerError::InvalidSince(_)) => {
                ApiError::BadRequest(err.to_string())
            }
            ServiceError::Rpc(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AttachError> for ApiError {
    fn from(err: AttachError) -> Self {
        match err {
            AttachError::NoLauncher => ApiError::Unavailable(err.to_string()),
            AttachError::Timeout => ApiError::Timeout(err.to_string()),
            AttachError::Correlator(CorrelatorError::Remote(m)) => ApiError::Internal(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(status_all))
        .route("/status/{service}", get(status_one))
        .route("/services", get(list_services))
        .route("/logs/{service}", get(service_logs))
        .route("/logs/{service}/follow", get(follow_service_logs))
        .route("/setup-status", get(setup_status))
        .route("/info", get(launcher_info))
        .route("/backup", put(update_backup))
        .route("/opendexd/getinfo", get(opendexd_info))
        .route("/opendexd/getbalance", get(opendexd_balance))
        .route("/opendexd/getbalance/{currency}", get(opendexd_currency_balance))
        .route("/opendexd/create", post(opendexd_create))
        .route("/opendexd/unlock", post(opendexd_unlock))
        .route("/boltz/{currency}/service-info", get(boltz_service_info))
        .route("/boltz/{currency}/deposit", post(boltz_deposit))
        .route("/boltz/{currency}/withdraw", post(boltz_withdraw));

    Router::new()
        .route("/health", get(health))
        .route("/launcher", get(launcher_ws))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until SIGINT/SIGTERM, then shut the gateway down.
pub async fn serve(state: AppState) -> Result<()> {
    let addr: SocketAddr = state
        .config
        .server
        .bind_address
        .parse()
        .context("Invalid bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!(%addr, "Listening");

    let shutdown_tx = state.shutdown_tx.clone();
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Releases attached launchers so open sockets do not hold the server
            shutdown_tx.send_replace(true);
        })
        .await
        .context("Server error")?;

    state.shutdown().await;
    Ok(())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let setup = state.fleet.setup_state();
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "services": state.fleet.registry().len(),
        "launchers": state.launchers.len(),
        "setup": setup,
    }))
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ServiceStatus {
    service: String,
    status: String,
}

/// Statuses in registry order.
async fn status_all(State(state): State<AppState>) -> Json<Vec<ServiceStatus>> {
    let mut statuses = state.fleet.status_all().await;
    let body = state
        .fleet
        .services()
        .map(|s| ServiceStatus {
            service: s.name().to_string(),
            status: statuses.remove(s.name()).unwrap_or_default(),
        })
        .collect();
    Json(body)
}

async fn status_one(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<ServiceStatus>, ApiError> {
    let status = state.fleet.status(&service).await?;
    Ok(Json(ServiceStatus { service, status }))
}

async fn list_services(State(state): State<AppState>) -> impl IntoResponse {
    let services: Vec<_> = state
        .fleet
        .services()
        .map(|s| {
            let container = s.container();
            json!({
                "service": s.name(),
                "container": container.container_name(),
                "disabled": container.is_disabled(),
                "mode": container.mode(),
            })
        })
        .collect();
    Json(services)
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    since: Option<String>,
    tail: Option<String>,
}

async fn service_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let service = state.fleet.service(&name)?;
    let since = query.since.unwrap_or_else(|| DEFAULT_LOG_SINCE.to_string());
    let tail = query.tail.unwrap_or_else(|| DEFAULT_LOG_TAIL.to_string());
    let lines = service.logs(Some(since), Some(tail)).await?;

    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    let headers = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.log\"", name),
        ),
    ];
    Ok((headers, body).into_response())
}

/// Live log lines across container restarts until the client goes away.
async fn follow_service_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let service = state.fleet.service(&name)?;
    let mut follower = service.follow_logs(query.since, query.tail);

    // Dropping the body drops the follower, which cancels it
    let stream = async_stream::stream! {
        while let Some(mut line) = follower.next_line().await {
            line.push('\n');
            yield Ok::<_, Infallible>(line);
        }
    };

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

/// One NDJSON record, or `None` (logged) when the entry does not serialize.
fn ndjson_line(status: &SetupStatus) -> Option<String> {
    match serde_json::to_string(status) {
        Ok(mut line) => {
            line.push('\n');
            Some(line)
        }
        Err(e) => {
            warn!(status = %status.status, error = %e, "Skipping unserializable setup status");
            None
        }
    }
}

/// Newline-delimited setup history followed by live entries, ending after `Done`.
async fn setup_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    let agent = state
        .setup
        .clone()
        .ok_or_else(|| ApiError::Unavailable("setup agent is not running".to_string()))?;
    let (history, mut rx) = agent.subscribe(-1);

    let stream = async_stream::stream! {
        let mut finished = false;
        for status in history {
            if let Some(line) = ndjson_line(&status) {
                yield Ok::<_, Infallible>(line);
            }
            if status.status == DONE {
                finished = true;
                break;
            }
        }
        while !finished {
            match rx.recv().await {
                Ok(status) => {
                    if let Some(line) = ndjson_line(&status) {
                        yield Ok::<_, Infallible>(line);
                    }
                    finished = status.status == DONE;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Setup status subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn launcher_info(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let info = state.launchers.get_info(state.deadline()).await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct BackupRequest {
    location: String,
}

async fn update_backup(
    State(state): State<AppState>,
    Json(body): Json<BackupRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .launchers
        .update_backup(&body.location, state.deadline())
        .await?;
    info!(location = %body.location, "Backup location updated");
    Ok(StatusCode::NO_CONTENT)
}

fn opendexd(state: &AppState) -> Result<&OpendexdService, ApiError> {
    state
        .fleet
        .service("opendexd")?
        .as_any()
        .downcast_ref::<OpendexdService>()
        .ok_or_else(|| ApiError::NotFound("Service not found: opendexd".to_string()))
}

fn boltz(state: &AppState) -> Result<&BoltzService, ApiError> {
    state
        .fleet
        .service("boltz")?
        .as_any()
        .downcast_ref::<BoltzService>()
        .ok_or_else(|| ApiError::NotFound("Service not found: boltz".to_string()))
}

async fn opendexd_info(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let info = opendexd(&state)?.get_info(state.deadline()).await?;
    Ok(Json(info))
}

async fn opendexd_balance(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let balance = opendexd(&state)?.get_balance(None, state.deadline()).await?;
    Ok(Json(balance))
}

async fn opendexd_currency_balance(
    State(state): State<AppState>,
    Path(currency): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let balance = opendexd(&state)?
        .get_balance(Some(currency.to_uppercase()), state.deadline())
        .await?;
    Ok(Json(balance))
}

#[derive(Debug, Deserialize)]
struct PasswordRequest {
    password: String,
}

async fn opendexd_create(
    State(state): State<AppState>,
    Json(body): Json<PasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = opendexd(&state)?
        .create_node(body.password, state.deadline())
        .await?;
    Ok(Json(created))
}

async fn opendexd_unlock(
    State(state): State<AppState>,
    Json(body): Json<PasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let unlocked = opendexd(&state)?
        .unlock_node(body.password, state.deadline())
        .await?;
    Ok(Json(unlocked))
}

async fn boltz_service_info(
    State(state): State<AppState>,
    Path(currency): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let currency: Currency = currency.parse()?;
    let info = boltz(&state)?.service_info(currency, state.deadline()).await?;
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct DepositRequest {
    #[serde(default)]
    inbound_liquidity: u32,
}

async fn boltz_deposit(
    State(state): State<AppState>,
    Path(currency): Path<String>,
    Json(body): Json<DepositRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let currency: Currency = currency.parse()?;
    let deposit = boltz(&state)?
        .deposit(currency, body.inbound_liquidity, state.deadline())
        .await?;
    Ok(Json(deposit))
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    amount: i64,
    address: String,
}

async fn boltz_withdraw(
    State(state): State<AppState>,
    Path(currency): Path<String>,
    Json(body): Json<WithdrawRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let currency: Currency = currency.parse()?;
    let swap = boltz(&state)?
        .withdraw(currency, body.amount, body.address, state.deadline())
        .await?;
    Ok(Json(swap))
}

async fn launcher_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let registry = state.launchers.clone();
    let shutdown = state.shutdown_tx.subscribe();
    ws.on_upgrade(move |socket| serve_socket(registry, socket, shutdown))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => warn!("Received SIGTERM, initiating graceful shutdown"),
    }
}
