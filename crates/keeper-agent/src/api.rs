use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use keeper_process::{AppId, AppStatus, HealthSnapshot};

use crate::{
    error::{LaunchError, StopError, format_error_chain},
    log_tailer::LogChunk,
    manager::{LaunchRequest, ProcessManager},
};

#[derive(Debug, serde::Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                code: self.code,
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<LaunchError> for ApiError {
    fn from(e: LaunchError) -> Self {
        let status = match &e {
            LaunchError::AlreadyRunning(_) => StatusCode::CONFLICT,
            LaunchError::EmptyCommand | LaunchError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.code(), format_error_chain(&e))
    }
}

impl From<StopError> for ApiError {
    fn from(e: StopError) -> Self {
        let status = match &e {
            StopError::AlreadyStopping(_) => StatusCode::CONFLICT,
            StopError::NotRunning(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.code(), format_error_chain(&e))
    }
}

#[derive(Debug, serde::Serialize)]
struct LaunchResponse {
    pid: u32,
}

#[derive(Debug, serde::Deserialize)]
struct LogQuery {
    #[serde(default)]
    cursor: u64,
    #[serde(default)]
    limit_bytes: u64,
}

pub fn router(manager: ProcessManager) -> Router {
    Router::new()
        .route("/health", get(health_all))
        .route("/apps", get(list_apps))
        .route("/apps/:id", get(app_status).delete(remove_app))
        .route("/apps/:id/launch", post(launch))
        .route("/apps/:id/terminate", post(terminate))
        .route("/apps/:id/health", get(app_health))
        .route("/apps/:id/logs", get(app_logs))
        .with_state(manager)
}

async fn health_all(State(m): State<ProcessManager>) -> Json<BTreeMap<AppId, HealthSnapshot>> {
    Json(m.health_all().await)
}

async fn list_apps(State(m): State<ProcessManager>) -> Json<Vec<AppStatus>> {
    Json(m.list().await)
}

async fn app_status(
    State(m): State<ProcessManager>,
    Path(id): Path<String>,
) -> Result<Json<AppStatus>, ApiError> {
    let app_id = AppId::new(id);
    m.status(&app_id).await.map(Json).ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, "not_running", format!("app not running: {app_id}"))
    })
}

async fn launch(
    State(m): State<ProcessManager>,
    Path(id): Path<String>,
    Json(req): Json<LaunchRequest>,
) -> Result<Json<LaunchResponse>, ApiError> {
    let pid = m.launch(&AppId::new(id), req).await?;
    Ok(Json(LaunchResponse { pid }))
}

async fn terminate(
    State(m): State<ProcessManager>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    m.terminate(&AppId::new(id)).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn remove_app(
    State(m): State<ProcessManager>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    m.remove(&AppId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn app_health(
    State(m): State<ProcessManager>,
    Path(id): Path<String>,
) -> Result<Json<HealthSnapshot>, ApiError> {
    let app_id = AppId::new(id);
    m.health(&app_id).await.map(Json).ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, "not_running", format!("app not running: {app_id}"))
    })
}

async fn app_logs(
    State(m): State<ProcessManager>,
    Path(id): Path<String>,
    Query(q): Query<LogQuery>,
) -> Result<Json<LogChunk>, ApiError> {
    m.read_log(&AppId::new(id), q.cursor, q.limit_bytes)
        .await
        .map(Json)
        .map_err(|e| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "log_read_failed",
                format_error_chain(&e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let app = AppId::new("web");
        let conflict = ApiError::from(LaunchError::AlreadyRunning(app.clone()));
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        assert_eq!(conflict.code, "already_running");

        assert_eq!(
            ApiError::from(LaunchError::EmptyCommand).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StopError::NotRunning(app.clone())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StopError::AlreadyStopping(app.clone())).status,
            StatusCode::CONFLICT
        );
        let failed = ApiError::from(StopError::NoPid(app));
        assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failed.code, "no_pid");
    }
}
