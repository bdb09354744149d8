//! HTTP surface of the daemon, routed with Axum.
//!
//! Handlers never block an I/O thread on device work: they enqueue a
//! closure on the right executor and await its result. Domain errors
//! are converted to status codes at this boundary and nowhere else.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tokend_core::device::DeviceInfo;

use crate::kernel::{KernelError, SessionHandles, SessionId};
use crate::ServerState;

const LISTEN_ITER_MAX: usize = 60;
const LISTEN_ITER_DELAY: Duration = Duration::from_millis(500);

/// Build the daemon's router.
pub fn app(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(handle_index).fallback(handle_404))
        .route("/listen", get(handle_listen).fallback(handle_404))
        .route("/enumerate", get(handle_enumerate).fallback(handle_404))
        .route("/configure", post(handle_configure).fallback(handle_404))
        .route("/acquire/{path}", post(handle_acquire).fallback(handle_404))
        .route("/release/{session}", post(handle_release).fallback(handle_404))
        .route("/call/{session}", post(handle_call).fallback(handle_404))
        .fallback(handle_404)
        .layer(middleware::from_fn_with_state(state.clone(), cors_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Errors shaped for the HTTP surface: a status code and a message that
/// becomes the `{"error": <message>}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        let status = match &err {
            KernelError::NotConfigured
            | KernelError::IncompleteConfig
            | KernelError::ExpiredConfig
            | KernelError::Config(_)
            | KernelError::Schema(_) => StatusCode::BAD_REQUEST,
            KernelError::OriginNotAllowed => StatusCode::FORBIDDEN,
            KernelError::UnknownSession => StatusCode::NOT_FOUND,
            KernelError::Codec(_)
            | KernelError::Transport(_)
            | KernelError::Wire(_)
            | KernelError::Executor(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<crate::executor::ExecutorGone> for ApiError {
    fn from(err: crate::executor::ExecutorGone) -> Self {
        Self::internal(err.to_string())
    }
}

/// CORS gate, applied to every request.
///
/// Requests without an `Origin` header pass through untouched. With an
/// origin: disallowed origins are rejected outright, allowed preflights
/// are answered here, and allowed ordinary requests get the origin
/// echoed onto the delegated response.
async fn cors_gate(State(state): State<Arc<ServerState>>, request: Request, next: Next) -> Response {
    let Some(origin) = request.headers().get(header::ORIGIN).cloned() else {
        return next.run(request).await;
    };

    let allowed = origin
        .to_str()
        .map(|o| state.kernel.is_allowed(o))
        .unwrap_or(false);
    if !allowed {
        return (StatusCode::FORBIDDEN, "Origin Not Allowed").into_response();
    }

    if request.method() == Method::OPTIONS {
        let mut response = (StatusCode::OK, "Enjoy Your Flight").into_response();
        let headers = response.headers_mut();
        if let Some(method) = request.headers().get("access-control-request-method") {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, method.clone());
        }
        if let Some(requested) = request.headers().get("access-control-request-headers") {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        return response;
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    response
}

// -- responses --------------------------------------------------------

#[derive(Serialize)]
struct IndexResponse {
    version: String,
    configured: bool,
    #[serde(rename = "validUntil")]
    valid_until: Option<u64>,
}

/// One enumerated device on the wire. The path is hex-encoded so it is
/// URL-safe.
#[derive(Serialize)]
struct DeviceEntry {
    path: String,
    vendor: u16,
    product: u16,
    #[serde(rename = "serialNumber")]
    serial_number: String,
    session: Option<SessionId>,
}

fn device_entries(devices: Vec<(DeviceInfo, Option<SessionId>)>) -> Vec<DeviceEntry> {
    devices
        .into_iter()
        .map(|(device, session)| DeviceEntry {
            path: HEXLOWER.encode(device.path.as_bytes()),
            vendor: device.vendor_id,
            product: device.product_id,
            serial_number: device.serial_number,
            session,
        })
        .collect()
}

fn decode_hex_param(value: &str) -> Result<String, ApiError> {
    let bytes = HEXLOWER_PERMISSIVE
        .decode(value.as_bytes())
        .map_err(|_| ApiError::bad_request("cannot decode value from hex"))?;
    String::from_utf8(bytes).map_err(|_| ApiError::bad_request("invalid device path"))
}

/// Run `enumerate` on the enumeration executor.
async fn enumerate_on_executor(
    state: &Arc<ServerState>,
) -> Result<Vec<(DeviceInfo, Option<SessionId>)>, ApiError> {
    let task_state = Arc::clone(state);
    let devices = state
        .kernel
        .enumeration_executor()
        .run(move || task_state.kernel.enumerate())
        .await??;
    Ok(devices)
}

// -- handlers ---------------------------------------------------------

async fn handle_index(State(state): State<Arc<ServerState>>) -> Json<IndexResponse> {
    Json(IndexResponse {
        version: state.kernel.version().to_owned(),
        configured: state.kernel.has_config(),
        valid_until: state.kernel.valid_until(),
    })
}

async fn handle_configure(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let raw = HEXLOWER_PERMISSIVE
        .decode(body.trim().as_bytes())
        .map_err(|_| ApiError::bad_request("cannot decode value from hex"))?;

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());

    state.kernel.set_config(&raw, origin)?;
    Ok(Json(json!({})))
}

async fn handle_enumerate(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<DeviceEntry>>, ApiError> {
    let devices = enumerate_on_executor(&state).await?;
    Ok(Json(device_entries(devices)))
}

/// Long-poll for an enumeration change: up to 60 rounds of compare and
/// sleep, returning early with the first changed list.
async fn handle_listen(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<DeviceEntry>>, ApiError> {
    let mut devices = enumerate_on_executor(&state).await?;

    for _ in 0..LISTEN_ITER_MAX {
        let updated = enumerate_on_executor(&state).await?;
        if updated == devices {
            tokio::time::sleep(LISTEN_ITER_DELAY).await;
        } else {
            devices = updated;
            break;
        }
    }

    Ok(Json(device_entries(devices)))
}

async fn handle_acquire(
    State(state): State<Arc<ServerState>>,
    Path(path_hex): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let path = decode_hex_param(&path_hex)?;

    let task_state = Arc::clone(&state);
    let check_path = path.clone();
    let supported = state
        .kernel
        .enumeration_executor()
        .run(move || task_state.kernel.is_path_supported(&check_path))
        .await??;
    if !supported {
        return Err(ApiError::not_found("device not found or unsupported"));
    }

    let (device, executor) = state.kernel.device_handles(&path)?;
    let task_state = Arc::clone(&state);
    let session = executor
        .run(move || -> Result<SessionId, KernelError> {
            device.open(task_state.kernel.backend().as_ref())?;
            task_state.kernel.acquire(&path)
        })
        .await??;

    info!("session acquired");
    Ok(Json(json!({ "session": session })))
}

async fn handle_release(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let SessionHandles {
        device, executor, ..
    } = state.kernel.resolve_session(&session_id)?;

    let task_state = Arc::clone(&state);
    executor
        .run(move || {
            device.close();
            task_state.kernel.release(&session_id)
        })
        .await??;

    Ok(Json(json!({})))
}

async fn handle_call(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let SessionHandles {
        device, executor, ..
    } = state.kernel.resolve_session(&session_id)?;

    let task_state = Arc::clone(&state);
    let reply = executor
        .run(move || -> Result<serde_json::Value, ApiError> {
            let json: serde_json::Value = serde_json::from_str(&body)
                .map_err(|e| ApiError::internal(format!("cannot parse message: {e}")))?;

            let msg_in = task_state.kernel.json_to_wire(&json)?;
            let msg_out = device.call(task_state.kernel.backend().as_ref(), &msg_in)?;
            let json_out = task_state.kernel.wire_to_json(&msg_out)?;
            Ok(json_out)
        })
        .await??;

    Ok(Json(reply))
}

async fn handle_404() -> ApiError {
    ApiError::not_found("not found")
}
