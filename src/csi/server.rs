//! RPC Server
//!
//! Exposes the Identity, Controller and Node roles as
//! `POST /csi.v1.<Role>/<Method>` JSON calls on a unix socket or TCP
//! listener, plus the health and metrics listener.

use super::controller::{ControllerService, UNIMPLEMENTED_CONTROLLER_CALLS};
use super::identity::IdentityService;
use super::node::NodeService;
use super::types::*;
use crate::error::{Error, Result, StatusCode as Code};
use crate::metrics::Metrics;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// Endpoint
// =============================================================================

/// Listener address of the RPC server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::Configuration(format!("endpoint {} has no path", s)));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(Error::Configuration(format!("endpoint {} has no address", s)));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }

        Err(Error::Configuration(format!(
            "unsupported endpoint {:?}, expected unix:// or tcp://",
            s
        )))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Remove a socket file left behind by a previous process
fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Errors
// =============================================================================

impl Code {
    fn http_status(self) -> StatusCode {
        match self {
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::Conflict => StatusCode::CONFLICT,
            Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.code();
        let body = ErrorBody {
            code: code.to_string(),
            message: self.to_string(),
        };
        (code.http_status(), Json(body)).into_response()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Services behind the router
pub struct CsiState {
    pub identity: IdentityService,
    pub controller: Option<Arc<ControllerService>>,
    pub node: Option<Arc<NodeService>>,
    pub metrics: Arc<Metrics>,
}

type Shared = State<Arc<CsiState>>;

impl CsiState {
    fn controller(&self) -> Result<&ControllerService> {
        self.controller
            .as_deref()
            .ok_or_else(|| Error::Unimplemented("Controller service".to_string()))
    }

    fn node(&self) -> Result<&NodeService> {
        self.node
            .as_deref()
            .ok_or_else(|| Error::Unimplemented("Node service".to_string()))
    }

    /// Log and count the outcome of a call
    fn record<T>(&self, method: &str, result: Result<T>) -> Result<Json<T>> {
        match &result {
            Ok(_) => {
                debug!("{} succeeded", method);
                self.metrics.observe(method, "OK");
            }
            Err(e) => {
                error!("{} failed: {}", method, e);
                self.metrics.observe(method, &e.code().to_string());
            }
        }
        result.map(Json)
    }
}

/// Build the RPC router
pub fn router(state: Arc<CsiState>) -> Router {
    let mut router = Router::new()
        .route("/csi.v1.Identity/GetPluginInfo", post(get_plugin_info))
        .route(
            "/csi.v1.Identity/GetPluginCapabilities",
            post(get_plugin_capabilities),
        )
        .route("/csi.v1.Identity/Probe", post(probe))
        .route("/csi.v1.Controller/CreateVolume", post(create_volume))
        .route("/csi.v1.Controller/DeleteVolume", post(delete_volume))
        .route(
            "/csi.v1.Controller/ControllerPublishVolume",
            post(controller_publish_volume),
        )
        .route(
            "/csi.v1.Controller/ControllerUnpublishVolume",
            post(controller_unpublish_volume),
        )
        .route("/csi.v1.Controller/GetCapacity", post(get_capacity))
        .route(
            "/csi.v1.Controller/ControllerGetCapabilities",
            post(controller_get_capabilities),
        )
        .route("/csi.v1.Node/NodeStageVolume", post(node_stage_volume))
        .route("/csi.v1.Node/NodeUnstageVolume", post(node_unstage_volume))
        .route("/csi.v1.Node/NodePublishVolume", post(node_publish_volume))
        .route("/csi.v1.Node/NodeUnpublishVolume", post(node_unpublish_volume))
        .route("/csi.v1.Node/NodeGetVolumeStats", post(node_get_volume_stats))
        .route("/csi.v1.Node/NodeExpandVolume", post(node_expand_volume))
        .route("/csi.v1.Node/NodeGetInfo", post(node_get_info))
        .route("/csi.v1.Node/NodeGetCapabilities", post(node_get_capabilities));

    for method in UNIMPLEMENTED_CONTROLLER_CALLS {
        router = router.route(
            &format!("/csi.v1.Controller/{}", method),
            post(move |State(state): Shared| async move {
                state.record::<Empty>(method, Err(Error::Unimplemented(method.to_string())))
            }),
        );
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve the router until `shutdown` resolves
pub async fn serve(
    endpoint: &Endpoint,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!("RPC server listening on {}", endpoint);

    match endpoint {
        Endpoint::Unix(path) => {
            remove_stale_socket(path)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let listener = tokio::net::UnixListener::bind(path)?;
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await?;
        }
        Endpoint::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await?;
        }
    }

    info!("RPC server stopped");
    Ok(())
}

// =============================================================================
// Identity Handlers
// =============================================================================

async fn get_plugin_info(State(state): Shared) -> Result<Json<GetPluginInfoResponse>> {
    state.record("GetPluginInfo", Ok(state.identity.get_plugin_info()))
}

async fn get_plugin_capabilities(
    State(state): Shared,
) -> Result<Json<GetPluginCapabilitiesResponse>> {
    state.record(
        "GetPluginCapabilities",
        Ok(state.identity.get_plugin_capabilities()),
    )
}

async fn probe(State(state): Shared) -> Result<Json<ProbeResponse>> {
    state.record("Probe", Ok(state.identity.probe()))
}

// =============================================================================
// Controller Handlers
// =============================================================================

async fn create_volume(
    State(state): Shared,
    Json(request): Json<CreateVolumeRequest>,
) -> Result<Json<CreateVolumeResponse>> {
    let result = match state.controller() {
        Ok(controller) => controller.create_volume(request).await,
        Err(e) => Err(e),
    };
    state.record("CreateVolume", result)
}

async fn delete_volume(
    State(state): Shared,
    Json(request): Json<DeleteVolumeRequest>,
) -> Result<Json<Empty>> {
    let result = match state.controller() {
        Ok(controller) => controller.delete_volume(request).await.map(|_| Empty {}),
        Err(e) => Err(e),
    };
    state.record("DeleteVolume", result)
}

async fn controller_publish_volume(
    State(state): Shared,
    Json(request): Json<ControllerPublishVolumeRequest>,
) -> Result<Json<ControllerPublishVolumeResponse>> {
    let result = match state.controller() {
        Ok(controller) => controller.controller_publish_volume(request).await,
        Err(e) => Err(e),
    };
    state.record("ControllerPublishVolume", result)
}

async fn controller_unpublish_volume(
    State(state): Shared,
    Json(request): Json<ControllerUnpublishVolumeRequest>,
) -> Result<Json<Empty>> {
    let result = match state.controller() {
        Ok(controller) => controller
            .controller_unpublish_volume(request)
            .await
            .map(|_| Empty {}),
        Err(e) => Err(e),
    };
    state.record("ControllerUnpublishVolume", result)
}

async fn get_capacity(
    State(state): Shared,
    Json(request): Json<GetCapacityRequest>,
) -> Result<Json<GetCapacityResponse>> {
    let result = match state.controller() {
        Ok(controller) => controller.get_capacity(request).await,
        Err(e) => Err(e),
    };
    state.record("GetCapacity", result)
}

async fn controller_get_capabilities(
    State(state): Shared,
) -> Result<Json<ControllerGetCapabilitiesResponse>> {
    let result = state
        .controller()
        .map(ControllerService::controller_get_capabilities);
    state.record("ControllerGetCapabilities", result)
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn node_stage_volume(
    State(state): Shared,
    Json(request): Json<NodeStageVolumeRequest>,
) -> Result<Json<Empty>> {
    let result = match state.node() {
        Ok(node) => node.node_stage_volume(request).await.map(|_| Empty {}),
        Err(e) => Err(e),
    };
    state.record("NodeStageVolume", result)
}

async fn node_unstage_volume(
    State(state): Shared,
    Json(request): Json<NodeUnstageVolumeRequest>,
) -> Result<Json<Empty>> {
    let result = match state.node() {
        Ok(node) => node.node_unstage_volume(request).await.map(|_| Empty {}),
        Err(e) => Err(e),
    };
    state.record("NodeUnstageVolume", result)
}

async fn node_publish_volume(
    State(state): Shared,
    Json(request): Json<NodePublishVolumeRequest>,
) -> Result<Json<Empty>> {
    let result = match state.node() {
        Ok(node) => node.node_publish_volume(request).await.map(|_| Empty {}),
        Err(e) => Err(e),
    };
    state.record("NodePublishVolume", result)
}

async fn node_unpublish_volume(
    State(state): Shared,
    Json(request): Json<NodeUnpublishVolumeRequest>,
) -> Result<Json<Empty>> {
    let result = match state.node() {
        Ok(node) => node.node_unpublish_volume(request).await.map(|_| Empty {}),
        Err(e) => Err(e),
    };
    state.record("NodeUnpublishVolume", result)
}

async fn node_get_volume_stats(
    State(state): Shared,
    Json(request): Json<NodeGetVolumeStatsRequest>,
) -> Result<Json<NodeGetVolumeStatsResponse>> {
    let result = match state.node() {
        Ok(node) => node.node_get_volume_stats(request).await,
        Err(e) => Err(e),
    };
    state.record("NodeGetVolumeStats", result)
}

async fn node_expand_volume(
    State(state): Shared,
    Json(request): Json<NodeExpandVolumeRequest>,
) -> Result<Json<NodeExpandVolumeResponse>> {
    let result = match state.node() {
        Ok(node) => node.node_expand_volume(request).await,
        Err(e) => Err(e),
    };
    state.record("NodeExpandVolume", result)
}

async fn node_get_info(State(state): Shared) -> Result<Json<NodeGetInfoResponse>> {
    let result = match state.node() {
        Ok(node) => node.node_get_info().await,
        Err(e) => Err(e),
    };
    state.record("NodeGetInfo", result)
}

async fn node_get_capabilities(State(state): Shared) -> Result<Json<NodeGetCapabilitiesResponse>> {
    let result = state.node().map(NodeService::node_get_capabilities);
    state.record("NodeGetCapabilities", result)
}

// =============================================================================
// Health Listener
// =============================================================================

/// Router serving `/healthz`, `/readyz` and `/metrics`
pub fn health_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> Result<String> {
    metrics.render()
}

/// Serve the health router on a TCP address
pub async fn serve_health(addr: &str, metrics: Arc<Metrics>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        Error::Configuration(format!("failed to bind health server on {}: {}", addr, e))
    })?;

    info!("Health server listening on {}", addr);
    axum::serve(listener, health_router(metrics)).await?;
    Ok(())
}
