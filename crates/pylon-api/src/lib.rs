//! Pylon API -- the node's two HTTP surfaces.
//!
//! [`admin_router`] is the local-operator surface (`/api/v1`, bearer token,
//! loopback bind by default). The peer-facing `/rpc` surface lives in
//! [`rpc`]. Both submit actions to the RIB task through an [`ActionHandle`]
//! and read through the published snapshot cell; neither touches the `Rib`
//! directly.

pub mod rpc;

pub use rpc::rpc_router;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use pylon_protocol::{Action, PeerInfo, PeerRecord, Route, RouteProtocol};
use pylon_rib::{PlanError, RibState, SnapshotCell};
use pylon_transport::{TransportCounters, TransportStats};

/// One queued action plus its reply slot.
#[derive(Debug)]
pub struct ActionRequest {
    pub action: Action,
    pub reply: oneshot::Sender<Result<Arc<RibState>, PlanError>>,
}

/// Failure to get an action committed.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The RIB task has stopped; the node is shutting down.
    #[error("rib task unavailable")]
    Unavailable,
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Cloneable submitter to the RIB task's action queue.
#[derive(Debug, Clone)]
pub struct ActionHandle {
    tx: mpsc::Sender<ActionRequest>,
}

impl ActionHandle {
    pub fn new(tx: mpsc::Sender<ActionRequest>) -> Self {
        ActionHandle { tx }
    }

    /// Queue an action and await its commit or rejection.
    pub async fn submit(&self, action: Action) -> Result<Arc<RibState>, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActionRequest { action, reply })
            .await
            .map_err(|_| SubmitError::Unavailable)?;
        match rx.await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(e)) => Err(SubmitError::Plan(e)),
            Err(_) => Err(SubmitError::Unavailable),
        }
    }
}

/// Shared state for both HTTP surfaces.
pub struct AppState {
    pub node_name: String,
    /// Local-operator credential for the admin surface.
    pub admin_token: String,
    /// Mesh credential peers present on `/rpc`.
    pub peer_token: String,
    pub start_time: Instant,
    pub handle: ActionHandle,
    pub snapshots: Arc<SnapshotCell>,
    pub transport_stats: Arc<TransportStats>,
}

/// Build the admin router.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/peers", get(peers))
        .route("/api/v1/routes", get(routes))
        .route("/api/v1/peers/create", post(peers_create))
        .route("/api/v1/peers/delete", post(peers_delete))
        .route("/api/v1/routes/create", post(routes_create))
        .route("/api/v1/routes/delete", post(routes_delete))
        .with_state(state)
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {}", state.admin_token);
    if auth != expected {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCreateRequest {
    pub peer_info: PeerInfo,
}

#[derive(Debug, Deserialize)]
pub struct PeerDeleteRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RouteCreateRequest {
    pub route: Route,
}

#[derive(Debug, Deserialize)]
pub struct RouteDeleteRequest {
    pub name: String,
    pub protocol: RouteProtocol,
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MutationResponse {
    fn ok() -> Self {
        MutationResponse {
            success: true,
            error: None,
        }
    }

    fn err(msg: impl Into<String>) -> Self {
        MutationResponse {
            success: false,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node: String,
    pub uptime_secs: u64,
    pub snapshot_version: u64,
    pub peers_total: usize,
    pub peers_connected: usize,
    pub local_routes: usize,
    pub learned_routes: usize,
    pub transport: TransportCounters,
}

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub total: usize,
    pub connected: usize,
    pub peers: Vec<PeerDetail>,
}

/// One peer record as shown to operators. The peer token never leaves the
/// node.
#[derive(Debug, Serialize)]
pub struct PeerDetail {
    pub name: String,
    pub endpoint: Option<String>,
    pub domains: Vec<String>,
    pub status: &'static str,
    pub hold_time_secs: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_message_received: Option<DateTime<Utc>>,
    pub routes: usize,
}

impl PeerDetail {
    fn from_record(record: &PeerRecord, routes: usize) -> Self {
        PeerDetail {
            name: record.info.name.clone(),
            endpoint: record.info.endpoint.clone(),
            domains: record.info.domains.clone(),
            status: record.status.name(),
            hold_time_secs: record.hold_time_secs,
            last_connected: record.last_connected,
            last_message_received: record.last_message_received,
            routes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RoutesResponse {
    pub local: Vec<Route>,
    pub learned: Vec<LearnedRoute>,
}

#[derive(Debug, Serialize)]
pub struct LearnedRoute {
    pub route: Route,
    pub peer: String,
    pub node_path: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let snapshot = state.snapshots.get().unwrap_or_default();
    let (local_routes, peers_total, learned_routes) = snapshot.counts();
    Json(StatusResponse {
        node: state.node_name.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        snapshot_version: snapshot.version,
        peers_total,
        peers_connected: snapshot.connected_peers().count(),
        local_routes,
        learned_routes,
        transport: state.transport_stats.snapshot(),
    })
    .into_response()
}

async fn peers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let snapshot = state.snapshots.get().unwrap_or_default();
    let peers: Vec<PeerDetail> = snapshot
        .internal
        .peers
        .values()
        .map(|record| {
            PeerDetail::from_record(record, snapshot.routes_from(record.name()).count())
        })
        .collect();
    let connected = peers.iter().filter(|p| p.status == "connected").count();
    Json(PeersResponse {
        total: peers.len(),
        connected,
        peers,
    })
    .into_response()
}

async fn routes(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let snapshot = state.snapshots.get().unwrap_or_default();
    let local: Vec<Route> = snapshot
        .local
        .routes
        .values()
        .map(|r| r.as_ref().clone())
        .collect();
    let learned: Vec<LearnedRoute> = snapshot
        .internal
        .routes
        .values()
        .map(|r| LearnedRoute {
            route: r.route.clone(),
            peer: r.peer_name.clone(),
            node_path: r.node_path.clone(),
        })
        .collect();
    Json(RoutesResponse { local, learned }).into_response()
}

async fn peers_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PeerCreateRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    submit_mutation(
        &state,
        Action::LocalPeerCreate {
            peer_info: req.peer_info,
        },
    )
    .await
}

async fn peers_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PeerDeleteRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    submit_mutation(&state, Action::LocalPeerDelete { name: req.name }).await
}

async fn routes_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RouteCreateRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    submit_mutation(&state, Action::LocalRouteCreate { route: req.route }).await
}

async fn routes_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RouteDeleteRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    submit_mutation(
        &state,
        Action::LocalRouteDelete {
            name: req.name,
            protocol: req.protocol,
        },
    )
    .await
}

/// Run one mutation through the RIB task and shape the reply. Rejections
/// keep their taxonomy: validation is the caller's fault, unknown names are
/// not found.
async fn submit_mutation(state: &AppState, action: Action) -> axum::response::Response {
    let kind = action.kind();
    match state.handle.submit(action).await {
        Ok(snapshot) => {
            tracing::info!(
                action = kind,
                version = snapshot.version,
                "admin mutation committed"
            );
            Json(MutationResponse::ok()).into_response()
        }
        Err(SubmitError::Plan(e)) => {
            let status = match &e {
                PlanError::Validation(_) => StatusCode::BAD_REQUEST,
                PlanError::PeerNotFound(_) | PlanError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            };
            (status, Json(MutationResponse::err(e.to_string()))).into_response()
        }
        Err(SubmitError::Unavailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(MutationResponse::err("node is shutting down")),
        )
            .into_response(),
    }
}
