//! HTTP request surface
//!
//! Read-mostly endpoints over the daemon's state plus the one mutating call
//! clients need, `POST /session/auth`.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dv_core::authorizer::{AuthorizeRequest, ClientTunnelConfig, LeaseState, PeerAuthorizer};
use dv_core::crypto::TunnelKey;
use dv_core::discovery::{DiscoveryAggregator, NodeFilter, NodeRecord};
use dv_core::ledger::{decode_node, DecodeError, NodeAccount, Pubkey, SessionAccount};
use dv_core::session::SessionVerifier;
use dv_core::DvpnError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

/// Shared handler state
pub struct AppState {
    pub verifier: Arc<SessionVerifier>,
    pub authorizer: Arc<PeerAuthorizer>,
    pub discovery: Arc<DiscoveryAggregator>,
    pub profile: NodeProfile,
    pub started_at: Instant,
}

/// What this daemon knows about itself without the ledger
#[derive(Debug, Clone, Default)]
pub struct NodeProfile {
    pub node_address: Option<Pubkey>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub tunnel_key: Option<TunnelKey>,
}

/// A [`DvpnError`] on its way to becoming an HTTP response
#[derive(Debug)]
pub struct ApiError(pub DvpnError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DvpnError::NotFound(_) => StatusCode::NOT_FOUND,
            DvpnError::OwnerMismatch { .. }
            | DvpnError::Expired { .. }
            | DvpnError::Underfunded { .. }
            | DvpnError::SessionInactive(_)
            | DvpnError::InvalidSignature(_) => StatusCode::FORBIDDEN,
            DvpnError::AddressConflict { .. } => StatusCode::CONFLICT,
            DvpnError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
            DvpnError::DaemonUnavailable(_) | DvpnError::LedgerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DvpnError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DvpnError::InvalidTunnelKey(_) | DvpnError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DvpnError> for ApiError {
    fn from(err: DvpnError) -> Self {
        ApiError(err)
    }
}

impl From<DecodeError> for ApiError {
    fn from(err: DecodeError) -> Self {
        ApiError(DvpnError::Decode(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.0.code(), "Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string(), "code": self.0.code() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Build the router over `state`
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/node", get(get_node))
        .route("/nodes", get(list_nodes))
        .route("/session/auth", post(authorize))
        .route("/session/:id", get(get_session))
        .layer(middleware::from_fn(request_span))
        .with_state(state)
}

async fn request_span(req: Request, next: Next) -> Response {
    let span = info_span!(
        "request",
        id = %Uuid::new_v4(),
        method = %req.method(),
        path = %req.uri().path(),
    );
    next.run(req).instrument(span).await
}

// ─────────────────────────────────────────────────────────────
// GET /health
// ─────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let leases = state.authorizer.leases();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "leases": leases.len(),
        "pendingLeases": leases.pending_count(),
        "nodes": state.discovery.len(),
        "ledgerStale": state.discovery.is_stale(),
    }))
}

// ─────────────────────────────────────────────────────────────
// GET /node
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub node_address: Option<Pubkey>,
    pub operator: Option<Pubkey>,
    pub node_id: Option<u64>,
    pub endpoint: String,
    pub region: Option<String>,
    /// Tunnel server key, base64
    pub tunnel_pubkey: Option<String>,
    pub price_per_minute: Option<u64>,
    pub is_active: bool,
    /// `ledger` or `config`
    pub source: &'static str,
    pub stale: bool,
}

impl NodeView {
    fn from_ledger(address: Pubkey, node: &NodeAccount) -> Self {
        Self {
            node_address: Some(address),
            operator: Some(node.provider),
            node_id: Some(node.node_id),
            endpoint: node.endpoint.clone(),
            region: Some(node.region.clone()),
            tunnel_pubkey: Some(TunnelKey::from_bytes(node.wg_server_pubkey).to_base64()),
            price_per_minute: Some(node.price_per_minute_lamports),
            is_active: node.is_active,
            source: "ledger",
            stale: false,
        }
    }

    fn from_profile(profile: &NodeProfile, stale: bool) -> Option<Self> {
        Some(Self {
            node_address: profile.node_address,
            operator: None,
            node_id: None,
            endpoint: profile.endpoint.clone()?,
            region: profile.region.clone(),
            tunnel_pubkey: profile.tunnel_key.map(|k| k.to_base64()),
            price_per_minute: None,
            is_active: true,
            source: "config",
            stale,
        })
    }
}

async fn get_node(State(state): State<Arc<AppState>>) -> ApiResult<NodeView> {
    let profile = &state.profile;
    let Some(address) = profile.node_address else {
        return NodeView::from_profile(profile, false)
            .map(Json)
            .ok_or_else(|| ApiError(DvpnError::NotFound("node is not configured".to_string())));
    };

    match state.verifier.fetch(&address).await {
        Ok(bytes) => {
            let node = decode_node(&bytes, state.verifier.layout())?;
            Ok(Json(NodeView::from_ledger(address, &node)))
        }
        Err(DvpnError::LedgerUnavailable(reason)) => {
            warn!(node = %address, "Ledger unavailable, serving configured node profile: {}", reason);
            NodeView::from_profile(profile, true)
                .map(Json)
                .ok_or(ApiError(DvpnError::LedgerUnavailable(reason)))
        }
        Err(e) => Err(e.into()),
    }
}

// ─────────────────────────────────────────────────────────────
// GET /nodes
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodesView {
    pub stale: bool,
    pub nodes: Vec<NodeRecord>,
}

async fn list_nodes(State(state): State<Arc<AppState>>, Query(filter): Query<NodeFilter>) -> Json<NodesView> {
    Json(NodesView {
        stale: state.discovery.is_stale(),
        nodes: state.discovery.list(&filter),
    })
}

// ─────────────────────────────────────────────────────────────
// GET /session/:id
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub owner: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub address: Pubkey,
    pub session: SessionAccount,
    pub lease_state: LeaseState,
    pub allocated_address: Option<Ipv4Addr>,
    /// Present when the owner was checked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<i64>,
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<SessionView> {
    let address: Pubkey = id.parse()?;

    let (session, remaining_secs) = match query.owner {
        Some(owner) => {
            let owner: Pubkey = owner.parse()?;
            let verified = state.verifier.verify_address(&address, &owner).await?;
            (verified.session, Some(verified.remaining_secs))
        }
        None => (state.verifier.load(&address).await?, None),
    };

    Ok(Json(SessionView {
        address,
        session,
        lease_state: state.authorizer.state(&address),
        allocated_address: state.authorizer.leases().get(&address).map(|l| l.allocated_address),
        remaining_secs,
    }))
}

// ─────────────────────────────────────────────────────────────
// POST /session/auth
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub allocated_address: Ipv4Addr,
    pub tunnel_peer_config: ClientTunnelConfig,
    /// The same configuration as a wg-quick file, minus the private key
    pub wg_quick: String,
    pub reused: bool,
    pub persisted: bool,
}

async fn authorize(State(state): State<Arc<AppState>>, Json(request): Json<AuthorizeRequest>) -> ApiResult<AuthResponse> {
    let grant = state.authorizer.authorize(&request).await?;
    Ok(Json(AuthResponse {
        allocated_address: grant.allocated_address,
        wg_quick: grant.client_config.to_wg_quick(),
        tunnel_peer_config: grant.client_config,
        reused: grant.reused,
        persisted: grant.persisted,
    }))
}
