use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden::{
    crypto::OsEntropy,
    node::{AuthorityNode, ControlPlane, NodeStatus},
    pairing::{PairingRequest, TokenValue},
    storage::FsStorage,
    time::SystemClock,
    ClusterConfig, DeviceId, DeviceIdentity, ModeState, Result,
};

#[derive(Debug, Parser)]
#[command(name = "warden-node", about = "Cluster authority node")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Create cluster state with this node as the genesis authority.
    #[arg(long)]
    bootstrap: bool,
}

#[derive(Debug, Clone)]
struct AppState {
    node: AuthorityNode,
    start_time: std::time::Instant,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: NodeStatus,
    uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct PermittedRequest {
    device_id: String,
    operation: String,
}

#[derive(Debug, Serialize)]
struct PermittedResponse {
    permitted: bool,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
    expires_at: warden::time::Timestamp,
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    device_id: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn reject(status: StatusCode, e: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.node.status().await,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn get_mode(State(state): State<AppState>) -> Json<ModeState> {
    Json(state.node.current_mode())
}

async fn post_permitted(
    State(state): State<AppState>,
    Json(request): Json<PermittedRequest>,
) -> Json<PermittedResponse> {
    // A malformed id is simply not permitted.
    let permitted = match request.device_id.parse::<DeviceId>() {
        Ok(device) => state.node.is_write_permitted(device, &request.operation).await,
        Err(_) => false,
    };
    Json(PermittedResponse { permitted })
}

async fn post_pairing_token(State(state): State<AppState>) -> ApiResult<TokenResponse> {
    let token = state
        .node
        .issue_pairing_token()
        .await
        .map_err(|e| reject(StatusCode::FORBIDDEN, e))?;
    Ok(Json(TokenResponse {
        token: token.token.to_string(),
        expires_at: token.expires_at,
    }))
}

async fn get_pairing_requests(State(state): State<AppState>) -> ApiResult<Vec<PairingRequest>> {
    state
        .node
        .pending_pairing_requests()
        .await
        .map(Json)
        .map_err(|e| reject(StatusCode::INTERNAL_SERVER_ERROR, e))
}

async fn post_pairing_approve(
    State(state): State<AppState>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<warden::RegistryEntry> {
    let device: DeviceId = request
        .device_id
        .parse()
        .map_err(|e| reject(StatusCode::BAD_REQUEST, e))?;
    let token: TokenValue = request
        .token
        .parse()
        .map_err(|e| reject(StatusCode::BAD_REQUEST, e))?;

    let pending = PairingRequest::fetch(state.node.plane().storage().as_ref(), &device)
        .await
        .map_err(|e| reject(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, format!("No pairing request from {device}")))?;

    match state.node.approve_pairing(&pending, token).await {
        Ok(entry) => {
            info!("Approved pairing for {}", device);
            Ok(Json(entry))
        }
        Err(e) => {
            error!("Pairing approval for {} failed: {}", device, e);
            Err(reject(StatusCode::CONFLICT, e))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ClusterConfig::load(args.config.as_deref())?;
    info!("warden-node starting, data dir {}", config.data_dir.display());

    let identity_storage = FsStorage::open(config.identity_dir()).await?;
    let identity = DeviceIdentity::generate_or_load(&identity_storage, &OsEntropy).await?;

    let state_storage = Arc::new(FsStorage::open(config.state_dir()).await?);
    let addr = config.socket_addr()?;
    let plane = if args.bootstrap {
        ControlPlane::bootstrap(
            config,
            identity.clone(),
            state_storage,
            Arc::new(SystemClock),
            Arc::new(OsEntropy),
        )
        .await?
    } else {
        ControlPlane::open(
            config,
            identity.clone(),
            state_storage,
            Arc::new(SystemClock),
            Arc::new(OsEntropy),
        )
        .await?
    };

    let node = AuthorityNode::new(identity, plane);
    node.start().await?;
    info!("Node {} started", node.device_id());

    let state = AppState {
        node: node.clone(),
        start_time: std::time::Instant::now(),
    };
    let app = Router::new()
        .route("/status", get(get_status))
        .route("/mode", get(get_mode))
        .route("/permitted", post(post_permitted))
        .route("/pairing/token", post(post_pairing_token))
        .route("/pairing/requests", get(get_pairing_requests))
        .route("/pairing/approve", post(post_pairing_approve))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| warden::Error::Other(anyhow::anyhow!("Failed to bind {}: {}", addr, e)))?;

    info!("warden-node listening on {}", addr);
    info!("API endpoints:");
    info!("  GET  /status            - node and cluster status");
    info!("  GET  /mode              - current operating mode");
    info!("  POST /permitted         - write permission check");
    info!("  POST /pairing/token     - issue a pairing token (operator)");
    info!("  GET  /pairing/requests  - pending pairing requests (operator)");
    info!("  POST /pairing/approve   - approve a pairing request (operator)");

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    let served = server
        .await
        .map_err(|e| warden::Error::Other(anyhow::anyhow!("Server error: {}", e)));

    node.shutdown().await;
    served
}
