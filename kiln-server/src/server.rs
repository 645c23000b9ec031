use crate::config::{MasterConfig, ShutdownMode};
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use kiln_core::{
    ClaimRow, ClaimStore, Db, EntityStore, EventBus, FileMtimeSignal, InMemoryRealm, JsonChannel,
    KilnError, LogEndpoint, LogsEndpoint, LogStore, MasterSessionHandler, NoopHooks, Realm,
    ResourceKind, WorkerSession,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub log_endpoint: LogEndpoint,
    pub logs_endpoint: LogsEndpoint,
    pub claim_store: ClaimStore,
    pub config: MasterConfig,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> axum::Json<Self> {
        axum::Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(message: impl Into<String>) -> axum::Json<Self> {
        axum::Json(Self {
            success: false,
            data: None,
            error: Some(message.into()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ClaimsQuery {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    master: Option<String>,
}

pub async fn run_server(config: MasterConfig) -> anyhow::Result<()> {
    let db = Db::open(&config.db_path)?;
    let bus = EventBus::new();
    let claim_store = ClaimStore::new(db.clone());
    let entity_store = EntityStore::new(db.clone());
    let log_store = LogStore::new(db, bus.clone());

    let realm: Arc<dyn Realm> = Arc::new(InMemoryRealm::with_credentials(
        config
            .credentials
            .iter()
            .map(|c| (c.worker.clone(), c.secret.clone())),
    ));

    // Worker listener: one session per accepted connection.
    let worker_listener = TcpListener::bind(&config.worker_addr).await?;
    tracing::info!("worker listener on {}", config.worker_addr);
    {
        let claim_store = claim_store.clone();
        let bus = bus.clone();
        let config = config.clone();
        tokio::spawn(async move {
            loop {
                match worker_listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!("accepted worker connection from {}", peer);
                        let claim_store = claim_store.clone();
                        let bus = bus.clone();
                        let realm = realm.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            serve_worker_connection(stream, claim_store, bus, realm, config).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("accepting worker connection failed: {}", e);
                    }
                }
            }
        });
    }

    let state = Arc::new(ServerState {
        log_endpoint: LogEndpoint::new(log_store.clone(), entity_store.clone()),
        logs_endpoint: LogsEndpoint::new(log_store, entity_store),
        claim_store,
        config: config.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/claims", get(list_claims))
        .route("/api/v1/*path", get(get_resource))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(&config.api_addr).await?;
    tracing::info!("api listening on {}", config.api_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Drive one worker connection from accept to teardown.
async fn serve_worker_connection(
    stream: TcpStream,
    claim_store: ClaimStore,
    bus: EventBus,
    realm: Arc<dyn Realm>,
    config: MasterConfig,
) {
    let session = Arc::new(WorkerSession::new(
        config.master_id.clone(),
        claim_store,
        bus,
    ));
    let handler = MasterSessionHandler::new(session.clone(), realm);
    let channel = JsonChannel::from_stream(stream, handler.clone());
    handler.bind(channel.clone());

    let keepalive = session.clone().spawn_keepalive(
        config.keepalive_interval,
        config.keepalive_timeout,
        Arc::new(NoopHooks),
    );

    let signal_poll = match config.shutdown.mode {
        ShutdownMode::File => config.shutdown.signal_file.clone().map(|path| {
            let session = session.clone();
            let interval = config.shutdown_poll_interval.max(1);
            tokio::spawn(async move {
                let signal = FileMtimeSignal::new(path);
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_secs(interval));
                loop {
                    ticker.tick().await;
                    if session.state() == kiln_core::SessionState::Disconnected {
                        break;
                    }
                    if let Err(e) = session.poll_shutdown_signal(&signal).await {
                        tracing::debug!("shutdown signal poll failed: {}", e);
                    }
                }
            })
        }),
        _ => None,
    };

    channel.wait_closed().await;
    session.detach().await;

    if let Some(task) = keepalive {
        task.abort();
    }
    if let Some(task) = signal_poll {
        task.abort();
    }
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

async fn list_claims(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ClaimsQuery>,
) -> Response {
    let kind = match query.kind.as_deref() {
        None => None,
        Some("changesource") => Some(ResourceKind::ChangeSource),
        Some("worker") => Some(ResourceKind::Worker),
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                ApiResponse::<Vec<ClaimRow>>::err(format!("unknown resource kind '{}'", other)),
            )
                .into_response();
        }
    };

    match state
        .claim_store
        .claims(kind, query.active, query.master.as_deref())
    {
        Ok(rows) => ApiResponse::ok(rows).into_response(),
        Err(e) => {
            tracing::error!("claims query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::<Vec<ClaimRow>>::err(e.to_string()),
            )
                .into_response()
        }
    }
}

/// Resolve a data-API path through the router endpoints.
///
/// Collection shapes (ending in `/logs`) return an array, possibly empty;
/// single shapes return the entity or 404. A path matching no declared
/// pattern is a 400, not a 404.
async fn get_resource(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> Response {
    let path = format!("/{}", path.trim_start_matches('/'));

    if path.ends_with("/logs") {
        return match state.logs_endpoint.get(&path) {
            Ok(logs) => ApiResponse::ok(logs).into_response(),
            Err(e) => router_error(e),
        };
    }

    match state.log_endpoint.get(&path) {
        Ok(Some(log)) => ApiResponse::ok(log).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::err("not found"),
        )
            .into_response(),
        Err(e) => router_error(e),
    }
}

fn router_error(e: KilnError) -> Response {
    match e {
        KilnError::UnknownPath(path) => (
            StatusCode::BAD_REQUEST,
            ApiResponse::<()>::err(format!("unrecognized path '{}'", path)),
        )
            .into_response(),
        other => {
            tracing::error!("resource lookup failed: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::<()>::err(other.to_string()),
            )
                .into_response()
        }
    }
}
