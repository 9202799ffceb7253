//! HTTP server for the operations console.
//!
//! Chat answers and push notifications are two independent Server-Sent
//! Event streams: `POST /chat` carries one reply as [`DisplayEvent`]s,
//! `GET /push` carries tool side effects (camera feeds, images, query
//! notices) to every connected console.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | `{message, mode?, session_id?}` → SSE of display events |
//! | `GET`  | `/push` | SSE of push events (`event: media`) |
//! | `GET`  | `/modes` | Capability table |
//! | `GET`  | `/tools/list` | Registered tools with parameter schemas |
//! | `POST` | `/knowledge/reload` | Re-ingest the knowledge directory |
//! | `GET`  | `/health` | Status, version, index size, push subscribers |
//! | `GET`  | `/files/*` | Static downloads from the knowledge directory |
//! | `GET`  | `/images/*` | Static images, when `tools.image_dir` is set |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embeddings_disabled` (400),
//! `ingest_in_progress` (409), `internal` (500). Errors raised after a chat
//! stream has started arrive as an SSE `error` event instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use iiot_assistant_core::capability::CapabilityProfile;
use iiot_assistant_core::embedding::Embedder;
use iiot_assistant_core::models::Mode;
use iiot_assistant_core::store::memory::InMemoryIndex;
use iiot_assistant_core::store::KnowledgeStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::config::{Config, FILES_MOUNT, IMAGES_MOUNT};
use crate::dispatch::{dispatch, DisplayEvent};
use crate::embedding::create_embedder;
use crate::ingest::{run_ingest, IngestReport, IngestStrategy};
use crate::llm::openai::OpenAiChatModel;
use crate::llm::ChatModel;
use crate::orchestrator::{Orchestrator, OrchestratorLimits};
use crate::push::PushChannel;
use crate::session::SessionStore;
use crate::tools::device::spawn_simulator;
use crate::tools::{DeviceCache, ToolContext, ToolInfo, ToolRegistry};

const KEEP_ALIVE_SECS: u64 = 15;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    embedder: Option<Arc<dyn Embedder>>,
    sessions: Arc<SessionStore>,
    push: PushChannel,
    /// Held for the duration of an ingestion run.
    ingest_lock: Arc<Mutex<()>>,
}

impl AppState {
    /// `orchestrator` must have been built with the same `push` channel
    /// and `embedder` so that health and reload report on what it uses.
    pub fn new(
        config: Config,
        orchestrator: Arc<Orchestrator>,
        embedder: Option<Arc<dyn Embedder>>,
        push: PushChannel,
    ) -> Self {
        let sessions = SessionStore::new(Duration::from_secs(config.sessions.idle_ttl_secs));
        Self {
            config: Arc::new(config),
            orchestrator,
            embedder,
            sessions: Arc::new(sessions),
            push,
            ingest_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Wire the configured model, embedder, tools and in-memory index.
    /// The returned cache is the one the device tools read.
    pub fn from_config(config: &Config) -> Result<(Self, DeviceCache)> {
        let model: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::from_config(&config.llm)?);
        Self::with_model(config, model)
    }

    /// Like [`AppState::from_config`] with a caller-supplied model.
    pub fn with_model(config: &Config, model: Arc<dyn ChatModel>) -> Result<(Self, DeviceCache)> {
        let push = PushChannel::with_capacity(config.push.capacity);
        let devices = DeviceCache::new();
        let tools = ToolRegistry::from_config(config, devices.clone())?;
        let capabilities = config.capability_registry()?;
        let store: Arc<dyn KnowledgeStore> = Arc::new(InMemoryIndex::new());
        let embedder = create_embedder(&config.embedding)?;
        let ctx = ToolContext::new(push.clone(), config.server.public_url());

        let orchestrator = Orchestrator::new(
            model,
            Arc::new(tools),
            capabilities,
            store,
            embedder.clone(),
            ctx,
        )
        .with_retrieval(config.knowledge.retrieval_params())
        .with_limits(OrchestratorLimits::from_config(config));

        let state = Self::new(config.clone(), Arc::new(orchestrator), embedder, push);
        Ok((state, devices))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn push(&self) -> &PushChannel {
        &self.push
    }

    /// Run one ingestion pass, serialized with any other run.
    /// Returns `Ok(None)` when embeddings are disabled.
    pub async fn ingest(&self, strategy: IngestStrategy) -> Result<Option<IngestReport>> {
        let running = self.ingest_lock.lock().await;
        self.ingest_locked(running, strategy).await
    }

    /// Like [`ingest`](Self::ingest), but returns `None` instead of waiting
    /// when another run holds the lock.
    pub async fn try_ingest(
        &self,
        strategy: IngestStrategy,
    ) -> Option<Result<Option<IngestReport>>> {
        let running = self.ingest_lock.try_lock().ok()?;
        Some(self.ingest_locked(running, strategy).await)
    }

    async fn ingest_locked(
        &self,
        _running: MutexGuard<'_, ()>,
        strategy: IngestStrategy,
    ) -> Result<Option<IngestReport>> {
        let Some(embedder) = &self.embedder else {
            return Ok(None);
        };
        let report = run_ingest(
            &self.config.knowledge,
            embedder.as_ref(),
            self.config.embedding.batch_size,
            self.orchestrator.store().as_ref(),
            strategy,
        )
        .await?;
        Ok(Some(report))
    }
}

/// Build the router. CORS is open to every origin.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/chat", post(handle_chat))
        .route("/push", get(handle_push))
        .route("/modes", get(handle_modes))
        .route("/tools/list", get(handle_list_tools))
        .route("/knowledge/reload", post(handle_reload))
        .route("/health", get(handle_health))
        .nest_service(
            &format!("/{FILES_MOUNT}"),
            ServeDir::new(&state.config.knowledge.root),
        );
    if let Some(dir) = &state.config.tools.image_dir {
        app = app.nest_service(&format!("/{IMAGES_MOUNT}"), ServeDir::new(dir));
    }

    app.layer(cors).with_state(state)
}

/// Spawn the device simulator and the startup ingestion, as configured.
/// Both stop when `cancel` fires.
pub fn spawn_background(
    state: &AppState,
    devices: DeviceCache,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let config = state.config();

    if config.tools.simulate_devices {
        handles.push(spawn_simulator(
            devices,
            config.tools.devices.clone(),
            Duration::from_millis(config.tools.simulate_interval_ms),
            cancel.clone(),
        ));
    }

    if config.knowledge.ingest_on_startup {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let run = tokio::select! {
                _ = cancel.cancelled() => return,
                run = state.ingest(IngestStrategy::Append) => run,
            };
            match run {
                Ok(Some(report)) => {
                    tracing::info!(chunks = report.chunks, "startup ingestion complete")
                }
                Ok(None) => tracing::info!("embeddings disabled, knowledge base not indexed"),
                Err(e) => tracing::error!(error = %format!("{e:#}"), "startup ingestion failed"),
            }
        }));
    }

    handles
}

/// Serve until Ctrl-C, then stop background work.
pub async fn run_server(config: &Config) -> Result<()> {
    let (state, devices) = AppState::from_config(config)?;
    let cancel = CancellationToken::new();
    let background = spawn_background(&state, devices, cancel.clone());

    tracing::info!(
        model = state.orchestrator().model_name(),
        tools = state.orchestrator().tools().len(),
        knowledge = %config.knowledge.root.display(),
        "assistant configured"
    );

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "assistant listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
            }
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    tracing::info!("assistant stopped");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %format!("{err:#}"), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{err:#}"),
    }
}

// ============ POST /chat ============

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
}

fn sse_event(event: &DisplayEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.name()).json_data(event)
}

/// Dropping the response (client disconnect) cancels the conversation.
async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let mode = Mode::from_label(req.mode.as_deref());
    let session = state.sessions.get_or_create(req.session_id.as_deref());
    let cancel = CancellationToken::new();
    let on_disconnect = cancel.clone().drop_guard();

    let tokens = state
        .orchestrator
        .converse(session, req.message, mode, cancel);
    let mut events = dispatch(tokens);

    let stream = async_stream::stream! {
        let _on_disconnect = on_disconnect;
        while let Some(event) = events.next().await {
            yield sse_event(&event);
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_SECS))
            .text("keepalive"),
    ))
}

// ============ GET /push ============

async fn handle_push(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let mut rx = state.push.subscribe();
    tracing::debug!(subscribers = state.push.subscriber_count(), "push subscriber connected");

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Event::default().event("media").json_data(&event);
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_SECS))
            .text("keepalive"),
    )
}

// ============ GET /modes ============

#[derive(Serialize)]
struct ModeInfo {
    mode: Mode,
    #[serde(flatten)]
    profile: CapabilityProfile,
    uses_retrieval: bool,
}

#[derive(Serialize)]
struct ModeListResponse {
    modes: Vec<ModeInfo>,
}

async fn handle_modes(State(state): State<AppState>) -> Json<ModeListResponse> {
    let modes = state
        .orchestrator
        .capabilities()
        .profiles()
        .map(|(mode, profile)| ModeInfo {
            mode,
            profile: profile.clone(),
            uses_retrieval: mode.uses_retrieval(),
        })
        .collect();
    Json(ModeListResponse { modes })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.orchestrator.tools().list(),
    })
}

// ============ POST /knowledge/reload ============

async fn handle_reload(State(state): State<AppState>) -> Result<Json<IngestReport>, AppError> {
    let Some(outcome) = state.try_ingest(IngestStrategy::Replace).await else {
        return Err(AppError {
            status: StatusCode::CONFLICT,
            code: "ingest_in_progress",
            message: "an ingestion run is already in progress".into(),
        });
    };

    match outcome {
        Ok(Some(report)) => Ok(Json(report)),
        Ok(None) => Err(AppError {
            status: StatusCode::BAD_REQUEST,
            code: "embeddings_disabled",
            message: "embeddings are disabled; set [embedding] provider to index knowledge".into(),
        }),
        Err(e) => Err(internal(e)),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    model: String,
    index_size: usize,
    push_subscribers: usize,
    sessions: usize,
}

async fn handle_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let index_size = state.orchestrator.store().len().await.map_err(internal)?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        model: state.orchestrator.model_name().to_string(),
        index_size,
        push_subscribers: state.push.subscriber_count(),
        sessions: state.sessions.len(),
    }))
}
