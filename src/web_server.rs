use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    serve, Json, Router,
};
use futures::StreamExt;
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::chart::{breakdown_slices, ChartSlice};
use crate::chat::{ChatAssistant, ChatBackend, ChatPhase, ChatSession, PendingReply, Transcript};
use crate::constants;
use crate::footprint::{FootprintEstimator, FootprintResult};
use crate::gemini::{GeminiClient, GeminiError, TextStream};

// Shared application state
#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    estimator: Arc<FootprintEstimator>,
    chat_backend: GeminiClient,
}

impl AppState {
    pub fn new(
        templates: AutoReloader,
        estimator: Arc<FootprintEstimator>,
        chat_backend: GeminiClient,
    ) -> Self {
        Self {
            templates: Arc::new(templates),
            estimator,
            chat_backend,
        }
    }
}

// Minijinja Environment setup
pub fn create_minijinja_env(templates_dir: impl Into<PathBuf>) -> AutoReloader {
    let templates_dir = templates_dir.into();
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(templates_dir.clone()));
        notifier.watch_path(&templates_dir, true);
        Ok(env)
    })
}

async fn index_handler(State(state): State<AppState>) -> Response {
    let rendered = state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                tmpl.render(minijinja::context! {
                    title => constants::APP_TITLE,
                    samples => constants::SAMPLE_ITEMS,
                    model => state.chat_backend.config().model.as_str(),
                })
            })
        });

    match rendered {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!("Failed to get or render template: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html("Internal Server Error".to_string()),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct EstimateRequest {
    pub item: String,
}

#[derive(Debug, Serialize)]
pub struct EstimateResponse {
    pub result: FootprintResult,
    pub chart: Vec<ChartSlice>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

fn error_response(status: StatusCode, message: &'static str) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

async fn estimate_handler(
    State(state): State<AppState>,
    request: Result<Json<EstimateRequest>, JsonRejection>,
) -> Response {
    // The page only reads JSON bodies, so rejections are answered in JSON too.
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => {
            warn!("Rejected footprint request: {}", rejection);
            return error_response(rejection.status(), constants::BLANK_ITEM_MESSAGE);
        }
    };

    let item = request.item.trim();
    if item.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, constants::BLANK_ITEM_MESSAGE);
    }

    match state.estimator.estimate(item).await {
        Ok(result) => {
            let chart = breakdown_slices(&result);
            Json(EstimateResponse { result, chart }).into_response()
        }
        // The estimator has already logged the cause.
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.user_message()),
    }
}

/// Frames sent by the browser chat widget.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Open,
    Send { text: String },
}

/// Frames sent back to the chat widget.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame<'a> {
    Transcript {
        messages: &'a Transcript,
        waiting: bool,
        state: ChatPhase,
    },
    Rejected {
        reason: String,
    },
}

impl<'a> ServerFrame<'a> {
    pub fn snapshot<S: ChatSession>(assistant: &'a ChatAssistant<S>) -> Self {
        ServerFrame::Transcript {
            messages: assistant.transcript(),
            waiting: assistant.is_waiting(),
            state: assistant.phase(),
        }
    }
}

// WebSocket upgrade handler
async fn chat_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Chat WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state.chat_backend))
}

/// Returns false once the client can no longer be reached.
async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame<'_>) -> bool {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize chat frame: {}", e);
            return true;
        }
    };
    if socket.send(Message::Text(json)).await.is_err() {
        warn!("Chat client disconnected or send error. Closing connection.");
        return false;
    }
    true
}

async fn await_reply(pending: &mut Option<PendingReply>) -> Result<TextStream, GeminiError> {
    match pending {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

async fn next_chunk(reply: &mut Option<TextStream>) -> Option<Result<String, GeminiError>> {
    match reply {
        Some(reply) => reply.next().await,
        None => std::future::pending().await,
    }
}

// One assistant per connection. Client frames keep being read while a reply
// streams, so a second send during a turn is seen and rejected.
async fn handle_chat_socket<B: ChatBackend>(mut socket: WebSocket, backend: B) {
    info!("New chat connection established");
    let mut assistant = ChatAssistant::<B::Session>::new();
    let mut pending: Option<PendingReply> = None;
    let mut reply: Option<TextStream> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Chat client closed the connection");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Received unexpected binary message from chat client");
                        continue;
                    }
                    // Axum answers pings itself
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Chat socket error: {}", e);
                        break;
                    }
                };

                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Ignoring malformed chat frame: {}", e);
                        continue;
                    }
                };

                let delivered = match frame {
                    ClientFrame::Open => {
                        assistant.open(&backend);
                        send_frame(&mut socket, &ServerFrame::snapshot(&assistant)).await
                    }
                    ClientFrame::Send { text } => match assistant.submit(&text) {
                        Ok(request) => {
                            pending = Some(request);
                            send_frame(&mut socket, &ServerFrame::snapshot(&assistant)).await
                        }
                        Err(reason) => {
                            debug!(%reason, "Chat send rejected");
                            let frame = ServerFrame::Rejected { reason: reason.to_string() };
                            send_frame(&mut socket, &frame).await
                        }
                    },
                };
                if !delivered {
                    break;
                }
            }

            opened = await_reply(&mut pending), if pending.is_some() => {
                pending = None;
                match opened {
                    Ok(stream) => {
                        assistant.stream_opened();
                        reply = Some(stream);
                    }
                    Err(e) => assistant.fail_reply(&e),
                }
                if !send_frame(&mut socket, &ServerFrame::snapshot(&assistant)).await {
                    break;
                }
            }

            chunk = next_chunk(&mut reply), if reply.is_some() => {
                match chunk {
                    Some(Ok(text)) => assistant.apply_chunk(&text),
                    Some(Err(e)) => {
                        reply = None;
                        assistant.fail_reply(&e);
                    }
                    None => {
                        reply = None;
                        assistant.finish_reply();
                    }
                }
                if !send_frame(&mut socket, &ServerFrame::snapshot(&assistant)).await {
                    break;
                }
            }
        }
    }
    info!("Chat connection closed");
}

pub fn build_router(state: AppState) -> Router {
    // Serve static files from the configured directory
    let static_files_service = ServeDir::new(constants::STATIC_DIR.as_str()).not_found_service(
        tower::service_fn(|_| async {
            Ok::<_, std::convert::Infallible>((StatusCode::NOT_FOUND, "Not Found").into_response())
        }),
    );

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/footprint", post(estimate_handler))
        .route("/ws/chat", get(chat_ws_handler))
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_web_server(
    port: u16,
    estimator: Arc<FootprintEstimator>,
    chat_backend: GeminiClient,
) -> Result<()> {
    let templates = create_minijinja_env(constants::TEMPLATES_DIR.as_str());
    let app = build_router(AppState::new(templates, estimator, chat_backend));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}
