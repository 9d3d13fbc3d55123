use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::metrics::UsageStats;
use crate::models::claude::ClaudeRequest;
use crate::models::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::provider::{Provider, UpstreamRequest};
use crate::streaming::orchestrator::buffer_body;
use crate::streaming::sink::BodyChunk;
use crate::streaming::sse::unix_now;
use crate::streaming::usage::estimate_input_tokens;
use crate::streaming::{Dialect, RequestDescriptor, SseSink, StreamOrchestrator};

/// Frames buffered between the session task and the client connection
const SSE_CHANNEL_CAPACITY: usize = 64;

pub struct AppState {
    pub provider: Arc<dyn Provider>,
    pub orchestrator: StreamOrchestrator,
    pub stats: Arc<UsageStats>,
    pub config: ProxyConfig,
}

impl AppState {
    pub fn new(config: ProxyConfig, provider: Arc<dyn Provider>) -> Self {
        let stats = Arc::new(UsageStats::new());
        let orchestrator = StreamOrchestrator::new(config.stream.clone(), stats.clone());
        Self {
            provider,
            orchestrator,
            stats,
            config,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .with_state(state)
}

pub async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ClaudeRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed messages request");
            return error_response(&ProxyError::InvalidRequest(e.to_string()), Dialect::Anthropic);
        }
    };
    if request.messages.is_empty() {
        return error_response(
            &ProxyError::InvalidRequest("messages must not be empty".to_string()),
            Dialect::Anthropic,
        );
    }

    let descriptor = RequestDescriptor {
        model: request.model,
        stream: request.stream,
        input_tokens: estimate_input_tokens(&body),
    };
    serve(state, body, descriptor, Dialect::Anthropic).await
}

pub async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed chat completions request");
            return error_response(&ProxyError::InvalidRequest(e.to_string()), Dialect::OpenAi);
        }
    };
    if request.messages.is_empty() {
        return error_response(
            &ProxyError::InvalidRequest("messages must not be empty".to_string()),
            Dialect::OpenAi,
        );
    }

    let descriptor = RequestDescriptor {
        model: request.model,
        stream: request.stream,
        input_tokens: estimate_input_tokens(&body),
    };
    serve(state, body, descriptor, Dialect::OpenAi).await
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "provider": state.provider.name(),
        "protocol_mode": format!("{:?}", state.config.stream.protocol_mode).to_lowercase(),
    }))
}

pub async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

async fn serve(
    state: Arc<AppState>,
    body: Bytes,
    descriptor: RequestDescriptor,
    dialect: Dialect,
) -> Response {
    info!(
        provider = state.provider.name(),
        model = %descriptor.model,
        stream = descriptor.stream,
        dialect = ?dialect,
        "Forwarding request"
    );

    let upstream = state
        .provider
        .send_request(UpstreamRequest {
            model: descriptor.model.clone(),
            body,
            stream: descriptor.stream,
        })
        .await;
    let upstream = match upstream {
        Ok(stream) => stream,
        Err(e) => {
            error!(provider = state.provider.name(), error = %e, "Upstream request failed");
            return error_response(&e, dialect);
        }
    };

    let cancel = CancellationToken::new();

    if !descriptor.stream {
        let result = match buffer_body(upstream, &cancel).await {
            Ok(bytes) => {
                state
                    .orchestrator
                    .collect_response(bytes, &descriptor, &cancel)
                    .await
            }
            Err(e) => Err(e),
        };
        return match result {
            Ok(message) => match dialect {
                Dialect::Anthropic => Json(message).into_response(),
                Dialect::OpenAi => {
                    Json(ChatCompletionResponse::from_message(&message, unix_now())).into_response()
                }
            },
            Err(e) => error_response(&e, dialect),
        };
    }

    let (tx, rx) = mpsc::channel::<BodyChunk>(SSE_CHANNEL_CAPACITY);
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let mut sink = SseSink::new(tx, dialect);
        match orchestrator
            .run_stream(upstream, &descriptor, &mut sink, &cancel)
            .await
        {
            Ok(summary) => debug!(
                message_id = %summary.message_id,
                frames = sink.frames(),
                "Stream task done"
            ),
            Err(e) => warn!(error = %e, "Stream task aborted"),
        }
    });

    let body = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

fn error_response(err: &ProxyError, dialect: Dialect) -> Response {
    let payload = match dialect {
        Dialect::Anthropic => err.to_payload(),
        Dialect::OpenAi => err.to_openai_payload(),
    };
    (err.status_code(), Json(payload)).into_response()
}
