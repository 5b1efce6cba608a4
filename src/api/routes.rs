use crate::admission::ClientKey;
use crate::api::model::{render_page, tail_utf8, AnswerResult, ChatInput, Format, RootQuery};
use crate::api::openai;
use crate::api::server::AppState;
use crate::api::sse::{self, PlainFraming};
use crate::error::Error;
use crate::stream::Coordinator;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const RATE_LIMITED: &str = "Rate limit exceeded. Please try again later.";

pub(super) fn new(state: AppState) -> Router {
    Router::new()
        .route("/", get(root).post(root))
        .route("/healthcheck", get(health_check))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/*query", get(root_path))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.http_timeout))
        .with_state(state)
}

#[allow(clippy::unused_async)]
async fn health_check() -> impl IntoResponse {
    Json(json!({"ok":"healthy"}))
}

async fn root(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<RootQuery>,
    body: Bytes,
) -> Response {
    let input = if method == Method::POST {
        let mut input =
            ChatInput::from_post(&headers, query.q, &body, state.config.http_body_limit);
        input.history = tail_utf8(&input.history, state.config.http_history_limit).to_string();
        input
    } else {
        ChatInput {
            query: query.q.unwrap_or_default(),
            history: String::new(),
        }
    };
    respond(state, client_addr, &headers, input).await
}

async fn root_path(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(query): Path<String>,
) -> Response {
    let input = ChatInput {
        query,
        history: String::new(),
    };
    respond(state, client_addr, &headers, input).await
}

async fn respond(
    state: AppState,
    client_addr: SocketAddr,
    headers: &HeaderMap,
    input: ChatInput,
) -> Response {
    if !state.admission.allow(&ClientKey::from(client_addr)) {
        tracing::debug!("rate limited {client_addr}");
        return (StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED).into_response();
    }

    let query = input.query.trim().to_string();
    let input = ChatInput { query, ..input };
    let format = Format::negotiate(headers, !input.query.is_empty());

    if format == Format::EventStream {
        let coordinator = Coordinator::with_deadline(state.config.http_stream_deadline);
        return match state.generator.generate_stream(&input.prompt()).await {
            Ok(fragments) => sse::relay(fragments, coordinator, PlainFraming).into_response(),
            Err(err) => sse::error(&PlainFraming, &err.to_string()).into_response(),
        };
    }

    let (content, json_body) = if input.query.is_empty() {
        (input.history.clone(), None)
    } else {
        let generated = tokio::time::timeout(
            state.config.http_timeout,
            state.generator.generate(&input.prompt()),
        )
        .await
        .unwrap_or(Err(Error::Timeout));
        match generated {
            Ok(answer) => {
                let content = input.with_answer(&answer, state.config.http_history_limit);
                let result = AnswerResult {
                    question: input.query.clone(),
                    answer,
                };
                (content, Some(json!(result)))
            }
            Err(err) => (format!("Error: {err}"), Some(json!({"error": err.to_string()}))),
        }
    };

    match (format, json_body) {
        (Format::Json, Some(body)) => Json(body).into_response(),
        (Format::Html, _) => Html(render_page(&content)).into_response(),
        _ => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            content,
        )
            .into_response(),
    }
}
