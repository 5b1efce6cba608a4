use crate::admission::ClientKey;
use crate::api::api_error::APIError;
use crate::api::server::AppState;
use crate::api::sse::{self, ChunkFraming};
use crate::chat::{ChatCompletion, ChatCompletionRequest};
use crate::error::Error;
use crate::stream::Coordinator;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::WithRejection;
use std::net::SocketAddr;
use time::OffsetDateTime;

pub(super) async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    WithRejection(Json(request), _): WithRejection<Json<ChatCompletionRequest>, APIError>,
) -> Result<Response, APIError> {
    if !state.admission.allow(&ClientKey::from(client_addr)) {
        return Err(Error::AdmissionRejected.into());
    }
    if request.messages.is_empty() {
        return Err(Error::BadRequest("messages must not be empty".to_string()).into());
    }

    let created = OffsetDateTime::now_utc().unix_timestamp();
    let id = format!("chatcmpl-{created}");
    let model = if request.model.is_empty() {
        state.config.upstream.model.clone()
    } else {
        request.model.clone()
    };
    let prompt = request.prompt();

    if request.stream {
        let framing = ChunkFraming { id, created, model };
        let coordinator = Coordinator::with_deadline(state.config.http_stream_deadline);
        return Ok(match state.generator.generate_stream(&prompt).await {
            Ok(fragments) => sse::relay(fragments, coordinator, framing).into_response(),
            Err(err) => sse::error(&framing, &err.to_string()).into_response(),
        });
    }

    let answer = tokio::time::timeout(state.config.http_timeout, state.generator.generate(&prompt))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|err| Error::GenerationFailure(format!("Chat error: {err}")))?;
    Ok(Json(ChatCompletion::reply(id, created, model, answer)).into_response())
}

#[cfg(test)]
mod tests {
    use crate::api::routes::tests::{app_with_capacity, body_string};
    use crate::chat::{ChatCompletion, ChatCompletionChunk, Role};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn completion_request(body: Value) -> Request<Body> {
        Request::post("/v1/chat/completions")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn returns_a_single_choice_completion() {
        let request = completion_request(json!({
            "model": "test-model",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ]
        }));
        let response = app_with_capacity(10).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let completion: ChatCompletion =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.model, "test-model");
        assert!(completion.id.starts_with("chatcmpl-"));
        assert_eq!(completion.choices.len(), 1);
        assert_eq!(completion.choices[0].message.role, Role::Assistant);
        assert_eq!(completion.choices[0].message.content, "echo: be brief\nhello");
    }

    #[tokio::test]
    async fn streams_chunks_then_done() {
        let request = completion_request(json!({
            "messages": [{"role": "user", "content": "a b"}],
            "stream": true
        }));
        let response = app_with_capacity(10).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let frames: Vec<&str> = body
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| f.trim_start_matches("data: "))
            .collect();
        assert_eq!(frames.last(), Some(&"[DONE]"));
        let text: String = frames[..frames.len() - 1]
            .iter()
            .map(|f| {
                let chunk: ChatCompletionChunk = serde_json::from_str(f).unwrap();
                assert_eq!(chunk.object, "chat.completion.chunk");
                chunk.delta_content()
            })
            .collect();
        assert_eq!(text, "a b");
    }

    #[tokio::test]
    async fn generation_failure_is_500() {
        let request = completion_request(json!({
            "messages": [{"role": "user", "content": "fail now"}]
        }));
        let response = app_with_capacity(10).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body, json!({"error": "Chat error: backend down"}));
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let empty = completion_request(json!({"messages": []}));
        let response = app_with_capacity(10).oneshot(empty).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let syntax = Request::post("/v1/chat/completions")
            .header("Content-Type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app_with_capacity(10).oneshot(syntax).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let untyped = Request::post("/v1/chat/completions")
            .body(Body::from("{}"))
            .unwrap();
        let response = app_with_capacity(10).oneshot(untyped).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn rate_limited_clients_get_429() {
        let app = app_with_capacity(1);
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let first = app.clone().oneshot(completion_request(body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(completion_request(body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
