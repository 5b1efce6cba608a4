//! A [`Generator`] backed by an OpenAI-compatible chat completions endpoint.

use crate::chat::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, Message};
use crate::config::Config;
use crate::error::Error;
use crate::generate::Generator;
use crate::stream::{self, FragmentSender, FragmentStream};
use futures_util::StreamExt;
use reqwest::{Client, Response};
use tracing::debug;

const COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct UpstreamGenerator {
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl UpstreamGenerator {
    /// Build a generator from the `upstream` section of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upstream`] if the HTTP client can't be constructed.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = Client::builder().timeout(config.upstream.timeout).build()?;
        Ok(Self {
            client,
            url: format!(
                "{}{COMPLETIONS_PATH}",
                config.upstream.base_url.trim_end_matches('/')
            ),
            api_key: config.api_key(),
            model: config.upstream.model.clone(),
        })
    }

    async fn post(&self, prompt: &str, stream: bool) -> Result<Response, Error> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::user(prompt)],
            stream,
        };
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        debug!(stream, "requesting upstream completion");
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::GenerationFailure(format!(
                "upstream returned {status}: {}",
                detail.trim()
            )));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl Generator for UpstreamGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, Error> {
        let completion: ChatCompletion = self.post(prompt, false).await?.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| Error::GenerationFailure("upstream returned no choices".to_string()))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream, Error> {
        let response = self.post(prompt, true).await?;
        let (tx, rx) = stream::channel();
        tokio::spawn(async move {
            tokio::select! {
                () = pump_events(response, &tx) => {},
                () = tx.cancelled() => debug!("upstream stream cancelled"),
            }
        });
        Ok(rx)
    }
}

/// Read server-sent events from `response`, forwarding each chunk's delta content.
async fn pump_events(response: Response, tx: &FragmentSender) {
    let mut body = response.bytes_stream();
    // Raw bytes: a chunk may end inside a multi-byte character.
    let mut buffer = Vec::new();

    while let Some(bytes) = body.next().await {
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(err) => {
                tx.fail(err.into()).await;
                return;
            }
        };
        buffer.extend_from_slice(&bytes);

        while let Some(event) = take_event(&mut buffer) {
            match parse_event(&event) {
                Some(Ok(content)) if content.is_empty() => {}
                Some(Ok(content)) => {
                    if !tx.send(content).await {
                        return;
                    }
                }
                Some(Err(err)) => {
                    tx.fail(err).await;
                    return;
                }
                None if event.contains("[DONE]") => return,
                None => {}
            }
        }
    }

    if let Some(Ok(content)) = parse_event(&String::from_utf8_lossy(&buffer)) {
        if !content.is_empty() {
            tx.send(content).await;
        }
    }
}

/// Remove the first complete event, blank-line terminator included, from `buffer`.
fn take_event(buffer: &mut Vec<u8>) -> Option<String> {
    let end = buffer.windows(2).position(|pair| pair == b"\n\n")?;
    let event: Vec<u8> = buffer.drain(..end + 2).collect();
    Some(String::from_utf8_lossy(&event).into_owned())
}

/// Extract the delta content from one SSE event. `None` for events without data and for
/// the `[DONE]` terminator.
fn parse_event(event: &str) -> Option<Result<String, Error>> {
    let data = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .find(|data| !data.is_empty())?;
    if data == "[DONE]" {
        return None;
    }
    Some(
        serde_json::from_str::<ChatCompletionChunk>(data)
            .map(|chunk| chunk.delta_content())
            .map_err(Error::from),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn generator(base_url: String) -> UpstreamGenerator {
        let config = Config {
            upstream: UpstreamConfig {
                base_url,
                api_key: Some("test_key".to_string()),
                model: "test-model".to_string(),
                timeout: Duration::from_secs(5),
            },
            ..Config::default()
        };
        UpstreamGenerator::new(&config).unwrap()
    }

    async fn collect(mut stream: FragmentStream) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(fragment) = stream.next_fragment().await {
            out.push(fragment.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn characters_split_across_chunks_survive() {
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n\n".as_bytes();
        // Cut between the two bytes of 'é'.
        let split = event.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let chunks = vec![
            Ok::<_, std::io::Error>(event[..split].to_vec()),
            Ok(event[split..].to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let body = reqwest::Body::wrap_stream(futures_util::stream::iter(chunks));
        let response = Response::from(axum::http::Response::new(body));

        let (tx, rx) = stream::channel();
        pump_events(response, &tx).await;
        drop(tx);
        assert_eq!(collect(rx).await, vec!["café"]);
    }

    #[test]
    fn events_are_taken_whole() {
        let mut buffer = b"data: a\n\ndata: b".to_vec();
        assert_eq!(take_event(&mut buffer).as_deref(), Some("data: a\n\n"));
        assert_eq!(take_event(&mut buffer), None);
        assert_eq!(buffer, b"data: b");
    }

    #[tokio::test]
    async fn generate_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test_key"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "test-model",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop"
                }]
            })))
            .mount(&server)
            .await;

        assert_eq!(generator(server.uri()).generate("hi").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn upstream_error_status_is_a_generation_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = generator(server.uri()).generate("hi").await.unwrap_err();
        assert!(matches!(err, Error::GenerationFailure(ref msg) if msg.contains("overloaded")));
    }

    #[tokio::test]
    async fn stream_yields_delta_content() {
        let body = [
            r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
            "data: [DONE]",
        ]
        .map(|event| format!("{event}\n\n"))
        .concat();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let stream = generator(server.uri()).generate_stream("hi").await.unwrap();
        assert_eq!(collect(stream).await, vec!["Hel", "lo"]);
    }

    #[test]
    fn parse_event_ignores_comments_and_done() {
        assert!(parse_event(": keep-alive").is_none());
        assert!(parse_event("data: [DONE]").is_none());
        assert!(matches!(parse_event("data: {not json"), Some(Err(_))));
        assert_eq!(
            parse_event(r#"data: {"choices":[{"delta":{"content":"x"}}]}"#)
                .unwrap()
                .unwrap(),
            "x"
        );
    }
}
