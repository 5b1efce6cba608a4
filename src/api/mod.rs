//! HTTP front end: a chat page, a plain-text/JSON/SSE query endpoint, and an
//! OpenAI-compatible chat completions API.
//!
//! # API Endpoints
//!
//! ## `/healthcheck` (GET)
//!
//!   Returns HTTP 200 (OK) and the JSON body `{"ok":"healthy"}` when the service is operational.
//!
//! ## `/` and `/{query}` (GET), `/` (POST)
//!
//!   Answers the question given as the `q` URL parameter, the request path, or the POST
//!   body. Form-encoded POSTs may also carry the conversation so far in the `h` field.
//!
//!   The response format follows the `Accept` header:
//!
//!   * `text/event-stream`: the answer as server-sent events, ending with `data: [DONE]`;
//!   * `application/json`: `{"question": "...", "answer": "..."}`;
//!   * `text/html`, unless the client is curl: the chat page;
//!   * anything else: the conversation as plain text.
//!
//!   ```text
//!   curl ch.at/?q=what+is+rust
//!   curl ch.at/what-is-rust
//!   curl -X POST --data 'what is rust' ch.at
//!   ```
//!
//! ## `/v1/chat/completions` (POST)
//!
//!   Accepts a JSON chat completion request:
//!
//!   ```json
//!   { "model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}], "stream": false }
//!   ```
//!
//!   Returns a `chat.completion` object, or with `"stream": true` a series of
//!   `chat.completion.chunk` events ending with `data: [DONE]`.
//!
//! Every endpoint except `/healthcheck` is subject to per-client rate limiting and
//! answers HTTP 429 (Too Many Requests) when the client is over its allowance.

mod api_error;
mod model;
mod openai;
mod routes;
pub mod server;
mod sse;

pub use server::new;
