//! Error types.

use crate::dns::codec::DecodeError;
use axum::extract::rejection::JsonRejection;

/// Error enumerates the possible chdotat error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when the [`AdmissionController`][crate::admission::AdmissionController]
    /// refuses a request from a client that has exhausted its token bucket.
    #[error("Rate limit exceeded. Please try again later.")]
    AdmissionRejected,

    /// Returned when an inbound DNS datagram can't be decoded, or is itself a response.
    /// The DNS adapter drops these without replying.
    #[error("malformed input: {0}")]
    MalformedInput(#[from] DecodeError),

    /// Returned when the generation backend fails. Adapters surface the message as
    /// ordinary answer text rather than as a transport level failure.
    #[error("{0}")]
    GenerationFailure(String),

    /// Returned when a generation doesn't produce an answer before its deadline.
    #[error("Request timed out")]
    Timeout,

    /// Returned when clients `POST` a request body that can't be used as a prompt.
    #[error("{0}")]
    BadRequest(String),

    /// Returned when clients `POST` invalid JSON.
    #[error(transparent)]
    JsonExtractorRejection(#[from] JsonRejection),

    /// Returned when the [`Config`][crate::config::Config] fails validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when processing JSON from disk or from the upstream fails due to invalid
    /// JSON content.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),

    /// Returned when the upstream generation endpoint can't be reached.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Returned when the HTTP server stops serving.
    #[error("HTTP server error: {0}")]
    HTTPError(#[from] hyper::Error),

    /// Returned when the SSH transport fails.
    #[error("SSH error")]
    SSHError(#[from] russh::Error),

    /// Returned when the SSH host key can't be loaded, generated or saved.
    #[error("SSH host key error")]
    SSHKeyError(#[from] russh_keys::Error),
}
