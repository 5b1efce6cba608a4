//! ch.at
//!
//! A language model chat reachable from whatever client is at hand: a browser, `curl`,
//! an OpenAI client library, `dig`, or `ssh`.
//!
//! Each transport is a thin adapter over the same pieces:
//!
//! * an [`AdmissionController`] deciding, per client address, whether a request may
//!   proceed;
//! * a [`Generator`][`generate::Generator`] producing answers, whole or as a stream of
//!   fragments;
//! * a [`Coordinator`][`stream::Coordinator`] bounding a fragment stream by deadline and
//!   length, and cancelling the generation whichever way the request ends.
//!
//! Nothing about a conversation is stored server side. HTTP clients carry their history
//! with them; the other transports are stateless per question.
#![warn(clippy::pedantic)]

pub mod admission;
pub mod api;
#[doc(hidden)]
pub mod banner;
pub mod chat;
pub mod config;
pub mod dns;
pub mod error;
pub mod generate;
pub mod ssh;
pub mod stream;

pub use admission::{AdmissionController, ClientKey, SessionSlots};
pub use api::new as new_http;
pub use config::{Config, SharedConfig};
pub use dns::new as new_dns;
pub use generate::{DynGenerator, UpstreamGenerator};
pub use ssh::new as new_ssh;
