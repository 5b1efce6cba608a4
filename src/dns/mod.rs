//! DNS TXT chat.
//!
//! A prompt is tunnelled in the name of a `TXT` query under the configured
//! [`Config::dns_suffix`][`crate::config::Config::dns_suffix`] zone, with dashes standing
//! in for spaces. The answer comes back as the query's single `TXT` record.
//!
//! E.g. with the default `ch.at` suffix:
//!
//! ```bash
//! ❯ dig @127.0.0.1 -p 5353 +short what-is-2-2.ch.at TXT
//! "4"
//! ```
//!
//! Answers are generated under [`Config::dns_deadline`][`crate::config::Config::dns_deadline`]
//! and cut to fit one 512 byte datagram, ending in `...` when cut. An answer that can't
//! be generated in time is `Request timed out`. Answers longer than 255 bytes are split
//! over several character-strings of the same record; clients should concatenate them.
//!
//! Nothing is sent back for datagrams that aren't queries, can't be decoded, or come from
//! a client over its rate limit.
//!
//! _Note: compression pointers in query names are refused. Answers that still overflow
//! the datagram (multi-byte text) are cut at the byte level with the `TC` bit set,
//! which leaves the last character-string damaged._

pub mod codec;
mod handlers;
pub mod server;

pub use server::{new, DnsServer};
