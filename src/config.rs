use crate::error::Error;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub type SharedConfig = Arc<Config>;

/// Environment variable consulted when [`UpstreamConfig::api_key`] is unset.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Smallest useful DNS response: a header plus a root-name TXT question.
const MIN_UDP_SIZE: usize = 12 + 5;

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub http_bind_addr: Option<SocketAddr>,
    pub dns_bind_addr: Option<SocketAddr>,
    pub ssh_bind_addr: Option<SocketAddr>,

    pub dns_suffix: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dns_deadline: Duration,
    pub dns_max_answer_len: usize,
    pub dns_max_udp_size: usize,
    pub dns_ttl: u32,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub http_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub http_stream_deadline: Duration,
    pub http_history_limit: usize,
    pub http_body_limit: usize,

    pub ssh_host_key_path: PathBuf,
    pub ssh_max_sessions: usize,

    pub rate_limit: RateLimitConfig,
    pub upstream: UpstreamConfig,
}

/// Token bucket parameters shared by every transport.
#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket size, i.e. the burst a fresh client may spend at once.
    pub capacity: u32,
    /// Tokens added over each `refill_period`, accrued continuously.
    pub refill_amount: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub refill_period: Duration,
    /// Keys held by the current generation before it's rotated out.
    pub max_entries: usize,
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let any = |port: u16| Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
        Self {
            http_bind_addr: any(80),
            dns_bind_addr: any(53),
            ssh_bind_addr: any(22),
            dns_suffix: "ch.at".to_string(),
            dns_deadline: Duration::from_secs(4),
            dns_max_answer_len: 500,
            dns_max_udp_size: 512,
            dns_ttl: 0,
            http_timeout: Duration::from_secs(30),
            http_stream_deadline: Duration::from_secs(30),
            http_history_limit: 2048,
            http_body_limit: 4096,
            ssh_host_key_path: PathBuf::from("ssh_host_key"),
            ssh_max_sessions: 100,
            rate_limit: RateLimitConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_amount: 100,
            refill_period: Duration::from_secs(60),
            max_entries: 10_000,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let conf: Config = serde_json::from_reader(reader)?;
        conf.validate()?;
        Ok(conf)
    }

    /// The API key for the upstream, from the config or the environment.
    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        self.upstream
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));
        if self.rate_limit.capacity == 0 {
            return invalid("rate_limit.capacity must be non-zero");
        }
        if self.rate_limit.refill_period.is_zero() {
            return invalid("rate_limit.refill_period must be non-zero");
        }
        if self.rate_limit.max_entries == 0 {
            return invalid("rate_limit.max_entries must be non-zero");
        }
        if self.ssh_max_sessions == 0 {
            return invalid("ssh_max_sessions must be non-zero");
        }
        if self.dns_max_udp_size < MIN_UDP_SIZE {
            return invalid("dns_max_udp_size is too small for a DNS response");
        }
        if self.dns_max_answer_len < 4 {
            return invalid("dns_max_answer_len must leave room for an ellipsis");
        }
        Ok(())
    }
}
