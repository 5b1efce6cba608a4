//! Exercises a running deployment end to end over every transport.
//!
//! ```text
//! selftest http://localhost:8080
//! ```
//!
//! Each check asks the service to repeat the word `pass` and expects exactly that back.
//! SSH is reached on port 22 and DNS on port 53 of the base URL's host. The last check
//! hammers `/` until the rate limiter answers 429. Exits non-zero if any check fails.

use anyhow::{anyhow, bail, Context, Result};
use chdotat::chat::{ChatCompletion, ChatCompletionRequest, Message};
use chdotat::dns::codec::{decode_txt_answer, encode_query, TYPE_TXT};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use russh::client;
use russh::ChannelMsg;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, timeout_at, Instant};

const QUERY: &str = "repeat verbatim the word pass";
const EXPECTED: &str = "pass";
const DNS_NAME: &str = "repeat-verbatim-the-word-pass.ch.at";
const SSH_PORT: u16 = 22;
const DNS_PORT: u16 = 53;
const RATE_LIMIT_ATTEMPTS: usize = 110;

/// Pause between checks so they don't trip the rate limiter themselves.
const CHECK_DELAY: Duration = Duration::from_millis(700);
const SSH_READ_TIMEOUT: Duration = Duration::from_secs(3);
const NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let Some(base_url) = std::env::args().nth(1) else {
        eprintln!("Usage: selftest <base-url>");
        eprintln!("Example: selftest http://localhost:8080");
        std::process::exit(1);
    };
    let base_url = base_url.trim_end_matches('/').to_string();
    let host = target_host(&base_url)?;
    let client = Client::builder().timeout(NETWORK_TIMEOUT).build()?;

    let query_url = format!("{base_url}/?q={}", QUERY.replace(' ', "+"));
    let path_url = format!("{base_url}/{}", QUERY.replace(' ', "-"));
    let mut report = Report::default();

    report
        .check("HTTP GET", expect_pass(get_text(&client, &query_url)))
        .await;
    sleep(CHECK_DELAY).await;
    report
        .check("HTTP POST", expect_pass(post_text(&client, &base_url)))
        .await;
    sleep(CHECK_DELAY).await;
    report
        .check("path-based query", expect_pass(get_text(&client, &path_url)))
        .await;
    sleep(CHECK_DELAY).await;
    report
        .check("JSON API", expect_pass(get_json_answer(&client, &query_url)))
        .await;
    sleep(CHECK_DELAY).await;
    report
        .check("OpenAI API", expect_pass(chat_completion(&client, &base_url)))
        .await;
    sleep(CHECK_DELAY).await;
    report
        .check("SSH protocol", expect_pass(ssh_answer(&host)))
        .await;
    sleep(CHECK_DELAY).await;
    report
        .check("DNS protocol", expect_pass(dns_answer(&host)))
        .await;
    sleep(CHECK_DELAY).await;
    report
        .check("rate limiting", rate_limited(&client, &base_url))
        .await;

    println!("\nTests passed: {}/{}", report.passed, report.passed + report.failed);
    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Report {
    passed: usize,
    failed: usize,
}

impl Report {
    async fn check(&mut self, name: &str, check: impl Future<Output = Result<()>>) {
        print!("Testing {name}... ");
        let _ = std::io::stdout().flush();
        match check.await {
            Ok(()) => {
                println!("✓");
                self.passed += 1;
            }
            Err(err) => {
                println!("✗ ({err:#})");
                self.failed += 1;
            }
        }
    }
}

async fn expect_pass(answer: impl Future<Output = Result<String>>) -> Result<()> {
    let answer = answer.await?;
    if answer == EXPECTED {
        return Ok(());
    }
    if answer.is_empty() {
        bail!("expected '{EXPECTED}', got an error or empty response");
    }
    bail!("expected '{EXPECTED}', got: {:?}", preview(&answer))
}

fn preview(answer: &str) -> String {
    match answer.char_indices().nth(50) {
        Some((cut, _)) => format!("{}...", &answer[..cut]),
        None => answer.to_string(),
    }
}

/// The host SSH and DNS are reached on. `localhost` is pinned to IPv4.
fn target_host(base_url: &str) -> Result<String> {
    let url = url::Url::parse(base_url).with_context(|| format!("invalid base URL {base_url}"))?;
    Ok(match url.host_str() {
        None | Some("localhost") => "127.0.0.1".to_string(),
        Some(host) => host.trim_start_matches('[').trim_end_matches(']').to_string(),
    })
}

async fn get_text(client: &Client, url: &str) -> Result<String> {
    read_answer(client.get(url).send().await?).await
}

async fn post_text(client: &Client, base_url: &str) -> Result<String> {
    let response = client
        .post(format!("{base_url}/"))
        .header(CONTENT_TYPE, "text/plain")
        .body(QUERY)
        .send()
        .await?;
    read_answer(response).await
}

async fn read_answer(response: reqwest::Response) -> Result<String> {
    if response.status() != StatusCode::OK {
        bail!("status {}", response.status().as_u16());
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Ok(extract_answer(&response.text().await?, &content_type))
}

/// The answer part of a query response: the `answer` field of JSON, the `A: ` line of
/// a plain-text conversation, or the whole body. Empty if the body reports an error.
fn extract_answer(body: &str, content_type: &str) -> String {
    let body = body.trim();
    if body.contains("error") || body.contains("Error") {
        return String::new();
    }

    if content_type.contains("json") {
        return serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("answer")?.as_str().map(|a| a.trim().to_string()))
            .unwrap_or_default();
    }

    if body.contains("\nA: ") {
        if let Some(answer) = body.lines().find_map(|line| line.strip_prefix("A: ")) {
            return answer.trim().to_string();
        }
    }
    body.to_string()
}

async fn get_json_answer(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .header(ACCEPT, "application/json")
        .send()
        .await?;
    if response.status() != StatusCode::OK {
        bail!("status {}", response.status().as_u16());
    }
    let body: serde_json::Value = response.json().await?;
    let question = body.get("question").and_then(serde_json::Value::as_str);
    if question != Some(QUERY) {
        bail!("question not echoed back: {question:?}");
    }
    body.get("answer")
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("no answer field"))
}

async fn chat_completion(client: &Client, base_url: &str) -> Result<String> {
    let request = ChatCompletionRequest {
        model: "gpt-4o".to_string(),
        messages: vec![Message::user(QUERY)],
        stream: false,
    };
    let response = client
        .post(format!("{base_url}/v1/chat/completions"))
        .json(&request)
        .send()
        .await?;
    if response.status() != StatusCode::OK {
        bail!("status {}", response.status().as_u16());
    }
    let completion: ChatCompletion = response.json().await.context("invalid response format")?;
    completion
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content.trim().to_string())
        .ok_or_else(|| anyhow!("no choices"))
}

/// Accepts whatever host key the server presents.
struct TrustingClient;

#[async_trait::async_trait]
impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn ssh_answer(host: &str) -> Result<String> {
    let config = Arc::new(client::Config::default());
    let mut session = timeout(
        NETWORK_TIMEOUT,
        client::connect(config, (host, SSH_PORT), TrustingClient),
    )
    .await
    .context("connect timed out")??;
    if !session.authenticate_none("anonymous").await? {
        bail!("anonymous login refused");
    }

    let mut channel = session.channel_open_session().await?;
    channel.request_pty(false, "xterm", 80, 40, 0, 0, &[]).await?;
    channel.request_shell(false).await?;
    channel.data(format!("{QUERY}\n").as_bytes()).await?;

    let deadline = Instant::now() + SSH_READ_TIMEOUT;
    let mut output = String::new();
    loop {
        match timeout_at(deadline, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => {
                output.push_str(&String::from_utf8_lossy(&data));
                // The next prompt means the answer is complete.
                if answer_after_query(&output).is_some() && output.ends_with("> ") {
                    break;
                }
            }
            Ok(Some(ChannelMsg::Eof | ChannelMsg::Close) | None) => break,
            Ok(Some(_)) => {}
            Err(_) if output.is_empty() => bail!("SSH timeout"),
            Err(_) => break,
        }
    }
    let _ = channel.eof().await;

    answer_after_query(&output).ok_or_else(|| anyhow!("no response extracted"))
}

/// The line following the echoed query in a terminal transcript, unless that line is a
/// prompt.
fn answer_after_query(output: &str) -> Option<String> {
    let lines: Vec<&str> = output.split('\n').map(str::trim).collect();
    lines.windows(2).find_map(|pair| {
        let (line, next) = (pair[0], pair[1]);
        (line.contains(QUERY) && !next.is_empty() && !next.starts_with('>'))
            .then(|| next.to_string())
    })
}

async fn dns_answer(host: &str) -> Result<String> {
    let server = tokio::net::lookup_host((host, DNS_PORT))
        .await?
        .next()
        .ok_or_else(|| anyhow!("can't resolve {host}"))?;
    let local = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(server).await?;

    let nanos = time::OffsetDateTime::now_utc().nanosecond();
    let id = u16::try_from(nanos % 0x1_0000).unwrap_or(1);
    socket.send(&encode_query(id, DNS_NAME, TYPE_TXT)).await?;

    let mut buf = vec![0_u8; 4096];
    let len = timeout(NETWORK_TIMEOUT, socket.recv(&mut buf))
        .await
        .context("no DNS response")??;
    let response = &buf[..len];
    if response.get(..2) != Some(&id.to_be_bytes()[..]) {
        bail!("response ID doesn't match the query");
    }
    Ok(decode_txt_answer(response)?.trim().to_string())
}

async fn rate_limited(client: &Client, base_url: &str) -> Result<()> {
    for _ in 0..RATE_LIMIT_ATTEMPTS {
        if let Ok(response) = client.get(format!("{base_url}/")).send().await {
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                return Ok(());
            }
        }
    }
    bail!("rate limit not enforced")
}
