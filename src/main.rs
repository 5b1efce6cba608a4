use anyhow::{anyhow, Result};
use chdotat::error::Error;
use chdotat::{AdmissionController, Config, DynGenerator, SharedConfig, UpstreamGenerator};
use is_terminal::IsTerminal;
use std::future::pending;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let mut first_args = std::env::args().take(2);
    let (program_name, config_file) = (
        first_args.next().unwrap_or("chdotat".to_string()),
        first_args.next(),
    );

    let config = config_init(&program_name, config_file)?;
    let admission = AdmissionController::new(&config.rate_limit);
    let generator: DynGenerator = Arc::new(UpstreamGenerator::new(&config)?);

    if config.api_key().is_none() {
        tracing::warn!("no upstream API key configured, generation requests will likely fail");
    }

    if std::io::stdout().is_terminal() {
        println!("{}", chdotat::banner::BANNER);
    }

    let http_handle = match config.http_bind_addr {
        Some(addr) => {
            tracing::info!("HTTP listening on {addr}");
            let api_server =
                chdotat::api::new(config.clone(), admission.clone(), generator.clone(), &addr);
            Some(tokio::spawn(async move { api_server.await.map_err(Error::from) }))
        }
        None => None,
    };

    let dns_handle = match config.dns_bind_addr {
        Some(addr) => {
            tracing::info!("DNS listening on UDP {addr}");
            let dns_server =
                chdotat::dns::new(config.clone(), admission.clone(), generator.clone(), &addr)
                    .await?;
            Some(tokio::spawn(dns_server.block_until_done()))
        }
        None => None,
    };

    let ssh_handle = match config.ssh_bind_addr {
        Some(addr) => {
            tracing::info!("SSH listening on {addr}");
            let ssh_server =
                chdotat::ssh::new(config.clone(), admission.clone(), generator.clone(), &addr)
                    .await?;
            Some(tokio::spawn(ssh_server.block_until_done()))
        }
        None => None,
    };

    if http_handle.is_none() && dns_handle.is_none() && ssh_handle.is_none() {
        return Err(anyhow!("no listeners configured"));
    }

    // TODO: graceful shutdown that lets in-flight answers finish.
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("quitting from signal");
        },
        res = wait(http_handle) => return res.map_err(|err| anyhow!("HTTP server failed: {err}")),
        res = wait(dns_handle) => return res.map_err(|err| anyhow!("DNS server failed: {err}")),
        res = wait(ssh_handle) => return res.map_err(|err| anyhow!("SSH server failed: {err}")),
    }
    tracing::info!("goodbye");
    Ok(())
}

/// Resolves when the listener task ends; never, for a listener that isn't running.
async fn wait(handle: Option<JoinHandle<Result<(), Error>>>) -> Result<()> {
    match handle {
        Some(handle) => Ok(handle.await??),
        None => pending().await,
    }
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chdotat=info".into()),
        )
        .init();
}

fn config_init(program_name: &str, config_file: Option<String>) -> Result<SharedConfig> {
    match config_file {
        None => Err(anyhow!("usage: {program_name} /path/to/config.json")),
        Some(config_file) => {
            let config = Config::try_from_file(&config_file)?;
            tracing::debug!("loaded config from {config_file}");
            Ok(Arc::new(config))
        }
    }
}
