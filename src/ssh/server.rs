use crate::admission::{AdmissionController, ClientKey, SessionSlots};
use crate::config::SharedConfig;
use crate::error::Error;
use crate::generate::DynGenerator;
use crate::ssh::session::ChatSession;
use anyhow::Context;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const RATE_LIMITED: &[u8] = b"Rate limit exceeded. Please try again later.\r\n";
const BUSY: &[u8] = b"Too many sessions. Please try again later.\r\n";

pub struct SshServer {
    listener: TcpListener,
    russh_config: Arc<russh::server::Config>,
    admission: AdmissionController,
    slots: SessionSlots,
    generator: DynGenerator,
}

/// Bind the SSH listener, loading the host key from the configured path or creating one
/// there on first start.
///
/// # Errors
/// Fails when the host key can't be read or written, or the address can't be bound.
pub async fn new(
    config: SharedConfig,
    admission: AdmissionController,
    generator: DynGenerator,
    bind_addr: &SocketAddr,
) -> anyhow::Result<SshServer> {
    let host_key = load_or_generate_host_key(&config.ssh_host_key_path)
        .with_context(|| format!("loading host key {}", config.ssh_host_key_path.display()))?;
    let russh_config = russh::server::Config {
        methods: MethodSet::NONE,
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        inactivity_timeout: Some(Duration::from_secs(3600)),
        ..Default::default()
    };

    Ok(SshServer {
        listener: TcpListener::bind(bind_addr).await?,
        russh_config: Arc::new(russh_config),
        admission,
        slots: SessionSlots::new(config.ssh_max_sessions),
        generator,
    })
}

impl SshServer {
    /// Accept connections until the listener fails.
    ///
    /// # Errors
    /// Only returns when accepting connections fails outright.
    pub async fn block_until_done(self) -> Result<(), Error> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) if is_transient(&err) => {
                    tracing::warn!("ssh accept failed: {err}");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            tokio::spawn(serve(
                stream,
                peer,
                self.russh_config.clone(),
                self.admission.clone(),
                self.slots.clone(),
                self.generator.clone(),
            ));
        }
    }

    /// # Errors
    /// Returns an error if the listener's address can't be read.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }
}

async fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    russh_config: Arc<russh::server::Config>,
    admission: AdmissionController,
    slots: SessionSlots,
    generator: DynGenerator,
) {
    if !admission.allow(&ClientKey::from(peer)) {
        tracing::debug!("rate limited ssh connection from {peer}");
        refuse(stream, RATE_LIMITED).await;
        return;
    }
    let Some(slot) = slots.try_acquire() else {
        tracing::debug!("no ssh session slot for {peer}");
        refuse(stream, BUSY).await;
        return;
    };

    // Nagle would hold back the single-byte echoes.
    let _ = stream.set_nodelay(true);
    let session = ChatSession::new(peer, generator, slot);
    let result = match russh::server::run_stream(russh_config, stream, session).await {
        Ok(running) => running.await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        tracing::debug!("ssh session with {peer} ended: {err}");
    }
}

async fn refuse(mut stream: TcpStream, message: &[u8]) {
    let _ = stream.write_all(message).await;
    let _ = stream.shutdown().await;
}

fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::{ConnectionAborted, ConnectionReset, Interrupted};
    matches!(err.kind(), ConnectionAborted | ConnectionReset | Interrupted)
}

fn load_or_generate_host_key(path: &Path) -> Result<KeyPair, Error> {
    if path.exists() {
        return Ok(russh_keys::load_secret_key(path, None)?);
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| Error::InvalidConfig("can't generate an Ed25519 host key".to_string()))?;
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
    let file = options.open(path)?;
    russh_keys::encode_pkcs8_pem(&key, file)?;
    tracing::info!("generated ssh host key {}", path.display());
    Ok(key)
}
