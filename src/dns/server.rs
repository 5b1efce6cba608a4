use crate::admission::AdmissionController;
use crate::config::SharedConfig;
use crate::dns::codec::MAX_UDP_SIZE;
use crate::dns::handlers::Handler;
use crate::error::Error;
use crate::generate::DynGenerator;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// A bound DNS listener. Each datagram is answered on its own task.
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    handler: Handler,
}

pub async fn new(
    config: SharedConfig,
    admission: AdmissionController,
    generator: DynGenerator,
    bind_addr: &std::net::SocketAddr,
) -> anyhow::Result<DnsServer> {
    let socket = UdpSocket::bind(bind_addr).await?;
    Ok(DnsServer {
        socket: Arc::new(socket),
        handler: Handler::new(config, admission, generator),
    })
}

impl DnsServer {
    /// Serve queries until the socket fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] if receiving from the socket fails.
    pub async fn block_until_done(self) -> Result<(), Error> {
        let mut buf = [0u8; MAX_UDP_SIZE];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                // ICMP port unreachable from an earlier reply surfaces here on some platforms.
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(err) => return Err(err.into()),
            };
            let datagram = buf[..len].to_vec();
            let socket = self.socket.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Some(reply) = handler.handle_datagram(peer, &datagram).await {
                    if let Err(err) = socket.send_to(&reply, peer).await {
                        tracing::warn!("failed to answer {peer}: {err}");
                    }
                }
            });
        }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dns::codec::tests::{answer_rdata, character_strings, query};
    use crate::dns::codec::{decode, TYPE_TXT};
    use crate::generate::Generator;
    use crate::stream::FragmentStream;
    use std::time::Duration;

    struct Answer42;

    #[async_trait::async_trait]
    impl Generator for Answer42 {
        async fn generate(&self, _prompt: &str) -> Result<String, Error> {
            Ok("42".to_string())
        }

        async fn generate_stream(&self, _prompt: &str) -> Result<FragmentStream, Error> {
            Ok(FragmentStream::from_fragments([Ok("4".to_string()), Ok("2".to_string())]))
        }
    }

    #[tokio::test]
    async fn answers_over_udp() {
        let config = Arc::new(Config::default());
        let admission = AdmissionController::new(&config.rate_limit);
        let server = new(
            config,
            admission,
            Arc::new(Answer42),
            &"127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(server.block_until_done());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram = query(77, "meaning-of-life.ch.at", TYPE_TXT);
        client.send_to(&datagram, server_addr).await.unwrap();

        let mut buf = [0u8; MAX_UDP_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let question = decode(&datagram).unwrap();
        let strings = character_strings(answer_rdata(&buf[..len], &question));
        assert_eq!(strings, vec![b"42".to_vec()]);
    }
}
