use crate::admission::{AdmissionController, ClientKey};
use crate::config::SharedConfig;
use crate::dns::codec::{self, Question};
use crate::error::Error;
use crate::generate::DynGenerator;
use crate::stream::coordinator::ELLIPSIS;
use crate::stream::{Coordinator, Termination};
use std::net::SocketAddr;
use tracing::debug;

#[derive(Clone)]
pub struct Handler {
    config: SharedConfig,
    admission: AdmissionController,
    generator: DynGenerator,
}

impl Handler {
    pub(super) fn new(
        config: SharedConfig,
        admission: AdmissionController,
        generator: DynGenerator,
    ) -> Self {
        Handler {
            config,
            admission,
            generator,
        }
    }

    /// Answer one query datagram. `None` means drop it without replying.
    pub async fn handle_datagram(&self, peer: SocketAddr, datagram: &[u8]) -> Option<Vec<u8>> {
        match self.dispatch_datagram(peer, datagram).await {
            Ok(reply) => Some(reply),
            Err(err) => {
                debug!("dropped datagram from {peer}: {err}");
                None
            }
        }
    }

    async fn dispatch_datagram(&self, peer: SocketAddr, datagram: &[u8]) -> Result<Vec<u8>, Error> {
        if !self.admission.allow(&ClientKey::from(peer)) {
            return Err(Error::AdmissionRejected);
        }

        let question = codec::decode(datagram)?;
        let prompt = codec::prompt_from_name(&question.name, &self.config.dns_suffix);
        let answer = self.answer(&question, &prompt).await;
        let reply = codec::encode(
            datagram,
            &question,
            &answer,
            self.config.dns_ttl,
            self.config.dns_max_udp_size,
        );
        Ok(reply)
    }

    async fn answer(&self, question: &Question, prompt: &str) -> String {
        let stream = match self.generator.generate_stream(prompt).await {
            Ok(stream) => stream,
            Err(err) => return format!("Error: {err}"),
        };
        let max_len = self
            .config
            .dns_max_answer_len
            .min(codec::answer_capacity(question, self.config.dns_max_udp_size))
            .max(ELLIPSIS.len() + 1);
        let result = Coordinator::bounded(self.config.dns_deadline, max_len)
            .accumulate(stream)
            .await;
        if result.termination != Termination::Completed {
            debug!(
                "answer for {} ended early: {:?}",
                question.header.id, result.termination
            );
        }
        result.text
    }
}
