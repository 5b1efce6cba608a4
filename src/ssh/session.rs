use crate::admission::slots::SessionSlot;
use crate::error::Error;
use crate::generate::DynGenerator;
use crate::ssh::line_editor::{Action, LineEditor, WELCOME};
use crate::stream::coordinator::Disconnected;
use crate::stream::{Coordinator, FragmentSink, RelayOutcome};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

/// One SSH connection: a single interactive shell channel answering typed questions.
pub(super) struct ChatSession {
    peer: SocketAddr,
    generator: DynGenerator,
    editor: Arc<Mutex<LineEditor>>,
    channel: Option<ChannelId>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    _slot: SessionSlot,
}

impl ChatSession {
    pub(super) fn new(peer: SocketAddr, generator: DynGenerator, slot: SessionSlot) -> Self {
        let cancel = CancellationToken::new();
        Self {
            peer,
            generator,
            editor: Arc::new(Mutex::new(LineEditor::new())),
            channel: None,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            _slot: slot,
        }
    }

    /// Run raw input through the line editor.
    async fn handle_input(&self, data: &[u8]) -> Vec<Output> {
        let mut editor = self.editor.lock().await;
        let mut outputs = Vec::new();
        for action in editor.input(data) {
            match action {
                Action::Echo(bytes) => outputs.push(Output::Write(bytes)),
                Action::Submit(prompt) => {
                    editor.start_generation();
                    outputs.push(Output::Generate(prompt));
                }
                Action::Exit | Action::Abort => {
                    tracing::debug!("ssh session for {} ended by client: {action:?}", self.peer);
                    self.cancel.cancel();
                    outputs.push(Output::Close);
                }
            }
        }
        outputs
    }

    /// The client closed its side; nothing more will be read.
    fn end_of_input(&self) {
        self.cancel.cancel();
    }

    /// Stream the answer to `prompt` into `sink` in the background, then hand the line
    /// back to the user. Ends early once the session is cancelled.
    fn spawn_generation<S>(&self, prompt: String, mut sink: S) -> JoinHandle<RelayOutcome>
    where
        S: FragmentSink + 'static,
    {
        let generator = self.generator.clone();
        let editor = self.editor.clone();
        let cancel = self.cancel.clone();
        let peer = self.peer;

        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = cancel.cancelled() => RelayOutcome::Disconnected,
                outcome = answer_and_prompt(&generator, &prompt, &editor, &mut sink) => outcome,
            };
            tracing::debug!("ssh answer for {peer} ended: {outcome:?}");
            outcome
        })
    }
}

/// What the connection has to do after a chunk of input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Output {
    Write(Vec<u8>),
    Generate(String),
    Close,
}

/// Write the answer to `prompt`, then the next prompt unless the session ended meanwhile.
async fn answer_and_prompt<S>(
    generator: &DynGenerator,
    prompt: &str,
    editor: &Mutex<LineEditor>,
    sink: &mut S,
) -> RelayOutcome
where
    S: FragmentSink + ?Sized,
{
    let mut terminal = Crlf(sink);
    let outcome = match generator.generate_stream(prompt).await {
        Ok(fragments) => Coordinator::unbounded().relay(fragments, &mut terminal).await,
        Err(err) => match terminal.write_error(&err.to_string()).await {
            Ok(()) => RelayOutcome::Failed,
            Err(Disconnected) => RelayOutcome::Disconnected,
        },
    };
    if outcome == RelayOutcome::Disconnected {
        return outcome;
    }

    let next = editor.lock().await.finish_generation();
    if let Some(next) = next {
        if terminal.write_fragment(&format!("\n{next}")).await.is_err() {
            return RelayOutcome::Disconnected;
        }
    }
    outcome
}

/// Line endings for a raw-mode terminal.
fn to_terminal(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Rewrites line endings on the way to the terminal.
struct Crlf<'a, S: ?Sized>(&'a mut S);

#[async_trait::async_trait]
impl<'a, S> FragmentSink for Crlf<'a, S>
where
    S: FragmentSink + ?Sized,
{
    async fn write_fragment(&mut self, fragment: &str) -> Result<(), Disconnected> {
        self.0.write_fragment(&to_terminal(fragment)).await
    }

    async fn closed(&self) {
        self.0.closed().await;
    }
}

/// Writes to the session channel.
struct ChannelSink {
    handle: Handle,
    channel: ChannelId,
}

#[async_trait::async_trait]
impl FragmentSink for ChannelSink {
    async fn write_fragment(&mut self, fragment: &str) -> Result<(), Disconnected> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(fragment.as_bytes()))
            .await
            .map_err(|_| Disconnected)
    }
}

#[async_trait::async_trait]
impl Handler for ChatSession {
    type Error = Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel.is_some() {
            return Ok(false);
        }
        self.channel = Some(channel.id());
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        session.data(channel, CryptoVec::from_slice(WELCOME.as_bytes()));
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channel != Some(channel) {
            return Ok(());
        }

        for output in self.handle_input(data).await {
            match output {
                Output::Write(bytes) => session.data(channel, CryptoVec::from_slice(&bytes)),
                Output::Generate(prompt) => {
                    let sink = ChannelSink {
                        handle: session.handle(),
                        channel,
                    };
                    self.spawn_generation(prompt, sink);
                }
                Output::Close => {
                    session.eof(channel);
                    session.close(channel);
                }
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.end_of_input();
        session.close(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::SessionSlots;
    use crate::generate::Generator;
    use crate::ssh::line_editor::EditorState;
    use crate::stream::{self, FragmentStream};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Streams fixed fragments, or fails when there are none.
    struct Scripted(Vec<&'static str>);

    #[async_trait::async_trait]
    impl Generator for Scripted {
        async fn generate(&self, _prompt: &str) -> Result<String, Error> {
            Ok(self.0.concat())
        }

        async fn generate_stream(&self, _prompt: &str) -> Result<FragmentStream, Error> {
            if self.0.is_empty() {
                return Err(Error::GenerationFailure("backend down".to_string()));
            }
            let fragments: Vec<_> = self.0.iter().map(|f| Ok((*f).to_string())).collect();
            Ok(FragmentStream::from_fragments(fragments))
        }
    }

    /// Never produces anything; reports when its producer is stopped.
    struct Stalled {
        stopped: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl Generator for Stalled {
        async fn generate(&self, _prompt: &str) -> Result<String, Error> {
            Ok(String::new())
        }

        async fn generate_stream(&self, _prompt: &str) -> Result<FragmentStream, Error> {
            let (tx, rx) = stream::channel();
            let stopped = self.stopped.clone();
            tokio::spawn(async move {
                tx.cancelled().await;
                stopped.notify_one();
            });
            Ok(rx)
        }
    }

    #[derive(Default)]
    struct Screen {
        text: String,
        gone: bool,
    }

    #[async_trait::async_trait]
    impl FragmentSink for Screen {
        async fn write_fragment(&mut self, fragment: &str) -> Result<(), Disconnected> {
            if self.gone {
                return Err(Disconnected);
            }
            self.text.push_str(fragment);
            Ok(())
        }
    }

    fn session(generator: impl Generator + Send + Sync + 'static) -> ChatSession {
        let slot = SessionSlots::new(1).try_acquire().unwrap();
        ChatSession::new(
            SocketAddr::from(([192, 0, 2, 7], 2222)),
            Arc::new(generator),
            slot,
        )
    }

    #[test]
    fn terminal_line_endings() {
        assert_eq!(to_terminal("a\nb"), "a\r\nb");
        assert_eq!(to_terminal("a\r\nb\n\n"), "a\r\nb\r\n\r\n");
        assert_eq!(to_terminal("plain"), "plain");
    }

    #[tokio::test]
    async fn exit_says_goodbye_and_closes() {
        let session = session(Scripted(vec!["unused"]));
        assert_eq!(
            session.handle_input(b"exit\r").await,
            vec![Output::Write(b"exit\r\nGoodbye!\r\n".to_vec()), Output::Close]
        );
        assert!(session.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn interrupt_while_generating_closes() {
        let session = session(Scripted(vec!["unused"]));
        assert_eq!(
            session.handle_input(b"q\r").await,
            vec![Output::Write(b"q\r\n".to_vec()), Output::Generate("q".to_string())]
        );
        assert_eq!(session.editor.lock().await.state(), EditorState::Generating);
        assert_eq!(session.handle_input(b"more\x03").await, vec![Output::Close]);
        assert!(session.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn answer_is_followed_by_a_fresh_prompt() {
        let session = session(Scripted(vec!["one\n", "two"]));
        session.handle_input(b"q\r").await;

        let mut screen = Screen::default();
        let outcome =
            answer_and_prompt(&session.generator, "q", &session.editor, &mut screen).await;
        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(screen.text, "one\r\ntwo\r\n> ");
        assert_eq!(session.editor.lock().await.state(), EditorState::Collecting);

        // Typing works again.
        assert_eq!(
            session.handle_input(b"x").await,
            vec![Output::Write(b"x".to_vec())]
        );
    }

    #[tokio::test]
    async fn failures_are_shown_before_the_prompt() {
        let session = session(Scripted(Vec::new()));
        session.handle_input(b"q\r").await;

        let mut screen = Screen::default();
        let outcome =
            answer_and_prompt(&session.generator, "q", &session.editor, &mut screen).await;
        assert_eq!(outcome, RelayOutcome::Failed);
        assert_eq!(screen.text, "Error: backend down\r\n> ");
    }

    #[tokio::test]
    async fn no_prompt_once_the_client_is_gone() {
        let session = session(Scripted(vec!["one"]));
        session.handle_input(b"q\r").await;

        let mut screen = Screen {
            gone: true,
            ..Screen::default()
        };
        let outcome =
            answer_and_prompt(&session.generator, "q", &session.editor, &mut screen).await;
        assert_eq!(outcome, RelayOutcome::Disconnected);
        assert!(screen.text.is_empty());
        assert_eq!(session.editor.lock().await.state(), EditorState::Generating);
    }

    #[tokio::test]
    async fn end_of_input_stops_the_generation() {
        let stopped = Arc::new(Notify::new());
        let session = session(Stalled {
            stopped: stopped.clone(),
        });
        session.handle_input(b"q\r").await;
        let generation = session.spawn_generation("q".to_string(), Screen::default());

        session.end_of_input();
        assert_eq!(generation.await.unwrap(), RelayOutcome::Disconnected);
        tokio::time::timeout(Duration::from_secs(5), stopped.notified())
            .await
            .unwrap();
    }
}
