use crate::chat::ChatCompletionChunk;
use crate::stream::coordinator::Disconnected;
use crate::stream::{Coordinator, FragmentSink, FragmentStream, RelayOutcome};
use axum::response::sse::{Event, Sse};
use futures_util::Stream;
use serde_json::json;
use std::borrow::Cow;
use std::convert::Infallible;
use tokio::sync::mpsc;

/// Events buffered between the relay task and the response body.
const EVENT_BUFFER: usize = 16;

/// The terminating frame of every completed event stream.
pub(super) const DONE: &str = "[DONE]";

/// How fragments and errors are framed as server-sent events.
pub(super) trait Framing: Send + Sync + 'static {
    fn fragment(&self, fragment: &str) -> Event;
    fn error(&self, message: &str) -> Event;
}

/// Fragments as bare `data:` lines.
pub(super) struct PlainFraming;

impl Framing for PlainFraming {
    fn fragment(&self, fragment: &str) -> Event {
        Event::default().data(unix_newlines(fragment))
    }

    fn error(&self, message: &str) -> Event {
        Event::default().data(format!("Error: {}", unix_newlines(message)))
    }
}

/// Event data is split into `data:` lines on `\n` and may not hold a carriage return.
fn unix_newlines(text: &str) -> Cow<'_, str> {
    if text.contains('\r') {
        Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(text)
    }
}

/// Fragments as `chat.completion.chunk` objects.
pub(super) struct ChunkFraming {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl Framing for ChunkFraming {
    fn fragment(&self, fragment: &str) -> Event {
        let chunk = ChatCompletionChunk::content(
            self.id.clone(),
            self.created,
            self.model.clone(),
            fragment.to_string(),
        );
        Event::default()
            .json_data(chunk)
            .unwrap_or_else(|_| self.error("error marshaling response"))
    }

    fn error(&self, message: &str) -> Event {
        Event::default().data(json!({ "error": message }).to_string())
    }
}

/// Writes framed events into the response body. The body going away is the client
/// disconnecting.
struct EventSink<F> {
    tx: mpsc::Sender<Event>,
    framing: F,
}

#[async_trait::async_trait]
impl<F: Framing> FragmentSink for EventSink<F> {
    async fn write_fragment(&mut self, fragment: &str) -> Result<(), Disconnected> {
        let event = self.framing.fragment(fragment);
        self.tx.send(event).await.map_err(|_| Disconnected)
    }

    async fn write_error(&mut self, message: &str) -> Result<(), Disconnected> {
        let event = self.framing.error(message);
        self.tx.send(event).await.map_err(|_| Disconnected)
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

fn body(mut rx: mpsc::Receiver<Event>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok(event);
        }
    })
}

/// Stream `fragments` to the client, ending with a `[DONE]` frame unless the client left.
pub(super) fn relay<F: Framing>(
    fragments: FragmentStream,
    coordinator: Coordinator,
    framing: F,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(async move {
        let mut sink = EventSink { tx, framing };
        let outcome = coordinator.relay(fragments, &mut sink).await;
        tracing::debug!("event stream ended: {outcome:?}");
        if outcome != RelayOutcome::Disconnected {
            let _ = sink.tx.send(Event::default().data(DONE)).await;
        }
    });
    body(rx)
}

/// A stream holding a single error frame, for generations that never started.
pub(super) fn error<F: Framing>(
    framing: &F,
    message: &str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(1);
    // Capacity covers the one frame.
    let _ = tx.try_send(framing.error(message));
    body(rx)
}
