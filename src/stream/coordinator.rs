//! Turns an open-ended [`FragmentStream`] into bounded, framed output.
//!
//! A [`Coordinator`] carries an optional deadline and an optional length limit and
//! drives a stream in one of two ways:
//!
//! * [`Coordinator::accumulate`] collects the whole answer into an
//!   [`AccumulationResult`], for transports that need the answer in one piece (DNS);
//! * [`Coordinator::relay`] forwards fragments to a [`FragmentSink`] as they arrive, for
//!   transports that stream (SSE, terminals).
//!
//! Either way the stream is cancelled before the call returns, whichever way it ends.

use crate::stream::{Fragment, FragmentStream};
use std::future::pending;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Answer text used when the deadline passes before any fragment arrived.
pub const TIMEOUT_PLACEHOLDER: &str = "Request timed out";
/// Appended to a partial answer cut off by the deadline.
pub const INCOMPLETE_MARKER: &str = " [incomplete]";
/// Ends an answer that was cut to the length limit.
pub const ELLIPSIS: &str = "...";

/// How an accumulation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed,
    LengthLimitReached,
    DeadlineElapsedEmpty,
    DeadlineElapsedPartial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulationResult {
    pub text: String,
    pub termination: Termination,
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    /// The generation reported an error, which was written to the sink.
    Failed,
    DeadlineElapsed,
    /// The sink stopped accepting writes.
    Disconnected,
}

/// The sink went away; nothing more can be written to it.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("client disconnected")]
pub struct Disconnected;

/// Where relayed fragments are written. Each streaming transport provides one.
#[async_trait::async_trait]
pub trait FragmentSink: Send + Sync {
    /// Write and flush one fragment.
    async fn write_fragment(&mut self, fragment: &str) -> Result<(), Disconnected>;

    /// Write the error that ended the generation.
    async fn write_error(&mut self, message: &str) -> Result<(), Disconnected> {
        self.write_fragment(&format!("Error: {message}")).await
    }

    /// Resolves once the client is known to be gone. Sinks that can only find out by
    /// writing never resolve.
    async fn closed(&self) {
        pending::<()>().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coordinator {
    deadline: Option<Duration>,
    max_len: Option<usize>,
}

/// What ended a wait during [`Coordinator::accumulate`].
enum Arrival {
    Fragment(Option<Fragment>),
    Deadline,
}

/// What ended a wait during [`Coordinator::relay`].
enum Event {
    Fragment(Option<Fragment>),
    Deadline,
    Closed,
}

async fn sleep_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

impl Coordinator {
    /// Stop after `deadline` or once `max_len` characters have been collected.
    #[must_use]
    pub fn bounded(deadline: Duration, max_len: usize) -> Self {
        Self {
            deadline: Some(deadline),
            max_len: Some(max_len),
        }
    }

    /// Stop after `deadline`, with no length limit.
    #[must_use]
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            max_len: None,
        }
    }

    /// Run until the stream ends or the client leaves.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Collect the stream into a single answer.
    ///
    /// With nothing received by the deadline the answer is [`TIMEOUT_PLACEHOLDER`]; a
    /// partial answer gets [`INCOMPLETE_MARKER`] appended. An answer longer than the
    /// length limit is cut so that, [`ELLIPSIS`] included, it is exactly the limit. An
    /// error from the generation is folded into the text.
    pub async fn accumulate(&self, mut stream: FragmentStream) -> AccumulationResult {
        let timer = sleep_or_never(self.deadline.map(|d| Instant::now() + d));
        tokio::pin!(timer);

        let mut text = String::new();
        let mut chars = 0usize;
        let termination = loop {
            let arrival = tokio::select! {
                biased;
                item = stream.next_fragment() => Arrival::Fragment(item),
                () = &mut timer => Arrival::Deadline,
            };
            match arrival {
                Arrival::Fragment(Some(Ok(fragment))) => {
                    chars += fragment.chars().count();
                    text.push_str(&fragment);
                    if self.max_len.is_some_and(|max| chars >= max) {
                        break Termination::LengthLimitReached;
                    }
                }
                Arrival::Fragment(Some(Err(err))) => {
                    tracing::debug!("generation failed mid-stream: {err}");
                    text.push_str(&format!("Error: {err}"));
                    break Termination::Completed;
                }
                Arrival::Fragment(None) => break Termination::Completed,
                Arrival::Deadline if text.is_empty() => break Termination::DeadlineElapsedEmpty,
                Arrival::Deadline => break Termination::DeadlineElapsedPartial,
            }
        };
        stream.cancel();

        match termination {
            Termination::DeadlineElapsedEmpty => text = TIMEOUT_PLACEHOLDER.to_string(),
            Termination::DeadlineElapsedPartial => text.push_str(INCOMPLETE_MARKER),
            Termination::Completed | Termination::LengthLimitReached => {}
        }
        if let Some(max) = self.max_len {
            text = truncate_with_ellipsis(text, max);
        }
        AccumulationResult { text, termination }
    }

    /// Forward fragments to `sink` as they arrive.
    ///
    /// On deadline the sink receives [`TIMEOUT_PLACEHOLDER`] if nothing was written yet,
    /// or [`INCOMPLETE_MARKER`] otherwise. The length limit doesn't apply to relays.
    pub async fn relay<S>(&self, mut stream: FragmentStream, sink: &mut S) -> RelayOutcome
    where
        S: FragmentSink + ?Sized,
    {
        let timer = sleep_or_never(self.deadline.map(|d| Instant::now() + d));
        tokio::pin!(timer);

        let mut written = false;
        let outcome = loop {
            let event = tokio::select! {
                biased;
                () = sink.closed() => Event::Closed,
                item = stream.next_fragment() => Event::Fragment(item),
                () = &mut timer => Event::Deadline,
            };
            match event {
                Event::Fragment(Some(Ok(fragment))) => {
                    if sink.write_fragment(&fragment).await.is_err() {
                        break RelayOutcome::Disconnected;
                    }
                    written = true;
                }
                Event::Fragment(Some(Err(err))) => {
                    break match sink.write_error(&err.to_string()).await {
                        Ok(()) => RelayOutcome::Failed,
                        Err(Disconnected) => RelayOutcome::Disconnected,
                    };
                }
                Event::Fragment(None) => break RelayOutcome::Completed,
                Event::Deadline => {
                    let notice = if written {
                        INCOMPLETE_MARKER
                    } else {
                        TIMEOUT_PLACEHOLDER
                    };
                    break match sink.write_fragment(notice).await {
                        Ok(()) => RelayOutcome::DeadlineElapsed,
                        Err(Disconnected) => RelayOutcome::Disconnected,
                    };
                }
                Event::Closed => break RelayOutcome::Disconnected,
            }
        };
        stream.cancel();
        outcome
    }
}

/// Cut `text` to at most `max` characters, ending in [`ELLIPSIS`] when anything was cut.
#[must_use]
pub fn truncate_with_ellipsis(text: String, max: usize) -> String {
    if text.chars().count() <= max {
        return text;
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut cut: String = text.chars().take(keep).collect();
    cut.push_str(&ELLIPSIS[..max.min(ELLIPSIS.len())]);
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::stream::{channel, FragmentStream};

    fn fragments(items: &[&str]) -> FragmentStream {
        FragmentStream::from_fragments(items.iter().map(|s| Ok((*s).to_string())))
    }

    /// A producer that never sends anything and never finishes on its own.
    fn silent() -> (FragmentStream, tokio::task::JoinHandle<()>) {
        let (tx, rx) = channel();
        let handle = tokio::spawn(async move { tx.cancelled().await });
        (rx, handle)
    }

    #[derive(Default)]
    struct VecSink {
        written: Vec<String>,
        fail_after: Option<usize>,
    }

    #[async_trait::async_trait]
    impl FragmentSink for VecSink {
        async fn write_fragment(&mut self, fragment: &str) -> Result<(), Disconnected> {
            if self.fail_after.is_some_and(|n| self.written.len() >= n) {
                return Err(Disconnected);
            }
            self.written.push(fragment.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn completes_with_all_fragments() {
        let result = Coordinator::bounded(Duration::from_secs(5), 100)
            .accumulate(fragments(&["Hello", ", ", "world"]))
            .await;
        assert_eq!(result.text, "Hello, world");
        assert_eq!(result.termination, Termination::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_with_nothing_is_placeholder() {
        let (stream, producer) = silent();
        let result = Coordinator::bounded(Duration::from_secs(4), 100)
            .accumulate(stream)
            .await;
        assert_eq!(result.text, "Request timed out");
        assert_eq!(result.termination, Termination::DeadlineElapsedEmpty);
        // The producer was told to stop.
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_with_partial_text_is_marked() {
        let (tx, rx) = channel();
        tokio::spawn(async move {
            tx.send("The answer is".to_string()).await;
            tx.cancelled().await;
        });
        let result = Coordinator::bounded(Duration::from_secs(4), 100)
            .accumulate(rx)
            .await;
        assert_eq!(result.text, "The answer is [incomplete]");
        assert_eq!(result.termination, Termination::DeadlineElapsedPartial);
    }

    #[tokio::test]
    async fn exact_limit_is_not_marked() {
        let result = Coordinator::bounded(Duration::from_secs(5), 10)
            .accumulate(fragments(&["01234", "56789", "never read"]))
            .await;
        assert_eq!(result.text, "0123456789");
        assert_eq!(result.termination, Termination::LengthLimitReached);
    }

    #[tokio::test]
    async fn over_limit_is_cut_with_ellipsis() {
        let result = Coordinator::bounded(Duration::from_secs(5), 10)
            .accumulate(fragments(&["0123456", "789abc"]))
            .await;
        assert_eq!(result.text, "0123456...");
        assert_eq!(result.text.chars().count(), 10);
        assert_eq!(result.termination, Termination::LengthLimitReached);
    }

    #[tokio::test]
    async fn limit_counts_characters_not_bytes() {
        let result = Coordinator::bounded(Duration::from_secs(5), 5)
            .accumulate(fragments(&["héllo wörld"]))
            .await;
        assert_eq!(result.text, "hé...");
    }

    #[tokio::test]
    async fn limit_stops_the_producer() {
        let (tx, rx) = channel();
        let producer = tokio::spawn(async move {
            let mut sent = 0usize;
            while tx.send("abcd".to_string()).await {
                sent += 1;
            }
            sent
        });
        let result = Coordinator::bounded(Duration::from_secs(5), 8)
            .accumulate(rx)
            .await;
        assert_eq!(result.text, "abcdabcd");
        let sent = producer.await.unwrap();
        assert!(sent < 2 + 2 * crate::stream::QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn generation_error_becomes_text() {
        let stream = FragmentStream::from_fragments(vec![Err(Error::GenerationFailure(
            "upstream unavailable".to_string(),
        ))]);
        let result = Coordinator::bounded(Duration::from_secs(5), 100)
            .accumulate(stream)
            .await;
        assert_eq!(result.text, "Error: upstream unavailable");
        assert_eq!(result.termination, Termination::Completed);
    }

    #[tokio::test]
    async fn relay_forwards_in_order() {
        let mut sink = VecSink::default();
        let outcome = Coordinator::unbounded()
            .relay(fragments(&["a", "b", "c"]), &mut sink)
            .await;
        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(sink.written, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn relay_disconnect_cancels_producer() {
        let (tx, rx) = channel();
        let producer = tokio::spawn(async move {
            while tx.send("chunk".to_string()).await {}
            tx.is_cancelled()
        });
        let mut sink = VecSink {
            fail_after: Some(3),
            ..VecSink::default()
        };
        let outcome = Coordinator::unbounded().relay(rx, &mut sink).await;
        assert_eq!(outcome, RelayOutcome::Disconnected);
        assert_eq!(sink.written.len(), 3);
        assert!(producer.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn relay_deadline_writes_notice() {
        let (stream, producer) = silent();
        let mut sink = VecSink::default();
        let outcome = Coordinator::with_deadline(Duration::from_secs(30))
            .relay(stream, &mut sink)
            .await;
        assert_eq!(outcome, RelayOutcome::DeadlineElapsed);
        assert_eq!(sink.written, vec!["Request timed out"]);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn relay_error_is_written() {
        let stream = FragmentStream::from_fragments(vec![
            Ok("partial ".to_string()),
            Err(Error::GenerationFailure("boom".to_string())),
        ]);
        let mut sink = VecSink::default();
        let outcome = Coordinator::unbounded().relay(stream, &mut sink).await;
        assert_eq!(outcome, RelayOutcome::Failed);
        assert_eq!(sink.written, vec!["partial ", "Error: boom"]);
    }

    #[test]
    fn truncation_keeps_short_text() {
        assert_eq!(truncate_with_ellipsis("short".to_string(), 5), "short");
        assert_eq!(truncate_with_ellipsis("longer".to_string(), 5), "lo...");
    }
}
