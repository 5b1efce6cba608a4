//! Cancellable fragment streams between a generation task and the request that owns it.
//!
//! A generation runs in its own task and hands text fragments to the request task over a
//! bounded single-producer/single-consumer queue created by [`channel`]. The two halves
//! share a [`CancellationToken`]:
//!
//! * the consumer half, [`FragmentStream`], cancels it when dropped, so every exit path of
//!   the request (finished, deadline, length limit, client gone) stops the producer;
//! * the producer half, [`FragmentSender`], refuses to send once the token is cancelled
//!   or the consumer is gone, so a producer is never parked on a queue nobody reads.
//!
//! Fragments arrive in production order.

use crate::error::Error;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub mod coordinator;

pub use coordinator::{AccumulationResult, Coordinator, FragmentSink, RelayOutcome, Termination};

/// Fragments buffered between producer and consumer.
pub const QUEUE_CAPACITY: usize = 32;

/// One item of a generation: a text fragment, or the error that ended the generation.
pub type Fragment = Result<String, Error>;

/// Create a connected producer/consumer pair.
#[must_use]
pub fn channel() -> (FragmentSender, FragmentStream) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let cancel = CancellationToken::new();
    (
        FragmentSender {
            tx,
            cancel: cancel.clone(),
        },
        FragmentStream {
            rx,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
        },
    )
}

/// The producing half of a fragment queue.
#[derive(Debug)]
pub struct FragmentSender {
    tx: mpsc::Sender<Fragment>,
    cancel: CancellationToken,
}

impl FragmentSender {
    /// Queue a fragment. Returns `false` once the consumer has cancelled or gone away, in
    /// which case the fragment is dropped and the producer should stop.
    pub async fn send(&self, fragment: String) -> bool {
        self.push(Ok(fragment)).await
    }

    /// Report the error that ends this generation.
    pub async fn fail(&self, err: Error) -> bool {
        self.push(Err(err)).await
    }

    async fn push(&self, item: Fragment) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the consumer cancels or drops its half.
    pub async fn cancelled(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {},
            () = self.tx.closed() => {},
        }
    }
}

/// The consuming half of a fragment queue.
///
/// Ends (yields `None`) when the producer finishes. Dropping it cancels the producer.
#[derive(Debug)]
pub struct FragmentStream {
    rx: mpsc::Receiver<Fragment>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl FragmentStream {
    /// A stream that yields the given fragments and then completes.
    #[must_use]
    pub fn from_fragments<I>(fragments: I) -> Self
    where
        I: IntoIterator<Item = Fragment>,
    {
        let fragments: Vec<Fragment> = fragments.into_iter().collect();
        let (tx, rx) = mpsc::channel(fragments.len().max(1));
        for fragment in fragments {
            // Capacity covers every fragment.
            let _ = tx.try_send(fragment);
        }
        let cancel = CancellationToken::new();
        Self {
            rx,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
        }
    }

    /// Wait for the next fragment. `None` means the producer finished.
    pub async fn next_fragment(&mut self) -> Option<Fragment> {
        self.rx.recv().await
    }

    /// Tell the producer to stop. Fragments already queued are discarded.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that is cancelled when this stream is.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for FragmentStream {
    type Item = Fragment;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
