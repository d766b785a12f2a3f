//! Inbound envelope stream handed to the session domain.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::{Stream, StreamExt};
use sync_telemetry::metrics;
use sync_types::Envelope;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// Stream of envelopes received from peers.
///
/// Ends when the bus unregisters. A subscriber that falls more than the
/// configured capacity behind skips the envelopes it missed.
pub struct EnvelopeStream {
    inner: Option<BroadcastStream<Envelope>>,
}

impl EnvelopeStream {
    pub(crate) fn new(receiver: broadcast::Receiver<Envelope>) -> Self {
        Self {
            inner: Some(BroadcastStream::new(receiver)),
        }
    }

    /// A stream that is already finished.
    pub(crate) fn closed() -> Self {
        Self { inner: None }
    }
}

impl Stream for EnvelopeStream {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let Some(inner) = self.inner.as_mut() else {
                return Poll::Ready(None);
            };
            match ready!(inner.poll_next_unpin(cx)) {
                Some(Ok(envelope)) => return Poll::Ready(Some(envelope)),
                Some(Err(BroadcastStreamRecvError::Lagged(count))) => {
                    metrics::INBOUND_LAGGED.inc_by(count);
                    warn!(lagged = count, "Envelope subscriber lagged, envelopes dropped");
                }
                None => {
                    self.inner = None;
                    return Poll::Ready(None);
                }
            }
        }
    }
}
