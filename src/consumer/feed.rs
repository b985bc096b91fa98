use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// The receiving end of a feed, shared with the engine so that it can
/// take back payloads nobody read.
#[derive(Debug, Clone)]
pub(super) struct Inbox(Arc<Mutex<mpsc::Receiver<String>>>);

impl Inbox {
    pub(super) fn new(receiver: mpsc::Receiver<String>) -> Self {
        Self(Arc::new(Mutex::new(receiver)))
    }

    fn lock(&self) -> MutexGuard<'_, mpsc::Receiver<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops the feed, and returns whatever it held, oldest first.
    pub(super) fn reclaim(&self) -> Vec<String> {
        let mut receiver = self.lock();
        receiver.close();

        let mut pending = Vec::new();
        while let Ok(payload) = receiver.try_recv() {
            pending.push(payload);
        }
        pending
    }
}

/// The stream of payloads delivered to a running consumer.
///
/// Payloads arrive in the order they were popped from the list; the
/// consumer only pops once the previous payload has been read, so at
/// most one is ever waiting here.  The stream ends only once the
/// consumer has stopped and released its connections; the end says
/// nothing about whether the queue is empty.  If a consumer stopped
/// because of a failure, the error is available from
/// [`Queue::take_error`](crate::Queue::take_error).
///
/// Dropping the feed stops the consumer.  When a consumer stops, by
/// being cancelled or by its feed being dropped, a payload that was
/// not read yet is put back at the head of the queue.
#[derive(Debug)]
#[must_use = "a consumer's tasks pile up unless its feed is read"]
pub struct Feed {
    inbox: Inbox,
}

impl Feed {
    pub(super) fn new(inbox: Inbox) -> Self { Self { inbox } }

    /// Waits for the next payload, or `None` once the consumer has
    /// stopped.
    pub async fn recv(&mut self) -> Option<String> {
        std::future::poll_fn(|cx| self.inbox.lock().poll_recv(cx)).await
    }
}

impl futures::Stream for Feed {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbox.lock().poll_recv(cx)
    }
}

impl Drop for Feed {
    // the engine notices, and reclaims what is left.
    fn drop(&mut self) { self.inbox.lock().close(); }
}
