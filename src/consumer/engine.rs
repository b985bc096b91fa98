use super::feed::Inbox;
use super::Shared;
use crate::backend::{Backend, Listener as _};
use crate::presence::Presence;
use crate::producer::NOTIFICATION;
use crate::{ConsumerId, QueueError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// The background half of a running consumer.
///
/// It owns the notification connection, and is the only thing that
/// writes to the feed.
pub(super) struct Engine<B: Backend> {
    pub(super) backend: Arc<B>,
    pub(super) listener: B::Listener,
    pub(super) name: Arc<str>,
    pub(super) channel: Arc<str>,
    pub(super) id: ConsumerId,
    pub(super) presence: Presence,
    pub(super) heartbeat: Duration,
    pub(super) shared: Arc<Shared<B::Error>>,
    pub(super) inbox: Inbox,
    pub(super) generation: u64,
}

/// Resolves once the consumer has been asked to stop, by its handle
/// or by the caller's shutdown future.
pub(super) struct Cancellation {
    stop: watch::Receiver<bool>,
    shutdown: Pin<Box<dyn Future<Output = ()> + Send>>,
    done: bool,
}

impl Cancellation {
    pub(super) fn new(
        stop: watch::Receiver<bool>,
        shutdown: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Self {
        Self {
            stop,
            shutdown,
            done: false,
        }
    }

    /// Cancel-safe; once this has resolved, it resolves immediately
    /// from then on.
    pub(super) async fn cancelled(&mut self) {
        if self.done || *self.stop.borrow() {
            self.done = true;
            return;
        }

        tokio::select! {
            // an error means the handle is gone, which is a stop too.
            _ = self.stop.changed() => {}
            () = &mut self.shutdown => {}
        }

        self.done = true;
    }
}

#[derive(Debug, Clone, Copy)]
enum Wake {
    Notification,
    Heartbeat,
}

impl<B: Backend> Engine<B> {
    #[tracing::instrument(
        skip_all,
        name = "queue.consume",
        fields(queue = %self.name, consumer = %self.id, generation = self.generation)
    )]
    pub(super) async fn run(
        mut self,
        feed: mpsc::Sender<String>,
        mut cancellation: Cancellation,
    ) -> Result<(), QueueError<B::Error>> {
        let mut heartbeat = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let wake = tokio::select! {
                () = cancellation.cancelled() => break Ok(()),
                () = feed.closed() => {
                    tracing::debug!("feed dropped");
                    break Ok(());
                }
                notified = self.listener.notified() => match notified {
                    Ok(()) => Wake::Notification,
                    Err(source) => break Err(QueueError::Listen {
                        queue: Arc::clone(&self.name),
                        source,
                    }),
                },
                _ = heartbeat.tick() => Wake::Heartbeat,
            };

            tracing::trace!(?wake, "woke up");

            match self.wake(&feed, &mut cancellation).await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(error) => break Err(error),
            }
        };

        match outcome {
            Ok(()) => {
                let result = self.teardown(true).await;
                tracing::debug!("consumer stopped");
                result
            }
            Err(error) => {
                tracing::error!(%error, "consumer failed");
                // recorded before the feed closes, so that a reader
                // who sees the end of the feed can find the cause.
                // whatever the feed still holds stays readable.
                self.shared.record(error);
                self.teardown(false).await.ok();
                Ok(())
            }
        }
    }

    /// Refreshes presence, waits for room in the feed, then pops at
    /// most one payload into it.
    ///
    /// Returns `false` once the consumer should stop.
    async fn wake(
        &mut self,
        feed: &mpsc::Sender<String>,
        cancellation: &mut Cancellation,
    ) -> Result<bool, QueueError<B::Error>> {
        if self.shared.is_current(self.generation) {
            self.presence
                .advertise(&*self.backend, &self.id)
                .await
                .map_err(|source| QueueError::Presence {
                    queue: Arc::clone(&self.name),
                    source,
                })?;
        }

        // nothing leaves the list until the reader has room for it.
        let permit = tokio::select! {
            permit = feed.reserve() => permit.ok(),
            () = cancellation.cancelled() => None,
        };

        let Some(permit) = permit else {
            return Ok(false);
        };

        if let Some(payload) = super::pop(&*self.backend, &self.name).await? {
            tracing::debug!(bytes = payload.len(), "task delivered");
            permit.send(payload);
        }

        Ok(true)
    }

    /// Puts payloads back at the head of the list, in their original
    /// order, and wakes another consumer for them.
    async fn requeue(&mut self, payloads: Vec<String>) -> Result<(), QueueError<B::Error>> {
        if payloads.is_empty() {
            return Ok(());
        }

        tracing::debug!(count = payloads.len(), "requeueing unread tasks");

        for payload in payloads.iter().rev() {
            self.backend
                .push_front(&self.name, payload)
                .await
                .map_err(|source| QueueError::Push {
                    queue: Arc::clone(&self.name),
                    source,
                })?;
        }

        self.backend
            .publish(&self.channel, NOTIFICATION)
            .await
            .map_err(|source| QueueError::Notify {
                queue: Arc::clone(&self.name),
                source,
            })
    }

    /// Releases everything this engine holds.  Every step is attempted
    /// even if an earlier one fails; the first failure is returned.
    ///
    /// With `reclaim`, payloads still unread in the feed go back to
    /// the list last, so the feed only ends once all of this is done.
    async fn teardown(&mut self, reclaim: bool) -> Result<(), QueueError<B::Error>> {
        let removed = self
            .presence
            .remove(&*self.backend, &self.id)
            .await
            .map_err(|source| {
                tracing::warn!(error = %source, "failed to remove presence record");
                QueueError::Presence {
                    queue: Arc::clone(&self.name),
                    source,
                }
            });

        let unsubscribed = self.listener.unsubscribe(&self.channel).await;
        let closed = self.listener.close().await;
        let released = unsubscribed.and(closed).map_err(|source| {
            tracing::warn!(error = %source, "failed to release the notification connection");
            QueueError::Listen {
                queue: Arc::clone(&self.name),
                source,
            }
        });

        let requeued = if reclaim {
            let pending = self.inbox.reclaim();
            let count = pending.len();
            self.requeue(pending).await.map_err(|error| {
                tracing::error!(%error, count, "failed to requeue unread tasks");
                error
            })
        } else {
            Ok(())
        };

        self.shared.finish(self.generation);

        removed.and(released).and(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // fails to build if the loop holds anything across an await that
    // can't move between threads.
    fn spawnable<B: Backend>(
        engine: Engine<B>,
        feed: mpsc::Sender<String>,
        cancellation: Cancellation,
    ) -> impl Future<Output = ()> + Send {
        async move {
            engine.run(feed, cancellation).await.ok();
        }
    }

    #[cfg(feature = "memory")]
    #[test]
    fn the_loop_is_send() {
        let _ = spawnable::<crate::memory::MemoryBackend>;
    }
}
