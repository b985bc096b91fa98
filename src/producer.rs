use crate::backend::Backend;
use crate::{Queue, QueueError};
use std::fmt::Display;
use std::sync::Arc;

/// The message published on a queue's channel after every push.
/// Consumers only care that something arrived.
pub(crate) const NOTIFICATION: &str = "1";

impl<B: Backend> Queue<B> {
    /// Appends a task to the tail of the queue, then wakes the
    /// consumers.
    ///
    /// The task is stored as the text its [`Display`] implementation
    /// renders.  If the push succeeds but the wake-up fails, the task
    /// is still queued, and will be picked up by the next consumer
    /// heartbeat; the error is returned all the same.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub async fn publish<V: Display + ?Sized>(&self, task: &V) -> Result<(), QueueError<B::Error>> {
        self.ensure_open()?;
        let payload = task.to_string();
        self.backend
            .push_back(&self.name, &payload)
            .await
            .map_err(|source| self.push_error(source))?;
        self.notify().await
    }

    /// Pushes a task onto the head of the queue, so it is the next one
    /// popped, then wakes the consumers.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub async fn publish_first<V: Display + ?Sized>(
        &self,
        task: &V,
    ) -> Result<(), QueueError<B::Error>> {
        self.ensure_open()?;
        let payload = task.to_string();
        self.backend
            .push_front(&self.name, &payload)
            .await
            .map_err(|source| self.push_error(source))?;
        self.notify().await
    }

    /// Appends a task, serialized as JSON, to the tail of the queue.
    pub async fn publish_json<V: serde::Serialize + ?Sized>(
        &self,
        task: &V,
    ) -> Result<(), QueueError<B::Error>> {
        let payload =
            serde_json::to_string(task).map_err(|source| QueueError::Encode { source })?;
        self.publish(&payload).await
    }

    /// The number of tasks waiting in the queue.
    #[tracing::instrument(skip(self), fields(queue = %self.name))]
    pub async fn count(&self) -> Result<u64, QueueError<B::Error>> {
        self.ensure_open()?;
        self.backend
            .length(&self.name)
            .await
            .map_err(|source| QueueError::Count {
                queue: Arc::clone(&self.name),
                source,
            })
    }

    /// Drops every task waiting in the queue.
    ///
    /// Tasks already popped by a consumer are unaffected.
    #[tracing::instrument(skip(self), fields(queue = %self.name))]
    pub async fn purge(&self) -> Result<(), QueueError<B::Error>> {
        self.ensure_open()?;
        self.backend
            .delete(&self.name)
            .await
            .map_err(|source| QueueError::Purge {
                queue: Arc::clone(&self.name),
                source,
            })
    }

    async fn notify(&self) -> Result<(), QueueError<B::Error>> {
        self.backend
            .publish(&self.channel, NOTIFICATION)
            .await
            .map_err(|source| {
                tracing::warn!(error = %source, "task queued, but consumers were not notified");
                QueueError::Notify {
                    queue: Arc::clone(&self.name),
                    source,
                }
            })
    }

    fn push_error(&self, source: B::Error) -> QueueError<B::Error> {
        QueueError::Push {
            queue: Arc::clone(&self.name),
            source,
        }
    }
}
