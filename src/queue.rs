use crate::backend::Backend;
use crate::config::{ConfigError, QueueConfig};
use crate::consumer::Shared;
use crate::id::{ConsumerId, IdentityError};
use crate::presence::Presence;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A handle on one named queue.
///
/// A handle can publish, pop, and run a single consumer at a time.
/// Handles are independent of each other: any number of them, in any
/// number of processes, can share a queue by using the same name
/// against the same store.
pub struct Queue<B: Backend> {
    pub(crate) name: Arc<str>,
    pub(crate) channel: Arc<str>,
    pub(crate) id: ConsumerId,
    pub(crate) config: QueueConfig,
    pub(crate) presence: Presence,
    pub(crate) backend: Arc<B>,
    pub(crate) shared: Arc<Shared<B::Error>>,
    closed: AtomicBool,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum QueueError<E> {
    #[error("queue is closed")]
    Closed,
    #[error("consumer {id} of queue {queue} is not running")]
    NotRunning { id: ConsumerId, queue: Arc<str> },
    #[error("consumer {id} of queue {queue} is already running")]
    AlreadyRunning { id: ConsumerId, queue: Arc<str> },
    #[error("failed to generate a consumer identity: {source}")]
    Identity {
        #[source]
        source: IdentityError,
    },
    #[error("invalid configuration: {source}")]
    Config {
        #[source]
        source: ConfigError,
    },
    #[error("failed to connect to the store: {source}")]
    Connection {
        #[source]
        source: E,
    },
    #[error("failed to push a task onto {queue}: {source}")]
    Push {
        queue: Arc<str>,
        #[source]
        source: E,
    },
    #[error("failed to notify consumers of {queue}: {source}")]
    Notify {
        queue: Arc<str>,
        #[source]
        source: E,
    },
    #[error("failed to pop a task from {queue}: {source}")]
    Pop {
        queue: Arc<str>,
        #[source]
        source: E,
    },
    #[error("failed to count the tasks in {queue}: {source}")]
    Count {
        queue: Arc<str>,
        #[source]
        source: E,
    },
    #[error("failed to purge {queue}: {source}")]
    Purge {
        queue: Arc<str>,
        #[source]
        source: E,
    },
    #[error("failed to update the consumers of {queue}: {source}")]
    Presence {
        queue: Arc<str>,
        #[source]
        source: E,
    },
    #[error("failed to listen for notifications on {queue}: {source}")]
    Listen {
        queue: Arc<str>,
        #[source]
        source: E,
    },
    #[error("failed to close the connection to the store: {source}")]
    Close {
        #[source]
        source: E,
    },
    #[error("failed to encode the task: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode the task: {source}")]
    Decode {
        payload: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("the consumer task failed: {source}")]
    Task {
        #[from]
        source: tokio::task::JoinError,
    },
}

impl<B: Backend> Queue<B> {
    /// Creates a handle on the queue `name`, using the default
    /// configuration.
    ///
    /// This checks that the store is reachable before returning.
    pub async fn new(name: &str, backend: B) -> Result<Self, QueueError<B::Error>> {
        Self::with_config(name, backend, QueueConfig::default()).await
    }

    #[tracing::instrument(skip(backend))]
    pub async fn with_config(
        name: &str,
        backend: B,
        config: QueueConfig,
    ) -> Result<Self, QueueError<B::Error>> {
        let id = ConsumerId::generate(name).map_err(|source| QueueError::Identity { source })?;

        backend
            .ping()
            .await
            .map_err(|source| QueueError::Connection { source })?;

        tracing::debug!(%id, "queue handle ready");

        Ok(Self {
            name: name.into(),
            channel: format!("{}{name}", config.prefix).into(),
            presence: Presence::new(&config.prefix, name),
            id,
            config,
            backend: Arc::new(backend),
            shared: Arc::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// The identity this handle advertises while consuming.
    pub fn id(&self) -> &ConsumerId { &self.id }

    pub fn name(&self) -> &str { &self.name }

    pub fn heartbeat(&self) -> Duration { self.config.heartbeat }

    /// Sets the fallback polling interval.
    ///
    /// This is only read when [`consume`](Self::consume) starts;
    /// changing it on a running consumer has no effect until the next
    /// start.  Unless one was set explicitly, the presence window
    /// follows it.
    pub fn set_heartbeat(&mut self, interval: Duration) { self.config.heartbeat = interval; }

    /// Lists the consumers of this queue seen within the presence
    /// window, with how long ago each was last seen.
    ///
    /// Entries that have fallen out of the window are removed from the
    /// store as a side effect.  Consumers that stopped cleanly have
    /// already removed themselves.
    #[tracing::instrument(skip(self), fields(queue = %self.name))]
    pub async fn list_consumers(
        &self,
    ) -> Result<BTreeMap<ConsumerId, Duration>, QueueError<B::Error>> {
        self.ensure_open()?;
        self.presence
            .list(&*self.backend, self.config.presence_window())
            .await
            .map_err(|source| QueueError::Presence {
                queue: Arc::clone(&self.name),
                source,
            })
    }

    /// Closes this handle.
    ///
    /// A running consumer is cancelled first, then the connections to
    /// the store are released.  Every later operation, including
    /// another `close`, fails with [`QueueError::Closed`].
    #[tracing::instrument(skip(self), fields(queue = %self.name))]
    pub async fn close(&self) -> Result<(), QueueError<B::Error>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let cancelled = if self.shared.is_running() {
            self.stop().await
        } else {
            Ok(())
        };

        let closed = self
            .backend
            .close()
            .await
            .map_err(|source| QueueError::Close { source });

        cancelled.and(closed)
    }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::SeqCst) }

    pub(crate) fn ensure_open(&self) -> Result<(), QueueError<B::Error>> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn not_running(&self) -> QueueError<B::Error> {
        QueueError::NotRunning {
            id: self.id.clone(),
            queue: Arc::clone(&self.name),
        }
    }
}

impl<B: Backend> Drop for Queue<B> {
    fn drop(&mut self) { self.shared.signal_stop(); }
}

impl<B: Backend> std::fmt::Display for Queue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.id.fmt(f) }
}

impl<B: Backend + std::fmt::Debug> std::fmt::Debug for Queue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("config", &self.config)
            .field("backend", &self.backend)
            .field("running", &self.shared.is_running())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
