mod engine;
mod feed;

use self::engine::{Cancellation, Engine};
use self::feed::Inbox;
pub use self::feed::Feed;
use crate::backend::{Backend, Listener as _};
use crate::config::ConfigError;
use crate::{Queue, QueueError};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

impl<B: Backend> Queue<B> {
    /// Pops one task off the head of the queue, if there is one.
    ///
    /// This works whether or not this handle is consuming, and
    /// competes with every consumer of the queue for the task.
    #[tracing::instrument(skip(self), fields(queue = %self.name))]
    pub async fn get_task(&self) -> Result<Option<String>, QueueError<B::Error>> {
        self.ensure_open()?;
        pop(&*self.backend, &self.name).await
    }

    /// Pops one task and decodes it from JSON.
    ///
    /// A task that fails to decode has still been removed from the
    /// queue; its raw payload is kept in the error.
    pub async fn get_task_json<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<Option<T>, QueueError<B::Error>> {
        let Some(payload) = self.get_task().await? else {
            return Ok(None);
        };

        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|source| QueueError::Decode { payload, source })
    }

    /// Starts consuming the queue.
    ///
    /// The consumer listens for notifications on its own connection,
    /// and also polls the queue every [`heartbeat`](Self::heartbeat) in
    /// case a notification went missing.  Every wake-up refreshes this
    /// handle's presence record and pops at most one task, which is
    /// delivered through the returned [`Feed`].
    ///
    /// Only one consumer can run per handle; starting another while
    /// one is running fails with [`QueueError::AlreadyRunning`].  Once
    /// a consumer has stopped, a new one can be started.
    pub async fn consume(&self) -> Result<Feed, QueueError<B::Error>> {
        self.consume_until(futures::future::pending()).await
    }

    /// Starts consuming the queue until `shutdown` completes, or until
    /// [`cancel`](Self::cancel) is called, whichever is first.
    #[tracing::instrument(skip_all, fields(queue = %self.name, consumer = %self.id))]
    pub async fn consume_until<F>(&self, shutdown: F) -> Result<Feed, QueueError<B::Error>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.ensure_open()?;

        if self.config.heartbeat.is_zero() {
            return Err(QueueError::Config {
                source: ConfigError::ZeroHeartbeat,
            });
        }

        if self.shared.is_running() {
            return Err(self.already_running());
        }

        let mut listener = self
            .backend
            .listen()
            .await
            .map_err(|source| QueueError::Listen {
                queue: Arc::clone(&self.name),
                source,
            })?;

        if let Err(source) = listener.subscribe(&self.channel).await {
            listener.close().await.ok();
            return Err(QueueError::Listen {
                queue: Arc::clone(&self.name),
                source,
            });
        }

        match self.launch(listener, Box::pin(shutdown)) {
            Ok(feed) => Ok(feed),
            // another call got there first while we were connecting.
            Err(mut listener) => {
                listener.unsubscribe(&self.channel).await.ok();
                listener.close().await.ok();
                Err(self.already_running())
            }
        }
    }

    /// Spawns the engine, unless a consumer is already running; in
    /// that case the listener is handed back.
    fn launch(
        &self,
        listener: B::Listener,
        shutdown: std::pin::Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<Feed, B::Listener> {
        let mut state = self.shared.state();
        if let State::Running(_) = &state.current {
            return Err(listener);
        }

        state.generation += 1;
        let generation = state.generation;

        // a single slot, which the engine reserves before it pops, so
        // at most one task is out of the list and unread.
        let (sender, receiver) = mpsc::channel(1);
        let inbox = Inbox::new(receiver);
        let (stop, stopped) = watch::channel(false);

        let engine = Engine {
            backend: Arc::clone(&self.backend),
            listener,
            name: Arc::clone(&self.name),
            channel: Arc::clone(&self.channel),
            id: self.id.clone(),
            presence: self.presence.clone(),
            heartbeat: self.config.heartbeat,
            shared: Arc::clone(&self.shared),
            inbox: inbox.clone(),
            generation,
        };

        let task = tokio::spawn(engine.run(sender, Cancellation::new(stopped, shutdown)));

        state.current = State::Running(Running {
            generation,
            started_at: Instant::now(),
            stop,
            task: Some(task),
        });

        tracing::debug!(generation, "consumer started");

        Ok(Feed::new(inbox))
    }

    /// Stops the running consumer, and waits for it to release its
    /// resources.
    ///
    /// Once this returns, the consumer's presence record is gone, its
    /// notification connection is closed, and its feed has ended.
    /// Fails with [`QueueError::NotRunning`] if no consumer is running
    /// or it is already being stopped; failures while tearing down are
    /// returned here.
    #[tracing::instrument(skip(self), fields(queue = %self.name, consumer = %self.id))]
    pub async fn cancel(&self) -> Result<(), QueueError<B::Error>> {
        self.ensure_open()?;
        let task = self.shared.signal_stop().ok_or_else(|| self.not_running())?;
        task.await?
    }

    /// Like [`cancel`](Self::cancel), but succeeds when there is
    /// nothing to stop.
    pub(crate) async fn stop(&self) -> Result<(), QueueError<B::Error>> {
        match self.shared.signal_stop() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }

    /// How long the running consumer has been running.
    pub fn age(&self) -> Result<Duration, QueueError<B::Error>> {
        self.ensure_open()?;
        self.shared
            .started_at()
            .map(|started_at| started_at.elapsed())
            .ok_or_else(|| self.not_running())
    }

    pub fn is_running(&self) -> bool { self.shared.is_running() }

    /// Takes the error that stopped the consumer, if it stopped on its
    /// own.
    ///
    /// A consumer that hits a store failure while running stops, and
    /// its feed ends; the failure is kept here until taken.
    pub fn take_error(&self) -> Result<Option<QueueError<B::Error>>, QueueError<B::Error>> {
        self.ensure_open()?;
        Ok(self.shared.take_error())
    }

    fn already_running(&self) -> QueueError<B::Error> {
        QueueError::AlreadyRunning {
            id: self.id.clone(),
            queue: Arc::clone(&self.name),
        }
    }
}

pub(crate) async fn pop<B: Backend>(
    backend: &B,
    queue: &Arc<str>,
) -> Result<Option<String>, QueueError<B::Error>> {
    backend
        .pop_front(queue)
        .await
        .map_err(|source| QueueError::Pop {
            queue: Arc::clone(queue),
            source,
        })
}

type Task<E> = JoinHandle<Result<(), QueueError<E>>>;

/// Consumer state shared between a [`Queue`] and its running engine.
pub(crate) struct Shared<E> {
    state: Mutex<Slot<E>>,
    error: Mutex<Option<QueueError<E>>>,
}

struct Slot<E> {
    /// Bumped on every start, so that an engine that is still tearing
    /// down can't clobber the state of its successor.
    generation: u64,
    current: State<E>,
}

enum State<E> {
    Idle,
    Running(Running<E>),
}

struct Running<E> {
    generation: u64,
    started_at: Instant,
    stop: watch::Sender<bool>,
    /// Taken by whoever stops the consumer first.
    task: Option<Task<E>>,
}

impl<E> Default for Shared<E> {
    fn default() -> Self {
        Self {
            state: Mutex::new(Slot {
                generation: 0,
                current: State::Idle,
            }),
            error: Mutex::new(None),
        }
    }
}

impl<E> Shared<E> {
    fn state(&self) -> MutexGuard<'_, Slot<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(&self.state().current, State::Running(_))
    }

    /// Whether the engine started as `generation` is still the one
    /// running.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        matches!(&self.state().current, State::Running(running) if running.generation == generation)
    }

    fn started_at(&self) -> Option<Instant> {
        match &self.state().current {
            State::Running(running) => Some(running.started_at),
            State::Idle => None,
        }
    }

    /// Asks the running engine to stop, handing back its task to wait
    /// on.  `None` if nothing is running, or it is already stopping.
    pub(crate) fn signal_stop(&self) -> Option<Task<E>> {
        let mut state = self.state();
        let State::Running(running) = &mut state.current else {
            return None;
        };

        let task = running.task.take()?;
        running.stop.send_replace(true);
        Some(task)
    }

    /// Marks the engine started as `generation` as stopped.
    pub(crate) fn finish(&self, generation: u64) {
        let mut state = self.state();
        if matches!(&state.current, State::Running(running) if running.generation == generation) {
            state.current = State::Idle;
        }
    }

    /// Keeps `error` for the owner, unless an earlier one is still
    /// waiting to be taken.
    pub(crate) fn record(&self, error: QueueError<E>) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take_error(&self) -> Option<QueueError<E>> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<E> std::fmt::Debug for Shared<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
