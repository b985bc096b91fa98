//! # Redis Provider
//!
//! This is the redis provider for the task queue.  It only uses
//! commands that have been around since Redis 2.x, so it should work
//! against any server, or anything speaking the protocol.
//!
//! ## Layout
//!
//! For a queue named `jobs`, with the default prefix of
//! `redisQueue/`:
//!
//! - the tasks are in the list `jobs`, oldest at the head.  Tasks are
//!   pushed with `RPUSH` (or `LPUSH`, for urgent ones) and popped with
//!   `LPOP`;
//! - after every push, the message `1` is published on the channel
//!   `redisQueue/jobs`;
//! - consumers record themselves in the sorted set
//!   `redisQueue/consumers_jobs`, scored by the unix time of their
//!   last wake-up, in seconds.
//!
//! This layout is shared with other implementations of the same
//! queue, so a producer written in anything else can feed consumers
//! written with this crate, and vice versa.  Note that the list is
//! *not* prefixed.
//!
//! ## Connections
//!
//! Everything but pub/sub goes through a `bb8` pool, so a handle can
//! be used from many tasks at once.  A subscribed connection can't
//! issue regular commands, so every consumer opens a connection of its
//! own for notifications, and closes it when it stops.

mod backend;
mod data;

pub use self::backend::{RedisBackend, RedisBackendError, RedisListener};
use crate::config::ConnectionOptions;
use crate::{Queue, QueueError};

impl Queue<RedisBackend> {
    /// Creates a handle on the queue `name`, on a server running on
    /// this machine, on the default port and database.
    pub async fn local(name: &str) -> Result<Self, QueueError<RedisBackendError>> {
        Self::connect(name, &ConnectionOptions::default()).await
    }

    /// Creates a handle on the queue `name` on the server described
    /// by `options`.
    #[tracing::instrument(skip(options), fields(host = %options.host, port = options.port))]
    pub async fn connect(
        name: &str,
        options: &ConnectionOptions,
    ) -> Result<Self, QueueError<RedisBackendError>> {
        let url = options
            .to_url()
            .map_err(|source| QueueError::Config { source })?;
        let backend = RedisBackend::open(url.as_str())
            .await
            .map_err(|source| QueueError::Connection { source })?;

        Self::new(name, backend).await
    }

    /// Creates a handle on the queue `name` on the server at `url`, a
    /// `redis://[user[:password]@]host[:port][/database]` connection
    /// string.
    pub async fn from_url(name: &str, url: &str) -> Result<Self, QueueError<RedisBackendError>> {
        let options = url
            .parse::<ConnectionOptions>()
            .map_err(|source| QueueError::Config { source })?;

        Self::connect(name, &options).await
    }
}
