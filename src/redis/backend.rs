use super::data::ScoredMembers;
use crate::backend::{Backend, Listener};
use bb8_redis::RedisConnectionManager;
use futures::StreamExt as _;
use redis::AsyncCommands as _;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

type Pool = bb8::Pool<RedisConnectionManager>;
type Connection = bb8::PooledConnection<'static, RedisConnectionManager>;

/// A [`Backend`] talking to a Redis server.
///
/// Regular commands go through a connection pool; every consumer gets
/// a connection of its own for pub/sub, opened from the client.
pub struct RedisBackend {
    client: redis::Client,
    pool: RwLock<Option<Pool>>,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RedisBackendError {
    #[error("invalid redis connection info: {source}")]
    Client {
        #[source]
        source: redis::RedisError,
    },
    #[error("failed to set up the redis connection pool: {source}")]
    Pool {
        #[source]
        source: redis::RedisError,
    },
    #[error("failed to connect to redis: {source}")]
    Connection {
        #[source]
        source: bb8::RunError<redis::RedisError>,
    },
    #[error("failed to open a redis pub/sub connection: {source}")]
    PubSub {
        #[source]
        source: redis::RedisError,
    },
    #[error("redis command {command} failed: {source}")]
    Command {
        command: &'static str,
        #[source]
        source: redis::RedisError,
    },
    #[error("the redis connection is closed")]
    Closed,
    #[error("the redis pub/sub connection was lost")]
    ListenerClosed,
    #[error("the redis pub/sub connection is already handing out messages")]
    Reading,
}

fn command(command: &'static str) -> impl FnOnce(redis::RedisError) -> RedisBackendError {
    move |source| RedisBackendError::Command { command, source }
}

impl RedisBackend {
    /// Connects to the server at `info`, which is anything the redis
    /// client accepts as connection info; usually a `redis://` URL.
    pub async fn open<T: redis::IntoConnectionInfo>(info: T) -> Result<Self, RedisBackendError> {
        let client =
            redis::Client::open(info).map_err(|source| RedisBackendError::Client { source })?;
        let manager = RedisConnectionManager::new(client.get_connection_info().clone())
            .map_err(|source| RedisBackendError::Client { source })?;
        let pool = bb8::Pool::builder()
            .build(manager)
            .await
            .map_err(|source| RedisBackendError::Pool { source })?;

        Ok(Self::with_pool(client, pool))
    }

    /// Uses an existing pool.  `client` should point at the same
    /// server as the pool; it is used for pub/sub connections.
    #[must_use = "a backend does nothing unless used"]
    pub fn with_pool(client: redis::Client, pool: bb8::Pool<RedisConnectionManager>) -> Self {
        Self {
            client,
            pool: RwLock::new(Some(pool)),
        }
    }

    async fn connection(&self) -> Result<Connection, RedisBackendError> {
        let pool = self
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RedisBackendError::Closed)?;

        pool.get_owned()
            .await
            .map_err(|source| RedisBackendError::Connection { source })
    }
}

#[async_trait::async_trait]
impl Backend for RedisBackend {
    type Error = RedisBackendError;
    type Listener = RedisListener;

    async fn ping(&self) -> Result<(), Self::Error> {
        let mut connection = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut *connection)
            .await
            .map_err(command("PING"))
    }

    async fn push_back(&self, list: &str, payload: &str) -> Result<(), Self::Error> {
        let mut connection = self.connection().await?;
        connection
            .rpush::<_, _, ()>(list, payload)
            .await
            .map_err(command("RPUSH"))
    }

    async fn push_front(&self, list: &str, payload: &str) -> Result<(), Self::Error> {
        let mut connection = self.connection().await?;
        connection
            .lpush::<_, _, ()>(list, payload)
            .await
            .map_err(command("LPUSH"))
    }

    async fn pop_front(&self, list: &str) -> Result<Option<String>, Self::Error> {
        let mut connection = self.connection().await?;
        // a nil reply is an empty (or missing) list.
        connection
            .lpop::<_, Option<String>>(list, None)
            .await
            .map_err(command("LPOP"))
    }

    async fn length(&self, list: &str) -> Result<u64, Self::Error> {
        let mut connection = self.connection().await?;
        connection.llen(list).await.map_err(command("LLEN"))
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        let mut connection = self.connection().await?;
        connection.del::<_, ()>(key).await.map_err(command("DEL"))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), Self::Error> {
        let mut connection = self.connection().await?;
        connection
            .publish::<_, _, ()>(channel, message)
            .await
            .map_err(command("PUBLISH"))
    }

    async fn upsert_score(&self, set: &str, member: &str, score: i64) -> Result<(), Self::Error> {
        let mut connection = self.connection().await?;
        connection
            .zadd::<_, _, _, ()>(set, member, score)
            .await
            .map_err(command("ZADD"))
    }

    async fn remove_score(&self, set: &str, member: &str) -> Result<(), Self::Error> {
        let mut connection = self.connection().await?;
        connection
            .zrem::<_, _, ()>(set, member)
            .await
            .map_err(command("ZREM"))
    }

    async fn scores_since(&self, set: &str, min: i64) -> Result<Vec<(String, i64)>, Self::Error> {
        let mut connection = self.connection().await?;
        // `ZRANGEBYSCORE {set} {min} +inf WITHSCORES`
        let reply: ScoredMembers = redis::cmd("ZRANGEBYSCORE")
            .arg(set)
            .arg(min)
            .arg("+inf")
            .arg("WITHSCORES")
            .query_async(&mut *connection)
            .await
            .map_err(command("ZRANGEBYSCORE"))?;

        Ok(reply.members)
    }

    async fn evict_scores_until(&self, set: &str, max: i64) -> Result<(), Self::Error> {
        let mut connection = self.connection().await?;
        connection
            .zrembyscore::<_, _, _, ()>(set, "-inf", max)
            .await
            .map_err(command("ZREMRANGEBYSCORE"))
    }

    async fn listen(&self) -> Result<Self::Listener, Self::Error> {
        if self.pool.read().unwrap_or_else(PoisonError::into_inner).is_none() {
            return Err(RedisBackendError::Closed);
        }

        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|source| RedisBackendError::PubSub { source })?;

        Ok(RedisListener {
            state: ListenerState::Idle(pubsub),
        })
    }

    async fn close(&self) -> Result<(), Self::Error> {
        // dropping the last handle on the pool closes its connections.
        self.pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(drop)
            .ok_or(RedisBackendError::Closed)
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("server", &self.client.get_connection_info().addr)
            .field(
                "open",
                &self.pool.read().unwrap_or_else(PoisonError::into_inner).is_some(),
            )
            .finish_non_exhaustive()
    }
}

/// A dedicated pub/sub connection.
///
/// Subscriptions are made on the bare connection.  The first wait for
/// a notification hands it to a reader task, which owns the message
/// stream from then on and signals every message it sees; the waits
/// themselves only watch for those signals.
pub struct RedisListener {
    state: ListenerState,
}

enum ListenerState {
    Idle(redis::aio::PubSub),
    Reading {
        reader: JoinHandle<()>,
        signals: mpsc::Receiver<()>,
    },
    Closed,
}

impl RedisListener {
    fn pubsub(&mut self) -> Result<&mut redis::aio::PubSub, RedisBackendError> {
        match &mut self.state {
            ListenerState::Idle(pubsub) => Ok(pubsub),
            ListenerState::Reading { .. } => Err(RedisBackendError::Reading),
            ListenerState::Closed => Err(RedisBackendError::Closed),
        }
    }

    fn signals(&mut self) -> Result<&mut mpsc::Receiver<()>, RedisBackendError> {
        self.state = match std::mem::replace(&mut self.state, ListenerState::Closed) {
            ListenerState::Idle(pubsub) => {
                // one pending signal is enough to wake the engine, so
                // the rest are dropped.
                let (sender, signals) = mpsc::channel(1);
                let reader = tokio::spawn(async move {
                    let mut messages = pubsub.into_on_message();
                    while messages.next().await.is_some() {
                        if let Err(TrySendError::Closed(())) = sender.try_send(()) {
                            break;
                        }
                    }
                });
                ListenerState::Reading { reader, signals }
            }
            state => state,
        };

        match &mut self.state {
            ListenerState::Reading { signals, .. } => Ok(signals),
            ListenerState::Idle(_) | ListenerState::Closed => Err(RedisBackendError::Closed),
        }
    }
}

#[async_trait::async_trait]
impl Listener for RedisListener {
    type Error = RedisBackendError;

    async fn subscribe(&mut self, channel: &str) -> Result<(), Self::Error> {
        self.pubsub()?
            .subscribe(channel)
            .await
            .map_err(command("SUBSCRIBE"))
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), Self::Error> {
        match &mut self.state {
            ListenerState::Idle(pubsub) => pubsub
                .unsubscribe(channel)
                .await
                .map_err(command("UNSUBSCRIBE")),
            // the reader owns the connection; stopping it drops every
            // subscription at once.
            ListenerState::Reading { reader, .. } => {
                reader.abort();
                Ok(())
            }
            ListenerState::Closed => Err(RedisBackendError::Closed),
        }
    }

    async fn notified(&mut self) -> Result<(), Self::Error> {
        // a signal is only taken off the channel when this resolves,
        // so dropping the wait loses nothing.
        self.signals()?
            .recv()
            .await
            .ok_or(RedisBackendError::ListenerClosed)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        match std::mem::replace(&mut self.state, ListenerState::Closed) {
            ListenerState::Idle(pubsub) => {
                drop(pubsub);
                Ok(())
            }
            ListenerState::Reading { reader, .. } => {
                reader.abort();
                Ok(())
            }
            ListenerState::Closed => Err(RedisBackendError::Closed),
        }
    }
}

impl Drop for RedisListener {
    fn drop(&mut self) {
        if let ListenerState::Reading { reader, .. } = &self.state {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for RedisListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            ListenerState::Idle(_) => "idle",
            ListenerState::Reading { .. } => "reading",
            ListenerState::Closed => "closed",
        };
        f.debug_struct("RedisListener").field("state", &state).finish()
    }
}
