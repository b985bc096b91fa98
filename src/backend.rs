//! The store a queue is built on.
//!
//! A backend provides three shared structures per queue: a list
//! holding the payloads, a pub/sub channel carrying wake-ups, and a
//! scored set recording which consumers are alive.  Every method here
//! maps onto a single atomic operation of the store; the queue never
//! combines them under a lock, so a backend must not rely on callers
//! serializing anything.

#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Listener: Listener<Error = Self::Error>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), Self::Error>;

    /// Appends a payload to the tail of `list`.
    async fn push_back(&self, list: &str, payload: &str) -> Result<(), Self::Error>;
    /// Prepends a payload to the head of `list`.
    async fn push_front(&self, list: &str, payload: &str) -> Result<(), Self::Error>;
    /// Removes and returns the head of `list`, without blocking.
    ///
    /// An empty (or missing) list is `Ok(None)`; that is a normal
    /// result, never an error.
    async fn pop_front(&self, list: &str) -> Result<Option<String>, Self::Error>;
    async fn length(&self, list: &str) -> Result<u64, Self::Error>;
    /// Deletes `key` entirely.  Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), Self::Error>;

    /// Publishes `message` on `channel`.
    ///
    /// Delivery is best-effort: subscribers that are not connected
    /// right now never see it.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), Self::Error>;

    /// Sets the score of `member` in `set`, adding it if missing.
    async fn upsert_score(&self, set: &str, member: &str, score: i64) -> Result<(), Self::Error>;
    /// Removes `member` from `set`.  Removing an absent member is not
    /// an error.
    async fn remove_score(&self, set: &str, member: &str) -> Result<(), Self::Error>;
    /// Returns every member of `set` scored at least `min`, lowest
    /// score first.
    async fn scores_since(&self, set: &str, min: i64) -> Result<Vec<(String, i64)>, Self::Error>;
    /// Removes every member of `set` scored at most `max`.
    async fn evict_scores_until(&self, set: &str, max: i64) -> Result<(), Self::Error>;

    /// Opens a dedicated connection for receiving notifications.
    ///
    /// This must fail if the store cannot be reached, and must not
    /// share a connection with the request/response methods above, as
    /// a subscribed connection cannot issue regular commands.
    async fn listen(&self) -> Result<Self::Listener, Self::Error>;

    /// Releases the connections held by this backend.  Any later call
    /// must fail.
    async fn close(&self) -> Result<(), Self::Error>;
}

#[async_trait::async_trait]
pub trait Listener: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn subscribe(&mut self, channel: &str) -> Result<(), Self::Error>;
    async fn unsubscribe(&mut self, channel: &str) -> Result<(), Self::Error>;

    /// Waits for the next message on any subscribed channel.
    ///
    /// The content of the message is irrelevant; only its arrival is.
    /// This is raced against other events in a `select!`, so dropping
    /// the returned future before it completes must not lose a
    /// message.  Returns an error once the connection is gone.
    async fn notified(&mut self) -> Result<(), Self::Error>;

    async fn close(&mut self) -> Result<(), Self::Error>;
}
