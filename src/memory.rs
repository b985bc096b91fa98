//! # Memory Provider
//!
//! An in-process backend, standing in for a store server.  A
//! [`MemoryStore`] holds the lists, channels and scored sets; each
//! [`MemoryStore::connect`] call hands out a [`MemoryBackend`], the
//! equivalent of one client connection, which can be closed without
//! affecting the others.
//!
//! Pub/sub here is as lossy as the real thing: a subscriber only sees
//! messages published while it is subscribed.  A few switches let
//! tests simulate an unhealthy store: [`MemoryStore::set_notifications`]
//! drops every published message on the floor,
//! [`MemoryStore::set_pop_failure`] makes pops fail, and
//! [`MemoryStore::set_available`] makes every operation fail.

use crate::backend::{Backend, Listener};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// How many undelivered notifications a lagging listener may fall
/// behind by before older ones are skipped.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MemoryError {
    #[error("the connection is closed")]
    Closed,
    #[error("the store is unavailable")]
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    data: Mutex<Data>,
    channels: broadcast::Sender<Arc<str>>,
    notifications: AtomicBool,
    available: AtomicBool,
    pop_failure: AtomicBool,
    listeners: AtomicUsize,
}

#[derive(Debug, Default)]
struct Data {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashMap<String, i64>>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (channels, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(Data::default()),
                channels,
                notifications: AtomicBool::new(true),
                available: AtomicBool::new(true),
                pop_failure: AtomicBool::new(false),
                listeners: AtomicUsize::new(0),
            }),
        }
    }

    /// Opens a new connection to this store.
    #[must_use]
    pub fn connect(&self) -> MemoryBackend {
        MemoryBackend {
            store: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enables or disables delivery of published messages.  Publishing
    /// still succeeds while disabled.
    pub fn set_notifications(&self, enabled: bool) {
        self.inner.notifications.store(enabled, Ordering::SeqCst);
    }

    /// Makes every operation, on every connection, fail with
    /// [`MemoryError::Unavailable`] while `false`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Makes every pop fail with [`MemoryError::Unavailable`] while
    /// `true`; everything else keeps working.
    pub fn set_pop_failure(&self, failing: bool) {
        self.inner.pop_failure.store(failing, Ordering::SeqCst);
    }

    /// The number of listeners opened and not closed yet.
    #[must_use]
    pub fn open_listeners(&self) -> usize { self.inner.listeners.load(Ordering::SeqCst) }

    fn data(&self) -> MutexGuard<'_, Data> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), MemoryError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemoryError::Unavailable)
        }
    }
}

/// One connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryBackend {
    store: MemoryStore,
    closed: AtomicBool,
}

impl MemoryBackend {
    fn store(&self) -> Result<&MemoryStore, MemoryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MemoryError::Closed);
        }

        self.store.check()?;
        Ok(&self.store)
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    type Error = MemoryError;
    type Listener = MemoryListener;

    async fn ping(&self) -> Result<(), Self::Error> { self.store().map(|_| ()) }

    async fn push_back(&self, list: &str, payload: &str) -> Result<(), Self::Error> {
        let mut data = self.store()?.data();
        data.lists
            .entry(list.to_owned())
            .or_default()
            .push_back(payload.to_owned());
        Ok(())
    }

    async fn push_front(&self, list: &str, payload: &str) -> Result<(), Self::Error> {
        let mut data = self.store()?.data();
        data.lists
            .entry(list.to_owned())
            .or_default()
            .push_front(payload.to_owned());
        Ok(())
    }

    async fn pop_front(&self, list: &str) -> Result<Option<String>, Self::Error> {
        let store = self.store()?;
        if store.inner.pop_failure.load(Ordering::SeqCst) {
            return Err(MemoryError::Unavailable);
        }

        let mut data = store.data();
        let Some(items) = data.lists.get_mut(list) else {
            return Ok(None);
        };

        let item = items.pop_front();
        // the store does not keep empty lists around.
        if items.is_empty() {
            data.lists.remove(list);
        }
        Ok(item)
    }

    async fn length(&self, list: &str) -> Result<u64, Self::Error> {
        let data = self.store()?.data();
        Ok(data.lists.get(list).map_or(0, |items| items.len() as u64))
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        let mut data = self.store()?.data();
        data.lists.remove(key);
        data.sets.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, _message: &str) -> Result<(), Self::Error> {
        let store = self.store()?;
        if store.inner.notifications.load(Ordering::SeqCst) {
            // no subscribers is not an error.
            store.inner.channels.send(channel.into()).ok();
        }
        Ok(())
    }

    async fn upsert_score(&self, set: &str, member: &str, score: i64) -> Result<(), Self::Error> {
        let mut data = self.store()?.data();
        data.sets
            .entry(set.to_owned())
            .or_default()
            .insert(member.to_owned(), score);
        Ok(())
    }

    async fn remove_score(&self, set: &str, member: &str) -> Result<(), Self::Error> {
        let mut data = self.store()?.data();
        if let Some(members) = data.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn scores_since(&self, set: &str, min: i64) -> Result<Vec<(String, i64)>, Self::Error> {
        let data = self.store()?.data();
        let mut entries = data
            .sets
            .get(set)
            .into_iter()
            .flatten()
            .filter(|(_, score)| **score >= min)
            .map(|(member, score)| (member.clone(), *score))
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(entries)
    }

    async fn evict_scores_until(&self, set: &str, max: i64) -> Result<(), Self::Error> {
        let mut data = self.store()?.data();
        if let Some(members) = data.sets.get_mut(set) {
            members.retain(|_, score| *score > max);
        }
        Ok(())
    }

    async fn listen(&self) -> Result<Self::Listener, Self::Error> {
        self.store()?;
        // opening a connection is never instant.
        tokio::task::yield_now().await;

        let store = self.store()?;
        store.inner.listeners.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryListener {
            store: store.clone(),
            receiver: store.inner.channels.subscribe(),
            channels: HashSet::new(),
            closed: false,
        })
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            Err(MemoryError::Closed)
        } else {
            Ok(())
        }
    }
}

/// A subscribed connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryListener {
    store: MemoryStore,
    receiver: broadcast::Receiver<Arc<str>>,
    channels: HashSet<String>,
    closed: bool,
}

impl MemoryListener {
    fn check(&self) -> Result<(), MemoryError> {
        if self.closed {
            return Err(MemoryError::Closed);
        }
        self.store.check()
    }
}

#[async_trait::async_trait]
impl Listener for MemoryListener {
    type Error = MemoryError;

    async fn subscribe(&mut self, channel: &str) -> Result<(), Self::Error> {
        self.check()?;
        self.channels.insert(channel.to_owned());
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), Self::Error> {
        self.check()?;
        self.channels.remove(channel);
        Ok(())
    }

    async fn notified(&mut self) -> Result<(), Self::Error> {
        loop {
            self.check()?;
            match self.receiver.recv().await {
                Ok(channel) if self.channels.contains(&*channel) => return Ok(()),
                Ok(_) => {}
                // we missed some, so at least one of them could have
                // been ours.
                Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                Err(broadcast::error::RecvError::Closed) => return Err(MemoryError::Closed),
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Err(MemoryError::Closed);
        }
        self.closed = true;
        self.channels.clear();
        self.store.inner.listeners.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_are_fifo_with_head_pushes() {
        let store = MemoryStore::new();
        let backend = store.connect();

        backend.push_back("jobs", "a").await.expect("push");
        backend.push_back("jobs", "b").await.expect("push");
        backend.push_front("jobs", "urgent").await.expect("push");

        assert_eq!(backend.length("jobs").await.expect("length"), 3);
        assert_eq!(backend.pop_front("jobs").await.expect("pop").as_deref(), Some("urgent"));
        assert_eq!(backend.pop_front("jobs").await.expect("pop").as_deref(), Some("a"));
        assert_eq!(backend.pop_front("jobs").await.expect("pop").as_deref(), Some("b"));
        assert_eq!(backend.pop_front("jobs").await.expect("pop"), None);
    }

    #[tokio::test]
    async fn connections_share_data_but_close_alone() {
        let store = MemoryStore::new();
        let first = store.connect();
        let second = store.connect();

        first.push_back("jobs", "a").await.expect("push");
        first.close().await.expect("close");

        assert!(matches!(first.length("jobs").await, Err(MemoryError::Closed)));
        assert!(matches!(first.close().await, Err(MemoryError::Closed)));
        assert_eq!(second.length("jobs").await.expect("length"), 1);
    }

    #[tokio::test]
    async fn listener_only_sees_subscribed_channels() {
        let store = MemoryStore::new();
        let backend = store.connect();
        let mut listener = backend.listen().await.expect("listen");
        listener.subscribe("wake/jobs").await.expect("subscribe");

        backend.publish("wake/other", "1").await.expect("publish");
        backend.publish("wake/jobs", "1").await.expect("publish");

        listener.notified().await.expect("notified");
        assert!(listener.receiver.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_everything() {
        let store = MemoryStore::new();
        let backend = store.connect();
        store.set_available(false);

        assert!(matches!(backend.ping().await, Err(MemoryError::Unavailable)));
        assert!(matches!(backend.pop_front("jobs").await, Err(MemoryError::Unavailable)));

        store.set_available(true);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn pop_failure_only_fails_pops() {
        let store = MemoryStore::new();
        let backend = store.connect();
        store.set_pop_failure(true);

        backend.push_back("jobs", "a").await.expect("push");
        assert!(matches!(backend.pop_front("jobs").await, Err(MemoryError::Unavailable)));
        assert_eq!(backend.length("jobs").await.expect("length"), 1);

        store.set_pop_failure(false);
        assert_eq!(backend.pop_front("jobs").await.expect("pop").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn counts_open_listeners() {
        let store = MemoryStore::new();
        let backend = store.connect();

        let mut listener = backend.listen().await.expect("listen");
        assert_eq!(store.open_listeners(), 1);

        listener.close().await.expect("close");
        assert!(matches!(listener.close().await, Err(MemoryError::Closed)));
        assert_eq!(store.open_listeners(), 0);
    }
}
