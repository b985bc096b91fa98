use crate::backend::Backend;
use crate::ConsumerId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The directory of live consumers for one queue.
///
/// Each consumer is a member of a scored set, with its score being
/// the unix time, in seconds, of its last wake-up.  Entries are
/// refreshed by the consumer itself, removed by it on teardown, and
/// swept by whoever lists the directory once they fall out of the
/// window.
#[derive(Debug, Clone)]
pub(crate) struct Presence {
    key: Arc<str>,
}

impl Presence {
    pub(crate) fn new(prefix: &str, queue: &str) -> Self {
        Self {
            key: format!("{prefix}consumers_{queue}").into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> &str { &self.key }

    pub(crate) async fn advertise<B: Backend>(
        &self,
        backend: &B,
        id: &ConsumerId,
    ) -> Result<(), B::Error> {
        backend.upsert_score(&self.key, id, unix_now()).await
    }

    pub(crate) async fn remove<B: Backend>(
        &self,
        backend: &B,
        id: &ConsumerId,
    ) -> Result<(), B::Error> {
        backend.remove_score(&self.key, id).await
    }

    /// Sweeps entries last seen before the window, then returns the
    /// rest keyed by consumer, with how long ago each was last seen.
    ///
    /// Scores are whole seconds, so a partial second at the end of the
    /// window counts as a full one.
    pub(crate) async fn list<B: Backend>(
        &self,
        backend: &B,
        window: Duration,
    ) -> Result<BTreeMap<ConsumerId, Duration>, B::Error> {
        let now = unix_now();
        let window = window.as_secs() + u64::from(window.subsec_nanos() > 0);
        let window = i64::try_from(window).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(window);

        backend
            .evict_scores_until(&self.key, cutoff.saturating_sub(1))
            .await?;
        let entries = backend.scores_since(&self.key, cutoff).await?;

        Ok(entries
            .into_iter()
            .map(|(member, seen)| {
                let elapsed = u64::try_from(now.saturating_sub(seen)).unwrap_or(0);
                (ConsumerId::new(member), Duration::from_secs(elapsed))
            })
            .collect())
    }
}

pub(crate) fn unix_now() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn sweeps_stale_entries() {
        let store = MemoryStore::new();
        let backend = store.connect();
        let presence = Presence::new("p/", "jobs");
        let fresh = ConsumerId::new("host/jobs/fresh/1");
        let now = unix_now();

        presence.advertise(&backend, &fresh).await.expect("advertise");
        backend
            .upsert_score(presence.key(), "host/jobs/late/2", now - 8)
            .await
            .expect("late");
        backend
            .upsert_score(presence.key(), "host/jobs/gone/3", now - 60)
            .await
            .expect("gone");

        let listed = presence.list(&backend, Duration::from_secs(10)).await.expect("list");

        assert!(listed.contains_key(&fresh));
        assert!(listed[&fresh] < Duration::from_secs(2));
        assert!(listed.contains_key(&ConsumerId::new("host/jobs/late/2")));
        assert!(!listed.contains_key(&ConsumerId::new("host/jobs/gone/3")));

        let remaining = backend
            .scores_since(presence.key(), i64::MIN)
            .await
            .expect("scores");
        assert_eq!(remaining.len(), 2, "stale entry should be evicted");
    }

    #[tokio::test]
    async fn long_windows_keep_slow_consumers() {
        let store = MemoryStore::new();
        let backend = store.connect();
        let presence = Presence::new("p/", "jobs");
        let slow = ConsumerId::new("host/jobs/slow/4");

        backend
            .upsert_score(presence.key(), &slow, unix_now() - 40)
            .await
            .expect("slow");

        let wide = presence.list(&backend, Duration::from_secs(60)).await.expect("list");
        assert!(wide[&slow] >= Duration::from_secs(40));

        let listed = presence.list(&backend, Duration::from_secs(10)).await.expect("list");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = MemoryStore::new();
        let backend = store.connect();
        let presence = Presence::new("p/", "jobs");
        let id = ConsumerId::new("host/jobs/abc/1");

        presence.advertise(&backend, &id).await.expect("advertise");
        presence.remove(&backend, &id).await.expect("remove");
        presence.remove(&backend, &id).await.expect("remove again");

        assert!(presence.list(&backend, Duration::from_secs(10)).await.expect("list").is_empty());
    }
}
