use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Change feed over one keyed record set.
///
/// Every delivery carries the entire current ordered snapshot, not a delta.
/// Dropping the feed is the unsubscribe; the publisher prunes closed channels
/// lazily, so no explicit cancel call is needed.
#[derive(Debug)]
pub struct SnapshotFeed<T> {
    receiver: watch::Receiver<Arc<Vec<T>>>,
}

impl<T> SnapshotFeed<T> {
    pub fn new(receiver: watch::Receiver<Arc<Vec<T>>>) -> Self {
        Self { receiver }
    }

    /// Builds a standalone publisher/feed pair. Store implementations outside
    /// this crate (including test fakes) publish through the returned sender.
    pub fn channel(initial: Vec<T>) -> (watch::Sender<Arc<Vec<T>>>, Self) {
        let (sender, receiver) = watch::channel(Arc::new(initial));
        (sender, Self::new(receiver))
    }

    /// Returns the snapshot as of the last publish without waiting.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next publish and returns it, or `None` once the
    /// publishing store has gone away.
    pub async fn changed(&mut self) -> Option<Arc<Vec<T>>> {
        match self.receiver.changed().await {
            Ok(()) => Some(self.receiver.borrow_and_update().clone()),
            Err(_) => None,
        }
    }
}

pub type MessageFeed = SnapshotFeed<super::types::MessageRecord>;
pub type SessionFeed = SnapshotFeed<super::types::SessionSummary>;

/// Publisher half shared by all feeds of one record set, keyed by owner id.
#[derive(Debug)]
pub(crate) struct FeedHub<K, T> {
    channels: Mutex<HashMap<K, watch::Sender<Arc<Vec<T>>>>>,
}

impl<K, T> FeedHub<K, T>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a feed for `key`, seeding the channel with a fresh snapshot
    /// so a new subscriber always starts from current store state.
    pub(crate) fn subscribe(&self, key: K, initial: Vec<T>) -> SnapshotFeed<T> {
        let mut channels = self.channels.lock().expect("feed hub lock poisoned");
        let sender = channels
            .entry(key)
            .or_insert_with(|| watch::channel(Arc::new(Vec::new())).0);
        sender.send_replace(Arc::new(initial));
        SnapshotFeed::new(sender.subscribe())
    }

    /// Delivers `snapshot` to every live feed for `key`; channels whose
    /// subscribers are all gone are dropped instead of notified.
    pub(crate) fn publish(&self, key: &K, snapshot: Vec<T>) {
        let mut channels = self.channels.lock().expect("feed hub lock poisoned");
        let Some(sender) = channels.get(key) else {
            return;
        };

        if sender.receiver_count() == 0 {
            channels.remove(key);
            return;
        }

        let _ = sender.send(Arc::new(snapshot));
    }
}
