use super::entry::CaptureEntry;
use super::filter::FilterState;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bounded, insertion-ordered store of captured transactions.
///
/// At capacity the oldest entry is evicted before a new one is inserted.
/// Readers get clones of the shared entries, so a `clear` never invalidates
/// a list that is already in hand.
pub struct CaptureStore {
    capacity: usize,
    entries: RwLock<VecDeque<Arc<CaptureEntry>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<Arc<CaptureEntry>>,
}

impl CaptureStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert `entry`, assigning its id. Returns the stored entry.
    pub fn append(&self, mut entry: CaptureEntry) -> Arc<CaptureEntry> {
        let stored = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let stored = Arc::new(entry);
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(stored.clone());
            stored
        };

        // No subscribers is the common case outside verbose mode.
        let _ = self.events.send(stored.clone());
        stored
    }

    /// Entries matching `filter`, oldest first.
    pub fn list(&self, filter: &FilterState) -> Vec<Arc<CaptureEntry>> {
        let hosts = filter.host_patterns();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|entry| filter.matches_with(entry, &hosts))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<Arc<CaptureEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().find(|entry| entry.id == id).cloned()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        *entries = VecDeque::with_capacity(self.capacity.min(1024));
        tracing::debug!("Cleared captured transactions");
    }

    pub fn count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Receive every entry appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CaptureEntry>> {
        self.events.subscribe()
    }
}
