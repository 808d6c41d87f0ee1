//! Storer events and non-blocking broadcast emitter.

use tokio::sync::broadcast;

/// Events announced by the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorerEvent {
    /// The storage radius moved.
    RadiusChanged { old: u8, new: u8 },
    /// Chunks were evicted from the cache.
    CacheEvicted { count: usize },
    /// A sweep evicted chunks from the reserve.
    ReserveEvicted { count: usize, radius: u8 },
    /// A chunk entered a reserve bin with the given bin id.
    BinUpdated { bin: u8, bin_id: u64 },
}

impl StorerEvent {
    pub fn is_reserve_event(&self) -> bool {
        !matches!(self, Self::CacheEvicted { .. })
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Non-blocking broadcast emitter. Slow subscribers drop events independently.
#[derive(Debug)]
pub struct EventEmitter {
    tx: broadcast::Sender<StorerEvent>,
}

impl Clone for EventEmitter {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: StorerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventEmitter {
    pub fn radius_changed(&self, old: u8, new: u8) {
        self.emit(StorerEvent::RadiusChanged { old, new });
    }

    pub fn cache_evicted(&self, count: usize) {
        self.emit(StorerEvent::CacheEvicted { count });
    }

    pub fn reserve_evicted(&self, count: usize, radius: u8) {
        self.emit(StorerEvent::ReserveEvicted { count, radius });
    }

    pub fn bin_updated(&self, bin: u8, bin_id: u64) {
        self.emit(StorerEvent::BinUpdated { bin, bin_id });
    }
}
