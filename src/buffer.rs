use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Counting permit guarding a channel's free slots
#[derive(Debug)]
struct Permits {
    available: Mutex<usize>,
    freed: Condvar,
}

#[derive(Debug)]
struct Shared<T> {
    queue: SegQueue<T>,
    capacity: usize,
    permits: Permits,
    abandoned: AtomicBool,
    block_count: AtomicU64,
}

/// A capacity-limited FIFO shared by one producer group and one consumer group.
///
/// Producers acquire a permit before enqueueing and block while none are
/// left; every successful [`pop`](Self::pop) returns one permit, so a blocked
/// producer is released by exactly one consumption. Occupancy never exceeds
/// the capacity.
#[derive(Debug)]
pub struct BoundedChannel<T: Send> {
    shared: Arc<Shared<T>>,
}

impl<T: Send> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> Default for BoundedChannel<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T: Send> BoundedChannel<T> {
    /// Create a channel holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                queue: SegQueue::new(),
                capacity,
                permits: Permits {
                    available: Mutex::new(capacity),
                    freed: Condvar::new(),
                },
                abandoned: AtomicBool::new(false),
                block_count: AtomicU64::new(0),
            }),
        }
    }

    /// Create a channel whose capacity is `usize::MAX`, which never blocks in practice
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Enqueue an item, blocking while the channel is full.
    ///
    /// Returns the item back only if the channel was abandoned, either before
    /// the call or while the producer was waiting for a permit.
    pub fn push(&self, item: T) -> Result<(), T> {
        if self.is_abandoned() {
            return Err(item);
        }
        {
            let mut available = self.shared.permits.available.lock();
            if *available == 0 {
                self.shared.block_count.fetch_add(1, Ordering::Relaxed);
            }
            while *available == 0 {
                if self.is_abandoned() {
                    return Err(item);
                }
                self.shared.permits.freed.wait(&mut available);
            }
            if self.is_abandoned() {
                return Err(item);
            }
            *available -= 1;
        }
        self.shared.queue.push(item);
        Ok(())
    }

    /// Dequeue the oldest item without blocking
    pub fn pop(&self) -> Option<T> {
        let item = self.shared.queue.pop()?;
        let mut available = self.shared.permits.available.lock();
        *available += 1;
        self.shared.permits.freed.notify_one();
        Some(item)
    }

    /// Release every blocked producer and refuse further pushes.
    ///
    /// Only used once a run has failed; items already queued stay poppable.
    pub fn abandon(&self) {
        self.shared.abandoned.store(true, Ordering::SeqCst);
        // Take the permit lock so no producer can miss the wake-up between
        // its abandoned check and its wait.
        let _available = self.shared.permits.available.lock();
        self.shared.permits.freed.notify_all();
    }

    /// Whether the channel was abandoned
    pub fn is_abandoned(&self) -> bool {
        self.shared.abandoned.load(Ordering::SeqCst)
    }

    /// Current occupancy; only meaningful for polling, never for synchronization
    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Check if the channel is empty
    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    /// Get the capacity of the channel
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Free permits, i.e. `capacity - occupancy` outside of in-flight pushes
    pub fn available_permits(&self) -> usize {
        *self.shared.permits.available.lock()
    }

    /// Get the utilization of the channel as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        let pct = (self.len() as u128 * 100) / self.capacity() as u128;
        pct.min(100) as u32
    }

    /// Number of pushes that found the channel full and had to wait
    pub fn block_count(&self) -> u64 {
        self.shared.block_count.load(Ordering::Relaxed)
    }
}

/// Producer side of a fan-out: the input channels of every downstream worker
/// linked to one upstream worker, fed in rotation.
///
/// Each downstream worker owns exactly one input channel, so rotating the
/// pushes hands every linked consumer its share of the items.
#[derive(Debug)]
pub struct Fanout<T: Send> {
    channels: Vec<BoundedChannel<T>>,
    next: usize,
}

impl<T: Send> Fanout<T> {
    pub fn new(channels: Vec<BoundedChannel<T>>) -> Self {
        Self { channels, next: 0 }
    }

    /// Pick the channels `links` assigns to `producer`, where `links[j]` is
    /// the producer feeding `channels[j]`
    pub fn assign(channels: &[BoundedChannel<T>], links: &[usize], producer: usize) -> Self {
        let channels = channels
            .iter()
            .zip(links)
            .filter(|(_, p)| **p == producer)
            .map(|(c, _)| c.clone())
            .collect();
        Self::new(channels)
    }

    /// Push to the next channel in rotation, blocking while it is full.
    ///
    /// Returns the item back if that channel was abandoned or there is no
    /// channel at all.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.channels.is_empty() {
            return Err(item);
        }
        let channel = &self.channels[self.next];
        self.next = (self.next + 1) % self.channels.len();
        channel.push(item)
    }

    /// Whether the channel the next push goes to has no free permit
    pub fn next_is_full(&self) -> bool {
        self.channels
            .get(self.next)
            .map_or(false, |c| c.available_permits() == 0)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl<T: Send> From<BoundedChannel<T>> for Fanout<T> {
    fn from(channel: BoundedChannel<T>) -> Self {
        Self::new(vec![channel])
    }
}
