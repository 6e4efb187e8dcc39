//
// Fixed-capacity single-producer/single-consumer index rings. These carry
// slot ownership between the engine and the driver boundary: fill and
// completion rings carry bare slot indices, rx and tx rings carry frame
// descriptors.
//
// The protocol is two-phase on both sides. The producer claims capacity with
// reserve(), writes entries into the claimed window, then publishes them with
// submit(); the consumer observes entries with peek() and hands capacity back
// with release(). Entries are never visible half-written because the only
// publication step is the release-store of the producer cursor, and capacity
// is never reclaimed early because the only reclamation step is the
// release-store of the consumer cursor.
//
use std::cell::UnsafeCell;
use std::cmp::min;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Shared<T> {
    slots: Box<[UnsafeCell<T>]>,
    capacity: u64,
    // Free-running cursors; slot position is cursor % capacity.
    prod: AtomicU64,
    cons: AtomicU64,
}

unsafe impl<T: Send + Copy> Send for Shared<T> {}
unsafe impl<T: Send + Copy> Sync for Shared<T> {}

/// Producer side of a ring. Owned by exactly one thread at a time.
pub struct RingProducer<T: Copy + Default> {
    shared: Arc<Shared<T>>,
    cached_cons: u64,
    reserved: u64,
}

/// Consumer side of a ring. Owned by exactly one thread at a time.
pub struct RingConsumer<T: Copy + Default> {
    shared: Arc<Shared<T>>,
    cached_prod: u64,
}

/// Create a ring of the given capacity and split it into its two ends.
pub fn ring<T: Copy + Default>(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    assert!(capacity > 0, "ring capacity must be non-zero");

    let slots: Vec<UnsafeCell<T>> = (0..capacity).map(|_| UnsafeCell::new(T::default())).collect();

    let shared = Arc::new(Shared {
        slots: slots.into_boxed_slice(),
        capacity: capacity as u64,
        prod: AtomicU64::new(0),
        cons: AtomicU64::new(0),
    });

    let producer = RingProducer {
        shared: shared.clone(),
        cached_cons: 0,
        reserved: 0,
    };
    let consumer = RingConsumer {
        shared,
        cached_prod: 0,
    };

    (producer, consumer)
}

impl<T: Copy + Default> RingProducer<T> {
    /// Claim up to `count` slots. Returns the number granted, which may be
    /// zero; a short grant is backpressure from the consumer side, not an
    /// error. Never blocks.
    #[inline]
    pub fn reserve(&mut self, count: usize) -> usize {
        let prod = self.shared.prod.load(Ordering::Relaxed);

        let mut free = self.shared.capacity - (prod - self.cached_cons);
        if free < count as u64 {
            self.cached_cons = self.shared.cons.load(Ordering::Acquire);
            free = self.shared.capacity - (prod - self.cached_cons);
        }

        let granted = min(count as u64, free);
        self.reserved = granted;
        granted as usize
    }

    /// Write an entry into position `i` of the currently reserved window.
    #[inline]
    pub fn write(&mut self, i: usize, entry: T) {
        assert!((i as u64) < self.reserved, "write outside reserved window");

        let prod = self.shared.prod.load(Ordering::Relaxed);
        let pos = ((prod + i as u64) % self.shared.capacity) as usize;
        unsafe {
            *self.shared.slots[pos].get() = entry;
        }
    }

    /// Publish the first `count` entries of the reserved window to the
    /// consumer. Must not exceed what reserve() granted.
    #[inline]
    pub fn submit(&mut self, count: usize) {
        assert!(count as u64 <= self.reserved, "submit exceeds reservation");

        let prod = self.shared.prod.load(Ordering::Relaxed);
        self.shared.prod.store(prod + count as u64, Ordering::Release);
        self.reserved = 0;
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }
}

impl<T: Copy + Default> RingConsumer<T> {
    /// Copy up to `out.len()` published entries into `out` without consuming
    /// them. Returns the number available. Never blocks.
    #[inline]
    pub fn peek(&mut self, out: &mut [T]) -> usize {
        let cons = self.shared.cons.load(Ordering::Relaxed);

        let mut avail = self.cached_prod - cons;
        if avail < out.len() as u64 {
            self.cached_prod = self.shared.prod.load(Ordering::Acquire);
            avail = self.cached_prod - cons;
        }

        let n = min(out.len() as u64, avail) as usize;
        for (i, slot) in out.iter_mut().enumerate().take(n) {
            let pos = ((cons + i as u64) % self.shared.capacity) as usize;
            *slot = unsafe { *self.shared.slots[pos].get() };
        }

        n
    }

    /// Acknowledge `count` consumed entries, returning their capacity to the
    /// producer. Must not exceed what peek() has shown.
    #[inline]
    pub fn release(&mut self, count: usize) {
        let cons = self.shared.cons.load(Ordering::Relaxed);
        assert!(
            cons + count as u64 <= self.shared.prod.load(Ordering::Acquire),
            "release exceeds published entries"
        );

        self.shared.cons.store(cons + count as u64, Ordering::Release);
    }

    /// Number of published entries currently waiting.
    pub fn len(&self) -> usize {
        let prod = self.shared.prod.load(Ordering::Acquire);
        let cons = self.shared.cons.load(Ordering::Relaxed);
        (prod - cons) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }
}
