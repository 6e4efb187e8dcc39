use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::desc::FrameDesc;
use crate::error::Error;

/// Bounded FIFO queue carrying frame descriptors from the ingress loop to the
/// egress loop. The two blocking calls here are the only suspension points in
/// the whole engine: push() blocks the ingress loop when the queue is at
/// capacity (backpressure against a slow egress path) and pop() blocks the
/// egress loop when the queue is empty.
///
/// Shutdown is irreversible for the life of the queue. After shutdown(),
/// push() fails with QueueClosed and pop() drains the remaining entries in
/// order, then returns None forever.
#[derive(Debug)]
pub struct HandoffQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    depth: usize,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<FrameDesc>,
    open: bool,
}

impl HandoffQueue {
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "queue depth must be at least 1");

        HandoffQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(depth),
                open: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            depth,
        }
    }

    /// Append a descriptor, blocking while the queue is at capacity.
    pub fn push(&self, desc: FrameDesc) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();

        while inner.items.len() == self.depth && inner.open {
            inner = self.not_full.wait(inner).unwrap();
        }

        if !inner.open {
            return Err(Error::QueueClosed);
        }

        inner.items.push_back(desc);
        drop(inner);
        self.not_empty.notify_one();

        Ok(())
    }

    /// Remove the oldest descriptor, blocking while the queue is empty and
    /// still open. Returns None exactly when the queue has been shut down and
    /// drained, and keeps returning None thereafter.
    pub fn pop(&self) -> Option<FrameDesc> {
        let mut inner = self.inner.lock().unwrap();

        while inner.items.is_empty() && inner.open {
            inner = self.not_empty.wait(inner).unwrap();
        }

        let desc = inner.items.pop_front();
        drop(inner);

        if desc.is_some() {
            self.not_full.notify_one();
        }

        desc
    }

    /// Non-blocking pop, used by the egress loop to top up a batch after a
    /// blocking pop returned the first descriptor.
    pub fn try_pop(&self) -> Option<FrameDesc> {
        let mut inner = self.inner.lock().unwrap();
        let desc = inner.items.pop_front();
        drop(inner);

        if desc.is_some() {
            self.not_full.notify_one();
        }

        desc
    }

    /// Stop accepting new descriptors and wake every blocked caller.
    /// Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.open = false;
        drop(inner);

        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Current number of queued descriptors.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::HandoffQueue;
    use crate::desc::FrameDesc;
    use crate::error::Error;

    fn desc(i: u32) -> FrameDesc {
        FrameDesc::new(i, 0, 100)
    }

    #[test]
    fn fifo_order() {
        let q = HandoffQueue::new(16);

        for i in 0..10 {
            q.push(desc(i)).unwrap();
        }

        for i in 0..10 {
            assert_eq!(q.pop().unwrap().index, i);
        }
    }

    #[test]
    fn shutdown_idempotent() {
        let q = HandoffQueue::new(4);

        q.push(desc(0)).unwrap();
        q.shutdown();
        q.shutdown();

        // Remaining entries still drain in order
        assert_eq!(q.pop().unwrap().index, 0);

        // Terminal state is sticky
        assert!(q.pop().is_none());
        assert!(q.pop().is_none());

        match q.push(desc(1)) {
            Err(Error::QueueClosed) => {}
            other => panic!("expected QueueClosed, got {:?}", other),
        }
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(HandoffQueue::new(4));

        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());

        thread::sleep(Duration::from_millis(50));
        q.push(desc(42)).unwrap();

        let got = handle.join().unwrap();
        assert_eq!(got.unwrap().index, 42);
    }

    #[test]
    fn pop_unblocked_by_shutdown() {
        let q = Arc::new(HandoffQueue::new(4));

        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());

        thread::sleep(Duration::from_millis(50));
        q.shutdown();

        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn push_blocks_at_capacity() {
        let q = Arc::new(HandoffQueue::new(1));
        let second_pushed = Arc::new(AtomicBool::new(false));

        q.push(desc(0)).unwrap();

        let q2 = q.clone();
        let flag = second_pushed.clone();
        let handle = thread::spawn(move || {
            q2.push(desc(1)).unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        // The second push must not get through while the queue is full
        thread::sleep(Duration::from_millis(100));
        assert!(!second_pushed.load(Ordering::SeqCst));
        assert_eq!(q.len(), 1);

        // One pop frees capacity and unblocks it
        let start = Instant::now();
        assert_eq!(q.pop().unwrap().index, 0);
        handle.join().unwrap();
        assert!(second_pushed.load(Ordering::SeqCst));
        assert!(start.elapsed() < Duration::from_secs(5));

        assert_eq!(q.pop().unwrap().index, 1);
    }

    #[test]
    fn never_exceeds_depth() {
        let q = Arc::new(HandoffQueue::new(4));

        let q2 = q.clone();
        let producer = thread::spawn(move || {
            for i in 0..100 {
                q2.push(desc(i)).unwrap();
            }
        });

        let mut seen = 0u32;
        while seen < 100 {
            assert!(q.len() <= 4);
            if let Some(d) = q.try_pop() {
                assert_eq!(d.index, seen);
                seen += 1;
            }
        }

        producer.join().unwrap();
    }
}
