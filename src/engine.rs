use std::cmp::min;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arraydeque::ArrayDeque;
use tracing::{debug, warn};

use crate::boundary::Boundary;
use crate::desc::FrameDesc;
use crate::error::Error;
use crate::frame_pool::{FramePool, PoolOptions};
use crate::queue::HandoffQueue;
use crate::ring::{RingConsumer, RingProducer};
use crate::PENDING_LEN;

/// Engine lifecycle. Draining is entered when cancellation is observed and
/// lasts until every descriptor already queued has been pushed to the
/// transmit ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl EngineState {
    fn from_u8(v: u8) -> EngineState {
        match v {
            0 => EngineState::Idle,
            1 => EngineState::Running,
            2 => EngineState::Draining,
            _ => EngineState::Stopped,
        }
    }
}

const STATE_RUNNING: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// How long the egress loop keeps servicing the completion ring after the
/// queue has drained, so slots acknowledged late still come back before the
/// rings go away. A boundary that never acknowledges cannot wedge shutdown.
const COMPLETION_DRAIN_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ingress: String,
    pub egress: String,
    pub slot_count: usize,
    pub slot_size: usize,
    pub ring_capacity: usize,
    pub batch_size: usize,
    pub queue_depth: usize,
    pub huge_tlb: bool,
}

impl EngineConfig {
    /// Checked before any boundary resource is touched.
    fn validate(&self) -> Result<(), Error> {
        if self.slot_size < 64 {
            return Err(Error::ConfigurationInvalid(format!(
                "slot_size {} is below the 64 byte minimum",
                self.slot_size
            )));
        }
        if self.ring_capacity < 1 {
            return Err(Error::ConfigurationInvalid(
                "ring_capacity must be at least 1".to_string(),
            ));
        }
        if self.slot_count < 2 * self.ring_capacity {
            return Err(Error::ConfigurationInvalid(format!(
                "slot_count {} is below 2 * ring_capacity ({})",
                self.slot_count,
                2 * self.ring_capacity
            )));
        }
        if self.ingress == self.egress {
            return Err(Error::ConfigurationInvalid(format!(
                "ingress and egress must be distinct interfaces (both {:?})",
                self.ingress
            )));
        }
        if self.queue_depth < 1 {
            return Err(Error::ConfigurationInvalid(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        if self.batch_size < 1 || self.batch_size > PENDING_LEN {
            return Err(Error::ConfigurationInvalid(format!(
                "batch_size {} outside 1..={}",
                self.batch_size, PENDING_LEN
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    forwarded: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time view of the engine counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountersSnapshot {
    /// Descriptors observed on the receive ring and queued.
    pub received: u64,
    /// Descriptors submitted to the transmit ring.
    pub forwarded: u64,
    /// Slots reclaimed through the completion ring.
    pub completed: u64,
    /// Descriptors lost to a closed queue or boundary error.
    pub dropped: u64,
    /// Descriptors currently sitting in the handoff queue.
    pub queue_depth: usize,
}

/// A running loopback engine. Constructed by [`start`]; all subsequent
/// operations (counters, stop) go through the handle, there is no
/// process-wide state.
pub struct EngineHandle<B: Boundary> {
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
    queue: Arc<HandoffQueue>,
    ingress_thread: Option<JoinHandle<()>>,
    egress_thread: Option<JoinHandle<()>>,
    boundary: B,
    ingress_iface: B::Interface,
    egress_iface: B::Interface,
    // Anchors the arena for at least as long as the rings referencing it.
    _pool: Arc<FramePool>,
}

impl<B: Boundary> EngineHandle<B> {
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn counters(&self) -> CountersSnapshot {
        CountersSnapshot {
            received: self.counters.received.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Signal cancellation and block until the engine reaches Stopped. All
    /// descriptors queued before the signal are transmitted first. Returns
    /// the final counters.
    pub fn stop(mut self) -> Result<CountersSnapshot, Error> {
        self.shutdown_threads()?;

        self.boundary.teardown(&self.ingress_iface)?;
        self.boundary.teardown(&self.egress_iface)?;

        Ok(self.counters())
    }

    fn shutdown_threads(&mut self) -> Result<(), Error> {
        self.stop.store(true, Ordering::Release);

        if let Some(handle) = self.ingress_thread.take() {
            handle
                .join()
                .map_err(|_| Error::Boundary("ingress thread panicked".to_string()))?;
        }
        if let Some(handle) = self.egress_thread.take() {
            handle
                .join()
                .map_err(|_| Error::Boundary("egress thread panicked".to_string()))?;
        }

        Ok(())
    }
}

impl<B: Boundary> Drop for EngineHandle<B> {
    fn drop(&mut self) {
        // A handle abandoned without stop() must not leave the loops spinning.
        let _ = self.shutdown_threads();
    }
}

/// Allocate the arena, bind both interfaces, place the initial free slots on
/// the fill ring and spin up the ingress and egress loops.
pub fn start<B: Boundary>(boundary: B, config: EngineConfig) -> Result<EngineHandle<B>, Error> {
    config.validate()?;

    let pool = FramePool::allocate(
        config.slot_count,
        config.slot_size,
        PoolOptions {
            huge_tlb: config.huge_tlb,
        },
    )?;

    let ingress_iface = boundary.bind_interface(&config.ingress)?;
    let egress_iface = match boundary.bind_interface(&config.egress) {
        Ok(iface) => iface,
        Err(err) => {
            boundary.teardown(&ingress_iface)?;
            return Err(err);
        }
    };

    let ingress_rings = boundary.create_rings(&ingress_iface, &pool, config.ring_capacity)?;
    let egress_rings = boundary.create_rings(&egress_iface, &pool, config.ring_capacity)?;

    // The ingress loop only consumes the receive ring. The fill producer goes
    // to the egress loop together with the completion consumer and the free
    // stash: a slot returns to the fill ring only after the completion ring
    // acknowledged its transmission, never on receive dequeue. This is what
    // keeps the driver from overwriting a slot the egress path still reads.
    let rx = ingress_rings.rx;
    let mut side = EgressSide {
        tx: egress_rings.tx,
        completion: egress_rings.completion,
        fill: ingress_rings.fill,
        free: (0..config.slot_count as u32).rev().collect(),
    };

    // All slots start Free: as many as fit go on the fill ring, the rest
    // wait in the stash.
    let granted = side.fill.reserve(min(config.ring_capacity, side.free.len()));
    for i in 0..granted {
        let idx = side.free.pop().expect("free stash holds all slots at startup");
        side.fill.write(i, idx);
    }
    side.fill.submit(granted);
    debug!(granted, stashed = side.free.len(), "initial fill complete");

    let stop = Arc::new(AtomicBool::new(false));
    let state = Arc::new(AtomicU8::new(STATE_RUNNING));
    let counters = Arc::new(Counters::default());
    let queue = Arc::new(HandoffQueue::new(config.queue_depth));

    let ingress_thread = {
        let stop = stop.clone();
        let state = state.clone();
        let counters = counters.clone();
        let queue = queue.clone();
        let batch = config.batch_size;
        thread::Builder::new()
            .name("pktloop-ingress".to_string())
            .spawn(move || ingress_loop(stop, state, rx, queue, counters, batch))
            .map_err(|e| Error::ResourceExhausted(format!("spawn ingress thread: {}", e)))?
    };

    let egress_thread = {
        let state = state.clone();
        let counters = counters.clone();
        let queue = queue.clone();
        let batch = config.batch_size;
        thread::Builder::new()
            .name("pktloop-egress".to_string())
            .spawn(move || egress_loop(state, queue, side, counters, batch))
            .map_err(|e| Error::ResourceExhausted(format!("spawn egress thread: {}", e)))?
    };

    Ok(EngineHandle {
        stop,
        state,
        counters,
        queue,
        ingress_thread: Some(ingress_thread),
        egress_thread: Some(egress_thread),
        boundary,
        ingress_iface,
        egress_iface,
        _pool: pool,
    })
}

/// Receive ring to handoff queue. Cancellation is observed at exactly one
/// point, the top of the iteration; propagation to the egress loop goes
/// through queue shutdown only, so everything already queued still drains.
fn ingress_loop(
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    mut rx: RingConsumer<FrameDesc>,
    queue: Arc<HandoffQueue>,
    counters: Arc<Counters>,
    batch: usize,
) {
    let mut batch_buf = vec![FrameDesc::default(); batch];

    while !stop.load(Ordering::Acquire) {
        let n = rx.peek(&mut batch_buf);
        if n == 0 {
            hint::spin_loop();
            continue;
        }

        for desc in &batch_buf[..n] {
            match queue.push(*desc) {
                Ok(()) => {
                    counters.received.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    // Queue closed under us. A lifecycle bug, not a retry
                    // condition.
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(index = desc.index, "descriptor dropped on closed queue");
                }
            }
        }

        rx.release(n);
    }

    state.store(STATE_DRAINING, Ordering::Release);
    queue.shutdown();
    debug!("ingress loop exited");
}

/// Everything the egress loop owns: the transmit producer, the completion
/// consumer, and the recycling side (fill producer plus the free stash).
struct EgressSide {
    tx: RingProducer<FrameDesc>,
    completion: RingConsumer<u32>,
    fill: RingProducer<u32>,
    free: Vec<u32>,
}

/// Handoff queue to transmit ring, plus completion servicing. Blocks on the
/// queue only when nothing is pending; a short transmit grant is driver
/// backpressure and the descriptors wait in the pending deque for the next
/// iteration.
fn egress_loop(
    state: Arc<AtomicU8>,
    queue: Arc<HandoffQueue>,
    mut side: EgressSide,
    counters: Arc<Counters>,
    batch: usize,
) {
    let mut pending: ArrayDeque<[FrameDesc; PENDING_LEN]> = ArrayDeque::new();
    let mut comp_buf = vec![0u32; batch];
    let mut outstanding: u64 = 0;

    loop {
        // Reclaim completed slots and top the fill ring back up before
        // potentially suspending on the queue. A boundary may acknowledge
        // more than was ever transmitted; that must not underflow.
        let n = service_completions(&mut side, &mut comp_buf, &counters);
        outstanding = outstanding.saturating_sub(n as u64);
        refill(&mut side);

        if pending.is_empty() {
            match queue.pop() {
                Some(desc) => {
                    pending.push_back(desc).expect("pending deque is empty");
                }
                None => break,
            }
        }

        while pending.len() < batch {
            match queue.try_pop() {
                Some(desc) => {
                    pending.push_back(desc).expect("pending deque has room");
                }
                None => break,
            }
        }

        let want = min(pending.len(), batch);
        let granted = side.tx.reserve(want);
        for i in 0..granted {
            let desc = pending.pop_front().expect("granted <= pending");
            side.tx.write(i, desc);
        }
        if granted > 0 {
            side.tx.submit(granted);
            outstanding += granted as u64;
            counters.forwarded.fetch_add(granted as u64, Ordering::Relaxed);
        } else if !pending.is_empty() {
            // Transmit ring full; retry next iteration.
            hint::spin_loop();
        }
    }

    // Queue closed and drained, pending flushed. Keep servicing the
    // completion ring for a bounded window so acknowledged slots come back
    // before the rings go away.
    let drain_deadline = Instant::now() + COMPLETION_DRAIN_WAIT;
    while outstanding > 0 && Instant::now() < drain_deadline {
        let n = service_completions(&mut side, &mut comp_buf, &counters);
        outstanding = outstanding.saturating_sub(n as u64);
        refill(&mut side);
        if n == 0 {
            thread::yield_now();
        }
    }
    if outstanding > 0 {
        warn!(outstanding, "slots still in flight at shutdown");
    }

    state.store(STATE_STOPPED, Ordering::Release);
    debug!("egress loop exited");
}

fn service_completions(side: &mut EgressSide, comp_buf: &mut [u32], counters: &Counters) -> usize {
    let n = side.completion.peek(comp_buf);
    if n == 0 {
        return 0;
    }

    side.free.extend_from_slice(&comp_buf[..n]);
    side.completion.release(n);
    counters.completed.fetch_add(n as u64, Ordering::Relaxed);

    n
}

fn refill(side: &mut EgressSide) {
    if side.free.is_empty() {
        return;
    }

    let granted = side.fill.reserve(side.free.len());
    for i in 0..granted {
        let idx = side.free.pop().expect("granted <= free stash");
        side.fill.write(i, idx);
    }
    if granted > 0 {
        side.fill.submit(granted);
    }
}
