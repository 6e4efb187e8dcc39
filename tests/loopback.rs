//
// End-to-end scenarios driving the engine against the in-memory boundary:
// the test plays the driver role, injecting frames on the ingress device and
// harvesting/acknowledging them on the egress device.
//
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pktloop::engine::{start, CountersSnapshot, EngineConfig, EngineHandle, EngineState};
use pktloop::error::Error;
use pktloop::sim::{SimBoundary, SimDevice};

const DEADLINE: Duration = Duration::from_secs(10);

fn config(slot_count: usize, ring_capacity: usize, batch_size: usize, queue_depth: usize) -> EngineConfig {
    EngineConfig {
        ingress: "sim0".to_string(),
        egress: "sim1".to_string(),
        slot_count,
        slot_size: 128,
        ring_capacity,
        batch_size,
        queue_depth,
        huge_tlb: false,
    }
}

fn setup(cfg: EngineConfig) -> (Arc<SimDevice>, Arc<SimDevice>, EngineHandle<SimBoundary>) {
    let boundary = SimBoundary::with_interfaces(&["sim0", "sim1"]);
    let ingress = boundary.device("sim0").unwrap();
    let egress = boundary.device("sim1").unwrap();

    let handle = match start(boundary, cfg) {
        Ok(handle) => handle,
        Err(err) => panic!("failed to start engine: {}", err),
    };

    (ingress, egress, handle)
}

fn inject_with_retry(dev: &SimDevice, payload: &[u8], deadline: Instant) {
    loop {
        match dev.inject(payload) {
            Ok(_) => return,
            Err(_) => {
                // Fill ring momentarily empty; the egress loop will top it up
                assert!(Instant::now() < deadline, "inject timed out");
                thread::yield_now();
            }
        }
    }
}

fn complete_with_retry(dev: &SimDevice, index: u32, deadline: Instant) {
    loop {
        match dev.complete(index) {
            Ok(()) => return,
            Err(_) => {
                // Completion ring momentarily full; the egress loop services it
                assert!(Instant::now() < deadline, "complete timed out");
                thread::yield_now();
            }
        }
    }
}

fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = Instant::now() + DEADLINE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::yield_now();
    }
}

//
// Scenario: 8 frames of 100 bytes through an 8-slot pool with ring capacity
// 4. Every frame must come out on the egress device, in order, each in a
// distinct slot, and every slot must be reclaimed once acknowledged.
//
#[test]
fn relays_and_recycles_every_slot() {
    let (ingress, egress, handle) = setup(config(8, 4, 2, 4));

    let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 100]).collect();

    // Inject all 8 before acknowledging anything, so no slot can be reused
    // and every frame must land in a distinct slot.
    let deadline = Instant::now() + DEADLINE;
    let mut collected = Vec::new();
    let mut injected = 0;
    while collected.len() < 8 {
        assert!(Instant::now() < deadline, "relay timed out");

        if injected < 8 {
            if ingress.inject(&payloads[injected]).is_ok() {
                injected += 1;
            }
        }

        for (desc, bytes) in egress.transmitted(4).unwrap() {
            collected.push((desc, bytes));
        }
    }

    // FIFO end to end, payloads intact
    for (i, (desc, bytes)) in collected.iter().enumerate() {
        assert_eq!(desc.len, 100);
        assert_eq!(bytes.len(), 100);
        assert!(bytes.iter().all(|&b| b == i as u8), "payload {} corrupted", i);
    }

    // Eight distinct slots
    let slots: HashSet<u32> = collected.iter().map(|(d, _)| d.index).collect();
    assert_eq!(slots.len(), 8);

    // Acknowledge everything. The completion ring only holds 4 entries, so
    // the tail of the acks lands while the engine is draining on stop.
    let acker = {
        let descs: Vec<u32> = collected.iter().map(|(d, _)| d.index).collect();
        thread::spawn(move || {
            let deadline = Instant::now() + DEADLINE;
            for index in descs {
                complete_with_retry(&egress, index, deadline);
            }
        })
    };

    thread::sleep(Duration::from_millis(20));
    let stats = handle.stop().unwrap();
    acker.join().unwrap();

    assert_eq!(stats.received, 8);
    assert_eq!(stats.forwarded, 8);
    assert_eq!(stats.completed, 8, "not all slots returned to free");
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.queue_depth, 0);
}

//
// Scenario: backpressure. With queue depth 1, batch 1 and ring capacity 2,
// the pipeline stalls after exactly 4 accepted descriptors (2 on the tx
// ring, 1 pending in the egress loop, 1 in the queue); the fifth is admitted
// only after the driver drains one transmission.
//
#[test]
fn backpressure_propagates_to_ingress() {
    let (ingress, egress, handle) = setup(config(8, 2, 1, 1));

    let deadline = Instant::now() + DEADLINE;
    for i in 0..5u8 {
        inject_with_retry(&ingress, &vec![i; 64], deadline);
    }

    assert_eq!(handle.state(), EngineState::Running);
    wait_for(|| handle.counters().received == 4, "pipeline to fill");

    // The fifth descriptor must stay stuck behind the full queue
    thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.counters().received, 4);

    // Draining one transmission unblocks the chain: tx frees, the pending
    // descriptor moves, the queued one is popped, the blocked push completes.
    let mut collected = Vec::new();
    let sent = egress.transmitted(1).unwrap();
    assert_eq!(sent.len(), 1);
    complete_with_retry(&egress, sent[0].0.index, deadline);
    collected.extend(sent);

    wait_for(|| handle.counters().received == 5, "fifth descriptor admitted");

    while collected.len() < 5 {
        assert!(Instant::now() < deadline, "drain timed out");
        for entry in egress.transmitted(4).unwrap() {
            complete_with_retry(&egress, entry.0.index, deadline);
            collected.push(entry);
        }
    }

    let stats = handle.stop().unwrap();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.forwarded, 5);
    assert_eq!(stats.dropped, 0);

    for (i, (_, bytes)) in collected.iter().enumerate() {
        assert!(bytes.iter().all(|&b| b == i as u8), "payload {} out of order", i);
    }
}

//
// Scenario: drain before terminate. stop() is issued while descriptors are
// still working their way to the transmit ring; every one of them must be
// observed on the egress device before the engine reports Stopped.
//
#[test]
fn drains_queued_descriptors_before_stopping() {
    let (ingress, egress, handle) = setup(config(8, 4, 4, 8));

    let deadline = Instant::now() + DEADLINE;
    for i in 0..7u8 {
        inject_with_retry(&ingress, &vec![i; 64], deadline);
    }

    // All 7 accepted; the tx ring holds 4, the rest sit behind it
    wait_for(|| handle.counters().received == 7, "descriptors accepted");

    let stopped = Arc::new(AtomicBool::new(false));
    let stopper = {
        let stopped = stopped.clone();
        thread::spawn(move || {
            let stats = handle.stop().unwrap();
            stopped.store(true, Ordering::SeqCst);
            stats
        })
    };

    // stop() must not return while undelivered descriptors remain
    thread::sleep(Duration::from_millis(100));
    assert!(!stopped.load(Ordering::SeqCst), "engine stopped with frames undelivered");

    let mut collected = Vec::new();
    while collected.len() < 7 {
        assert!(Instant::now() < deadline, "drain timed out");
        for entry in egress.transmitted(4).unwrap() {
            complete_with_retry(&egress, entry.0.index, deadline);
            collected.push(entry);
        }
    }

    let stats: CountersSnapshot = stopper.join().unwrap();
    assert!(stopped.load(Ordering::SeqCst));
    assert_eq!(stats.received, 7);
    assert_eq!(stats.forwarded, 7, "not every queued descriptor was transmitted");
    assert_eq!(stats.dropped, 0);

    for (i, (_, bytes)) in collected.iter().enumerate() {
        assert!(bytes.iter().all(|&b| b == i as u8), "payload {} out of order", i);
    }
}

//
// Scenario: invalid configuration is rejected before any boundary resource
// is touched.
//
#[test]
fn invalid_config_touches_no_boundary_resource() {
    let boundary = SimBoundary::with_interfaces(&["sim0", "sim1"]);
    let ingress = boundary.device("sim0").unwrap();
    let egress = boundary.device("sim1").unwrap();

    let cfg = config(1, 4, 2, 4); // slot_count < 2 * ring_capacity

    match start(boundary, cfg) {
        Err(Error::ConfigurationInvalid(_)) => {}
        Err(other) => panic!("expected ConfigurationInvalid, got {}", other),
        Ok(_) => panic!("expected ConfigurationInvalid, engine started"),
    }

    assert!(!ingress.is_torn_down());
    assert!(!egress.is_torn_down());
    assert_eq!(ingress.fill_level(), 0);
    assert!(ingress.inject(&[0u8; 64]).is_err(), "rings were created");
}

//
// Scenario: a driver side that acknowledges a slot it was never handed. The
// engine must keep relaying and shut down cleanly instead of crashing the
// egress loop.
//
#[test]
fn tolerates_spurious_completions() {
    let (ingress, egress, handle) = setup(config(8, 4, 2, 4));

    // Acknowledge a slot before anything was transmitted.
    egress.complete(3).unwrap();

    let deadline = Instant::now() + DEADLINE;
    inject_with_retry(&ingress, &[7u8; 64], deadline);

    let mut collected = Vec::new();
    while collected.is_empty() {
        assert!(Instant::now() < deadline, "relay timed out");
        collected.extend(egress.transmitted(4).unwrap());
    }
    assert_eq!(collected[0].1, vec![7u8; 64]);
    complete_with_retry(&egress, collected[0].0.index, deadline);

    let stats = handle.stop().unwrap();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.forwarded, 1);
    assert_eq!(stats.dropped, 0);
}

//
// Soak: a thousand sequence-stamped frames through a 16-slot pool with
// immediate completion, verifying total order and payload integrity across
// many recycles of every slot.
//
#[test]
fn soak_relay_preserves_order_across_recycling() {
    const COUNT: u64 = 1000;

    let (ingress, egress, handle) = setup(config(16, 4, 4, 8));

    let deadline = Instant::now() + DEADLINE;
    let mut injected: u64 = 0;
    let mut next_expected: u64 = 0;

    while next_expected < COUNT {
        assert!(Instant::now() < deadline, "soak timed out");

        if injected < COUNT {
            let mut payload = [0u8; 64];
            payload[..8].copy_from_slice(&injected.to_ne_bytes());
            if ingress.inject(&payload).is_ok() {
                injected += 1;
            }
        }

        for (desc, bytes) in egress.transmitted(8).unwrap() {
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(&bytes[..8]);
            let seq = u64::from_ne_bytes(seq_bytes);

            assert_eq!(seq, next_expected, "frames reordered or corrupted");
            next_expected += 1;

            complete_with_retry(&egress, desc.index, deadline);
        }
    }

    let stats = handle.stop().unwrap();
    assert_eq!(stats.received, COUNT);
    assert_eq!(stats.forwarded, COUNT);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.queue_depth, 0);
}
