//
// Runs the loopback engine against the in-memory boundary: a driver thread
// injects synthetic frames on sim0 and harvests/acknowledges them on sim1,
// while the engine relays between the two. Useful for eyeballing throughput
// of the ring/queue path without any NIC.
//
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use pktloop::engine::{start, EngineConfig};
use pktloop::sim::SimBoundary;

#[derive(StructOpt, Debug)]
#[structopt(name = "loopback-sim")]
struct Opt {
    #[structopt(long, default_value = "4096")]
    slot_count: usize,

    #[structopt(long, default_value = "2048")]
    slot_size: usize,

    #[structopt(long, default_value = "1024")]
    ring_size: usize,

    #[structopt(long, default_value = "64")]
    batch_size: usize,

    #[structopt(long, default_value = "1024")]
    queue_depth: usize,

    #[structopt(long, default_value = "1000000")]
    packets: u64,

    #[structopt(long)]
    huge_tlb: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })
        .expect("failed to set ctrl-c handler");
    }

    let boundary = SimBoundary::with_interfaces(&["sim0", "sim1"]);
    let ingress_dev = boundary.device("sim0").unwrap();
    let egress_dev = boundary.device("sim1").unwrap();

    let config = EngineConfig {
        ingress: "sim0".to_string(),
        egress: "sim1".to_string(),
        slot_count: opt.slot_count,
        slot_size: opt.slot_size,
        ring_capacity: opt.ring_size,
        batch_size: opt.batch_size,
        queue_depth: opt.queue_depth,
        huge_tlb: opt.huge_tlb,
    };

    let handle = match start(boundary, config) {
        Ok(handle) => handle,
        Err(err) => {
            println!("failed to start engine: {}", err);
            return;
        }
    };

    let started = Instant::now();

    //
    // Driver pump: inject on the ingress device, harvest and acknowledge on
    // the egress device.
    //
    let packets = opt.packets;
    let slot_size = opt.slot_size;
    let batch = opt.batch_size;
    let pump_interrupted = interrupted.clone();
    let pump = thread::spawn(move || {
        let mut payload = vec![0u8; slot_size];
        let mut injected: u64 = 0;
        let mut harvested: u64 = 0;

        while harvested < packets && !pump_interrupted.load(Ordering::SeqCst) {
            if injected < packets {
                let len = 60 + (injected as usize % 190).min(slot_size - 60);
                payload[..8].copy_from_slice(&injected.to_ne_bytes());

                if ingress_dev.inject(&payload[..len]).is_ok() {
                    injected += 1;
                }
            }

            match egress_dev.transmitted(batch) {
                Ok(sent) => {
                    for (desc, _payload) in &sent {
                        egress_dev.complete(desc.index).ok();
                        harvested += 1;
                    }
                    if sent.is_empty() {
                        hint::spin_loop();
                    }
                }
                Err(err) => {
                    println!("harvest error: {}", err);
                    break;
                }
            }
        }

        (injected, harvested)
    });

    let (injected, harvested) = pump.join().expect("pump thread panicked");
    let elapsed = started.elapsed();

    let stats = match handle.stop() {
        Ok(stats) => stats,
        Err(err) => {
            println!("stop failed: {}", err);
            return;
        }
    };

    println!("injected:  {}", injected);
    println!("harvested: {}", harvested);
    println!("received:  {}", stats.received);
    println!("forwarded: {}", stats.forwarded);
    println!("completed: {}", stats.completed);
    println!("dropped:   {}", stats.dropped);
    println!(
        "rate: {:.0} pkts/sec",
        harvested as f64 / elapsed.as_secs_f64()
    );
}
