//
// In-memory driver boundary. Stands in for the kernel/NIC side of the ring
// protocol: tests and the demo binary use it to inject frames on an ingress
// interface and to harvest and acknowledge transmissions on an egress
// interface, all against the same shared frame pool the engine uses.
//
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::boundary::{Boundary, RingSet};
use crate::desc::FrameDesc;
use crate::error::Error;
use crate::frame_pool::FramePool;
use crate::ring::{ring, RingConsumer, RingProducer};

/// Driver-side state of one simulated interface, created by `create_rings`.
struct DeviceState {
    pool: Arc<FramePool>,
    fill: RingConsumer<u32>,
    completion: RingProducer<u32>,
    rx: RingProducer<FrameDesc>,
    tx: RingConsumer<FrameDesc>,
}

/// One simulated interface. The engine talks to it through the ring set; the
/// test or demo driver talks to it through `inject`, `transmitted` and
/// `complete`.
pub struct SimDevice {
    name: String,
    state: Mutex<Option<DeviceState>>,
    torn_down: AtomicBool,
}

impl SimDevice {
    fn new(name: &str) -> Self {
        SimDevice {
            name: name.to_string(),
            state: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver one frame on this interface: takes a free slot from the fill
    /// ring, copies the payload into the arena and publishes an rx
    /// descriptor. Fails when the interface has no rings yet, the fill ring
    /// is empty (no free frame) or the payload exceeds the slot size.
    pub fn inject(&self, payload: &[u8]) -> Result<u32, Error> {
        let mut guard = self.state.lock().unwrap();
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::Boundary(format!("{}: no rings bound", self.name)))?;

        if payload.len() > state.pool.slot_size() {
            return Err(Error::Boundary(format!(
                "{}: payload of {} bytes exceeds slot size {}",
                self.name,
                payload.len(),
                state.pool.slot_size()
            )));
        }

        // Claim rx capacity before taking the slot off the fill ring, so a
        // full rx ring never strands a free slot.
        if state.rx.reserve(1) == 0 {
            return Err(Error::Boundary(format!("{}: rx ring full", self.name)));
        }

        let mut slot_idx = [0u32; 1];
        if state.fill.peek(&mut slot_idx) == 0 {
            return Err(Error::Boundary(format!("{}: fill ring empty", self.name)));
        }
        let index = slot_idx[0];

        let mut view = state.pool.slot(index as usize)?;
        view.data_mut()[..payload.len()].copy_from_slice(payload);

        state.fill.release(1);
        state.rx.write(0, FrameDesc::new(index, 0, payload.len() as u32));
        state.rx.submit(1);

        debug!(device = %self.name, index, len = payload.len(), "injected frame");

        Ok(index)
    }

    /// Drain up to `max` descriptors from the tx ring, copying each payload
    /// off the "wire". The slots stay in-flight until `complete` is called
    /// for them.
    pub fn transmitted(&self, max: usize) -> Result<Vec<(FrameDesc, Vec<u8>)>, Error> {
        let mut guard = self.state.lock().unwrap();
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::Boundary(format!("{}: no rings bound", self.name)))?;

        let mut descs = vec![FrameDesc::default(); max];
        let n = state.tx.peek(&mut descs);

        let mut out = Vec::with_capacity(n);
        for desc in &descs[..n] {
            let view = state.pool.slot(desc.index as usize)?;
            let start = desc.offset as usize;
            let end = start + desc.len as usize;
            out.push((*desc, view.data()[start..end].to_vec()));
        }

        if n > 0 {
            state.tx.release(n);
            debug!(device = %self.name, count = n, "harvested transmissions");
        }

        Ok(out)
    }

    /// Acknowledge one transmitted slot on the completion ring, returning it
    /// to the engine as free.
    pub fn complete(&self, index: u32) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::Boundary(format!("{}: no rings bound", self.name)))?;

        if state.completion.reserve(1) == 0 {
            return Err(Error::Boundary(format!(
                "{}: completion ring full",
                self.name
            )));
        }
        state.completion.write(0, index);
        state.completion.submit(1);

        Ok(())
    }

    /// Number of free slots currently offered on the fill ring.
    pub fn fill_level(&self) -> usize {
        match self.state.lock().unwrap().as_ref() {
            Some(state) => state.fill.len(),
            None => 0,
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

/// Registry of simulated interfaces.
pub struct SimBoundary {
    devices: HashMap<String, Arc<SimDevice>>,
}

impl SimBoundary {
    pub fn with_interfaces(names: &[&str]) -> Self {
        let devices = names
            .iter()
            .map(|&n| (n.to_string(), Arc::new(SimDevice::new(n))))
            .collect();

        SimBoundary { devices }
    }

    /// Driver-side handle for one interface, for injecting and harvesting
    /// frames. Available before and after the engine runs.
    pub fn device(&self, name: &str) -> Option<Arc<SimDevice>> {
        self.devices.get(name).cloned()
    }
}

impl Boundary for SimBoundary {
    type Interface = Arc<SimDevice>;

    fn bind_interface(&self, name: &str) -> Result<Arc<SimDevice>, Error> {
        self.devices
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))
    }

    fn create_rings(
        &self,
        interface: &Arc<SimDevice>,
        pool: &Arc<FramePool>,
        ring_capacity: usize,
    ) -> Result<RingSet, Error> {
        let (fill_prod, fill_cons) = ring::<u32>(ring_capacity);
        let (comp_prod, comp_cons) = ring::<u32>(ring_capacity);
        let (rx_prod, rx_cons) = ring::<FrameDesc>(ring_capacity);
        let (tx_prod, tx_cons) = ring::<FrameDesc>(ring_capacity);

        let mut state = interface.state.lock().unwrap();
        *state = Some(DeviceState {
            pool: pool.clone(),
            fill: fill_cons,
            completion: comp_prod,
            rx: rx_prod,
            tx: tx_cons,
        });

        debug!(device = %interface.name, ring_capacity, "created rings");

        Ok(RingSet {
            fill: fill_prod,
            completion: comp_cons,
            rx: rx_cons,
            tx: tx_prod,
        })
    }

    fn teardown(&self, interface: &Arc<SimDevice>) -> Result<(), Error> {
        if !interface.torn_down.swap(true, Ordering::SeqCst) {
            interface.state.lock().unwrap().take();
            debug!(device = %interface.name, "tore down interface");
        }

        Ok(())
    }
}
