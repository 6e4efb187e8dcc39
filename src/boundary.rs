use std::sync::Arc;

use crate::desc::FrameDesc;
use crate::error::Error;
use crate::frame_pool::FramePool;
use crate::ring::{RingConsumer, RingProducer};

/// Application-side ends of the four rings bound to one interface. The
/// boundary keeps the driver-side ends.
///
/// Role split: fill and tx are produced by the application and consumed by
/// the driver; rx and completion flow the other way.
pub struct RingSet {
    /// Free slots offered to the receive path.
    pub fill: RingProducer<u32>,
    /// Transmitted slots coming back as free.
    pub completion: RingConsumer<u32>,
    /// Received frame descriptors.
    pub rx: RingConsumer<FrameDesc>,
    /// Frame descriptors queued for transmission.
    pub tx: RingProducer<FrameDesc>,
}

/// The driver boundary the engine runs against. Implementations own the
/// actual interface binding and I/O; the engine only ever sees ring ends.
///
/// `teardown` must be safe to call more than once for the same interface
/// within a run.
pub trait Boundary {
    type Interface;

    fn bind_interface(&self, name: &str) -> Result<Self::Interface, Error>;

    fn create_rings(
        &self,
        interface: &Self::Interface,
        pool: &Arc<FramePool>,
        ring_capacity: usize,
    ) -> Result<RingSet, Error>;

    fn teardown(&self, interface: &Self::Interface) -> Result<(), Error>;
}
