/// Descriptor for one frame in the arena. Carries no payload, only the slot
/// index and the byte range within the slot that holds packet data.
///
/// Created by the ingress loop when an rx descriptor is observed, consumed by
/// the egress loop when queued for transmission. The slot it references is
/// owned by whoever currently holds the descriptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    pub index: u32,
    pub offset: u32,
    pub len: u32,
}

impl FrameDesc {
    pub fn new(index: u32, offset: u32, len: u32) -> Self {
        FrameDesc { index, offset, len }
    }
}
