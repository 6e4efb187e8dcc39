use std::sync::Arc;

use errno::errno;
use libc::{
    c_int, c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_POPULATE, MAP_PRIVATE,
    PROT_READ, PROT_WRITE,
};
use tracing::warn;

use crate::error::Error;

/// A mapped memory arena divided into fixed-size frame slots. Packets live in
/// these slots for their whole time inside the engine; everything else passes
/// `(slot index, length)` pairs around.
///
/// The arena is unmapped exactly once, when the last `Arc` holder drops. The
/// engine, both loop threads and the boundary all hold the pool through an
/// `Arc`, so no ring can outlive the memory it indexes into.
#[derive(Debug)]
pub struct FramePool {
    ptr: *mut c_void,
    slot_count: usize,
    slot_size: usize,
}

unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

/// Configuration options for FramePool
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolOptions {
    /// If set to true, the mmap call is passed MAP_HUGETLB
    pub huge_tlb: bool,
}

/// A bounded view of a single slot's bytes.
///
/// Holding a view does not lock anything. Correctness rests on the
/// single-owner convention: a slot index lives in exactly one ring or queue
/// at a time, and only its current holder may create a view of it.
#[derive(Debug)]
pub struct FrameView<'a> {
    data: &'a mut [u8],
}

impl<'a> FrameView<'a> {
    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

impl FramePool {
    /// Map a zero-initialized arena of `slot_count * slot_size` bytes.
    pub fn allocate(
        slot_count: usize,
        slot_size: usize,
        options: PoolOptions,
    ) -> Result<Arc<FramePool>, Error> {
        let len = slot_count * slot_size;
        let mut flags: c_int = MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE;

        if options.huge_tlb {
            flags |= MAP_HUGETLB;
        }

        let ptr: *mut c_void;
        unsafe {
            ptr = mmap(std::ptr::null_mut(), len, PROT_READ | PROT_WRITE, flags, -1, 0);
        }

        if ptr == MAP_FAILED {
            return Err(Error::ResourceExhausted(format!(
                "mmap of {} bytes failed: errno {}",
                len,
                errno().0
            )));
        }

        Ok(Arc::new(FramePool {
            ptr,
            slot_count,
            slot_size,
        }))
    }

    /// View of the slot at `index`: bytes `[index * slot_size, (index + 1) * slot_size)`.
    pub fn slot(&self, index: usize) -> Result<FrameView<'_>, Error> {
        if index >= self.slot_count {
            return Err(Error::InvalidIndex {
                index,
                count: self.slot_count,
            });
        }

        let data = unsafe {
            let ptr = self.ptr.add(index * self.slot_size);
            std::slice::from_raw_parts_mut(ptr as *mut u8, self.slot_size)
        };

        Ok(FrameView { data })
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let r: c_int;

        unsafe {
            r = munmap(self.ptr, self.slot_count * self.slot_size);
        }

        if r != 0 {
            warn!(errno = errno().0, "munmap of frame pool failed");
        }
    }
}
