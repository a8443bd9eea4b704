//! # Bounce Buffer Pool
//!
//! Per-rail pre-registered receive slots large enough for the largest
//! control or eager message (spec.md §4.3). The backing region is one
//! page-aligned anonymous mapping, registered with the fabric once; slots
//! are addressed by index into that region rather than by raw pointer, so
//! the rest of the crate can hand them around as plain `usize`s the same
//! way [`crate::freelist::FreeList`] hands out indices.
//!
//! `min`/`max` bound the per-rail posted count; whenever it drops below
//! `min` the pool eagerly reposts up to `max` (spec.md §4.3, "decrement of
//! the posted counter always triggers a refill check").

use std::num::NonZeroUsize;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::TransportError;
use crate::fabric::{EndpointHandle, FabricError, FabricProvider, MemType, MrHandle};

fn page_size() -> usize {
    // SAFETY: `sysconf` with a valid name is always safe to call; failure
    // is signalled by a negative return, guarded against below.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

struct BounceRegion {
    ptr: std::ptr::NonNull<std::ffi::c_void>,
    len: usize,
}

// SAFETY: the region is exclusively owned by the `BouncePool` that holds
// it; access is always mediated through slot indices handed out under that
// owner's control.
unsafe impl Send for BounceRegion {}
unsafe impl Sync for BounceRegion {}

impl BounceRegion {
    fn new(min_len: usize) -> Result<Self, TransportError> {
        let page = page_size();
        let len = min_len.max(page).div_ceil(page) * page;
        let len_nz = NonZeroUsize::new(len).expect("bounce region length is never zero");
        // SAFETY: anonymous, private mapping with no file backing; the
        // returned pointer is tracked by this struct and unmapped in
        // `Drop`.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| TransportError::System(format!("mmap bounce region failed: {e}")))?;
        Ok(Self { ptr, len })
    }

    fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl Drop for BounceRegion {
    fn drop(&mut self) {
        // SAFETY: `self.ptr`/`self.len` are exactly the mapping returned
        // by `mmap_anonymous` in `new`, unmapped exactly once.
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

/// A pre-registered pool of fixed-size receive slots on one rail.
pub struct BouncePool {
    region: BounceRegion,
    slot_size: usize,
    mr: MrHandle,
    free: Vec<usize>,
    min: u32,
    max: u32,
    posted: u32,
}

impl BouncePool {
    /// Allocate `max` slots of `slot_size` bytes, register them with the
    /// fabric, and eagerly post receives up to `max`.
    pub fn new(
        fabric: &dyn FabricProvider,
        ep: EndpointHandle,
        slot_size: usize,
        min: u32,
        max: u32,
        ctx_for: impl Fn(usize) -> u64,
    ) -> Result<Self, TransportError> {
        let region = BounceRegion::new(slot_size * max as usize)?;
        let mr = fabric.reg_mr(ep, region.addr(), region.len, MemType::Host)?;
        let free = (0..max as usize).rev().collect();
        let mut pool = Self {
            region,
            slot_size,
            mr,
            free,
            min,
            max,
            posted: 0,
        };
        pool.replenish(fabric, ep, ctx_for)?;
        Ok(pool)
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn mr(&self) -> MrHandle {
        self.mr
    }

    pub fn posted(&self) -> u32 {
        self.posted
    }

    /// Address of slot `idx` within the registered region.
    pub fn slot_addr(&self, idx: usize) -> usize {
        self.region.addr() + idx * self.slot_size
    }

    /// Copy `len` bytes out of slot `idx`. `len` must be `<= slot_size`,
    /// as guaranteed by every caller posting a recv of at most
    /// `slot_size` bytes on this pool.
    pub fn read_slot(&self, idx: usize, len: usize) -> Vec<u8> {
        let addr = self.slot_addr(idx);
        // SAFETY: `addr` is within the pool's live mapping and `len` is
        // bounded by `slot_size`, the size every recv on this pool is
        // posted with.
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
    }

    /// Eagerly repost free slots up to `max` whenever `posted < min`.
    /// `ctx_for(idx)` produces the completion context to associate with
    /// the recv posted on slot `idx` (normally the request-pool index of
    /// a BOUNCE request wrapping that slot).
    pub fn replenish(
        &mut self,
        fabric: &dyn FabricProvider,
        ep: EndpointHandle,
        ctx_for: impl Fn(usize) -> u64,
    ) -> Result<(), TransportError> {
        if self.posted >= self.min {
            return Ok(());
        }
        while self.posted < self.max {
            let Some(idx) = self.free.pop() else { break };
            match fabric.recv(ep, self.slot_addr(idx), self.slot_size, self.mr, ctx_for(idx)) {
                Ok(()) => self.posted += 1,
                Err(FabricError::Again) => {
                    self.free.push(idx);
                    break;
                }
                Err(FabricError::Fatal(e)) => return Err(e),
            }
        }
        Ok(())
    }

    /// Report that the recv on `idx` completed. `repost = true` reposts
    /// the same slot immediately (control/connect messages); `repost =
    /// false` releases it back to the free list (its payload has been
    /// handed off, e.g. to an eager copy) and lets the next
    /// [`BouncePool::replenish`] pick it up. Either way the posted
    /// counter is decremented first, which always triggers a refill
    /// check (spec.md §4.3).
    pub fn on_consumed(
        &mut self,
        idx: usize,
        repost: bool,
        fabric: &dyn FabricProvider,
        ep: EndpointHandle,
        ctx_for: impl Fn(usize) -> u64,
    ) -> Result<(), TransportError> {
        self.posted -= 1;
        if repost {
            match fabric.recv(ep, self.slot_addr(idx), self.slot_size, self.mr, ctx_for(idx)) {
                Ok(()) => {
                    self.posted += 1;
                    return Ok(());
                }
                Err(FabricError::Again) => self.free.push(idx),
                Err(FabricError::Fatal(e)) => return Err(e),
            }
        } else {
            self.free.push(idx);
        }
        self.replenish(fabric, ep, ctx_for)
    }
}

/// The single pre-registered host page a receive communicator reads
/// from when confirming a GPU-memory write landed (spec.md §4.8, option
/// (b)). One page is always enough: the flush read is 4 bytes, never
/// more.
pub struct FlushBuffer {
    region: BounceRegion,
    mr: MrHandle,
}

impl FlushBuffer {
    pub fn new(fabric: &dyn FabricProvider, ep: EndpointHandle) -> Result<Self, TransportError> {
        let region = BounceRegion::new(page_size())?;
        let mr = fabric.reg_mr(ep, region.addr(), region.len, MemType::Host)?;
        Ok(Self { region, mr })
    }

    pub fn addr(&self) -> usize {
        self.region.addr()
    }

    pub fn mr(&self) -> MrHandle {
        self.mr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::loopback::LoopbackFabric;

    #[test]
    fn new_pool_posts_up_to_max() {
        let fabric = LoopbackFabric::new(u32::MAX);
        let ep = fabric.open_endpoint().unwrap();
        let pool = BouncePool::new(&fabric, ep, 256, 2, 4, |idx| idx as u64).unwrap();
        assert_eq!(pool.posted(), 4);
    }

    #[test]
    fn consumption_with_repost_keeps_posted_count_stable() {
        let fabric = LoopbackFabric::new(u32::MAX);
        let ep = fabric.open_endpoint().unwrap();
        let mut pool = BouncePool::new(&fabric, ep, 64, 2, 4, |idx| idx as u64).unwrap();
        pool.on_consumed(0, true, &fabric, ep, |idx| idx as u64).unwrap();
        assert_eq!(pool.posted(), 4);
    }

    #[test]
    fn consumption_without_repost_drops_then_refills_below_min() {
        let fabric = LoopbackFabric::new(u32::MAX);
        let ep = fabric.open_endpoint().unwrap();
        let mut pool = BouncePool::new(&fabric, ep, 64, 3, 4, |idx| idx as u64).unwrap();
        pool.on_consumed(0, false, &fabric, ep, |idx| idx as u64).unwrap();
        // posted dropped to 3, which is not below min (3), so no refill yet.
        assert_eq!(pool.posted(), 3);
        pool.on_consumed(1, false, &fabric, ep, |idx| idx as u64).unwrap();
        // posted dropped to 2, below min (3): refills back up to max (4).
        assert_eq!(pool.posted(), 4);
    }

    #[test]
    fn slot_addresses_are_distinct_and_page_aligned_region() {
        let fabric = LoopbackFabric::new(u32::MAX);
        let ep = fabric.open_endpoint().unwrap();
        let pool = BouncePool::new(&fabric, ep, 128, 1, 2, |idx| idx as u64).unwrap();
        assert_ne!(pool.slot_addr(0), pool.slot_addr(1));
        assert_eq!(pool.region.addr() % page_size(), 0);
    }

    #[test]
    fn flush_buffer_is_page_aligned_and_registered() {
        let fabric = LoopbackFabric::new(u32::MAX);
        let ep = fabric.open_endpoint().unwrap();
        let flush = FlushBuffer::new(&fabric, ep).unwrap();
        assert_eq!(flush.addr() % page_size(), 0);
        assert_ne!(flush.mr(), MrHandle(0));
    }
}
