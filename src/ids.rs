//! # Fixed-Capacity Id Pool
//!
//! spec.md lists the id pool as infrastructure "provided by collaborators"
//! — in a standalone crate there is no such collaborator, so this module
//! implements the minimal version the rest of the crate needs: a
//! fixed-capacity allocator handing out small integer ids (communicator
//! ids, memory-registration keys) and taking them back. It never grows
//! past its configured capacity; exhaustion is a [`TransportError::ResourceExhausted`],
//! matching spec.md §7's "resource exhaustion" error kind.

use crate::error::TransportError;

/// A free-list-backed pool of `u32` ids in `0..capacity`.
#[derive(Debug)]
pub struct IdPool {
    capacity: u32,
    free: Vec<u32>,
}

impl IdPool {
    /// Create a pool that can hand out ids `0..capacity`.
    pub fn new(capacity: u32) -> Self {
        // Hand out low ids first by keeping the free list in descending
        // order and popping from the end.
        let free = (0..capacity).rev().collect();
        Self { capacity, free }
    }

    /// Total id space, used by callers to validate externally supplied ids
    /// (e.g. an 18-bit communicator id space).
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of ids currently available.
    pub fn available(&self) -> u32 {
        self.free.len() as u32
    }

    /// Allocate the next free id.
    pub fn alloc(&mut self) -> Result<u32, TransportError> {
        self.free
            .pop()
            .ok_or_else(|| TransportError::ResourceExhausted("id pool exhausted".into()))
    }

    /// Return an id to the pool. Double-frees are a programming error and
    /// are rejected rather than silently corrupting the free list.
    pub fn free(&mut self, id: u32) -> Result<(), TransportError> {
        if id >= self.capacity {
            return Err(TransportError::InvalidArgument(format!(
                "id {id} out of range for pool of capacity {}",
                self.capacity
            )));
        }
        if self.free.contains(&id) {
            return Err(TransportError::InvalidArgument(format!(
                "id {id} freed twice"
            )));
        }
        self.free.push(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_capacity_then_exhausts() {
        let mut pool = IdPool::new(2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            pool.alloc(),
            Err(TransportError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn freed_ids_are_reusable() {
        let mut pool = IdPool::new(1);
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_double_free() {
        let mut pool = IdPool::new(2);
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        assert!(pool.free(a).is_err());
    }

    #[test]
    fn rejects_out_of_range_free() {
        let mut pool = IdPool::new(2);
        assert!(pool.free(5).is_err());
    }
}
