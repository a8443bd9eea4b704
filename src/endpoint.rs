//! # Endpoint & Device
//!
//! [`Device`] is a logical NIC-group: an ordered list of rails opened
//! against one [`FabricProvider`], a scheduler factory, and a lazily
//! created, per-thread [`Endpoint`] (spec.md §3: "per-thread aggregation
//! of N rails ... created lazily on first use; destroyed when refcount
//! reaches zero"). Every interior field uses `parking_lot::Mutex` rather
//! than `RefCell`, the same choice spec.md §5 calls for across the crate
//! — it is what lets a `Device` be shared as `Arc<Device>` across the
//! threads that each lazily realize their own endpoint from it, without
//! `unsafe impl Sync` anywhere in this module.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bounce::BouncePool;
use crate::config::RdmaConfig;
use crate::error::TransportError;
use crate::fabric::{CqHandle, EndpointHandle, FabricProvider};
use crate::freelist::FreeList;
use crate::ids::IdPool;
use crate::pending::PendingQueue;
use crate::request::Request;
use crate::scheduler::Scheduler;

/// One NIC. Owns the fabric endpoint/CQ pair and this rail's bounce pool,
/// shared by every communicator that uses this endpoint (spec.md §3: the
/// bounce-payload freelist belongs to the endpoint, not to any one
/// communicator).
pub struct Rail {
    pub fabric_ep: EndpointHandle,
    pub cq: CqHandle,
    pub bounce: Mutex<BouncePool>,
}

/// Per-thread aggregation of this device's rails. Holds everything
/// spec.md §3 lists against "Endpoint": the communicator lookup array
/// (here, a sparse `FreeList` indexed by 18-bit local id), the id pool
/// issuing those ids, the shared request pool, the pending-request queue,
/// and a reference count.
pub struct Endpoint {
    pub rails: Vec<Rail>,
    pub comm_ids: Mutex<IdPool>,
    pub comms: Mutex<HashMap<u32, crate::comm::Communicator>>,
    /// In-progress `connect()` attempts, keyed by the target listen
    /// communicator id named in the connect handle. Moved into `comms`
    /// under a freshly allocated local id once the handshake reaches
    /// `Stage::Connected`.
    pub connects: Mutex<HashMap<u32, crate::comm::SendComm>>,
    /// In-progress `accept()` attempts, keyed by the listen communicator
    /// id they arrived on.
    pub accepts: Mutex<HashMap<u32, crate::comm::ReceiveComm>>,
    pub requests: Mutex<FreeList<Request>>,
    /// Small fixed-layout message payloads (CONN/CONN_RESP/CTRL) keyed by
    /// the request-pool index that owns the in-flight send or recv, so the
    /// buffer stays alive for as long as the fabric post referencing it
    /// does. Freed when the owning request is freed.
    pub scratch: Mutex<HashMap<usize, Vec<u8>>>,
    /// `RECV_SEGMS` request-pool index by `(comm_id, seq)`, used by the
    /// progress engine to locate the target of a `RemoteWrite` completion
    /// from its immediate data alone (spec.md §4.4).
    pub recv_index: Mutex<HashMap<(u32, u16), usize>>,
    /// CTRL messages that have arrived on rail 0's bounce pool before the
    /// matching `send()` was posted, keyed by `(comm_id, seq)` (spec.md
    /// §4.2's "buffer" element kind, realized directly since CTRL is the
    /// only steady-state message the bounce pool carries in this build).
    pub ctrl_store: Mutex<HashMap<(u32, u16), crate::wire::CtrlMessage>>,
    /// EAGER payloads that have arrived before the matching `irecv()` was
    /// posted, keyed by `(comm_id, seq)`.
    pub eager_store: Mutex<HashMap<(u32, u16), Vec<u8>>>,
    pub pending: Mutex<PendingQueue>,
    pub scheduler: Mutex<Scheduler>,
    /// Fixed once, at creation, from the fabric's GPUDirect RDMA probe
    /// (spec.md §3/§8: `support_gdr` is `UNKNOWN` until the first
    /// endpoint is realized, then stays `SUPPORTED`/`UNSUPPORTED` for
    /// the endpoint's lifetime — the `UNKNOWN` state itself never needs
    /// representing since nothing observes it before this field exists).
    pub support_gdr: bool,
    refcount: Mutex<u32>,
}

impl Endpoint {
    pub fn num_rails(&self) -> u32 {
        self.rails.len() as u32
    }

    pub fn incref(&self) {
        *self.refcount.lock() += 1;
    }

    pub fn decref(&self) -> u32 {
        let mut n = self.refcount.lock();
        *n = n.saturating_sub(1);
        *n
    }

    pub fn refcount(&self) -> u32 {
        *self.refcount.lock()
    }
}

/// A logical NIC-group backed by one fabric provider, lazily realizing one
/// [`Endpoint`] per thread that touches it.
pub struct Device {
    pub fabric: Arc<dyn FabricProvider>,
    pub config: RdmaConfig,
    num_rails: u32,
    bounce_slot_size: usize,
    endpoints: Mutex<HashMap<std::thread::ThreadId, Arc<Endpoint>>>,
}

impl Device {
    pub fn new(fabric: Arc<dyn FabricProvider>, num_rails: u32, config: RdmaConfig) -> Self {
        let bounce_slot_size = config
            .eager_max_size
            .max(crate::wire::ConnMessage::WIRE_SIZE)
            .max(crate::wire::CtrlMessage::WIRE_SIZE);
        Self {
            fabric,
            config,
            num_rails,
            bounce_slot_size,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Return this thread's endpoint, creating it on first access and
    /// incrementing its refcount. Callers release via
    /// [`Device::release_endpoint`] when the owning communicator closes.
    pub fn acquire_endpoint(&self) -> Result<Arc<Endpoint>, TransportError> {
        let tid = std::thread::current().id();
        let mut endpoints = self.endpoints.lock();
        if let Some(ep) = endpoints.get(&tid) {
            ep.incref();
            return Ok(Arc::clone(ep));
        }

        let (min, max) = self.config.per_rail_bounce_bounds(self.num_rails);
        let mut rails = Vec::with_capacity(self.num_rails as usize);
        for _ in 0..self.num_rails {
            let fabric_ep = self.fabric.open_endpoint()?;
            let cq = self.fabric.cq_of(fabric_ep)?;
            let bounce = BouncePool::new(
                self.fabric.as_ref(),
                fabric_ep,
                self.bounce_slot_size,
                min,
                max,
                |idx| idx as u64,
            )?;
            rails.push(Rail {
                fabric_ep,
                cq,
                bounce: Mutex::new(bounce),
            });
        }

        let endpoint = Arc::new(Endpoint {
            rails,
            comm_ids: Mutex::new(IdPool::new(1 << 18)),
            comms: Mutex::new(HashMap::new()),
            connects: Mutex::new(HashMap::new()),
            accepts: Mutex::new(HashMap::new()),
            requests: Mutex::new(FreeList::new(4096)),
            scratch: Mutex::new(HashMap::new()),
            recv_index: Mutex::new(HashMap::new()),
            ctrl_store: Mutex::new(HashMap::new()),
            eager_store: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingQueue::new()),
            scheduler: Mutex::new(Scheduler::new(self.num_rails, self.config.round_robin_threshold)),
            support_gdr: self.fabric.supports_gdr(),
            refcount: Mutex::new(0),
        });
        endpoint.incref();
        endpoints.insert(tid, Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Fetch this thread's already-created endpoint without touching its
    /// refcount. Used by calls that operate on an already-open
    /// communicator (`send`, `irecv`, `test`, repeated `connect`/`accept`
    /// polls) where [`Device::acquire_endpoint`]'s per-call increment
    /// would leak references that nothing would ever balance.
    pub fn endpoint(&self) -> Result<Arc<Endpoint>, TransportError> {
        let tid = std::thread::current().id();
        self.endpoints
            .lock()
            .get(&tid)
            .cloned()
            .ok_or_else(|| TransportError::InvalidArgument("no endpoint created on this thread yet".into()))
    }

    /// Drop this thread's reference to its endpoint, tearing it down once
    /// the refcount reaches zero (spec.md §5, endpoint lifecycle).
    pub fn release_endpoint(&self) {
        let tid = std::thread::current().id();
        let mut endpoints = self.endpoints.lock();
        if let Some(ep) = endpoints.get(&tid) {
            if ep.decref() == 0 {
                endpoints.remove(&tid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::loopback::LoopbackFabric;

    fn device() -> Device {
        Device::new(Arc::new(LoopbackFabric::new(u32::MAX)), 2, RdmaConfig::default())
    }

    #[test]
    fn first_acquire_creates_endpoint_with_refcount_one() {
        let dev = device();
        let ep = dev.acquire_endpoint().unwrap();
        assert_eq!(ep.refcount(), 1);
        assert_eq!(ep.num_rails(), 2);
    }

    #[test]
    fn repeated_acquire_on_same_thread_reuses_and_increfs() {
        let dev = device();
        let a = dev.acquire_endpoint().unwrap();
        let b = dev.acquire_endpoint().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn release_to_zero_tears_down_the_endpoint() {
        let dev = device();
        let ep = dev.acquire_endpoint().unwrap();
        dev.release_endpoint();
        drop(ep);
        assert!(dev.endpoints.lock().is_empty());
    }
}
