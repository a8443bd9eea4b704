//! # Loopback Fabric Provider
//!
//! An in-process software implementation of [`FabricProvider`]. Every
//! endpoint opened against the same `LoopbackFabric` lives in the same
//! address space, so one-sided `write_with_immediate`/`read` are
//! implemented as direct memory copies — exactly what real RDMA hardware
//! achieves across hosts, just without a network in between. Two-sided
//! `send`/`recv` match a posted receive against the oldest unmatched send
//! per destination endpoint, `ANY_SRC`-style.
//!
//! This is the fabric every test in this crate and the demo binary run
//! against; it is grounded on the teacher's own pattern of testing its
//! transport abstraction purely over loopback connections
//! (`tests/integration_tcp_round_trip.rs`, `ipc/shared_memory.rs`'s
//! in-process ring buffer).
//!
//! `write_with_immediate` can be made to return `EAGAIN` once a
//! configurable number of writes are in flight on an endpoint, letting
//! tests exercise the pending-request queue deterministically (spec.md §8
//! scenario 4) without needing a slow real network to actually back up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    AddressHandle, CompletionKind, CqEntry, CqError, CqHandle, EndpointHandle, FabricError,
    FabricProvider, FabricResult, MemType, MrHandle,
};
use crate::error::TransportError;
use crate::wire::{EndpointName, MAX_ENDPOINT_NAME};

struct PostedRecv {
    buf_addr: usize,
    buf_len: usize,
    ctx: u64,
}

struct PendingSend {
    data: Vec<u8>,
    imm: Option<u32>,
}

struct CqState {
    completions: VecDeque<CqEntry>,
    errors: VecDeque<CqError>,
}

struct EndpointState {
    cq: CqHandle,
    inflight_writes: AtomicU32,
    recvs: Mutex<VecDeque<PostedRecv>>,
    sends: Mutex<VecDeque<PendingSend>>,
}

/// Software reliable-datagram fabric shared by every endpoint opened
/// against it. Clone to hand the same fabric to multiple [`crate::comm`]
/// owners within one process (the usual case in tests: "two ranks" are
/// just two sets of endpoints opened on one shared `LoopbackFabric`).
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<LoopbackInner>,
}

struct LoopbackInner {
    endpoints: Mutex<Vec<Arc<EndpointState>>>,
    cqs: Mutex<Vec<Arc<Mutex<CqState>>>>,
    next_mr_key: AtomicU64,
    max_inflight_writes: u32,
    /// Defaults `false`: real GPUDirect probing has nothing to probe in
    /// an in-process software fabric. Tests flip it with
    /// [`LoopbackFabric::set_gdr_supported`] to exercise the flush path.
    gdr_supported: AtomicBool,
}

impl LoopbackFabric {
    /// `max_inflight_writes` bounds how many `write_with_immediate`
    /// calls an endpoint may have outstanding before further posts
    /// return `EAGAIN`. Use a small value (e.g. 4) in tests that need to
    /// exercise backpressure; `u32::MAX` effectively disables the cap.
    pub fn new(max_inflight_writes: u32) -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                endpoints: Mutex::new(Vec::new()),
                cqs: Mutex::new(Vec::new()),
                next_mr_key: AtomicU64::new(1),
                max_inflight_writes,
                gdr_supported: AtomicBool::new(false),
            }),
        }
    }

    fn endpoint(&self, ep: EndpointHandle) -> Result<Arc<EndpointState>, TransportError> {
        self.inner
            .endpoints
            .lock()
            .get(ep as usize)
            .cloned()
            .ok_or_else(|| TransportError::InvalidArgument(format!("unknown endpoint {ep}")))
    }

    fn cq(&self, cq: CqHandle) -> Result<Arc<Mutex<CqState>>, TransportError> {
        self.inner
            .cqs
            .lock()
            .get(cq as usize)
            .cloned()
            .ok_or_else(|| TransportError::InvalidArgument(format!("unknown cq {cq}")))
    }

    fn push_completion(&self, cq: CqHandle, entry: CqEntry) {
        if let Ok(cq) = self.cq(cq) {
            cq.lock().completions.push_back(entry);
        }
    }

    /// Deliver a (possibly immediate-bearing) send payload to `dest`,
    /// matching it against a posted recv if one is waiting, else queuing
    /// it for the next recv post.
    fn deliver_send(&self, dest: &Arc<EndpointState>, data: Vec<u8>, imm: Option<u32>) {
        let waiting = dest.recvs.lock().pop_front();
        match waiting {
            Some(recv) => {
                let n = data.len().min(recv.buf_len);
                // SAFETY: `recv.buf_addr` was supplied by the peer's own
                // `recv` post and must remain valid until that post
                // completes; we are the only writer and write no more
                // than the buffer's declared length.
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), recv.buf_addr as *mut u8, n);
                }
                self.push_completion(
                    dest.cq,
                    CqEntry {
                        ctx: recv.ctx,
                        kind: CompletionKind::Recv,
                        len: n,
                        immediate_data: imm,
                    },
                );
            }
            None => {
                dest.sends.lock().push_back(PendingSend { data, imm });
            }
        }
    }
}

impl FabricProvider for LoopbackFabric {
    fn open_endpoint(&self) -> Result<EndpointHandle, TransportError> {
        let mut endpoints = self.inner.endpoints.lock();
        let mut cqs = self.inner.cqs.lock();
        let cq_id = cqs.len() as CqHandle;
        cqs.push(Arc::new(Mutex::new(CqState {
            completions: VecDeque::new(),
            errors: VecDeque::new(),
        })));
        let ep_id = endpoints.len() as EndpointHandle;
        endpoints.push(Arc::new(EndpointState {
            cq: cq_id,
            inflight_writes: AtomicU32::new(0),
            recvs: Mutex::new(VecDeque::new()),
            sends: Mutex::new(VecDeque::new()),
        }));
        Ok(ep_id)
    }

    fn cq_of(&self, ep: EndpointHandle) -> Result<CqHandle, TransportError> {
        Ok(self.endpoint(ep)?.cq)
    }

    fn get_ep_name(&self, ep: EndpointHandle) -> Result<EndpointName, TransportError> {
        self.endpoint(ep)?;
        let mut name = [0u8; MAX_ENDPOINT_NAME];
        name[0..8].copy_from_slice(&ep.to_ne_bytes());
        Ok(name)
    }

    fn av_insert(&self, _ep: EndpointHandle, name: &EndpointName) -> Result<AddressHandle, TransportError> {
        let target = u64::from_ne_bytes(name[0..8].try_into().unwrap());
        self.endpoint(target)?;
        Ok(target)
    }

    fn reg_mr(&self, _ep: EndpointHandle, _addr: usize, _len: usize, _mem_type: MemType) -> Result<MrHandle, TransportError> {
        Ok(MrHandle(self.inner.next_mr_key.fetch_add(1, Ordering::Relaxed)))
    }

    fn dereg_mr(&self, _ep: EndpointHandle, _mr: MrHandle) -> Result<(), TransportError> {
        Ok(())
    }

    fn supports_gdr(&self) -> bool {
        self.inner.gdr_supported.load(Ordering::SeqCst)
    }

    fn send(&self, ep: EndpointHandle, buf_addr: usize, buf_len: usize, _mr: MrHandle, dest: AddressHandle, ctx: u64) -> FabricResult<()> {
        self.send_with_immediate_inner(ep, buf_addr, buf_len, None, dest, ctx)
    }

    fn send_with_immediate(&self, ep: EndpointHandle, buf_addr: usize, buf_len: usize, _mr: MrHandle, imm: u32, dest: AddressHandle, ctx: u64) -> FabricResult<()> {
        self.send_with_immediate_inner(ep, buf_addr, buf_len, Some(imm), dest, ctx)
    }

    fn recv(&self, ep: EndpointHandle, buf_addr: usize, buf_len: usize, _mr: MrHandle, ctx: u64) -> FabricResult<()> {
        let me = self.endpoint(ep)?;
        let queued = me.sends.lock().pop_front();
        match queued {
            Some(pending) => {
                let n = pending.data.len().min(buf_len);
                unsafe {
                    std::ptr::copy_nonoverlapping(pending.data.as_ptr(), buf_addr as *mut u8, n);
                }
                self.push_completion(
                    me.cq,
                    CqEntry {
                        ctx,
                        kind: CompletionKind::Recv,
                        len: n,
                        immediate_data: pending.imm,
                    },
                );
            }
            None => {
                me.recvs.lock().push_back(PostedRecv {
                    buf_addr,
                    buf_len,
                    ctx,
                });
            }
        }
        Ok(())
    }

    fn write_with_immediate(
        &self,
        ep: EndpointHandle,
        buf_addr: usize,
        buf_len: usize,
        _mr: MrHandle,
        imm: u32,
        dest: AddressHandle,
        remote_addr: u64,
        _remote_key: u64,
        ctx: u64,
    ) -> FabricResult<()> {
        let me = self.endpoint(ep)?;
        let inflight = me.inflight_writes.fetch_add(1, Ordering::AcqRel);
        if inflight >= self.inner.max_inflight_writes {
            me.inflight_writes.fetch_sub(1, Ordering::AcqRel);
            return Err(FabricError::Again);
        }

        let dest_ep = self.endpoint(dest)?;
        // SAFETY: loopback endpoints share one address space; `buf_addr`
        // is owned by this post's caller for the duration of the call,
        // and `remote_addr` was registered by the peer via `reg_mr` and
        // handed to us through a CTRL message naming a live buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(buf_addr as *const u8, remote_addr as *mut u8, buf_len);
        }
        me.inflight_writes.fetch_sub(1, Ordering::AcqRel);

        self.push_completion(
            me.cq,
            CqEntry {
                ctx,
                kind: CompletionKind::Write,
                len: buf_len,
                immediate_data: None,
            },
        );
        self.push_completion(
            dest_ep.cq,
            CqEntry {
                ctx: 0,
                kind: CompletionKind::RemoteWrite,
                len: buf_len,
                immediate_data: Some(imm),
            },
        );
        Ok(())
    }

    fn read(
        &self,
        ep: EndpointHandle,
        buf_addr: usize,
        buf_len: usize,
        _mr: MrHandle,
        _dest: AddressHandle,
        remote_addr: u64,
        _remote_key: u64,
        ctx: u64,
    ) -> FabricResult<()> {
        let me = self.endpoint(ep)?;
        // SAFETY: see `write_with_immediate`; symmetric for the read
        // direction.
        unsafe {
            std::ptr::copy_nonoverlapping(remote_addr as *const u8, buf_addr as *mut u8, buf_len);
        }
        self.push_completion(
            me.cq,
            CqEntry {
                ctx,
                kind: CompletionKind::Read,
                len: buf_len,
                immediate_data: None,
            },
        );
        Ok(())
    }

    fn cq_read(&self, cq: CqHandle, max: usize) -> Vec<CqEntry> {
        let Ok(cq) = self.cq(cq) else { return Vec::new() };
        let mut state = cq.lock();
        let n = max.min(state.completions.len());
        state.completions.drain(0..n).collect()
    }

    fn cq_readerr(&self, cq: CqHandle) -> Vec<CqError> {
        let Ok(cq) = self.cq(cq) else { return Vec::new() };
        let mut state = cq.lock();
        state.errors.drain(..).collect()
    }
}

impl LoopbackFabric {
    fn send_with_immediate_inner(
        &self,
        ep: EndpointHandle,
        buf_addr: usize,
        buf_len: usize,
        imm: Option<u32>,
        dest: AddressHandle,
        ctx: u64,
    ) -> FabricResult<()> {
        let me = self.endpoint(ep)?;
        let dest_ep = self.endpoint(dest)?;
        // SAFETY: same loopback address-space argument as the write path.
        let data = unsafe { std::slice::from_raw_parts(buf_addr as *const u8, buf_len) }.to_vec();
        self.push_completion(
            me.cq,
            CqEntry {
                ctx,
                kind: CompletionKind::Send,
                len: buf_len,
                immediate_data: None,
            },
        );
        self.deliver_send(&dest_ep, data, imm);
        Ok(())
    }

    /// Test/diagnostic hook: force the next `write_with_immediate` calls
    /// on `ep` to return `EAGAIN` by pretending `n` writes are already
    /// in flight.
    #[cfg(any(test, feature = "test-support"))]
    pub fn saturate_writes(&self, ep: EndpointHandle, n: u32) {
        if let Ok(state) = self.endpoint(ep) {
            state.inflight_writes.store(n, Ordering::SeqCst);
        }
    }

    /// Test/diagnostic hook: flip the fabric-wide `support_gdr` probe
    /// result, letting tests exercise the flush-buffer allocation and
    /// read path without real GPU hardware.
    #[cfg(any(test, feature = "test-support"))]
    pub fn set_gdr_supported(&self, supported: bool) {
        self.inner.gdr_supported.store(supported, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_recv_matches_post_after_arrival() {
        let fabric = LoopbackFabric::new(u32::MAX);
        let a = fabric.open_endpoint().unwrap();
        let b = fabric.open_endpoint().unwrap();
        let name_b = fabric.get_ep_name(b).unwrap();
        let addr_b = fabric.av_insert(a, &name_b).unwrap();

        let payload = b"hello".to_vec();
        fabric
            .send(a, payload.as_ptr() as usize, payload.len(), MrHandle(0), addr_b, 7)
            .unwrap();

        let mut buf = vec![0u8; 5];
        fabric
            .recv(b, buf.as_mut_ptr() as usize, buf.len(), MrHandle(0), 3)
            .unwrap();

        let cq_b = fabric.cq_of(b).unwrap();
        let entries = fabric.cq_read(cq_b, 4);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ctx, 3);
        assert_eq!(buf, payload);
    }

    #[test]
    fn recv_posted_before_send_still_matches() {
        let fabric = LoopbackFabric::new(u32::MAX);
        let a = fabric.open_endpoint().unwrap();
        let b = fabric.open_endpoint().unwrap();
        let name_a = fabric.get_ep_name(a).unwrap();
        let addr_a = fabric.av_insert(b, &name_a).unwrap();

        let mut buf = vec![0u8; 3];
        fabric
            .recv(b, buf.as_mut_ptr() as usize, buf.len(), MrHandle(0), 1)
            .unwrap();

        let payload = b"abc".to_vec();
        fabric
            .send(a, payload.as_ptr() as usize, payload.len(), MrHandle(0), addr_a, 2)
            .unwrap();

        let cq_b = fabric.cq_of(b).unwrap();
        let entries = fabric.cq_read(cq_b, 4);
        assert_eq!(entries.len(), 1);
        assert_eq!(buf, payload);
    }

    #[test]
    fn write_with_immediate_copies_bytes_and_notifies_both_sides() {
        let fabric = LoopbackFabric::new(u32::MAX);
        let a = fabric.open_endpoint().unwrap();
        let b = fabric.open_endpoint().unwrap();
        let name_b = fabric.get_ep_name(b).unwrap();
        let addr_b = fabric.av_insert(a, &name_b).unwrap();

        let src = b"payload!".to_vec();
        let mut dst = vec![0u8; src.len()];
        fabric
            .write_with_immediate(
                a,
                src.as_ptr() as usize,
                src.len(),
                MrHandle(0),
                0xABCD,
                addr_b,
                dst.as_mut_ptr() as u64,
                0,
                9,
            )
            .unwrap();

        assert_eq!(dst, src);
        let cq_a = fabric.cq_of(a).unwrap();
        let cq_b = fabric.cq_of(b).unwrap();
        let a_entries = fabric.cq_read(cq_a, 4);
        let b_entries = fabric.cq_read(cq_b, 4);
        assert_eq!(a_entries.len(), 1);
        assert_eq!(a_entries[0].kind, CompletionKind::Write);
        assert_eq!(b_entries.len(), 1);
        assert_eq!(b_entries[0].kind, CompletionKind::RemoteWrite);
        assert_eq!(b_entries[0].immediate_data, Some(0xABCD));
    }

    #[test]
    fn write_with_immediate_returns_eagain_once_saturated() {
        let fabric = LoopbackFabric::new(1);
        let a = fabric.open_endpoint().unwrap();
        let b = fabric.open_endpoint().unwrap();
        let name_b = fabric.get_ep_name(b).unwrap();
        let addr_b = fabric.av_insert(a, &name_b).unwrap();
        fabric.saturate_writes(a, 1);

        let src = [0u8; 4];
        let mut dst = [0u8; 4];
        let result = fabric.write_with_immediate(
            a,
            src.as_ptr() as usize,
            src.len(),
            MrHandle(0),
            0,
            addr_b,
            dst.as_mut_ptr() as u64,
            0,
            0,
        );
        assert!(matches!(result, Err(FabricError::Again)));
    }
}
