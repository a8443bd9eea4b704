//! # Send / Receive / Test / Flush
//!
//! The data-path operations named in spec.md §4.6–§4.9, built on top of
//! [`crate::progress`]'s dispatch helpers. Every entry point here starts
//! by draining this thread's endpoint the same way `crate::handshake`
//! already does for `connect`/`accept` — the single "every call makes
//! progress" discipline spec.md §4.4 asks for.

use crate::comm::Communicator;
use crate::endpoint::Device;
use crate::error::TransportError;
use crate::fabric::MrHandle;
use crate::message_buffer::{ElementType, InsertOutcome, SlotStatus};
use crate::progress::{bump_parent, post_eager, post_write_segments, progress};
use crate::request::{FlushContext, Request, RequestKind, SendContext, StagedSend, Status, UNKNOWN_TOTAL};
use crate::wire::CtrlMessage;

/// Per-communicator cap on simultaneously outstanding requests (spec.md
/// §3's invariant: "a communicator's `num_inflight_reqs` never exceeds
/// the configured per-communicator maximum"). `RdmaConfig` carries no
/// dedicated field for this — it sizes buffer pools and thresholds, not
/// request concurrency — so the cap is fixed at the request freelist's
/// per-communicator share named in spec.md §3's data model ("a 16-entry
/// request freelist" on each send/receive communicator). Recorded as a
/// deliberate choice in DESIGN.md.
pub const MAX_INFLIGHT_REQS: u32 = 16;

fn not_connected(kind: &str) -> TransportError {
    TransportError::InvalidArgument(format!("{kind} communicator is not connected"))
}

/// `send(device, send_comm, data, size, tag, mr)`: spec.md §4.6 steps 1–7.
/// `tag` is carried through purely for parity with the external API
/// surface named in spec.md §6 — nothing in the wire protocol matches or
/// filters on it, so it is otherwise unused here.
pub fn send(
    device: &Device,
    send_comm_id: u32,
    data_addr: usize,
    size: usize,
    _tag: i32,
    mr: MrHandle,
) -> Result<Option<usize>, TransportError> {
    let endpoint = device.endpoint()?;
    progress(device.fabric.as_ref(), &endpoint, device.config.cq_read_count)?;

    let mut comms = endpoint.comms.lock();
    let Some(Communicator::Send(comm)) = comms.get_mut(&send_comm_id) else {
        return Err(TransportError::InvalidArgument("not a send communicator".into()));
    };
    if !comm.connected {
        return Err(not_connected("send"));
    }
    if comm.num_inflight_reqs >= MAX_INFLIGHT_REQS {
        return Err(TransportError::ResourceExhausted(
            "send communicator inflight request limit reached".into(),
        ));
    }

    // Step 1: allocate a sequence number and check whether this message's
    // CTRL already arrived (a race with the peer's matching `irecv`).
    let seq = comm.alloc_seq();
    let have_ctrl_entry = comm.message_buffer.retrieve(seq);
    let ctrl = match have_ctrl_entry {
        None => None,
        Some((_, ElementType::Buffer, SlotStatus::InProgress)) => Some(
            endpoint
                .ctrl_store
                .lock()
                .remove(&(send_comm_id, seq))
                .ok_or_else(|| TransportError::Protocol("message buffer held a CTRL buffer with no stored payload".into()))?,
        ),
        Some((_, ty, st)) => {
            return Err(TransportError::Protocol(format!(
                "send seq {seq} found the message buffer in an unexpected state: {ty:?}/{st:?}"
            )))
        }
    };
    let have_ctrl = ctrl.is_some();

    // Step 2: classify eager vs rendezvous (spec.md §4.6 step 2 — an
    // already-arrived CTRL always means rendezvous, since the peer only
    // sends one when its `irecv` outran this `send`).
    let eager = !have_ctrl && (size == 0 || size <= device.config.eager_max_size);
    // A send only ever has to wait on a CTRL that hasn't shown up yet
    // when it is neither already holding one nor small enough to go
    // eager; crediting this "extra" completion unconditionally would
    // leave every eager send's `total_compls` permanently unsatisfiable.
    let needs_ctrl_wait = !have_ctrl && !eager;

    // Step 3: attach a schedule now, from the local size alone — it never
    // depends on anything the CTRL carries, so it is computed exactly
    // once whether or not this request ends up staged.
    let schedule = endpoint.scheduler.lock().schedule(size);
    let num_segments = schedule.segments.len() as u32;
    let total_compls = num_segments + u32::from(needs_ctrl_wait);

    let req = Request::new(RequestKind::Send, send_comm_id, seq, total_compls, None);
    *req.schedule.lock() = Some(schedule);
    req.mark_pending();
    let req_idx = endpoint.requests.lock().insert(req)?;

    // Step 4/5: reconcile against the message buffer. A CTRL already
    // present moved the slot to `InProgress`/`Buffer`; claim it with
    // `replace`. Otherwise this is the first arrival for `seq` and a
    // fresh `insert` is expected to succeed — unless the peer's CTRL
    // raced in between the `retrieve` above and here, in which case the
    // insert reports `InvalidIdx` and the caller is asked to retry.
    let outcome = if have_ctrl {
        comm.message_buffer.replace(seq, req_idx, ElementType::Request).map(|_| InsertOutcome::Success)
    } else {
        Ok(comm.message_buffer.insert(seq, req_idx, ElementType::Request))
    }?;
    if let InsertOutcome::InvalidIdx { .. } = outcome {
        endpoint.requests.lock().remove(req_idx).ok();
        return Ok(None);
    }

    comm.num_inflight_reqs += 1;
    let wire_comm_id = comm.remote_comm_id;
    let remote_addrs = comm.remote_addrs.clone();
    drop(comms);

    // Step 6/7: post now if eager or the CTRL is already in hand;
    // otherwise stage the data pointer for `crate::progress::progress` to
    // pick up once the CTRL arrives (spec.md §4.6 step 5's race case).
    let requests = endpoint.requests.lock();
    let req = requests.get(req_idx).expect("just inserted");
    if have_ctrl || eager {
        let ctx = SendContext {
            wire_comm_id,
            data_addr,
            mr,
            eager,
            ctrl,
        };
        *req.send_ctx.lock() = Some(ctx.clone());
        if eager {
            post_eager(device.fabric.as_ref(), &endpoint.rails, &remote_addrs, req_idx, req, &ctx, &endpoint.pending)?;
        } else {
            post_write_segments(device.fabric.as_ref(), &endpoint.rails, &remote_addrs, req_idx, req, &ctx, &endpoint.pending)?;
        }
    } else {
        *req.staged_send.lock() = Some(StagedSend { data_addr, data_len: size, mr });
    }

    Ok(Some(req_idx))
}

/// `irecv(device, recv_comm, dest, size, tag, mr)`: spec.md §4.7 steps
/// 1–6. Creates a `RECV` parent request chaining a `SEND_CTRL` and a
/// `RECV_SEGMS` sub-request, per spec.md §9's "chain them so sub-request
/// completion propagates". `tag` is accepted for the same reason as in
/// [`send`].
pub fn irecv(
    device: &Device,
    recv_comm_id: u32,
    dest_addr: usize,
    dest_len: usize,
    _tag: i32,
    mr: MrHandle,
) -> Result<Option<usize>, TransportError> {
    let endpoint = device.endpoint()?;
    progress(device.fabric.as_ref(), &endpoint, device.config.cq_read_count)?;

    let mut comms = endpoint.comms.lock();
    let Some(Communicator::Receive(comm)) = comms.get_mut(&recv_comm_id) else {
        return Err(TransportError::InvalidArgument("not a receive communicator".into()));
    };
    if !comm.connected {
        return Err(not_connected("receive"));
    }
    if comm.num_inflight_reqs >= MAX_INFLIGHT_REQS {
        return Err(TransportError::ResourceExhausted(
            "receive communicator inflight request limit reached".into(),
        ));
    }

    // Step 1: allocate a sequence number and check for an EAGER payload
    // that already arrived and is waiting in `eager_store`.
    let seq = comm.alloc_seq();
    let slot = comm.message_buffer.retrieve(seq);
    let (eager, stored_payload) = match slot {
        None => (false, None),
        Some((_, ElementType::Buffer, SlotStatus::InProgress)) => {
            (true, endpoint.eager_store.lock().remove(&(recv_comm_id, seq)))
        }
        Some((_, ty, st)) => {
            return Err(TransportError::Protocol(format!(
                "recv seq {seq} found the message buffer in an unexpected state: {ty:?}/{st:?}"
            )))
        }
    };

    // Step 2: build the RECV parent (2 sub-requests: SEND_CTRL, RECV_SEGMS)
    // and the RECV_SEGMS child. Its true segment count isn't knowable
    // until the first segment's immediate data arrives (or, for an
    // already-arrived eager payload, is fixed below at exactly one), so
    // it is created with the `UNKNOWN_TOTAL` sentinel.
    let mut requests = endpoint.requests.lock();
    let parent_idx = requests.insert(Request::new(RequestKind::Recv, recv_comm_id, seq, 2, None))?;
    let recvsegms_idx = match requests.insert(Request::new(RequestKind::RecvSegms, recv_comm_id, seq, UNKNOWN_TOTAL, Some(parent_idx))) {
        Ok(idx) => idx,
        Err(e) => {
            requests.remove(parent_idx).ok();
            return Err(e);
        }
    };
    requests.get(recvsegms_idx).expect("just inserted").recv_dest.lock().replace((dest_addr, dest_len));
    requests.get(parent_idx).expect("just inserted").children.lock().push(recvsegms_idx);
    drop(requests);

    endpoint.recv_index.lock().insert((recv_comm_id, seq), recvsegms_idx);

    // Step 3: reconcile against the message buffer, same tie-break
    // contract as `send`'s step 4/5.
    let outcome = if eager {
        comm.message_buffer.replace(seq, parent_idx, ElementType::Request).map(|_| InsertOutcome::Success)
    } else {
        Ok(comm.message_buffer.insert(seq, parent_idx, ElementType::Request))
    }?;
    if let InsertOutcome::InvalidIdx { .. } = outcome {
        endpoint.recv_index.lock().remove(&(recv_comm_id, seq));
        let mut requests = endpoint.requests.lock();
        requests.remove(recvsegms_idx).ok();
        requests.remove(parent_idx).ok();
        return Ok(None);
    }

    comm.num_inflight_reqs += 1;
    let ctrl_target_comm_id = comm.remote_comm_id;
    let remote_addr0 = comm.remote_addrs[0];
    drop(comms);

    // Step 4: if an EAGER payload was already waiting, deliver it
    // synchronously right now rather than waiting for the next CQ drain.
    if eager {
        let requests = endpoint.requests.lock();
        let recv_req = requests.get(recvsegms_idx).expect("just inserted");
        let payload_len = match &stored_payload {
            Some(bytes) => {
                if !bytes.is_empty() {
                    // SAFETY: `dest_addr`/`dest_len` are the caller's
                    // registered destination, valid for this call.
                    unsafe {
                        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest_addr as *mut u8, bytes.len().min(dest_len));
                    }
                }
                bytes.len()
            }
            None => 0,
        };
        recv_req.record_segment(1);
        if recv_req.record_completion(payload_len) {
            bump_parent(&requests, recv_req, payload_len);
        }
    }

    // Step 5/6: post the CTRL reply naming this buffer, needed regardless
    // of whether the matching segment arrives eagerly or via rendezvous
    // RDMA-writes, since the sender's `send()` may not have classified
    // the message yet.
    let ctrl = CtrlMessage {
        remote_comm_id: ctrl_target_comm_id,
        msg_seq_num: seq,
        buff_addr: dest_addr as u64,
        buff_len: dest_len as u64,
        buff_mr_key: [mr.0; crate::wire::MAX_RAILS],
    };
    let mut bytes = ctrl.to_bytes();
    let addr = bytes.as_mut_ptr() as usize;
    let len = bytes.len();

    let ctrl_req_idx = endpoint
        .requests
        .lock()
        .insert(Request::new(RequestKind::SendCtrl, recv_comm_id, seq, 1, Some(parent_idx)))?;
    endpoint.scratch.lock().insert(ctrl_req_idx, bytes);
    if let Some(parent) = endpoint.requests.lock().get(parent_idx) {
        parent.children.lock().push(ctrl_req_idx);
    }

    let rail0_ep = endpoint.rails[0].fabric_ep;
    match device.fabric.send(rail0_ep, addr, len, MrHandle(0), remote_addr0, ctrl_req_idx as u64) {
        Ok(()) => {}
        Err(crate::fabric::FabricError::Again) => {
            if let Some(req) = endpoint.requests.lock().get(ctrl_req_idx) {
                let already = req.queued.load(std::sync::atomic::Ordering::Acquire);
                if endpoint.pending.lock().try_enqueue(ctrl_req_idx, already) {
                    req.queued.store(true, std::sync::atomic::Ordering::Release);
                }
            }
        }
        Err(crate::fabric::FabricError::Fatal(e)) => return Err(e),
    }

    Ok(Some(parent_idx))
}

/// `test(device, req)`: drain this endpoint's CQ, then report whether
/// `req` has reached a terminal state (spec.md §4.9). A terminal request
/// is freed back to the pool here — along with a `Recv` parent's
/// `SEND_CTRL`/`RECV_SEGMS` children — and its owning communicator's
/// `num_inflight_reqs` is decremented (spec.md §3, "freed back when
/// `test` observes `COMPLETED` or error"). Returns `(done, size)`; `size`
/// is only meaningful once `done` is `true`.
pub fn test(device: &Device, req_idx: usize) -> Result<(bool, usize), TransportError> {
    let endpoint = device.endpoint()?;
    progress(device.fabric.as_ref(), &endpoint, device.config.cq_read_count)?;

    let requests = endpoint.requests.lock();
    let req = requests
        .get(req_idx)
        .ok_or_else(|| TransportError::InvalidArgument(format!("unknown request index {req_idx}")))?;
    let status = req.status();
    let size = req.size();
    let (kind, comm_id, seq, children) = (req.kind, req.comm_id, req.seq, req.children.lock().clone());
    drop(requests);

    let terminal = matches!(status, Status::Completed | Status::Error(_));

    if terminal {
        let mut comms = endpoint.comms.lock();
        match (kind, comms.get_mut(&comm_id)) {
            (RequestKind::Send, Some(Communicator::Send(c))) => {
                c.num_inflight_reqs = c.num_inflight_reqs.saturating_sub(1);
                if status == Status::Completed {
                    c.message_buffer.complete(seq).ok();
                    c.message_buffer.clear(seq);
                }
            }
            (RequestKind::Recv, Some(Communicator::Receive(c))) => {
                c.num_inflight_reqs = c.num_inflight_reqs.saturating_sub(1);
                if status == Status::Completed {
                    c.message_buffer.complete(seq).ok();
                    c.message_buffer.clear(seq);
                }
                endpoint.recv_index.lock().remove(&(comm_id, seq));
            }
            _ => {}
        }
        drop(comms);

        let mut requests = endpoint.requests.lock();
        for child in children {
            requests.remove(child).ok();
        }
        requests.remove(req_idx).ok();
    }

    match status {
        Status::Completed => Ok((true, size)),
        Status::Error(e) => Err(e),
        Status::Created | Status::Pending => Ok((false, 0)),
    }
}

/// `iflush(device, recv_comm, data, size, mr)`: spec.md §4.8. Issues a
/// 4-byte RDMA read back from the just-written GPU buffer so the caller
/// can be sure the write landed before touching the data, unless
/// `gdr_flush_disable` is set or there is nothing to flush (`size == 0`
/// or the CUDA flush API already covers it).
pub fn iflush(device: &Device, recv_comm_id: u32, data_addr: usize, size: usize, mr: MrHandle) -> Result<Option<usize>, TransportError> {
    let endpoint = device.endpoint()?;
    progress(device.fabric.as_ref(), &endpoint, device.config.cq_read_count)?;

    if device.config.gdr_flush_disable || device.config.cuda_flush_enable || size == 0 {
        return Ok(None);
    }

    let mut comms = endpoint.comms.lock();
    let Some(Communicator::Receive(comm)) = comms.get_mut(&recv_comm_id) else {
        return Err(TransportError::InvalidArgument("not a receive communicator".into()));
    };
    if !comm.connected {
        return Err(not_connected("receive"));
    }
    let Some(flush) = &comm.flush_buffer else {
        // No flush buffer registered for this communicator: flush is a
        // no-op rather than a hard error, matching GDR-unsupported or
        // GDR-disabled hosts.
        return Ok(None);
    };
    let (flush_addr, flush_mr) = (flush.addr(), flush.mr());
    let remote_addr0 = comm.remote_addrs[0];
    drop(comms);

    let req_idx = endpoint.requests.lock().insert(Request::new(RequestKind::Flush, recv_comm_id, 0, 1, None))?;
    let rail0_ep = endpoint.rails[0].fabric_ep;
    let read_len = 4.min(size);
    match device.fabric.read(rail0_ep, flush_addr, read_len, flush_mr, remote_addr0, data_addr as u64, mr.0, req_idx as u64) {
        Ok(()) => Ok(Some(req_idx)),
        Err(crate::fabric::FabricError::Again) => {
            let requests = endpoint.requests.lock();
            if let Some(req) = requests.get(req_idx) {
                *req.flush_ctx.lock() = Some(FlushContext {
                    local_addr: flush_addr,
                    local_len: read_len,
                    local_mr: flush_mr,
                    remote_addr: data_addr as u64,
                    remote_key: mr.0,
                });
                let already = req.queued.load(std::sync::atomic::Ordering::Acquire);
                if endpoint.pending.lock().try_enqueue(req_idx, already) {
                    req.queued.store(true, std::sync::atomic::Ordering::Release);
                }
            }
            Ok(Some(req_idx))
        }
        Err(crate::fabric::FabricError::Fatal(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::RdmaConfig;
    use crate::fabric::loopback::LoopbackFabric;
    use crate::fabric::MemType;
    use crate::handshake::{accept, connect, listen};

    fn connected_pair(num_rails: u32) -> (Device, Device, u32, u32) {
        let fabric = Arc::new(LoopbackFabric::new(u32::MAX));
        let dev_a = Device::new(fabric.clone(), num_rails, RdmaConfig::default());
        let dev_b = Device::new(fabric, num_rails, RdmaConfig::default());

        let handle = listen(&dev_b).unwrap();
        let mut send_id = None;
        let mut recv_id = None;
        for _ in 0..16 {
            if send_id.is_none() {
                send_id = connect(&dev_a, &handle).unwrap();
            }
            if recv_id.is_none() {
                recv_id = accept(&dev_b, handle.listen_comm_id).unwrap();
            }
            if send_id.is_some() && recv_id.is_some() {
                break;
            }
        }
        (dev_a, dev_b, send_id.unwrap(), recv_id.unwrap())
    }

    fn reg(device: &Device, buf: &mut [u8]) -> MrHandle {
        let endpoint = device.endpoint().unwrap();
        device
            .fabric
            .reg_mr(endpoint.rails[0].fabric_ep, buf.as_mut_ptr() as usize, buf.len(), MemType::Host)
            .unwrap()
    }

    #[test]
    fn eager_round_trip_delivers_exact_bytes() {
        let (dev_a, dev_b, send_id, recv_id) = connected_pair(1);
        let mut src = b"hello eager".to_vec();
        let mut dst = vec![0u8; src.len()];
        let src_mr = reg(&dev_a, &mut src);
        let dst_mr = reg(&dev_b, &mut dst);

        let recv_req = irecv(&dev_b, recv_id, dst.as_mut_ptr() as usize, dst.len(), 0, dst_mr).unwrap().unwrap();
        let send_req = send(&dev_a, send_id, src.as_ptr() as usize, src.len(), 0, src_mr).unwrap().unwrap();

        let mut send_done = false;
        let mut recv_done = false;
        for _ in 0..32 {
            if !send_done {
                send_done = test(&dev_a, send_req).unwrap().0;
            }
            if !recv_done {
                let (done, size) = test(&dev_b, recv_req).unwrap();
                if done {
                    recv_done = true;
                    assert_eq!(size, src.len());
                }
            }
            if send_done && recv_done {
                break;
            }
        }
        assert!(send_done && recv_done);
        assert_eq!(dst, src);
    }

    #[test]
    fn rendezvous_round_trip_delivers_exact_bytes_across_rails() {
        let mut cfg = RdmaConfig::default();
        cfg.eager_max_size = 64;
        cfg.round_robin_threshold = 256;
        let fabric = Arc::new(LoopbackFabric::new(u32::MAX));
        let dev_a = Device::new(fabric.clone(), 2, cfg.clone());
        let dev_b = Device::new(fabric, 2, cfg);

        let handle = listen(&dev_b).unwrap();
        let mut send_id = None;
        let mut recv_id = None;
        for _ in 0..16 {
            send_id = send_id.or(connect(&dev_a, &handle).unwrap());
            recv_id = recv_id.or(accept(&dev_b, handle.listen_comm_id).unwrap());
            if send_id.is_some() && recv_id.is_some() {
                break;
            }
        }
        let (send_id, recv_id) = (send_id.unwrap(), recv_id.unwrap());

        let mut src = vec![7u8; 4096];
        let mut dst = vec![0u8; src.len()];
        let src_mr = reg(&dev_a, &mut src);
        let dst_mr = reg(&dev_b, &mut dst);

        // Receiver posts first: its CTRL must chase the sender's request.
        let recv_req = irecv(&dev_b, recv_id, dst.as_mut_ptr() as usize, dst.len(), 0, dst_mr).unwrap().unwrap();
        let send_req = send(&dev_a, send_id, src.as_ptr() as usize, src.len(), 0, src_mr).unwrap().unwrap();

        let mut send_done = false;
        let mut recv_done = false;
        for _ in 0..64 {
            if !send_done {
                send_done = test(&dev_a, send_req).unwrap().0;
            }
            if !recv_done {
                let (done, size) = test(&dev_b, recv_req).unwrap();
                if done {
                    recv_done = true;
                    assert_eq!(size, src.len());
                }
            }
            if send_done && recv_done {
                break;
            }
        }
        assert!(send_done && recv_done);
        assert_eq!(dst, src);
    }

    #[test]
    fn send_before_irecv_stages_until_ctrl_arrives() {
        let mut cfg = RdmaConfig::default();
        cfg.eager_max_size = 64;
        cfg.round_robin_threshold = 256;
        let fabric = Arc::new(LoopbackFabric::new(u32::MAX));
        let dev_a = Device::new(fabric.clone(), 1, cfg.clone());
        let dev_b = Device::new(fabric, 1, cfg);

        let handle = listen(&dev_b).unwrap();
        let mut send_id = None;
        let mut recv_id = None;
        for _ in 0..16 {
            send_id = send_id.or(connect(&dev_a, &handle).unwrap());
            recv_id = recv_id.or(accept(&dev_b, handle.listen_comm_id).unwrap());
            if send_id.is_some() && recv_id.is_some() {
                break;
            }
        }
        let (send_id, recv_id) = (send_id.unwrap(), recv_id.unwrap());

        let mut src = vec![3u8; 1024];
        let mut dst = vec![0u8; src.len()];
        let src_mr = reg(&dev_a, &mut src);
        let dst_mr = reg(&dev_b, &mut dst);

        // Sender posts first this time: its request must stage until the
        // receiver's `irecv` produces a CTRL.
        let send_req = send(&dev_a, send_id, src.as_ptr() as usize, src.len(), 0, src_mr).unwrap().unwrap();
        assert!(!test(&dev_a, send_req).unwrap().0);

        let recv_req = irecv(&dev_b, recv_id, dst.as_mut_ptr() as usize, dst.len(), 0, dst_mr).unwrap().unwrap();

        let mut send_done = false;
        let mut recv_done = false;
        for _ in 0..64 {
            if !send_done {
                send_done = test(&dev_a, send_req).unwrap().0;
            }
            if !recv_done {
                recv_done = test(&dev_b, recv_req).unwrap().0;
            }
            if send_done && recv_done {
                break;
            }
        }
        assert!(send_done && recv_done);
        assert_eq!(dst, src);
    }

    #[test]
    fn window_wraps_past_256_messages_on_the_same_pair() {
        // Regression test: `test()` must advance the message buffer to
        // `COMPLETE` and clear the slot on completion, or the 257th
        // message on a peer pair re-hits a slot still `InProgress` and
        // both `send` and `irecv` error out.
        let (dev_a, dev_b, send_id, recv_id) = connected_pair(1);
        for i in 0..(crate::message_buffer::WINDOW_SIZE + 1) {
            let mut src = vec![i as u8; 8];
            let mut dst = vec![0u8; src.len()];
            let src_mr = reg(&dev_a, &mut src);
            let dst_mr = reg(&dev_b, &mut dst);

            let recv_req = irecv(&dev_b, recv_id, dst.as_mut_ptr() as usize, dst.len(), 0, dst_mr).unwrap().unwrap();
            let send_req = send(&dev_a, send_id, src.as_ptr() as usize, src.len(), 0, src_mr).unwrap().unwrap();

            let mut send_done = false;
            let mut recv_done = false;
            for _ in 0..16 {
                if !send_done {
                    send_done = test(&dev_a, send_req).unwrap().0;
                }
                if !recv_done {
                    recv_done = test(&dev_b, recv_req).unwrap().0;
                }
                if send_done && recv_done {
                    break;
                }
            }
            assert!(send_done && recv_done, "message {i} did not complete");
            assert_eq!(dst, src);
        }
    }

    #[test]
    fn gdr_flush_allocates_buffer_and_completes_read() {
        let fabric = Arc::new(LoopbackFabric::new(u32::MAX));
        fabric.set_gdr_supported(true);
        let dev_a = Device::new(fabric.clone(), 1, RdmaConfig::default());
        let dev_b = Device::new(fabric, 1, RdmaConfig::default());

        let handle = listen(&dev_b).unwrap();
        let mut send_id = None;
        let mut recv_id = None;
        for _ in 0..16 {
            send_id = send_id.or(connect(&dev_a, &handle).unwrap());
            recv_id = recv_id.or(accept(&dev_b, handle.listen_comm_id).unwrap());
            if send_id.is_some() && recv_id.is_some() {
                break;
            }
        }
        let (send_id, recv_id) = (send_id.unwrap(), recv_id.unwrap());

        let mut src = b"flush me for real".to_vec();
        let mut dst = vec![0u8; src.len()];
        let src_mr = reg(&dev_a, &mut src);
        let dst_mr = reg(&dev_b, &mut dst);

        let recv_req = irecv(&dev_b, recv_id, dst.as_mut_ptr() as usize, dst.len(), 0, dst_mr).unwrap().unwrap();
        let send_req = send(&dev_a, send_id, src.as_ptr() as usize, src.len(), 0, src_mr).unwrap().unwrap();
        let mut send_done = false;
        let mut recv_done = false;
        for _ in 0..32 {
            if !send_done {
                send_done = test(&dev_a, send_req).unwrap().0;
            }
            if !recv_done {
                recv_done = test(&dev_b, recv_req).unwrap().0;
            }
            if send_done && recv_done {
                break;
            }
        }
        assert!(send_done && recv_done);

        let flush_req = iflush(&dev_b, recv_id, dst.as_mut_ptr() as usize, dst.len(), dst_mr)
            .unwrap()
            .expect("GDR-supported receive communicator must allocate a flush buffer");
        let mut flush_done = false;
        for _ in 0..16 {
            if test(&dev_b, flush_req).unwrap().0 {
                flush_done = true;
                break;
            }
        }
        assert!(flush_done, "flush read never completed");
    }

    #[test]
    fn inflight_cap_rejects_once_reached() {
        let (dev_a, _dev_b, send_id, _recv_id) = connected_pair(1);
        let mut buf = vec![0u8; 8];
        let mr = reg(&dev_a, &mut buf);
        for _ in 0..MAX_INFLIGHT_REQS {
            send(&dev_a, send_id, buf.as_ptr() as usize, buf.len(), 0, mr).unwrap();
        }
        let result = send(&dev_a, send_id, buf.as_ptr() as usize, buf.len(), 0, mr);
        assert!(matches!(result, Err(TransportError::ResourceExhausted(_))));
    }
}
