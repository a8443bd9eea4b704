//! # Progress Engine
//!
//! The single entry point that drains completion queues and the
//! pending-request queue (spec.md §4.4). Every public operation that can
//! make forward progress — `send`, `irecv`, `test`, `connect`, `accept`,
//! `close*` — calls this (directly or via [`crate::protocol::test`])
//! rather than maintaining its own dispatch loop, the same "one place
//! that reads the CQ" discipline the connection handshake already
//! follows on rail 0.
//!
//! Posting helpers used both by a fresh `send()` and by a pending-queue
//! retry live here too, since a retry is just "do the same post again
//! with the state `send()` already built."

use std::sync::atomic::Ordering;

use crate::comm::Communicator;
use crate::endpoint::{Endpoint, Rail};
use crate::error::TransportError;
use crate::fabric::{CompletionKind, FabricError, FabricProvider, MrHandle};
use crate::freelist::FreeList;
use crate::message_buffer::ElementType;
use crate::request::{Request, RequestKind, SendContext};
use crate::wire::{decode_write_immediate, encode_write_immediate, peek_tag, CtrlMessage, MessageTag};

/// Propagate one sub-request's completion up to its parent, if it has
/// one (spec.md §4.7, "chain them so sub-request completion
/// propagates").
pub(crate) fn bump_parent(requests: &FreeList<Request>, child: &Request, bytes: usize) {
    if let Some(parent_idx) = child.parent {
        if let Some(parent) = requests.get(parent_idx) {
            parent.record_completion(bytes);
        }
    }
}

/// Post (or resume posting) a rendezvous SEND's remaining RDMA-write
/// segments. Stops at the first `EAGAIN`, leaving `schedule.next`
/// pointing at the segment to retry.
pub(crate) fn post_write_segments(
    fabric: &dyn FabricProvider,
    rails: &[Rail],
    remote_addrs: &[u64],
    req_idx: usize,
    req: &Request,
    ctx: &SendContext,
    pending: &parking_lot::Mutex<crate::pending::PendingQueue>,
) -> Result<(), TransportError> {
    let ctrl = ctx.ctrl.as_ref().expect("rendezvous send context always carries a CTRL");
    let mut schedule_guard = req.schedule.lock();
    let schedule = schedule_guard.as_mut().expect("schedule attached before posting begins");
    let num_segments = schedule.segments.len() as u8;

    while !schedule.is_complete() {
        let seg = schedule.segments[schedule.next];
        let imm = encode_write_immediate(ctx.wire_comm_id, req.seq, num_segments);
        let remote_addr = ctrl.buff_addr + seg.offset as u64;
        let remote_key = ctrl.buff_mr_key[seg.rail as usize];
        match fabric.write_with_immediate(
            rails[seg.rail as usize].fabric_ep,
            ctx.data_addr + seg.offset,
            seg.length,
            ctx.mr,
            imm,
            remote_addrs[seg.rail as usize],
            remote_addr,
            remote_key,
            req_idx as u64,
        ) {
            Ok(()) => schedule.next += 1,
            Err(FabricError::Again) => break,
            Err(FabricError::Fatal(e)) => return Err(e),
        }
    }

    if !schedule.is_complete() {
        drop(schedule_guard);
        enqueue_if_new(req_idx, req, pending);
    }
    Ok(())
}

/// Post (or resume posting) an eager SEND's single `send_with_immediate`.
pub(crate) fn post_eager(
    fabric: &dyn FabricProvider,
    rails: &[Rail],
    remote_addrs: &[u64],
    req_idx: usize,
    req: &Request,
    ctx: &SendContext,
    pending: &parking_lot::Mutex<crate::pending::PendingQueue>,
) -> Result<(), TransportError> {
    let mut schedule_guard = req.schedule.lock();
    let schedule = schedule_guard.as_mut().expect("eager send always carries a single-segment schedule");
    if schedule.is_complete() {
        return Ok(());
    }
    let seg = schedule.segments[0];
    let imm = encode_write_immediate(ctx.wire_comm_id, req.seq, 1);
    match fabric.send_with_immediate(
        rails[seg.rail as usize].fabric_ep,
        ctx.data_addr + seg.offset,
        seg.length,
        ctx.mr,
        imm,
        remote_addrs[seg.rail as usize],
        req_idx as u64,
    ) {
        Ok(()) => schedule.next = 1,
        Err(FabricError::Again) => {
            drop(schedule_guard);
            enqueue_if_new(req_idx, req, pending);
        }
        Err(FabricError::Fatal(e)) => return Err(e),
    }
    Ok(())
}

fn enqueue_if_new(req_idx: usize, req: &Request, pending: &parking_lot::Mutex<crate::pending::PendingQueue>) {
    let already = req.queued.load(Ordering::Acquire);
    if pending.lock().try_enqueue(req_idx, already) {
        req.queued.store(true, Ordering::Release);
    }
}

/// Drain every rail's CQ in bounded batches, dispatch each completion,
/// drain the error queues, then walk the pending-request queue
/// front-to-back until the first renewed `EAGAIN`.
pub fn progress(fabric: &dyn FabricProvider, endpoint: &Endpoint, cq_read_count: usize) -> Result<(), TransportError> {
    for rail in &endpoint.rails {
        for entry in fabric.cq_read(rail.cq, cq_read_count) {
            match entry.kind {
                CompletionKind::Send => dispatch_send(endpoint, entry.ctx as usize)?,
                CompletionKind::Recv => match entry.immediate_data {
                    Some(imm) => dispatch_eager(fabric, endpoint, rail, entry.ctx as usize, entry.len, imm)?,
                    None => dispatch_unsolicited_recv(fabric, endpoint, rail, entry.ctx as usize, entry.len)?,
                },
                CompletionKind::RemoteWrite => {
                    let imm = entry
                        .immediate_data
                        .ok_or_else(|| TransportError::Protocol("remote-write completion missing immediate data".into()))?;
                    dispatch_remote_write(endpoint, imm, entry.len)?;
                }
                CompletionKind::Write => dispatch_write(endpoint, entry.ctx as usize, entry.len)?,
                CompletionKind::Read => dispatch_read(endpoint, entry.ctx as usize, entry.len)?,
            }
        }

        for err in fabric.cq_readerr(rail.cq) {
            if let Some(imm) = err.immediate_data {
                let (comm_id, seq, _) = decode_write_immediate(imm);
                if let Some(idx) = endpoint.recv_index.lock().get(&(comm_id, seq)).copied() {
                    let requests = endpoint.requests.lock();
                    if let Some(req) = requests.get(idx) {
                        req.fail(TransportError::Protocol(format!(
                            "remote write failed (errno {}, prov_errno {})",
                            err.errno, err.prov_errno
                        )));
                    }
                }
            } else {
                let requests = endpoint.requests.lock();
                if let Some(req) = requests.get(err.ctx as usize) {
                    req.fail(TransportError::Remote(format!(
                        "operation failed (errno {}, prov_errno {})",
                        err.errno, err.prov_errno
                    )));
                }
            }
        }
    }

    drain_pending(fabric, endpoint)
}

fn dispatch_send(endpoint: &Endpoint, req_idx: usize) -> Result<(), TransportError> {
    let requests = endpoint.requests.lock();
    let Some(req) = requests.get(req_idx) else { return Ok(()) };
    match req.kind {
        RequestKind::Send => {
            req.record_completion(0);
        }
        RequestKind::SendCtrl => {
            if req.record_completion(0) {
                bump_parent(&requests, req, 0);
                endpoint.scratch.lock().remove(&req_idx);
            }
        }
        // CONN/CONN_RESP sends are drained directly by `crate::handshake`
        // on rail 0; they never reach this dispatcher.
        _ => {}
    }
    Ok(())
}

fn dispatch_unsolicited_recv(
    fabric: &dyn FabricProvider,
    endpoint: &Endpoint,
    rail: &Rail,
    slot_idx: usize,
    len: usize,
) -> Result<(), TransportError> {
    let payload = rail.bounce.lock().read_slot(slot_idx, len);
    match peek_tag(&payload)? {
        MessageTag::Ctrl => dispatch_ctrl(fabric, endpoint, &payload)?,
        // CONN/CONN_RESP arrive on rail 0's scratch-backed recv posted by
        // `crate::handshake`, never through the bounce pool.
        MessageTag::Conn | MessageTag::ConnResp => {
            return Err(TransportError::Protocol(
                "CONN/CONN_RESP arrived on the bounce-buffer path".into(),
            ))
        }
    }
    rail.bounce.lock().on_consumed(slot_idx, true, fabric, rail.fabric_ep, |i| i as u64)
}

fn dispatch_ctrl(fabric: &dyn FabricProvider, endpoint: &Endpoint, payload: &[u8]) -> Result<(), TransportError> {
    let ctrl = CtrlMessage::from_bytes(payload)?;
    let seq = ctrl.msg_seq_num;
    let local_id = ctrl.remote_comm_id;

    let mut comms = endpoint.comms.lock();
    let Some(Communicator::Send(comm)) = comms.get_mut(&local_id) else {
        return Err(TransportError::Protocol(format!(
            "CTRL for unknown send communicator {local_id}"
        )));
    };

    match comm.message_buffer.retrieve(seq) {
        None => {
            comm.message_buffer.insert(seq, 0, ElementType::Buffer);
            endpoint.ctrl_store.lock().insert((local_id, seq), ctrl);
            Ok(())
        }
        Some((req_idx, ElementType::Request, crate::message_buffer::SlotStatus::InProgress)) => {
            drop(comms);
            resume_staged_send(fabric, endpoint, req_idx, ctrl)
        }
        Some((_, element_type, status)) => Err(TransportError::Protocol(format!(
            "CTRL arrived at an unexpected message buffer state: {element_type:?}/{status:?}"
        ))),
    }
}

/// A SEND request posted before its CTRL arrived (the normal, non-racing
/// case of spec.md §4.6 step 3's "extra completion") now has one: attach
/// its schedule, start posting the rendezvous writes, and record the
/// awaited-CTRL completion.
fn resume_staged_send(
    fabric: &dyn FabricProvider,
    endpoint: &Endpoint,
    req_idx: usize,
    ctrl: CtrlMessage,
) -> Result<(), TransportError> {
    let requests = endpoint.requests.lock();
    let Some(req) = requests.get(req_idx) else { return Ok(()) };
    let staged = req
        .staged_send
        .lock()
        .take()
        .ok_or_else(|| TransportError::Protocol("staged send missing its data pointer".into()))?;

    // The schedule was already attached at `send()` time (it only
    // depends on the local message size); only the remote buffer
    // coordinates were waiting on this CTRL.
    let ctx = SendContext {
        wire_comm_id: ctrl.remote_comm_id,
        data_addr: staged.data_addr,
        mr: staged.mr,
        eager: false,
        ctrl: Some(ctrl),
    };
    *req.send_ctx.lock() = Some(ctx.clone());
    // The CTRL arrival itself is the "extra" completion `send()` credited
    // against `total_compls` for a request that had to wait for one.
    req.record_completion(0);

    let remote_addrs = {
        let comms = endpoint.comms.lock();
        match comms.get(&req.comm_id) {
            Some(Communicator::Send(c)) => c.remote_addrs.clone(),
            _ => return Err(TransportError::Protocol("staged send's owning communicator vanished".into())),
        }
    };

    post_write_segments(fabric, &endpoint.rails, &remote_addrs, req_idx, req, &ctx, &endpoint.pending)
}

fn dispatch_eager(
    fabric: &dyn FabricProvider,
    endpoint: &Endpoint,
    rail: &Rail,
    slot_idx: usize,
    len: usize,
    imm: u32,
) -> Result<(), TransportError> {
    let payload = rail.bounce.lock().read_slot(slot_idx, len);
    let (comm_id, seq, _segs) = decode_write_immediate(imm);

    if let Some(recvsegms_idx) = endpoint.recv_index.lock().get(&(comm_id, seq)).copied() {
        let requests = endpoint.requests.lock();
        if let Some(req) = requests.get(recvsegms_idx) {
            if let Some((addr, cap)) = *req.recv_dest.lock() {
                if !payload.is_empty() {
                    // SAFETY: `addr`/`cap` were supplied by the matching
                    // `irecv` and remain valid for its lifetime.
                    unsafe {
                        std::ptr::copy_nonoverlapping(payload.as_ptr(), addr as *mut u8, payload.len().min(cap));
                    }
                }
            }
            // An eager arrival always completes a `RecvSegms` in exactly
            // one delivery, whether or not the request was originally
            // expecting a striped rendezvous.
            req.record_segment(1);
            if req.record_completion(payload.len()) {
                bump_parent(&requests, req, payload.len());
            }
        }
    } else {
        // The matching `irecv` hasn't been posted yet; stash the payload
        // for it to pick up from `eager_store` when it is.
        endpoint.eager_store.lock().insert((comm_id, seq), payload);
    }

    rail.bounce.lock().on_consumed(slot_idx, true, fabric, rail.fabric_ep, |i| i as u64)
}

fn dispatch_remote_write(endpoint: &Endpoint, imm: u32, len: usize) -> Result<(), TransportError> {
    let (comm_id, seq, segs) = decode_write_immediate(imm);
    let Some(recvsegms_idx) = endpoint.recv_index.lock().get(&(comm_id, seq)).copied() else {
        return Err(TransportError::Protocol(format!(
            "remote write for unknown (comm {comm_id}, seq {seq})"
        )));
    };
    let requests = endpoint.requests.lock();
    let Some(req) = requests.get(recvsegms_idx) else { return Ok(()) };
    // `record_segment` fixes `total_compls` to the real segment count on
    // the first arrival; `record_completion` must still run on every
    // arrival to accumulate bytes across all of them.
    req.record_segment(segs);
    if req.record_completion(len) {
        bump_parent(&requests, req, req.size());
    }
    Ok(())
}

fn dispatch_write(endpoint: &Endpoint, req_idx: usize, len: usize) -> Result<(), TransportError> {
    let requests = endpoint.requests.lock();
    if let Some(req) = requests.get(req_idx) {
        req.record_completion(len);
    }
    Ok(())
}

fn dispatch_read(endpoint: &Endpoint, req_idx: usize, len: usize) -> Result<(), TransportError> {
    let requests = endpoint.requests.lock();
    if let Some(req) = requests.get(req_idx) {
        if req.record_completion(len) {
            bump_parent(&requests, req, len);
        }
    }
    Ok(())
}

/// Retry a staged/partially-posted SEND's remaining segments. Returns
/// `true` once nothing is left to retry (fully posted, or the owning
/// communicator is gone), `false` if it hit `EAGAIN` again and must stay
/// at the front of the queue.
fn retry_send(fabric: &dyn FabricProvider, endpoint: &Endpoint, req_idx: usize, req: &Request) -> Result<bool, TransportError> {
    let Some(ctx) = req.send_ctx.lock().clone() else {
        // Still waiting on a CTRL that hasn't arrived: nothing to retry.
        return Ok(false);
    };

    let remote_addrs: Vec<u64> = {
        let comms = endpoint.comms.lock();
        match comms.get(&req.comm_id) {
            Some(Communicator::Send(c)) => c.remote_addrs.clone(),
            _ => Vec::new(),
        }
    };
    if remote_addrs.is_empty() {
        return Ok(true);
    }

    let was_incomplete = req.schedule.lock().as_ref().map(|s| !s.is_complete()).unwrap_or(false);
    if !was_incomplete {
        return Ok(true);
    }

    if ctx.eager {
        post_eager(fabric, &endpoint.rails, &remote_addrs, req_idx, req, &ctx, &endpoint.pending)?;
    } else {
        post_write_segments(fabric, &endpoint.rails, &remote_addrs, req_idx, req, &ctx, &endpoint.pending)?;
    }
    Ok(req.schedule.lock().as_ref().map(|s| s.is_complete()).unwrap_or(true))
}

/// Retry a flush read that hit `EAGAIN` on its first attempt, using the
/// exact arguments `crate::protocol::iflush` stashed in `req.flush_ctx`.
fn retry_flush(fabric: &dyn FabricProvider, endpoint: &Endpoint, req_idx: usize, req: &Request) -> Result<bool, TransportError> {
    let Some(ctx) = *req.flush_ctx.lock() else { return Ok(true) };
    let remote_addr0 = {
        let comms = endpoint.comms.lock();
        match comms.get(&req.comm_id) {
            Some(Communicator::Receive(c)) => c.remote_addrs.first().copied(),
            _ => None,
        }
    };
    let Some(remote_addr0) = remote_addr0 else { return Ok(true) };
    let rail0_ep = endpoint.rails[0].fabric_ep;
    match fabric.read(
        rail0_ep,
        ctx.local_addr,
        ctx.local_len,
        ctx.local_mr,
        remote_addr0,
        ctx.remote_addr,
        ctx.remote_key,
        req_idx as u64,
    ) {
        Ok(()) => Ok(true),
        Err(FabricError::Again) => Ok(false),
        Err(FabricError::Fatal(e)) => Err(e),
    }
}

/// Retry a RECV's CTRL reply that hit `EAGAIN` on its first post (spec.md
/// §4.7 step 5). The message bytes live in `endpoint.scratch` exactly as
/// `crate::protocol::irecv` left them; nothing else about the post needs
/// to be recomputed.
fn retry_send_ctrl(fabric: &dyn FabricProvider, endpoint: &Endpoint, req_idx: usize, req: &Request) -> Result<bool, TransportError> {
    let addr_len = endpoint.scratch.lock().get(&req_idx).map(|b| (b.as_ptr() as usize, b.len()));
    let Some((addr, len)) = addr_len else {
        // Already sent and cleaned up by `dispatch_send`.
        return Ok(true);
    };
    let remote_addr0 = {
        let comms = endpoint.comms.lock();
        match comms.get(&req.comm_id) {
            Some(Communicator::Receive(c)) => c.remote_addrs.first().copied(),
            _ => None,
        }
    };
    let Some(remote_addr0) = remote_addr0 else { return Ok(true) };
    let rail0_ep = endpoint.rails[0].fabric_ep;
    match fabric.send(rail0_ep, addr, len, MrHandle(0), remote_addr0, req_idx as u64) {
        Ok(()) => Ok(true),
        Err(FabricError::Again) => Ok(false),
        Err(FabricError::Fatal(e)) => Err(e),
    }
}

fn drain_pending(fabric: &dyn FabricProvider, endpoint: &Endpoint) -> Result<(), TransportError> {
    loop {
        let Some(req_idx) = endpoint.pending.lock().front() else { break };
        let requests = endpoint.requests.lock();
        let Some(req) = requests.get(req_idx) else {
            drop(requests);
            endpoint.pending.lock().pop_front();
            continue;
        };

        let resolved = match req.kind {
            RequestKind::Send => retry_send(fabric, endpoint, req_idx, req)?,
            RequestKind::SendCtrl => retry_send_ctrl(fabric, endpoint, req_idx, req)?,
            RequestKind::Flush => retry_flush(fabric, endpoint, req_idx, req)?,
            // Nothing else is ever enqueued here; drop defensively.
            _ => true,
        };
        drop(requests);

        if !resolved {
            // `retry_*` already re-enqueued at the front on renewed
            // `EAGAIN` (it was never popped); stop the drain here per
            // spec.md §4.4.
            break;
        }
        endpoint.pending.lock().pop_front();
        if let Some(req) = endpoint.requests.lock().get(req_idx) {
            req.queued.store(false, Ordering::Release);
        }
    }
    Ok(())
}
