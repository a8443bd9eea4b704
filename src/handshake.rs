//! # Connection Handshake
//!
//! The three-way CONN / CONN_RESP exchange of spec.md §4.5. `connect` and
//! `accept` are non-blocking: each call performs one round of CQ progress
//! on rail 0, advances the handshake at most one stage, and returns either
//! a terminal communicator or `None` ("call again"). In-progress attempts
//! live in [`crate::endpoint::Endpoint::connects`] /
//! [`crate::endpoint::Endpoint::accepts`], keyed by the listen
//! communicator id, since unlike a finished communicator they have no
//! local id of their own yet.
//!
//! CONN/CONN_RESP are exchanged as plain two-sided messages on rail 0
//! rather than through the shared bounce pool — simpler to reason about
//! for a one-shot exchange, and noted as a deliberate simplification in
//! `DESIGN.md`.

use crate::bounce::FlushBuffer;
use crate::comm::{Communicator, ReceiveComm, SendComm, Stage};
use crate::endpoint::{Device, Endpoint};
use crate::error::TransportError;
use crate::fabric::{CompletionKind, FabricError, MrHandle};
use crate::message_buffer::MessageBuffer;
use crate::request::{Request, RequestKind};
use crate::wire::{ConnMessage, EndpointName, MessageTag};

/// What `listen()` hands the caller to pass to the remote peer's
/// `connect()` (spec.md §6).
#[derive(Debug, Clone)]
pub struct ConnectHandle {
    pub listen_comm_id: u32,
    pub rail0_name: EndpointName,
}

fn post_scratch_recv(
    endpoint: &Endpoint,
    device: &Device,
    ep: crate::fabric::EndpointHandle,
    req_idx: usize,
    len: usize,
) -> Result<(), TransportError> {
    let mut buf = vec![0u8; len];
    let addr = buf.as_mut_ptr() as usize;
    endpoint.scratch.lock().insert(req_idx, buf);
    match device.fabric.recv(ep, addr, len, MrHandle(0), req_idx as u64) {
        Ok(()) => Ok(()),
        Err(FabricError::Again) => Ok(()), // retried by the caller's next CQ drain
        Err(FabricError::Fatal(e)) => Err(e),
    }
}

/// `listen(device)`: allocate a listen communicator, pre-post its CONN
/// receive, and return the handle to hand to the remote peer.
pub fn listen(device: &Device) -> Result<ConnectHandle, TransportError> {
    let endpoint = device.acquire_endpoint()?;
    let local_comm_id = endpoint.comm_ids.lock().alloc()?;
    let rail0_ep = endpoint.rails[0].fabric_ep;
    let rail0_name = device.fabric.get_ep_name(rail0_ep)?;

    let req_idx = endpoint
        .requests
        .lock()
        .insert(Request::new(RequestKind::RecvConn, local_comm_id, 0, 1, None))?;
    post_scratch_recv(&endpoint, device, rail0_ep, req_idx, ConnMessage::WIRE_SIZE)?;

    endpoint.comms.lock().insert(
        local_comm_id,
        Communicator::Listen(crate::comm::ListenComm {
            local_comm_id,
            rail0_ep,
            conn_recv_req: req_idx,
        }),
    );

    Ok(ConnectHandle {
        listen_comm_id: local_comm_id,
        rail0_name,
    })
}

/// `connect(device, handle)`: advance (or start) the sender side of the
/// handshake. Returns `Some(local_comm_id)` once `Stage::Connected` is
/// reached; the finished [`SendComm`] is moved into `endpoint.comms`
/// under that id.
pub fn connect(device: &Device, handle: &ConnectHandle) -> Result<Option<u32>, TransportError> {
    // Only the call that creates the in-progress attempt takes a fresh
    // endpoint reference (on behalf of the communicator it will become);
    // every poll after that reuses the same endpoint without incrementing
    // its refcount again, since nothing would ever balance that.
    let endpoint = match device.endpoint() {
        Ok(ep) => ep,
        Err(_) => device.acquire_endpoint()?,
    };
    let mut connects = endpoint.connects.lock();

    if !connects.contains_key(&handle.listen_comm_id) {
        let num_rails = endpoint.num_rails();
        let mut remote_addrs = Vec::with_capacity(num_rails as usize);
        remote_addrs.push(device.fabric.av_insert(endpoint.rails[0].fabric_ep, &handle.rail0_name)?);
        let local_comm_id = endpoint.comm_ids.lock().alloc()?;

        let comm = SendComm {
            local_comm_id,
            remote_comm_id: handle.listen_comm_id,
            remote_addrs,
            message_buffer: MessageBuffer::new(),
            conn: None,
            stage: Stage::CreateStart,
            pending_req: None,
            connected: false,
            next_seq: 0,
            num_inflight_reqs: 0,
        };
        connects.insert(handle.listen_comm_id, comm);
    }

    let comm = connects.get_mut(&handle.listen_comm_id).unwrap();
    let rail0_ep = endpoint.rails[0].fabric_ep;

    match comm.stage {
        Stage::CreateStart => {
            let names: Vec<EndpointName> = endpoint
                .rails
                .iter()
                .map(|r| device.fabric.get_ep_name(r.fabric_ep))
                .collect::<Result<_, _>>()?;
            let msg = ConnMessage::new(MessageTag::Conn, comm.local_comm_id, handle.listen_comm_id, &names)?;
            let mut bytes = msg.to_bytes();
            let addr = bytes.as_mut_ptr() as usize;
            let len = bytes.len();
            let req_idx = endpoint
                .requests
                .lock()
                .insert(Request::new(RequestKind::SendConn, comm.local_comm_id, 0, 1, None))?;
            endpoint.scratch.lock().insert(req_idx, bytes);
            comm.conn = Some(msg);
            match device
                .fabric
                .send(rail0_ep, addr, len, MrHandle(0), comm.remote_addrs[0], req_idx as u64)
            {
                Ok(()) => {
                    comm.pending_req = Some(req_idx);
                    comm.stage = Stage::ConnReqPending;
                }
                Err(FabricError::Again) => comm.pending_req = Some(req_idx),
                Err(FabricError::Fatal(e)) => return Err(e),
            }
            Ok(None)
        }
        Stage::ConnReqPending => {
            let cq = endpoint.rails[0].cq;
            for entry in device.fabric.cq_read(cq, 8) {
                if entry.ctx == comm.pending_req.unwrap_or(usize::MAX) as u64 && entry.kind == CompletionKind::Send {
                    endpoint.scratch.lock().remove(&(entry.ctx as usize));
                    let req_idx = endpoint
                        .requests
                        .lock()
                        .insert(Request::new(RequestKind::RecvConnResp, u32::MAX, 0, 1, None))?;
                    post_scratch_recv(&endpoint, device, rail0_ep, req_idx, ConnMessage::WIRE_SIZE)?;
                    comm.pending_req = Some(req_idx);
                    comm.stage = Stage::RecvConn;
                }
            }
            Ok(None)
        }
        Stage::RecvConn => {
            let cq = endpoint.rails[0].cq;
            let mut arrived = None;
            for entry in device.fabric.cq_read(cq, 8) {
                if entry.kind == CompletionKind::Recv && entry.ctx == comm.pending_req.unwrap_or(usize::MAX) as u64 {
                    arrived = Some(entry.ctx as usize);
                }
            }
            if let Some(req_idx) = arrived {
                let bytes = endpoint.scratch.lock().remove(&req_idx).unwrap();
                let resp = ConnMessage::from_bytes(&bytes)?;
                if resp.tag != MessageTag::ConnResp {
                    return Err(TransportError::Protocol("expected CONN_RESP".into()));
                }
                for name in &resp.rail_names()[1..] {
                    comm.remote_addrs.push(device.fabric.av_insert(rail0_ep, name)?);
                }
                comm.remote_comm_id = resp.local_comm_id;
                comm.stage = Stage::Connected;
                comm.connected = true;
            }
            Ok(None)
        }
        Stage::Connected => {
            let comm = connects.remove(&handle.listen_comm_id).unwrap();
            let local_comm_id = comm.local_comm_id;
            endpoint.comms.lock().insert(local_comm_id, Communicator::Send(comm));
            Ok(Some(local_comm_id))
        }
        Stage::SendConn | Stage::ConnRespReqPending => unreachable!("sender never visits receiver-only stages"),
    }
}

/// `accept(device, listen_comm_id)`: advance (or start) the receiver side.
/// Returns `Some(local_comm_id)` once connected.
pub fn accept(device: &Device, listen_comm_id: u32) -> Result<Option<u32>, TransportError> {
    let endpoint = device.endpoint()?;
    let comms = endpoint.comms.lock();
    let listen = match comms.get(&listen_comm_id) {
        Some(Communicator::Listen(l)) => l,
        _ => return Err(TransportError::InvalidArgument("not a listen communicator".into())),
    };
    let rail0_ep = listen.rail0_ep;
    let conn_recv_req = listen.conn_recv_req;
    drop(comms);

    let mut accepts = endpoint.accepts.lock();

    if !accepts.contains_key(&listen_comm_id) {
        let cq = endpoint.rails[0].cq;
        let mut arrived = None;
        for entry in device.fabric.cq_read(cq, 8) {
            if entry.kind == CompletionKind::Recv && entry.ctx == conn_recv_req as u64 {
                arrived = Some(conn_recv_req);
            }
        }
        let Some(req_idx) = arrived else { return Ok(None) };
        let bytes = endpoint.scratch.lock().remove(&req_idx).unwrap();
        let conn = ConnMessage::from_bytes(&bytes)?;

        let mut remote_addrs = Vec::with_capacity(conn.num_rails as usize);
        for name in conn.rail_names() {
            remote_addrs.push(device.fabric.av_insert(rail0_ep, name)?);
        }
        let local_comm_id = endpoint.comm_ids.lock().alloc()?;

        // spec.md §4.5, CONN_REQ_PENDING: allocate the flush buffer now if
        // this endpoint's fabric supports GPUDirect RDMA and the operator
        // hasn't disabled the flush path outright.
        let flush_buffer = if endpoint.support_gdr && !device.config.gdr_flush_disable {
            Some(FlushBuffer::new(device.fabric.as_ref(), rail0_ep)?)
        } else {
            None
        };

        let comm = ReceiveComm {
            local_comm_id,
            remote_comm_id: conn.local_comm_id,
            remote_addrs,
            message_buffer: MessageBuffer::new(),
            stage: Stage::ConnReqPending,
            pending_req: None,
            connected: false,
            next_seq: 0,
            num_inflight_reqs: 0,
            flush_buffer,
        };
        accepts.insert(listen_comm_id, comm);

        post_scratch_recv(&endpoint, device, rail0_ep, conn_recv_req, ConnMessage::WIRE_SIZE)?;
    }

    let comm = accepts.get_mut(&listen_comm_id).unwrap();

    match comm.stage {
        Stage::ConnReqPending => {
            let names: Vec<EndpointName> = endpoint
                .rails
                .iter()
                .map(|r| device.fabric.get_ep_name(r.fabric_ep))
                .collect::<Result<_, _>>()?;
            let msg = ConnMessage::new(MessageTag::ConnResp, comm.local_comm_id, comm.remote_comm_id, &names)?;
            let mut bytes = msg.to_bytes();
            let addr = bytes.as_mut_ptr() as usize;
            let len = bytes.len();
            let req_idx = endpoint
                .requests
                .lock()
                .insert(Request::new(RequestKind::SendConnResp, comm.local_comm_id, 0, 1, None))?;
            endpoint.scratch.lock().insert(req_idx, bytes);
            match device
                .fabric
                .send(rail0_ep, addr, len, MrHandle(0), comm.remote_addrs[0], req_idx as u64)
            {
                Ok(()) => {
                    comm.pending_req = Some(req_idx);
                    comm.stage = Stage::ConnRespReqPending;
                }
                Err(FabricError::Again) => comm.pending_req = Some(req_idx),
                Err(FabricError::Fatal(e)) => return Err(e),
            }
            Ok(None)
        }
        Stage::ConnRespReqPending => {
            let cq = endpoint.rails[0].cq;
            let mut done = false;
            for entry in device.fabric.cq_read(cq, 8) {
                if entry.kind == CompletionKind::Send && entry.ctx == comm.pending_req.unwrap_or(usize::MAX) as u64 {
                    done = true;
                }
            }
            if done {
                endpoint.scratch.lock().remove(&comm.pending_req.unwrap());
                comm.stage = Stage::Connected;
                comm.connected = true;
            }
            Ok(None)
        }
        Stage::Connected => {
            let comm = accepts.remove(&listen_comm_id).unwrap();
            let local_comm_id = comm.local_comm_id;
            // spec.md §4.5's CONN_RESP_REQ_PENDING row: the finished
            // receive-comm takes its own reference on top of the
            // listener's, released by `close_recv`.
            endpoint.incref();
            endpoint.comms.lock().insert(local_comm_id, Communicator::Receive(comm));
            Ok(Some(local_comm_id))
        }
        Stage::CreateStart | Stage::SendConn | Stage::RecvConn => {
            unreachable!("receiver never visits sender-only stages")
        }
    }
}
