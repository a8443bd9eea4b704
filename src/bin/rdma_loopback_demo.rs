//! Drives one eager send/receive exchange over [`LoopbackFabric`] end to
//! end, printing each step as it happens. Useful as a smoke test and as a
//! worked example of the call sequence a real NCCL-net plugin would make:
//! `listen`/`connect`/`accept`, `reg_mr`, `irecv`/`send`, `test` until
//! both sides report completion, `iflush`, then the `close_*` trio.

use std::sync::Arc;

use rdma_rail_transport::api::{close_listen, close_recv, close_send, dereg_mr, reg_mr};
use rdma_rail_transport::fabric::loopback::LoopbackFabric;
use rdma_rail_transport::fabric::MemType;
use rdma_rail_transport::handshake::{accept, connect, listen};
use rdma_rail_transport::protocol::{iflush, irecv, send, test};
use rdma_rail_transport::{Device, RdmaConfig};

fn main() -> anyhow::Result<()> {
    rdma_rail_transport::logging::init(tracing::Level::INFO);

    let fabric = Arc::new(LoopbackFabric::new(u32::MAX));
    let config = RdmaConfig::default();
    let sender = Device::new(fabric.clone(), 1, config.clone());
    let receiver = Device::new(fabric, 1, config);

    tracing::info!("listening on the receiver device");
    let handle = listen(&receiver)?;

    tracing::info!("running the CONN/CONN_RESP handshake to completion");
    let (send_comm, recv_comm) = run_handshake(&sender, &receiver, &handle)?;

    let mut src = b"hello over rdma-rail-transport".to_vec();
    let mut dst = vec![0u8; src.len()];
    let src_mr = reg_mr(&sender, src.as_mut_ptr() as usize, src.len(), MemType::Host)?;
    let dst_mr = reg_mr(&receiver, dst.as_mut_ptr() as usize, dst.len(), MemType::Host)?;

    tracing::info!("posting irecv, then send, for {} bytes", src.len());
    let recv_req = irecv(&receiver, recv_comm, dst.as_mut_ptr() as usize, dst.len(), 0, dst_mr)?
        .expect("irecv posts immediately against a fresh message buffer slot");
    let send_req = send(&sender, send_comm, src.as_ptr() as usize, src.len(), 0, src_mr)?
        .expect("send posts immediately against a fresh message buffer slot");

    let mut send_done = false;
    let mut recv_done = false;
    for _ in 0..64 {
        if !send_done {
            send_done = test(&sender, send_req)?.0;
        }
        if !recv_done {
            let (done, size) = test(&receiver, recv_req)?;
            if done {
                recv_done = true;
                tracing::info!("receive completed, {size} bytes landed");
            }
        }
        if send_done && recv_done {
            break;
        }
    }
    assert!(send_done && recv_done, "demo exchange did not complete");
    assert_eq!(dst, src);
    tracing::info!("payload verified: {:?}", String::from_utf8_lossy(&dst));

    if let Some(flush_req) = iflush(&receiver, recv_comm, dst.as_mut_ptr() as usize, dst.len(), dst_mr)? {
        for _ in 0..16 {
            if test(&receiver, flush_req)?.0 {
                break;
            }
        }
        tracing::info!("flush completed");
    }

    dereg_mr(&sender, src_mr)?;
    dereg_mr(&receiver, dst_mr)?;
    close_send(&sender, send_comm)?;
    close_recv(&receiver, recv_comm)?;
    close_listen(&receiver, handle.listen_comm_id)?;

    tracing::info!("demo finished cleanly");
    Ok(())
}

/// `connect`/`accept` are non-blocking, one step per call; spin both
/// sides until each reaches `Connected`, matching how a caller without a
/// blocking wrapper would drive them.
fn run_handshake(
    sender: &Device,
    receiver: &Device,
    handle: &rdma_rail_transport::handshake::ConnectHandle,
) -> anyhow::Result<(u32, u32)> {
    let mut send_comm = None;
    let mut recv_comm = None;
    for _ in 0..64 {
        if send_comm.is_none() {
            send_comm = connect(sender, handle)?;
        }
        if recv_comm.is_none() {
            recv_comm = accept(receiver, handle.listen_comm_id)?;
        }
        if send_comm.is_some() && recv_comm.is_some() {
            break;
        }
    }
    Ok((
        send_comm.ok_or_else(|| anyhow::anyhow!("connect never reached Connected"))?,
        recv_comm.ok_or_else(|| anyhow::anyhow!("accept never reached Connected"))?,
    ))
}
