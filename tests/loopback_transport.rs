//! End-to-end exercises of the public API surface over
//! [`LoopbackFabric`], one file per scenario family rather than one test
//! per module (the module-level `#[cfg(test)]` blocks already cover unit
//! behavior; these drive `listen`/`connect`/`accept`/`send`/`irecv`/
//! `test`/`iflush`/`close_*` together the way an embedding collective
//! library would).

use std::sync::Arc;

use rdma_rail_transport::api::{close_listen, close_recv, close_send, dereg_mr, reg_mr};
use rdma_rail_transport::config::RdmaConfig;
use rdma_rail_transport::fabric::loopback::LoopbackFabric;
use rdma_rail_transport::fabric::{MemType, MrHandle};
use rdma_rail_transport::handshake::{accept, connect, listen, ConnectHandle};
use rdma_rail_transport::protocol::{iflush, irecv, send, test};
use rdma_rail_transport::Device;

fn run_handshake(sender: &Device, receiver: &Device, handle: &ConnectHandle) -> (u32, u32) {
    let mut send_comm = None;
    let mut recv_comm = None;
    for _ in 0..64 {
        if send_comm.is_none() {
            send_comm = connect(sender, handle).unwrap();
        }
        if recv_comm.is_none() {
            recv_comm = accept(receiver, handle.listen_comm_id).unwrap();
        }
        if send_comm.is_some() && recv_comm.is_some() {
            break;
        }
    }
    (send_comm.unwrap(), recv_comm.unwrap())
}

fn connected_pair(num_rails: u32, config: RdmaConfig) -> (Device, Device, ConnectHandle, u32, u32) {
    let fabric = Arc::new(LoopbackFabric::new(u32::MAX));
    let sender = Device::new(fabric.clone(), num_rails, config.clone());
    let receiver = Device::new(fabric, num_rails, config);
    let handle = listen(&receiver).unwrap();
    let (send_comm, recv_comm) = run_handshake(&sender, &receiver, &handle);
    (sender, receiver, handle, send_comm, recv_comm)
}

fn reg(device: &Device, buf: &mut [u8]) -> MrHandle {
    reg_mr(device, buf.as_mut_ptr() as usize, buf.len(), MemType::Host).unwrap()
}

fn drive_to_completion(sender: &Device, send_req: usize, receiver: &Device, recv_req: usize) -> usize {
    let mut send_done = false;
    let mut recv_size = None;
    for _ in 0..128 {
        if !send_done {
            send_done = test(sender, send_req).unwrap().0;
        }
        if recv_size.is_none() {
            let (done, size) = test(receiver, recv_req).unwrap();
            if done {
                recv_size = Some(size);
            }
        }
        if send_done && recv_size.is_some() {
            break;
        }
    }
    assert!(send_done, "send never completed");
    recv_size.expect("recv never completed")
}

#[test]
fn eager_zero_byte_message_round_trips() {
    let (sender, receiver, _handle, send_comm, recv_comm) = connected_pair(1, RdmaConfig::default());
    let mut src: Vec<u8> = Vec::new();
    let mut dst: Vec<u8> = Vec::new();
    let src_mr = MrHandle(0);
    let dst_mr = MrHandle(0);

    let recv_req = irecv(&receiver, recv_comm, dst.as_mut_ptr() as usize, 0, 0, dst_mr).unwrap().unwrap();
    let send_req = send(&sender, send_comm, src.as_ptr() as usize, 0, 0, src_mr).unwrap().unwrap();

    let size = drive_to_completion(&sender, send_req, &receiver, recv_req);
    assert_eq!(size, 0);
    assert!(src.is_empty() && dst.is_empty());
}

#[test]
fn rendezvous_large_message_across_multiple_rails() {
    let mut cfg = RdmaConfig::default();
    cfg.eager_max_size = 256;
    cfg.round_robin_threshold = 4096;
    let (sender, receiver, _handle, send_comm, recv_comm) = connected_pair(4, cfg);

    let mut src = vec![0u8; 1 << 20];
    for (i, b) in src.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let mut dst = vec![0u8; src.len()];
    let src_mr = reg(&sender, &mut src);
    let dst_mr = reg(&receiver, &mut dst);

    let recv_req = irecv(&receiver, recv_comm, dst.as_mut_ptr() as usize, dst.len(), 0, dst_mr).unwrap().unwrap();
    let send_req = send(&sender, send_comm, src.as_ptr() as usize, src.len(), 0, src_mr).unwrap().unwrap();

    let size = drive_to_completion(&sender, send_req, &receiver, recv_req);
    assert_eq!(size, src.len());
    assert_eq!(dst, src);
}

#[test]
fn out_of_order_ctrl_arrival_is_reconciled() {
    // The receiver posts several `irecv`s before the sender posts
    // anything, so every CTRL this generates has to chase a `send` that
    // hasn't happened yet, then the sends arrive out of the order the
    // receives were posted in.
    let mut cfg = RdmaConfig::default();
    cfg.eager_max_size = 32;
    cfg.round_robin_threshold = 4096;
    let (sender, receiver, _handle, send_comm, recv_comm) = connected_pair(1, cfg);

    let mut srcs: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8; 512]).collect();
    let mut dsts: Vec<Vec<u8>> = (0..4).map(|_| vec![0u8; 512]).collect();
    let src_mrs: Vec<MrHandle> = srcs.iter_mut().map(|b| reg(&sender, b)).collect();
    let dst_mrs: Vec<MrHandle> = dsts.iter_mut().map(|b| reg(&receiver, b)).collect();

    let recv_reqs: Vec<usize> = dsts
        .iter_mut()
        .zip(&dst_mrs)
        .map(|(dst, mr)| irecv(&receiver, recv_comm, dst.as_mut_ptr() as usize, dst.len(), 0, *mr).unwrap().unwrap())
        .collect();

    // Post the matching sends in reverse order.
    let send_reqs: Vec<usize> = srcs
        .iter()
        .zip(&src_mrs)
        .rev()
        .map(|(src, mr)| send(&sender, send_comm, src.as_ptr() as usize, src.len(), 0, *mr).unwrap().unwrap())
        .collect();

    for (send_req, recv_req) in send_reqs.iter().zip(recv_reqs.iter()).rev() {
        drive_to_completion(&sender, *send_req, &receiver, *recv_req);
    }
    for (src, dst) in srcs.iter().zip(dsts.iter()) {
        assert_eq!(src, dst);
    }
}

#[test]
fn eagain_backpressure_resumes_once_the_fabric_drains() {
    // A fabric that saturates after one in-flight write forces the
    // rendezvous segments of a multi-segment message through the
    // pending-request queue.
    let mut cfg = RdmaConfig::default();
    cfg.eager_max_size = 64;
    cfg.round_robin_threshold = 128;
    let fabric = Arc::new(LoopbackFabric::new(1));
    let sender = Device::new(fabric.clone(), 2, cfg.clone());
    let receiver = Device::new(fabric, 2, cfg);
    let handle = listen(&receiver).unwrap();
    let (send_comm, recv_comm) = run_handshake(&sender, &receiver, &handle);

    let mut src = vec![9u8; 2048];
    let mut dst = vec![0u8; src.len()];
    let src_mr = reg(&sender, &mut src);
    let dst_mr = reg(&receiver, &mut dst);

    let recv_req = irecv(&receiver, recv_comm, dst.as_mut_ptr() as usize, dst.len(), 0, dst_mr).unwrap().unwrap();
    let send_req = send(&sender, send_comm, src.as_ptr() as usize, src.len(), 0, src_mr).unwrap().unwrap();

    let size = drive_to_completion(&sender, send_req, &receiver, recv_req);
    assert_eq!(size, src.len());
    assert_eq!(dst, src);
}

#[test]
fn connect_retries_until_both_sides_observe_connected() {
    let fabric = Arc::new(LoopbackFabric::new(u32::MAX));
    let sender = Device::new(fabric.clone(), 1, RdmaConfig::default());
    let receiver = Device::new(fabric, 1, RdmaConfig::default());
    let handle = listen(&receiver).unwrap();

    // Poll `connect` a few times before `accept` ever runs, exercising
    // the in-progress `connects` map rather than completing in one shot.
    for _ in 0..3 {
        assert!(connect(&sender, &handle).unwrap().is_none());
    }
    let (send_comm, recv_comm) = run_handshake(&sender, &receiver, &handle);
    assert!(send_comm != 0 || recv_comm != 0);
}

#[test]
fn bounce_pool_replenishes_across_many_unsolicited_arrivals() {
    // More in-flight sends than the default bounce pool's minimum posted
    // count, so some of them have to land after a replenish.
    let mut cfg = RdmaConfig::default();
    cfg.min_posted_bounce_buffers = 2;
    cfg.max_posted_bounce_buffers = 4;
    let (sender, receiver, _handle, send_comm, recv_comm) = connected_pair(1, cfg);

    let mut srcs: Vec<Vec<u8>> = (0..8).map(|i| vec![i as u8; 16]).collect();
    let src_mrs: Vec<MrHandle> = srcs.iter_mut().map(|b| reg(&sender, b)).collect();

    // Sends before any matching `irecv`: each one's EAGER payload lands
    // in the bounce pool and must be replenished for the next arrival.
    let send_reqs: Vec<usize> = srcs
        .iter()
        .zip(&src_mrs)
        .map(|(src, mr)| send(&sender, send_comm, src.as_ptr() as usize, src.len(), 0, *mr).unwrap().unwrap())
        .collect();
    for req in &send_reqs {
        for _ in 0..8 {
            if test(&sender, *req).unwrap().0 {
                break;
            }
        }
    }

    let mut dsts: Vec<Vec<u8>> = (0..8).map(|_| vec![0u8; 16]).collect();
    let recv_reqs: Vec<usize> = dsts
        .iter_mut()
        .map(|dst| irecv(&receiver, recv_comm, dst.as_mut_ptr() as usize, dst.len(), 0, MrHandle(0)).unwrap().unwrap())
        .collect();
    for (req, dst) in recv_reqs.iter().zip(srcs.iter()) {
        let mut done = false;
        for _ in 0..8 {
            if test(&receiver, *req).unwrap().0 {
                done = true;
                break;
            }
        }
        assert!(done);
        let _ = dst;
    }
}

#[test]
fn flush_completes_and_close_tears_down_cleanly() {
    let (sender, receiver, handle, send_comm, recv_comm) = connected_pair(1, RdmaConfig::default());
    let mut src = b"flush me".to_vec();
    let mut dst = vec![0u8; src.len()];
    let src_mr = reg(&sender, &mut src);
    let dst_mr = reg(&receiver, &mut dst);

    let recv_req = irecv(&receiver, recv_comm, dst.as_mut_ptr() as usize, dst.len(), 0, dst_mr).unwrap().unwrap();
    let send_req = send(&sender, send_comm, src.as_ptr() as usize, src.len(), 0, src_mr).unwrap().unwrap();
    drive_to_completion(&sender, send_req, &receiver, recv_req);

    // Default config has no flush buffer registered for this receive
    // communicator, so this is a documented no-op rather than an error.
    assert!(iflush(&receiver, recv_comm, dst.as_mut_ptr() as usize, dst.len(), dst_mr).unwrap().is_none());

    dereg_mr(&sender, src_mr).unwrap();
    dereg_mr(&receiver, dst_mr).unwrap();
    close_send(&sender, send_comm).unwrap();
    close_recv(&receiver, recv_comm).unwrap();
    close_listen(&receiver, handle.listen_comm_id).unwrap();
}
