//! # Public API Surface
//!
//! The handful of operations spec.md §6 lists as "exposed upward" that
//! don't already live in a more specific module: memory registration and
//! the three `close_*` calls. `listen`/`connect`/`accept` live in
//! [`crate::handshake`]; `send`/`irecv`/`test`/`iflush` live in
//! [`crate::protocol`].

use crate::comm::Communicator;
use crate::endpoint::Device;
use crate::error::TransportError;
use crate::fabric::{MemType, MrHandle};

pub fn reg_mr(device: &Device, addr: usize, len: usize, mem_type: MemType) -> Result<MrHandle, TransportError> {
    let endpoint = device.endpoint()?;
    device.fabric.reg_mr(endpoint.rails[0].fabric_ep, addr, len, mem_type)
}

pub fn dereg_mr(device: &Device, mr: MrHandle) -> Result<(), TransportError> {
    let endpoint = device.endpoint()?;
    device.fabric.dereg_mr(endpoint.rails[0].fabric_ep, mr)
}

/// `close_send(device, send_comm)`: spec.md §3's cancellation note —
/// refuses while any request is still outstanding.
pub fn close_send(device: &Device, send_comm_id: u32) -> Result<(), TransportError> {
    let endpoint = device.endpoint()?;
    let mut comms = endpoint.comms.lock();
    match comms.get(&send_comm_id) {
        Some(Communicator::Send(c)) if c.num_inflight_reqs > 0 => {
            return Err(TransportError::InvalidArgument(
                "cannot close a send communicator with requests still outstanding".into(),
            ));
        }
        Some(Communicator::Send(_)) => {}
        _ => return Err(TransportError::InvalidArgument("not a send communicator".into())),
    }
    comms.remove(&send_comm_id);
    drop(comms);
    endpoint.comm_ids.lock().free(send_comm_id)?;
    device.release_endpoint();
    Ok(())
}

/// `close_recv(device, recv_comm)`: symmetric to [`close_send`].
pub fn close_recv(device: &Device, recv_comm_id: u32) -> Result<(), TransportError> {
    let endpoint = device.endpoint()?;
    let mut comms = endpoint.comms.lock();
    match comms.get(&recv_comm_id) {
        Some(Communicator::Receive(c)) if c.num_inflight_reqs > 0 => {
            return Err(TransportError::InvalidArgument(
                "cannot close a receive communicator with requests still outstanding".into(),
            ));
        }
        Some(Communicator::Receive(_)) => {}
        _ => return Err(TransportError::InvalidArgument("not a receive communicator".into())),
    }
    comms.remove(&recv_comm_id);
    drop(comms);
    endpoint.comm_ids.lock().free(recv_comm_id)?;
    device.release_endpoint();
    Ok(())
}

/// `close_listen(device, listen_comm)`: a listener that never accepted a
/// connection still holds one endpoint reference (from `listen`'s
/// `acquire_endpoint`) to release.
pub fn close_listen(device: &Device, listen_comm_id: u32) -> Result<(), TransportError> {
    let endpoint = device.endpoint()?;
    let mut comms = endpoint.comms.lock();
    match comms.get(&listen_comm_id) {
        Some(Communicator::Listen(_)) => {}
        _ => return Err(TransportError::InvalidArgument("not a listen communicator".into())),
    }
    comms.remove(&listen_comm_id);
    drop(comms);
    endpoint.comm_ids.lock().free(listen_comm_id)?;
    device.release_endpoint();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::RdmaConfig;
    use crate::fabric::loopback::LoopbackFabric;
    use crate::handshake::listen;

    #[test]
    fn close_listen_releases_the_endpoint_reference() {
        let fabric = Arc::new(LoopbackFabric::new(u32::MAX));
        let device = Device::new(fabric, 1, RdmaConfig::default());
        let handle = listen(&device).unwrap();
        let endpoint = device.endpoint().unwrap();
        assert_eq!(endpoint.refcount(), 1);
        close_listen(&device, handle.listen_comm_id).unwrap();
        assert_eq!(endpoint.refcount(), 0);
    }

    #[test]
    fn close_send_rejects_unknown_communicator() {
        let fabric = Arc::new(LoopbackFabric::new(u32::MAX));
        let device = Device::new(fabric, 1, RdmaConfig::default());
        // No endpoint created yet on this thread.
        assert!(close_send(&device, 0).is_err());
    }
}
