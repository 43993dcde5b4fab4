//! Adapts [`CanFabric::xmit_sdo`] to the transport-agnostic [`SdoChannel`]
//! trait, and wires the PVT segment stream onto a pair of dedicated COB-IDs.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::sdo::SdoChannel;
use crate::transport::{CanFrame, CanPort};
use crate::trajectory::wire::{BufferStatus, SEGMENT_LEN};
use crate::trajectory::SegmentChannel;

use super::{CanFabric, CanReceiver};

/// Per-node handle binding an `SdoEngine` to one node's request/response
/// pair on a `CanFabric`.
pub struct CanSdoChannel<P: CanPort + 'static> {
    fabric: Arc<CanFabric<P>>,
    node_id: u8,
}

impl<P: CanPort + 'static> CanSdoChannel<P> {
    pub fn new(fabric: Arc<CanFabric<P>>, node_id: u8) -> Self {
        Self { fabric, node_id }
    }
}

impl<P: CanPort + 'static> SdoChannel for CanSdoChannel<P> {
    fn transfer(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, Error> {
        let mut frame = [0u8; 8];
        frame[..request.len().min(8)].copy_from_slice(&request[..request.len().min(8)]);
        let reply = self.fabric.xmit_sdo(self.node_id, &frame, timeout)?;
        Ok(reply.to_vec())
    }

    fn supports_block(&self) -> bool {
        true
    }
}

/// RPDO4 (host to drive) and TPDO4 (drive to host), reserved here for PVT
/// segment transport so they don't collide with the configurable PDO
/// mapping layer.
pub const PVT_COMMAND_BASE: u32 = 0x500;
pub const PVT_STATUS_BASE: u32 = 0x480;

struct StatusSlot {
    value: Mutex<Option<BufferStatus>>,
    cond: Condvar,
}

impl CanReceiver for StatusSlot {
    fn new_frame(&self, frame: &CanFrame) {
        if frame.len < 4 {
            return;
        }
        let word = u32::from_le_bytes([frame.data[0], frame.data[1], frame.data[2], frame.data[3]]);
        *self.value.lock().unwrap() = Some(BufferStatus::from_u32(word));
        self.cond.notify_all();
    }
}

/// Binds a [`PvtStreamer`](crate::trajectory::PvtStreamer) to one node's PVT
/// COB-ID pair. The drive publishes its status word cyclically on
/// `PVT_STATUS_BASE + node_id`; `read_status` blocks for the next update.
pub struct CanSegmentChannel<P: CanPort + 'static> {
    fabric: Arc<CanFabric<P>>,
    node_id: u8,
    status: Arc<StatusSlot>,
}

impl<P: CanPort + 'static> CanSegmentChannel<P> {
    pub fn new(fabric: Arc<CanFabric<P>>, node_id: u8) -> Self {
        let status = Arc::new(StatusSlot { value: Mutex::new(None), cond: Condvar::new() });
        fabric.enable_receiver(PVT_STATUS_BASE + node_id as u32, status.clone());
        Self { fabric, node_id, status }
    }
}

impl<P: CanPort + 'static> SegmentChannel for CanSegmentChannel<P> {
    fn send_segment(&self, bytes: &[u8; SEGMENT_LEN]) -> Result<(), Error> {
        let frame = CanFrame::data_frame(PVT_COMMAND_BASE + self.node_id as u32, bytes);
        self.fabric.xmit(&frame, Duration::from_millis(50))
    }

    fn read_status(&self) -> Result<BufferStatus, Error> {
        let mut guard = self.status.value.lock().unwrap();
        if guard.is_none() {
            let (g, _) = self.status.cond.wait_timeout(guard, Duration::from_millis(200)).unwrap();
            guard = g;
        }
        guard.ok_or(Error::Transport(crate::error::TransportError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSettings;
    use crate::transport::test_support::LoopbackCan;

    #[test]
    fn segment_channel_reads_cyclically_published_status() {
        let (host, mut node_port) = LoopbackCan::pair();
        let fabric = CanFabric::new(host, NetworkSettings::default());
        fabric.open().unwrap();
        let channel = CanSegmentChannel::new(fabric.clone(), 5);

        node_port.open().unwrap();
        let status = BufferStatus { next_expected: 3, free_slots: 10, error_flags: 0, empty: false };
        let frame = CanFrame::data_frame(PVT_STATUS_BASE + 5, &status.to_u32().to_le_bytes());
        node_port.send(&frame).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let observed = channel.read_status().unwrap();
        assert_eq!(observed, status);
        fabric.close().unwrap();
    }
}
