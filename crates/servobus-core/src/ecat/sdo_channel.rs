//! Adapts [`EcatFabric::xmit_sdo`] to the transport-agnostic [`SdoChannel`]
//! trait, and gives the PVT segment stream a dedicated process-data
//! register pair — the Ethernet-side equivalent of `can::sdo_channel`'s
//! dedicated COB-ID pair, since there's no spare CAN-style 11-bit id space
//! to borrow here.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::sdo::SdoChannel;
use crate::trajectory::wire::{BufferStatus, SEGMENT_LEN};
use crate::trajectory::SegmentChannel;
use crate::transport::EthPort;

use super::EcatFabric;

/// Per-node handle binding an `SdoEngine` to one node's CoE mailbox.
pub struct EcatSdoChannel<P: EthPort + 'static> {
    fabric: Arc<EcatFabric<P>>,
    node_id: u8,
}

impl<P: EthPort + 'static> EcatSdoChannel<P> {
    pub fn new(fabric: Arc<EcatFabric<P>>, node_id: u8) -> Self {
        Self { fabric, node_id }
    }
}

impl<P: EthPort + 'static> SdoChannel for EcatSdoChannel<P> {
    fn transfer(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, Error> {
        let mut frame = [0u8; 8];
        frame[..request.len().min(8)].copy_from_slice(&request[..request.len().min(8)]);
        let reply = self.fabric.xmit_sdo(self.node_id, &frame, timeout)?;
        Ok(reply.to_vec())
    }

    fn supports_block(&self) -> bool {
        false
    }
}

/// Registers reserved for PVT segment transport — chosen well clear of the
/// sync-manager-configured process image range so they never collide with
/// a node's mapped RPDO/TPDO.
pub const PVT_COMMAND_REG: u16 = 0x1600;
pub const PVT_STATUS_REG: u16 = 0x1A80;

/// Binds a [`PvtStreamer`](crate::trajectory::PvtStreamer) to one node's PVT
/// register pair, writing/reading them directly (bypassing both PDO
/// mapping and the CoE mailbox) the same way the CAN side uses a reserved
/// COB-ID pair instead of its general PDO mapping layer.
pub struct EcatSegmentChannel<P: EthPort + 'static> {
    fabric: Arc<EcatFabric<P>>,
    node_id: u8,
}

impl<P: EthPort + 'static> EcatSegmentChannel<P> {
    pub fn new(fabric: Arc<EcatFabric<P>>, node_id: u8) -> Self {
        Self { fabric, node_id }
    }
}

impl<P: EthPort + 'static> SegmentChannel for EcatSegmentChannel<P> {
    fn send_segment(&self, bytes: &[u8; SEGMENT_LEN]) -> Result<(), Error> {
        self.fabric.node_write(self.node_id, PVT_COMMAND_REG, bytes)
    }

    fn read_status(&self) -> Result<BufferStatus, Error> {
        let bytes = self.fabric.node_read(self.node_id, PVT_STATUS_REG, 4)?;
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(BufferStatus::from_u32(word))
    }
}
