//! Cyclic/event-driven CAN PDO transmission and receipt, wired onto a
//! `CanFabric` via [`CanFabric::xmit_pdo`] and [`CanPdoReceiver`].

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::pdo::Pdo;
use crate::transport::{CanFrame, CanPort};

use super::{CanFabric, CanReceiver};

impl<P: CanPort + 'static> CanFabric<P> {
    /// Sends `pdo`'s current encoding as a single CAN frame at its COB-ID.
    pub fn xmit_pdo(&self, pdo: &Pdo, timeout: Duration) -> Result<(), Error> {
        let frame = CanFrame::data_frame(pdo.id, &pdo.encode());
        self.xmit(&frame, timeout)
    }
}

/// Adapts a received-PDO COB-ID to [`Pdo::decode`]. Registering one of
/// these via [`CanFabric::enable_receiver`] is what makes an RPDO's bound
/// variables (and its [`PdoReceived`](crate::pdo::PdoReceived) hook) update
/// as frames arrive on the read thread.
pub struct CanPdoReceiver {
    pdo: Arc<Pdo>,
}

impl CanPdoReceiver {
    /// Builds the adapter and registers it on `fabric` for `pdo.id`.
    pub fn register<P: CanPort + 'static>(fabric: &CanFabric<P>, pdo: Arc<Pdo>) -> Arc<Self> {
        let receiver = Arc::new(Self { pdo: pdo.clone() });
        fabric.enable_receiver(pdo.id, receiver.clone());
        receiver
    }
}

impl CanReceiver for CanPdoReceiver {
    fn new_frame(&self, frame: &CanFrame) {
        self.pdo.decode(frame.payload());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSettings;
    use crate::pdo::mapping::PdoMappingEntry;
    use crate::pdo::{PdoDirection, PdoValue};
    use crate::transport::test_support::LoopbackCan;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn xmit_pdo_sends_current_encoding_at_its_cob_id() {
        let (host, mut node_port) = LoopbackCan::pair();
        let fabric = CanFabric::new(host, NetworkSettings::default());
        fabric.open().unwrap();
        node_port.open().unwrap();

        let pdo = Pdo::new(0x200, PdoDirection::Transmit, 64);
        let value = Arc::new(AtomicU32::new(0xAABBCCDD));
        pdo.add_var(
            PdoMappingEntry { index: 0x6041, sub: 0, length_bits: 32 },
            PdoValue::U32(value),
        )
        .unwrap();

        fabric.xmit_pdo(&pdo, Duration::from_millis(50)).unwrap();
        let frame = node_port.recv(Duration::from_millis(200)).unwrap();
        assert_eq!(frame.id, 0x200);
        assert_eq!(frame.payload(), &0xAABBCCDDu32.to_le_bytes());
        fabric.close().unwrap();
    }

    #[test]
    fn registered_receiver_decodes_incoming_frames_into_the_pdo() {
        let (host, mut node_port) = LoopbackCan::pair();
        let fabric = CanFabric::new(host, NetworkSettings::default());
        fabric.open().unwrap();
        node_port.open().unwrap();

        let pdo = Arc::new(Pdo::new(0x180, PdoDirection::Receive, 64));
        let value = Arc::new(AtomicU32::new(0));
        pdo.add_var(
            PdoMappingEntry { index: 0x6040, sub: 0, length_bits: 32 },
            PdoValue::U32(value.clone()),
        )
        .unwrap();
        let _receiver = CanPdoReceiver::register(&fabric, pdo.clone());

        let frame = CanFrame::data_frame(0x180, &0x11223344u32.to_le_bytes());
        node_port.send(&frame).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(value.load(Ordering::SeqCst), 0x11223344);
        fabric.close().unwrap();
    }
}
