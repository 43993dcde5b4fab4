//! Pluggable byte-oriented frame transports.
//!
//! `servobus-core` never touches a socket or a device file directly; a
//! platform crate implements [`CanPort`] and/or [`EthPort`] and hands the
//! engine ownership of the port. Fabrics only ever call through these
//! traits, never reaching into platform-specific details.

use std::time::Duration;

use crate::error::{Error, TransportError};

/// Canonical CAN bit rates the engine knows how to request. Baud changes
/// require the port to be closed first.
pub const CAN_BAUD_TABLE: [u32; 9] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanFrameKind {
    Data,
    Remote,
    Error,
}

/// A single CAN frame, 11- or 29-bit id, up to 8 data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub kind: CanFrameKind,
    pub len: u8,
    pub data: [u8; 8],
    /// Receive timestamp in engine-monotonic milliseconds, if the port
    /// supplies one.
    pub timestamp_ms: Option<u64>,
}

impl CanFrame {
    pub fn data_frame(id: u32, payload: &[u8]) -> Self {
        assert!(payload.len() <= 8, "CAN payload is at most 8 bytes");
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Self {
            id,
            extended: id > 0x7FF,
            kind: CanFrameKind::Data,
            len: payload.len() as u8,
            data,
            timestamp_ms: None,
        }
    }

    pub fn remote(id: u32) -> Self {
        Self {
            id,
            extended: id > 0x7FF,
            kind: CanFrameKind::Remote,
            len: 0,
            data: [0u8; 8],
            timestamp_ms: None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// A single raw Ethernet frame as exchanged with the transport: no link
/// header is stripped, so `bytes` starts at the destination MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthFrame {
    pub bytes: Vec<u8>,
}

pub const ETH_MIN_FRAME_LEN: usize = 60;
pub const ETHERCAT_ETHERTYPE: u16 = 0x88A4;

impl EthFrame {
    /// Builds a frame addressed to the broadcast MAC with the fixed
    /// EtherCAT EtherType, zero-padded to the minimum wire size.
    pub fn new(src_mac: [u8; 6], payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(ETH_MIN_FRAME_LEN.max(14 + payload.len()));
        bytes.extend_from_slice(&[0xFF; 6]);
        bytes.extend_from_slice(&src_mac);
        bytes.extend_from_slice(&ETHERCAT_ETHERTYPE.to_be_bytes());
        bytes.extend_from_slice(payload);
        while bytes.len() < ETH_MIN_FRAME_LEN {
            bytes.push(0);
        }
        Self { bytes }
    }

    pub fn ethertype(&self) -> Option<u16> {
        if self.bytes.len() < 14 {
            return None;
        }
        Some(u16::from_be_bytes([self.bytes[12], self.bytes[13]]))
    }

    pub fn payload(&self) -> &[u8] {
        if self.bytes.len() < 14 {
            &[]
        } else {
            &self.bytes[14..]
        }
    }
}

/// Common transport lifecycle, mirrored by both CAN and Ethernet ports.
pub trait PortLifecycle {
    fn open(&mut self) -> Result<(), Error>;
    fn close(&mut self) -> Result<(), Error>;
    fn is_open(&self) -> bool;
}

/// One CAN frame in, one CAN frame out.
pub trait CanPort: PortLifecycle + Send {
    fn send(&mut self, frame: &CanFrame) -> Result<(), Error>;
    fn recv(&mut self, timeout: Duration) -> Result<CanFrame, Error>;

    /// Requests a new bit rate. The port must be closed; implementations
    /// should return `TransportError::AlreadyOpen` otherwise.
    fn set_baud(&mut self, bps: u32) -> Result<(), Error> {
        if self.is_open() {
            return Err(Error::Transport(TransportError::AlreadyOpen));
        }
        if !CAN_BAUD_TABLE.contains(&bps) {
            return Err(Error::Transport(TransportError::BadParam));
        }
        Ok(())
    }

    fn baud(&self) -> u32;
}

/// One Ethernet frame in, one Ethernet frame out.
pub trait EthPort: PortLifecycle + Send {
    fn send(&mut self, frame: &EthFrame) -> Result<(), Error>;
    fn recv(&mut self, timeout: Duration) -> Result<EthFrame, Error>;
    fn local_mac(&self) -> [u8; 6];
}

/// In-memory loopback `CanPort`/`EthPort` pairs. Public (rather than
/// `#[cfg(test)]`-gated) so both this crate's unit tests and its `tests/`
/// integration suite can drive a fabric without real hardware.
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// In-memory loopback `CanPort` pair, wired so frames sent on one side
    /// appear in the other's receive queue. Used by fabric unit tests and
    /// the crate's integration tests.
    #[derive(Clone)]
    pub struct LoopbackCan {
        inbox: Arc<Mutex<VecDeque<CanFrame>>>,
        outbox: Arc<Mutex<VecDeque<CanFrame>>>,
        open: bool,
        baud: u32,
    }

    impl LoopbackCan {
        pub fn pair() -> (Self, Self) {
            let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
            let b_to_a = Arc::new(Mutex::new(VecDeque::new()));
            (
                Self {
                    inbox: b_to_a.clone(),
                    outbox: a_to_b.clone(),
                    open: false,
                    baud: 1_000_000,
                },
                Self {
                    inbox: a_to_b,
                    outbox: b_to_a,
                    open: false,
                    baud: 1_000_000,
                },
            )
        }
    }

    impl PortLifecycle for LoopbackCan {
        fn open(&mut self) -> Result<(), Error> {
            self.open = true;
            Ok(())
        }
        fn close(&mut self) -> Result<(), Error> {
            self.open = false;
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.open
        }
    }

    impl CanPort for LoopbackCan {
        fn send(&mut self, frame: &CanFrame) -> Result<(), Error> {
            if !self.open {
                return Err(Error::Transport(TransportError::NotOpen));
            }
            self.outbox.lock().unwrap().push_back(frame.clone());
            Ok(())
        }

        fn recv(&mut self, timeout: Duration) -> Result<CanFrame, Error> {
            if !self.open {
                return Err(Error::Transport(TransportError::NotOpen));
            }
            let deadline = std::time::Instant::now() + timeout;
            loop {
                if let Some(frame) = self.inbox.lock().unwrap().pop_front() {
                    return Ok(frame);
                }
                if std::time::Instant::now() >= deadline {
                    return Err(Error::Transport(TransportError::Timeout));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        fn set_baud(&mut self, bps: u32) -> Result<(), Error> {
            if self.open {
                return Err(Error::Transport(TransportError::AlreadyOpen));
            }
            if !CAN_BAUD_TABLE.contains(&bps) {
                return Err(Error::Transport(TransportError::BadParam));
            }
            self.baud = bps;
            Ok(())
        }

        fn baud(&self) -> u32 {
            self.baud
        }
    }

    /// In-memory loopback `EthPort` pair for EcatFabric tests.
    #[derive(Clone)]
    pub struct LoopbackEth {
        inbox: Arc<Mutex<VecDeque<EthFrame>>>,
        outbox: Arc<Mutex<VecDeque<EthFrame>>>,
        open: bool,
        mac: [u8; 6],
    }

    impl LoopbackEth {
        pub fn pair() -> (Self, Self) {
            let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
            let b_to_a = Arc::new(Mutex::new(VecDeque::new()));
            (
                Self {
                    inbox: b_to_a.clone(),
                    outbox: a_to_b.clone(),
                    open: false,
                    mac: [0x02, 0, 0, 0, 0, 1],
                },
                Self {
                    inbox: a_to_b,
                    outbox: b_to_a,
                    open: false,
                    mac: [0x02, 0, 0, 0, 0, 2],
                },
            )
        }
    }

    impl PortLifecycle for LoopbackEth {
        fn open(&mut self) -> Result<(), Error> {
            self.open = true;
            Ok(())
        }
        fn close(&mut self) -> Result<(), Error> {
            self.open = false;
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.open
        }
    }

    impl EthPort for LoopbackEth {
        fn send(&mut self, frame: &EthFrame) -> Result<(), Error> {
            if !self.open {
                return Err(Error::Transport(TransportError::NotOpen));
            }
            self.outbox.lock().unwrap().push_back(frame.clone());
            Ok(())
        }

        fn recv(&mut self, timeout: Duration) -> Result<EthFrame, Error> {
            if !self.open {
                return Err(Error::Transport(TransportError::NotOpen));
            }
            let deadline = std::time::Instant::now() + timeout;
            loop {
                if let Some(frame) = self.inbox.lock().unwrap().pop_front() {
                    return Ok(frame);
                }
                if std::time::Instant::now() >= deadline {
                    return Err(Error::Transport(TransportError::Timeout));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        fn local_mac(&self) -> [u8; 6] {
            self.mac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_truncates_payload_into_fixed_array() {
        let f = CanFrame::data_frame(0x601, &[1, 2, 3]);
        assert_eq!(f.payload(), &[1, 2, 3]);
        assert_eq!(f.len, 3);
    }

    #[test]
    fn eth_frame_pads_to_minimum_length() {
        let f = EthFrame::new([0; 6], &[1, 2, 3]);
        assert_eq!(f.bytes.len(), ETH_MIN_FRAME_LEN);
        assert_eq!(f.ethertype(), Some(ETHERCAT_ETHERTYPE));
        assert_eq!(&f.payload()[..3], &[1, 2, 3]);
    }

    #[test]
    fn baud_table_has_all_canonical_rates() {
        for rate in [10_000, 125_000, 1_000_000] {
            assert!(CAN_BAUD_TABLE.contains(&rate));
        }
    }
}
