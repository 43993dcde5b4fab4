//! Linux transport implementations: [`SocketCanPort`] over the `socketcan`
//! crate and [`RawEthPort`] over `pnet`'s raw-Ethernet datalink channel.
//! Neither type does any protocol work; they just satisfy `servobus_core`'s
//! [`CanPort`]/[`EthPort`] traits so a fabric can be opened against a real
//! interface instead of the in-memory loopback used by the core crate's
//! tests.
#![cfg(target_os = "linux")]

use std::io;
use std::time::Duration;

use log::warn;
use pnet::datalink::{self, Channel, NetworkInterface as PnetInterface};
use servobus_core::error::{Error, TransportError};
use servobus_core::transport::{
    CanFrame, CanFrameKind, CanPort, EthFrame, EthPort, PortLifecycle, CAN_BAUD_TABLE,
};
use socketcan::{CanFrame as SockFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, SocketOptions, StandardId};

/// A CAN interface (e.g. `can0`, `vcan0`) opened via the kernel's SocketCAN
/// binding.
pub struct SocketCanPort {
    interface: String,
    socket: Option<CanSocket>,
    baud: u32,
}

impl SocketCanPort {
    pub fn new(interface: &str) -> Self {
        Self { interface: interface.to_string(), socket: None, baud: 1_000_000 }
    }
}

impl PortLifecycle for SocketCanPort {
    fn open(&mut self) -> Result<(), Error> {
        if self.socket.is_some() {
            return Err(Error::Transport(TransportError::AlreadyOpen));
        }
        let socket = CanSocket::open(&self.interface).map_err(|e| {
            warn!("failed to open {}: {e}", self.interface);
            Error::Transport(TransportError::BadPortName)
        })?;
        socket
            .set_read_timeout(Duration::from_millis(100))
            .map_err(|_| Error::Transport(TransportError::Driver))?;
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.socket = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

impl CanPort for SocketCanPort {
    fn send(&mut self, frame: &CanFrame) -> Result<(), Error> {
        let socket = self.socket.as_ref().ok_or(Error::Transport(TransportError::NotOpen))?;
        let id = to_socketcan_id(frame.id, frame.extended)?;
        let wire = match frame.kind {
            CanFrameKind::Remote => SockFrame::new_remote(id, frame.len as usize),
            _ => SockFrame::new(id, frame.payload()),
        }
        .ok_or(Error::Transport(TransportError::BadParam))?;
        socket.write_frame(&wire).map_err(|_| Error::Transport(TransportError::Driver))?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<CanFrame, Error> {
        let socket = self.socket.as_ref().ok_or(Error::Transport(TransportError::NotOpen))?;
        socket
            .set_read_timeout(timeout)
            .map_err(|_| Error::Transport(TransportError::Driver))?;
        let wire = socket.read_frame().map_err(|e| {
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
                Error::Transport(TransportError::Timeout)
            } else {
                Error::Transport(TransportError::Driver)
            }
        })?;
        Ok(from_socketcan_frame(&wire))
    }

    fn set_baud(&mut self, bps: u32) -> Result<(), Error> {
        if self.is_open() {
            return Err(Error::Transport(TransportError::AlreadyOpen));
        }
        if !CAN_BAUD_TABLE.contains(&bps) {
            return Err(Error::Transport(TransportError::BadParam));
        }
        // Bitrate is a property of the interface (set via `ip link` / netlink),
        // not something this socket can push down itself; record it so
        // `baud()` reports what the caller asked for.
        self.baud = bps;
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }
}

fn to_socketcan_id(id: u32, extended: bool) -> Result<Id, Error> {
    if extended {
        ExtendedId::new(id).map(Id::Extended).ok_or(Error::Transport(TransportError::BadParam))
    } else {
        StandardId::new(id as u16).map(Id::Standard).ok_or(Error::Transport(TransportError::BadParam))
    }
}

fn from_socketcan_frame(wire: &SockFrame) -> CanFrame {
    let id = match wire.id() {
        Id::Standard(s) => s.as_raw() as u32,
        Id::Extended(e) => e.as_raw(),
    };
    let payload = wire.data();
    let mut data = [0u8; 8];
    data[..payload.len()].copy_from_slice(payload);
    CanFrame {
        id,
        extended: matches!(wire.id(), Id::Extended(_)),
        kind: if wire.is_remote_frame() {
            CanFrameKind::Remote
        } else if wire.is_error_frame() {
            CanFrameKind::Error
        } else {
            CanFrameKind::Data
        },
        len: payload.len() as u8,
        data,
        timestamp_ms: None,
    }
}

/// A raw (non-IP) Ethernet interface, used for EtherCAT-style traffic.
/// Promiscuous so the port also sees frames addressed to other stations'
/// MACs, which matters for a multi-datagram frame bouncing around a ring.
pub struct RawEthPort {
    interface_name: String,
    mac_address: [u8; 6],
    channel: Option<(Box<dyn datalink::DataLinkSender>, Box<dyn datalink::DataLinkReceiver>)>,
}

impl RawEthPort {
    pub fn new(interface_name: &str) -> Result<Self, Error> {
        let interface = find_interface(interface_name)?;
        let mac_address: [u8; 6] = interface.mac.ok_or(Error::Transport(TransportError::BadPortName))?.into();
        Ok(Self { interface_name: interface_name.to_string(), mac_address, channel: None })
    }
}

fn find_interface(name: &str) -> Result<PnetInterface, Error> {
    datalink::interfaces()
        .into_iter()
        .find(|iface: &PnetInterface| iface.name == name)
        .ok_or(Error::Transport(TransportError::BadPortName))
}

impl PortLifecycle for RawEthPort {
    fn open(&mut self) -> Result<(), Error> {
        if self.channel.is_some() {
            return Err(Error::Transport(TransportError::AlreadyOpen));
        }
        let interface = find_interface(&self.interface_name)?;
        let config = datalink::Config {
            read_timeout: Some(Duration::from_millis(100)),
            promiscuous: true,
            ..Default::default()
        };
        let (tx, rx) = match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => return Err(Error::Transport(TransportError::Driver)),
            Err(e) => {
                warn!("failed to open {}: {e}", self.interface_name);
                return Err(Error::Transport(TransportError::Driver));
            }
        };
        self.channel = Some((tx, rx));
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.channel = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.is_some()
    }
}

impl EthPort for RawEthPort {
    fn send(&mut self, frame: &EthFrame) -> Result<(), Error> {
        let (tx, _) = self.channel.as_mut().ok_or(Error::Transport(TransportError::NotOpen))?;
        tx.send_to(&frame.bytes, None)
            .ok_or(Error::Transport(TransportError::Driver))?
            .map_err(|_| Error::Transport(TransportError::Driver))
    }

    fn recv(&mut self, timeout: Duration) -> Result<EthFrame, Error> {
        let (_, rx) = self.channel.as_mut().ok_or(Error::Transport(TransportError::NotOpen))?;
        // pnet's blocking channel doesn't take a per-call timeout; the fixed
        // 100ms read_timeout set at open() means a long caller timeout is
        // served by polling in short slices instead.
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match rx.next() {
                Ok(bytes) => return Ok(EthFrame { bytes: bytes.to_vec() }),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::Transport(TransportError::Timeout));
                    }
                }
                Err(_) => return Err(Error::Transport(TransportError::Driver)),
            }
        }
    }

    fn local_mac(&self) -> [u8; 6] {
        self.mac_address
    }
}
