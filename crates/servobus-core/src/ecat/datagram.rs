//! EtherCAT datagram encoding and the pending-frame ring that matches
//! replies back to the caller that sent them.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{EcatError, Error};
use crate::transport::EthFrame;

pub const HEADER_LEN_WORD_MASK: u16 = 0x1000;
const DATAGRAM_HEADER_LEN: usize = 10;
const WKC_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EcatCmd {
    Nop = 0,
    Aprd = 1,
    Apwr = 2,
    Fprd = 4,
    Fpwr = 5,
    Brd = 7,
    Bwr = 8,
    Armw = 13,
}

#[derive(Debug, Clone)]
pub struct Datagram {
    pub cmd: EcatCmd,
    /// Datagram counter, distinct from the frame ring slot.
    pub idx: u8,
    pub adp: u16,
    pub ado: u16,
    pub irq: u16,
    pub data: Vec<u8>,
    pub wkc: u16,
}

impl Datagram {
    pub fn new(cmd: EcatCmd, idx: u8, adp: u16, ado: u16, data: Vec<u8>) -> Self {
        Self { cmd, idx, adp, ado, irq: 0, data, wkc: 0 }
    }

    fn encoded_len(&self) -> usize {
        DATAGRAM_HEADER_LEN + self.data.len() + WKC_LEN
    }

    fn encode(&self, out: &mut Vec<u8>, has_next: bool) {
        out.push(self.cmd as u8);
        out.push(self.idx);
        out.extend_from_slice(&self.adp.to_le_bytes());
        out.extend_from_slice(&self.ado.to_le_bytes());
        let len_field = (self.data.len() as u16 & 0x07FF) | if has_next { 0x8000 } else { 0 };
        out.extend_from_slice(&len_field.to_le_bytes());
        out.extend_from_slice(&self.irq.to_le_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.wkc.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < DATAGRAM_HEADER_LEN {
            return Err(Error::Ecat(EcatError::EcatMsgCorrupt));
        }
        let cmd = match bytes[0] {
            0 => EcatCmd::Nop,
            1 => EcatCmd::Aprd,
            2 => EcatCmd::Apwr,
            4 => EcatCmd::Fprd,
            5 => EcatCmd::Fpwr,
            7 => EcatCmd::Brd,
            8 => EcatCmd::Bwr,
            13 => EcatCmd::Armw,
            _ => return Err(Error::Ecat(EcatError::EcatMsgCorrupt)),
        };
        let idx = bytes[1];
        let adp = u16::from_le_bytes([bytes[2], bytes[3]]);
        let ado = u16::from_le_bytes([bytes[4], bytes[5]]);
        let len_field = u16::from_le_bytes([bytes[6], bytes[7]]);
        let len = (len_field & 0x07FF) as usize;
        let has_next = len_field & 0x8000 != 0;
        let irq = u16::from_le_bytes([bytes[8], bytes[9]]);
        let total = DATAGRAM_HEADER_LEN + len + WKC_LEN;
        if bytes.len() < total {
            return Err(Error::Ecat(EcatError::EcatMsgCorrupt));
        }
        let data = bytes[DATAGRAM_HEADER_LEN..DATAGRAM_HEADER_LEN + len].to_vec();
        let wkc = u16::from_le_bytes([bytes[total - 2], bytes[total - 1]]);
        let _ = has_next; // caller re-derives chaining from how many bytes remain
        Ok((Self { cmd, idx, adp, ado, irq, data, wkc }, total))
    }
}

/// The sentinel address pattern used for the ring-matching datagram: an
/// APWR against an auto-decrementing position address, so the value seen
/// on return tells the host at least one node processed the frame.
pub const SENTINEL_ADP_START: u16 = 0xFFFF;
const SENTINEL_ADO: u16 = 0x0E00;

fn sentinel_datagram(idx: u8, ring_index: u8, frame_id: u16) -> Datagram {
    let mut data = vec![ring_index];
    data.extend_from_slice(&frame_id.to_le_bytes());
    Datagram::new(EcatCmd::Apwr, idx, SENTINEL_ADP_START, SENTINEL_ADO, data)
}

/// Assembles one or more Ethernet frames carrying `datagrams`, splitting
/// across frames when the payload would exceed `mtu` bytes.
pub fn build_frames(datagrams: &[Datagram], src_mac: [u8; 6], mtu: usize) -> Vec<EthFrame> {
    let mut frames = Vec::new();
    let mut current: Vec<&Datagram> = Vec::new();
    let mut current_len = 2; // ethercat header
    for dg in datagrams {
        let dg_len = dg.encoded_len();
        if !current.is_empty() && current_len + dg_len > mtu {
            frames.push(encode_frame(&current, src_mac));
            current.clear();
            current_len = 2;
        }
        current.push(dg);
        current_len += dg_len;
    }
    if !current.is_empty() {
        frames.push(encode_frame(&current, src_mac));
    }
    frames
}

fn encode_frame(datagrams: &[&Datagram], src_mac: [u8; 6]) -> EthFrame {
    let mut payload = Vec::new();
    let body_len: usize = datagrams.iter().map(|d| d.encoded_len()).sum();
    let header = (body_len as u16 & 0x07FF) | HEADER_LEN_WORD_MASK;
    payload.extend_from_slice(&header.to_le_bytes());
    for (i, dg) in datagrams.iter().enumerate() {
        dg.encode(&mut payload, i + 1 < datagrams.len());
    }
    EthFrame::new(src_mac, &payload)
}

/// Parses an EtherCAT payload (after the link header and the 2-byte
/// ethercat header) into its datagram chain.
pub fn parse_datagrams(ecat_payload: &[u8]) -> Result<Vec<Datagram>, Error> {
    if ecat_payload.len() < 2 {
        return Err(Error::Ecat(EcatError::EcatMsgCorrupt));
    }
    let mut datagrams = Vec::new();
    let mut offset = 2;
    loop {
        if offset >= ecat_payload.len() {
            break;
        }
        let (dg, consumed) = Datagram::decode(&ecat_payload[offset..])?;
        offset += consumed;
        datagrams.push(dg);
        if offset >= ecat_payload.len() {
            break;
        }
    }
    Ok(datagrams)
}

/// Extracts `(ring_index, frame_id)` from a decoded sentinel datagram, if
/// its auto-decrementing address shows at least one node processed it.
pub fn read_sentinel(dg: &Datagram) -> Option<(u8, u16)> {
    if dg.cmd != EcatCmd::Apwr || dg.ado != SENTINEL_ADO || dg.adp == SENTINEL_ADP_START || dg.data.len() < 3 {
        return None;
    }
    Some((dg.data[0], u16::from_le_bytes([dg.data[1], dg.data[2]])))
}

pub fn make_sentinel(idx: u8, ring_index: u8, frame_id: u16) -> Datagram {
    sentinel_datagram(idx, ring_index, frame_id)
}

struct PendingSlot {
    reply: Mutex<Option<Vec<Datagram>>>,
    cond: Condvar,
}

/// Bounded ring of in-flight frames. Capacity is fixed at construction; on
/// overflow the oldest unmatched slot is silently recycled and its waiter
/// times out.
pub struct FrameRing {
    slots: Vec<Arc<PendingSlot>>,
    next_slot: Mutex<usize>,
    next_id: Mutex<u16>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Arc::new(PendingSlot { reply: Mutex::new(None), cond: Condvar::new() }))
                .collect(),
            next_slot: Mutex::new(0),
            next_id: Mutex::new(0),
        }
    }

    /// Reserves the next ring slot and a monotonic frame id, returning
    /// `(1-based index, id)` to stamp into the sentinel datagram.
    pub fn reserve(&self) -> (u8, u16) {
        let mut slot_cursor = self.next_slot.lock().unwrap();
        let index = *slot_cursor;
        *slot_cursor = (*slot_cursor + 1) % self.slots.len();
        *self.slots[index].reply.lock().unwrap() = None;
        let mut id_cursor = self.next_id.lock().unwrap();
        let id = *id_cursor;
        *id_cursor = id_cursor.wrapping_add(1);
        ((index + 1) as u8, id)
    }

    pub fn deliver(&self, ring_index: u8, datagrams: Vec<Datagram>) {
        let idx = ring_index as usize;
        if idx == 0 || idx > self.slots.len() {
            return;
        }
        let slot = &self.slots[idx - 1];
        *slot.reply.lock().unwrap() = Some(datagrams);
        slot.cond.notify_all();
    }

    pub fn wait(&self, ring_index: u8, timeout: std::time::Duration) -> Result<Vec<Datagram>, Error> {
        let idx = ring_index as usize;
        if idx == 0 || idx > self.slots.len() {
            return Err(Error::Ecat(EcatError::NoResponse));
        }
        let slot = &self.slots[idx - 1];
        let mut guard = slot.reply.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(reply) = guard.take() {
                return Ok(reply);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::Ecat(EcatError::NoResponse));
            }
            let (g, result) = slot.cond.wait_timeout(guard, remaining).unwrap();
            guard = g;
            if result.timed_out() && guard.is_none() {
                return Err(Error::Ecat(EcatError::NoResponse));
            }
        }
    }
}
