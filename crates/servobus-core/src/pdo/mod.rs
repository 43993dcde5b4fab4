//! PDO mapping objects, per-slot enable/disable, and per-transport dispatch.

pub mod ecat_list;
pub mod mapping;

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, PdoError};
use crate::sdo::{SdoChannel, SdoEngine};
use mapping::PdoMappingEntry;

/// CAN PDOs carry at most 8 bytes; Ethernet capacity is left to the
/// sync-manager's configured length, so only CAN enforces this at
/// `add_var` time via `Pdo::new`'s `capacity_bits`.
pub const CAN_PDO_CAPACITY_BITS: u16 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoDirection {
    Transmit,
    Receive,
}

/// A bound variable's live value, updated atomically so a PDO publish can
/// never observe a torn write — a value update is either fully visible in
/// this frame or fully deferred to the next, never half-applied.
#[derive(Clone)]
pub enum PdoValue {
    I32(Arc<AtomicI32>),
    U32(Arc<AtomicU32>),
    Raw(Arc<Mutex<Vec<u8>>>),
}

impl PdoValue {
    fn write_into(&self, entry: &PdoMappingEntry, out: &mut [u8]) {
        let len = entry.byte_length();
        match self {
            PdoValue::I32(v) => out[..len].copy_from_slice(&v.load(Ordering::Acquire).to_le_bytes()[..len]),
            PdoValue::U32(v) => out[..len].copy_from_slice(&v.load(Ordering::Acquire).to_le_bytes()[..len]),
            PdoValue::Raw(v) => {
                let guard = v.lock().unwrap();
                out[..len.min(guard.len())].copy_from_slice(&guard[..len.min(guard.len())]);
            }
        }
    }

    fn read_from(&self, bytes: &[u8]) {
        match self {
            PdoValue::I32(v) => {
                let mut buf = [0u8; 4];
                buf[..bytes.len().min(4)].copy_from_slice(&bytes[..bytes.len().min(4)]);
                v.store(i32::from_le_bytes(buf), Ordering::Release);
            }
            PdoValue::U32(v) => {
                let mut buf = [0u8; 4];
                buf[..bytes.len().min(4)].copy_from_slice(&bytes[..bytes.len().min(4)]);
                v.store(u32::from_le_bytes(buf), Ordering::Release);
            }
            PdoValue::Raw(v) => {
                *v.lock().unwrap() = bytes.to_vec();
            }
        }
    }
}

struct Binding {
    entry: PdoMappingEntry,
    value: PdoValue,
}

/// Called when a TPDO's process image has just been refreshed from the
/// wire.
pub trait PdoReceived: Send + Sync {
    fn received(&self, pdo_id: u32);
}

/// One PDO: an ordered list of bindings sharing a transmission id.
pub struct Pdo {
    pub id: u32,
    pub direction: PdoDirection,
    pub transmission_type: u8,
    pub rtr_allowed: bool,
    capacity_bits: u16,
    bindings: Mutex<Vec<Binding>>,
    receiver: Mutex<Option<Arc<dyn PdoReceived>>>,
}

impl Pdo {
    pub fn new(id: u32, direction: PdoDirection, capacity_bits: u16) -> Self {
        Self {
            id,
            direction,
            transmission_type: 0xFF,
            rtr_allowed: false,
            capacity_bits,
            bindings: Mutex::new(Vec::new()),
            receiver: Mutex::new(None),
        }
    }

    pub fn set_receiver(&self, receiver: Arc<dyn PdoReceived>) {
        *self.receiver.lock().unwrap() = Some(receiver);
    }

    /// Appends a binding. Fails when the total mapped bit count would
    /// exceed the PDO's capacity, or the size isn't a byte multiple (this
    /// spec only maps byte-aligned fields).
    pub fn add_var(&self, entry: PdoMappingEntry, value: PdoValue) -> Result<(), Error> {
        if entry.length_bits % 8 != 0 {
            return Err(Error::Pdo(PdoError::BitSizeError));
        }
        let mut bindings = self.bindings.lock().unwrap();
        let total: u32 = bindings.iter().map(|b| b.entry.length_bits as u32).sum::<u32>()
            + entry.length_bits as u32;
        if total > self.capacity_bits as u32 {
            return Err(Error::Pdo(PdoError::BitOverflow));
        }
        bindings.push(Binding { entry, value });
        Ok(())
    }

    pub fn mapping_entries(&self) -> Vec<PdoMappingEntry> {
        self.bindings.lock().unwrap().iter().map(|b| b.entry).collect()
    }

    pub fn byte_len(&self) -> usize {
        self.bindings
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.entry.byte_length())
            .sum()
    }

    /// Serializes every bound variable's current value, in mapping order,
    /// into one contiguous buffer (the RPDO/TPDO wire payload).
    pub fn encode(&self) -> Vec<u8> {
        let bindings = self.bindings.lock().unwrap();
        let mut out = vec![0u8; self.byte_len()];
        let mut offset = 0;
        for b in bindings.iter() {
            let len = b.entry.byte_length();
            b.value.write_into(&b.entry, &mut out[offset..offset + len]);
            offset += len;
        }
        out
    }

    /// Slices an incoming process image across the bound variables in
    /// order and notifies the receiver hook.
    pub fn decode(&self, image: &[u8]) {
        let bindings = self.bindings.lock().unwrap();
        let mut offset = 0;
        for b in bindings.iter() {
            let len = b.entry.byte_length();
            if offset + len > image.len() {
                break;
            }
            b.value.read_from(&image[offset..offset + len]);
            offset += len;
        }
        drop(bindings);
        if let Some(recv) = self.receiver.lock().unwrap().as_ref() {
            recv.received(self.id);
        }
    }
}

/// CAN-side enable/disable sequence: clear the mapping count, rewrite
/// entries, restore the count, then clear bit 31 of the
/// communication-parameter id to enable — or set it to disable.
pub mod can_dispatch {
    use super::*;

    pub fn disable<C: SdoChannel>(sdo: &SdoEngine<C>, comm_index: u16) -> Result<(), Error> {
        let id = sdo.upload_u32(comm_index, 1)?;
        sdo.download_u32(comm_index, 1, id | 0x8000_0000)
    }

    pub fn enable<C: SdoChannel>(
        sdo: &SdoEngine<C>,
        comm_index: u16,
        map_index: u16,
        pdo: &Pdo,
    ) -> Result<(), Error> {
        disable(sdo, comm_index)?;
        sdo.download_u8(map_index, 0, 0)?;
        for (i, entry) in pdo.mapping_entries().iter().enumerate() {
            sdo.download_u32(map_index, (i + 1) as u8, entry.to_u32())?;
        }
        sdo.download_u8(map_index, 0, pdo.mapping_entries().len() as u8)?;
        let id = sdo.upload_u32(comm_index, 1)?;
        sdo.download_u32(comm_index, 1, id & !0x8000_0000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn add_var_rejects_overflow_of_can_capacity() {
        let pdo = Pdo::new(0x200, PdoDirection::Transmit, CAN_PDO_CAPACITY_BITS);
        for i in 0..4 {
            pdo.add_var(
                PdoMappingEntry { index: 0x6000 + i, sub: 0, length_bits: 16 },
                PdoValue::U32(Arc::new(AtomicU32::new(0))),
            )
            .unwrap();
        }
        let err = pdo
            .add_var(
                PdoMappingEntry { index: 0x6010, sub: 0, length_bits: 16 },
                PdoValue::U32(Arc::new(AtomicU32::new(0))),
            )
            .unwrap_err();
        assert_eq!(err, Error::Pdo(PdoError::BitOverflow));
    }

    #[test]
    fn encode_places_variables_at_declared_offsets_in_order() {
        let pdo = Pdo::new(0x200, PdoDirection::Transmit, CAN_PDO_CAPACITY_BITS);
        let v1 = Arc::new(AtomicU32::new(0x1234));
        let v2 = Arc::new(AtomicU32::new(0x5678));
        pdo.add_var(
            PdoMappingEntry { index: 0x6041, sub: 0, length_bits: 16 },
            PdoValue::U32(v1.clone()),
        )
        .unwrap();
        pdo.add_var(
            PdoMappingEntry { index: 0x6042, sub: 0, length_bits: 16 },
            PdoValue::U32(v2.clone()),
        )
        .unwrap();
        let bytes = pdo.encode();
        assert_eq!(&bytes[0..2], &0x1234u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &0x5678u16.to_le_bytes());
    }

    #[test]
    fn decode_updates_bindings_and_invokes_received_hook() {
        struct Counter(std::sync::atomic::AtomicU32);
        impl PdoReceived for Counter {
            fn received(&self, _pdo_id: u32) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let pdo = Pdo::new(0x180, PdoDirection::Receive, CAN_PDO_CAPACITY_BITS);
        let v = Arc::new(AtomicU32::new(0));
        pdo.add_var(
            PdoMappingEntry { index: 0x6041, sub: 0, length_bits: 32 },
            PdoValue::U32(v.clone()),
        )
        .unwrap();
        let counter = Arc::new(Counter(std::sync::atomic::AtomicU32::new(0)));
        pdo.set_receiver(counter.clone());
        pdo.decode(&0xAABBCCDDu32.to_le_bytes());
        assert_eq!(v.load(Ordering::SeqCst), 0xAABBCCDD);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
