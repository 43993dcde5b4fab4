//! Ethernet-side TPDO/RPDO lists: the concatenated byte layout a single
//! sync-managed datagram carries, and the enable sequence that writes that
//! layout to the node's sync-manager objects.

use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::sdo::{SdoChannel, SdoEngine};

use super::Pdo;

/// One sync-manager descriptor as written back to the node
/// (`0x0800 + 8*n` register block, or its CoE object mirror).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncManagerConfig {
    pub start_addr: u16,
    pub length: u16,
    pub control: u8,
    pub enable: bool,
}

/// An ordered collection of PDOs sharing one sync-managed datagram.
/// Mutation disables the list; [`EcatPdoList::apply`] recomputes the
/// layout and re-enables it.
pub struct EcatPdoList {
    pdos: Mutex<Vec<Arc<Pdo>>>,
    sm_index: u16,
    enabled: Mutex<bool>,
}

impl EcatPdoList {
    pub fn new(sm_index: u16) -> Self {
        Self {
            pdos: Mutex::new(Vec::new()),
            sm_index,
            enabled: Mutex::new(false),
        }
    }

    pub fn insert(&self, slot: usize, pdo: Arc<Pdo>) {
        *self.enabled.lock().unwrap() = false;
        let mut pdos = self.pdos.lock().unwrap();
        if slot >= pdos.len() {
            pdos.push(pdo);
        } else {
            pdos.insert(slot, pdo);
        }
    }

    pub fn remove(&self, slot: usize) {
        *self.enabled.lock().unwrap() = false;
        let mut pdos = self.pdos.lock().unwrap();
        if slot < pdos.len() {
            pdos.remove(slot);
        }
    }

    pub fn byte_len(&self) -> usize {
        self.pdos.lock().unwrap().iter().map(|p| p.byte_len()).sum()
    }

    /// Concatenates every member PDO's current encoding into one buffer,
    /// in list order — this is what a cyclic RPDO write sends.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for pdo in self.pdos.lock().unwrap().iter() {
            out.extend(pdo.encode());
        }
        out
    }

    /// Slices a received TPDO image across member PDOs in order.
    pub fn decode(&self, image: &[u8]) {
        let mut offset = 0;
        for pdo in self.pdos.lock().unwrap().iter() {
            let len = pdo.byte_len();
            if offset + len > image.len() {
                break;
            }
            pdo.decode(&image[offset..offset + len]);
            offset += len;
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap()
    }

    /// Writes the recomputed sync-manager descriptor via SDO and marks the
    /// list enabled again.
    pub fn apply<C: SdoChannel>(&self, sdo: &SdoEngine<C>, base_reg: u16) -> Result<(), Error> {
        let len = self.byte_len() as u16;
        sdo.download_u16(base_reg, 1, len)?;
        sdo.download_u8(base_reg, 2, 0x00)?;
        sdo.download_u8(base_reg, 3, 1)?; // enable bit
        *self.enabled.lock().unwrap() = true;
        Ok(())
    }

    pub fn sm_index(&self) -> u16 {
        self.sm_index
    }
}
