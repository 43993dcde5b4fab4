//! Node abstraction shared by both transports.
//!
//! A `Node` is deliberately thin: it owns identity/lifecycle bookkeeping
//! and delegates everything fieldbus-specific (SDO, PDO, guard wiring) to
//! the fabric that attached it. The CiA-301 identity object (0x1018) and an
//! error-history ring are populated through [`Node::refresh_identity`] and
//! [`Node::record_error`], which the owning fabric calls after a
//! successful SDO upload / received emergency frame respectively.

pub mod fsm;
pub mod guard;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::config::NodeConfig;
use crate::error::Error;
use fsm::NodeFsm;

const ERROR_HISTORY_CAPACITY: usize = 8;

/// CiA-301 object 0x1018: vendor id, product code, revision, serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Identity {
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
}

struct NodeInfo {
    identity: Option<Identity>,
    error_history: VecDeque<u32>,
}

/// One fieldbus node: a CANopen node-id, or an EtherCAT ring position/alias.
pub struct Node {
    pub id: u8,
    pub fsm: Arc<NodeFsm>,
    pub config: NodeConfig,
    info: Mutex<NodeInfo>,
}

impl Node {
    pub fn new(id: u8, config: NodeConfig) -> Self {
        Self {
            id,
            fsm: Arc::new(NodeFsm::new()),
            config,
            info: Mutex::new(NodeInfo {
                identity: None,
                error_history: VecDeque::with_capacity(ERROR_HISTORY_CAPACITY),
            }),
        }
    }

    pub fn state(&self) -> fsm::NodeState {
        self.fsm.state()
    }

    /// Reads the identity object via the supplied accessor (an SDO upload
    /// of `(0x1018, sub)` in practice) and caches the result.
    pub fn refresh_identity<F>(&self, mut read_u32: F) -> Result<Identity, Error>
    where
        F: FnMut(u16, u8) -> Result<u32, Error>,
    {
        let identity = Identity {
            vendor: read_u32(0x1018, 1)?,
            product: read_u32(0x1018, 2)?,
            revision: read_u32(0x1018, 3)?,
            serial: read_u32(0x1018, 4)?,
        };
        self.info.lock().unwrap().identity = Some(identity);
        Ok(identity)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.info.lock().unwrap().identity
    }

    /// Appends an emergency/error code to the ring, evicting the oldest
    /// entry once full.
    pub fn record_error(&self, code: u32) {
        let mut info = self.info.lock().unwrap();
        if info.error_history.len() == ERROR_HISTORY_CAPACITY {
            info.error_history.pop_front();
        }
        info.error_history.push_back(code);
    }

    /// Returns up to `limit` most recent error codes, newest first.
    pub fn error_history(&self, limit: usize) -> Vec<u32> {
        let info = self.info.lock().unwrap();
        info.error_history.iter().rev().take(limit).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_identity_reads_all_four_subindices() {
        let node = Node::new(5, NodeConfig::default());
        let identity = node
            .refresh_identity(|index, sub| {
                assert_eq!(index, 0x1018);
                Ok(match sub {
                    1 => 0xDEADBEEF,
                    2 => 2,
                    3 => 3,
                    4 => 4,
                    _ => unreachable!(),
                })
            })
            .unwrap();
        assert_eq!(identity.vendor, 0xDEADBEEF);
        assert_eq!(node.identity(), Some(identity));
    }

    #[test]
    fn error_history_keeps_newest_first_and_evicts_oldest() {
        let node = Node::new(1, NodeConfig::default());
        for code in 0..10u32 {
            node.record_error(code);
        }
        let history = node.error_history(3);
        assert_eq!(history, vec![9, 8, 7]);
    }
}
