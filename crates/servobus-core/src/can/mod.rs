//! CAN receive dispatcher, node lifecycle, node-guard wiring, and SYNC/time
//! production.

mod nmt;
pub mod pdo;
pub mod sdo_channel;

pub use nmt::NmtOpcode;
pub use pdo::CanPdoReceiver;
pub use sdo_channel::{CanSdoChannel, CanSegmentChannel};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{GuardMode, NetworkSettings};
use crate::error::{CanOpenError, Error, TransportError};
use crate::log::{sb_error, sb_warn, LogContext};
use crate::node::fsm::NodeState;
use crate::node::guard::NodeGuard;
use crate::node::Node;
use crate::timebase::{now_ms, StopToken, WorkerThread};
use crate::transport::{CanFrame, CanFrameKind, CanPort};

/// Invoked with a received frame while the dispatcher's receiver table is
/// locked. Implementations must not call back into the owning `CanFabric`
/// (enable/disable a receiver, etc.) from within this callback; holding the
/// same mutex across the call enforces that.
pub trait CanReceiver: Send {
    fn new_frame(&self, frame: &CanFrame);
}

const EMERGENCY_BASE: u32 = 0x080;
const SDO_RESPONSE_BASE: u32 = 0x580;
const SDO_REQUEST_BASE: u32 = 0x600;
const HEARTBEAT_BASE: u32 = 0x700;
const NMT_ID: u32 = 0x000;

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const ERROR_RETRY_SLEEP: Duration = Duration::from_millis(5);
const NMT_RETRANSMIT: Duration = Duration::from_millis(20);

struct PendingSdoReply {
    buf: Mutex<Option<[u8; 8]>>,
    cond: std::sync::Condvar,
}

struct Inner {
    receivers: HashMap<u32, Arc<dyn CanReceiver>>,
    nodes: HashMap<u8, Arc<Node>>,
    sdo_waiters: HashMap<u8, Arc<PendingSdoReply>>,
    sync_count: u32,
    error_frame_count: u64,
}

/// CAN fabric: one read thread, a message-id keyed receiver table, and the
/// default handlers for emergency/SDO-reply/heartbeat ranges.
pub struct CanFabric<P: CanPort> {
    port: Mutex<P>,
    inner: Mutex<Inner>,
    guard: Arc<NodeGuard>,
    settings: NetworkSettings,
    read_worker: Mutex<Option<WorkerThread>>,
}

impl<P: CanPort + 'static> CanFabric<P> {
    pub fn new(port: P, settings: NetworkSettings) -> Arc<Self> {
        Arc::new(Self {
            port: Mutex::new(port),
            inner: Mutex::new(Inner {
                receivers: HashMap::new(),
                nodes: HashMap::new(),
                sdo_waiters: HashMap::new(),
                sync_count: 0,
                error_frame_count: 0,
            }),
            guard: Arc::new(NodeGuard::new()),
            settings,
            read_worker: Mutex::new(None),
        })
    }

    pub fn error_frame_count(&self) -> u64 {
        self.inner.lock().unwrap().error_frame_count
    }

    pub fn open(self: &Arc<Self>) -> Result<(), Error> {
        self.port.lock().unwrap().open()?;
        self.guard.start();
        let this = self.clone();
        let worker = WorkerThread::start("can-read", move |stop| this.read_loop(stop))?;
        *self.read_worker.lock().unwrap() = Some(worker);
        Ok(())
    }

    pub fn close(&self) -> Result<(), Error> {
        if let Some(mut w) = self.read_worker.lock().unwrap().take() {
            let _ = w.stop(Duration::from_secs(1));
        }
        self.guard.stop(Duration::from_secs(1));
        self.port.lock().unwrap().close()
    }

    pub fn enable_receiver(&self, id: u32, recv: Arc<dyn CanReceiver>) {
        self.inner.lock().unwrap().receivers.insert(id, recv);
    }

    pub fn disable_receiver(&self, id: u32) {
        self.inner.lock().unwrap().receivers.remove(&id);
    }

    pub fn xmit(&self, frame: &CanFrame, _timeout: Duration) -> Result<(), Error> {
        self.port.lock().unwrap().send(frame)
    }

    /// Sends an 8-byte SDO request to `node` and blocks for the matching
    /// `0x580+node` reply.
    pub fn xmit_sdo(&self, node: u8, buf: &[u8; 8], timeout: Duration) -> Result<[u8; 8], Error> {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .sdo_waiters
                .entry(node)
                .or_insert_with(|| {
                    Arc::new(PendingSdoReply {
                        buf: Mutex::new(None),
                        cond: std::sync::Condvar::new(),
                    })
                })
                .clone()
        };
        *waiter.buf.lock().unwrap() = None;
        let frame = CanFrame::data_frame(SDO_REQUEST_BASE + node as u32, buf);
        self.port.lock().unwrap().send(&frame)?;

        let mut guard = waiter.buf.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(reply) = *guard {
                return Ok(reply);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::CanOpen(CanOpenError::SdoTimeout));
            }
            let (g, result) = waiter.cond.wait_timeout(guard, remaining).unwrap();
            guard = g;
            if result.timed_out() && guard.is_none() {
                return Err(Error::CanOpen(CanOpenError::SdoTimeout));
            }
        }
    }

    pub fn attach(&self, node: Arc<Node>) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.nodes.contains_key(&node.id) {
            return Err(Error::CanOpen(CanOpenError::BadNodeId));
        }
        if node.config.guard_mode != GuardMode::None {
            self.guard.register(
                node.id,
                node.fsm.clone(),
                node.config.guard_mode,
                node.config.guard_timeout_ms,
                node.config.life_factor,
            );
        }
        inner.nodes.insert(node.id, node);
        Ok(())
    }

    pub fn detach(&self, node_id: u8) {
        self.guard.unregister(node_id);
        self.inner.lock().unwrap().nodes.remove(&node_id);
    }

    /// Reconfigures (or disables) liveness watching for an attached node.
    /// `GuardMode::None` simply unregisters it.
    pub fn set_node_guard(&self, node_id: u8, mode: GuardMode, timeout_ms: u32, life_factor: u8) -> Result<(), Error> {
        let fsm = {
            let inner = self.inner.lock().unwrap();
            inner.nodes.get(&node_id).map(|n| n.fsm.clone()).ok_or(Error::CanOpen(CanOpenError::BadNodeId))?
        };
        if mode == GuardMode::None {
            self.guard.unregister(node_id);
        } else {
            self.guard.register(node_id, fsm, mode, timeout_ms, life_factor);
        }
        Ok(())
    }

    fn send_nmt(&self, node_id: u8, opcode: NmtOpcode) -> Result<(), Error> {
        let frame = CanFrame::data_frame(NMT_ID, &[opcode as u8, node_id]);
        self.port.lock().unwrap().send(&frame)
    }

    /// Requests `target` via the matching NMT opcode and retransmits every
    /// 20ms until the node's observed state matches or `timeout` elapses.
    fn request_state(&self, node_id: u8, opcode: NmtOpcode, target: NodeState, timeout: Duration) -> Result<(), Error> {
        let fsm = {
            let inner = self.inner.lock().unwrap();
            inner
                .nodes
                .get(&node_id)
                .map(|n| n.fsm.clone())
                .ok_or(Error::CanOpen(CanOpenError::BadNodeId))?
        };
        let deadline = std::time::Instant::now() + timeout;
        loop {
            self.send_nmt(node_id, opcode)?;
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::Node(crate::error::NodeError::GuardTimeout));
            }
            match fsm.await_state(target, remaining.min(NMT_RETRANSMIT)) {
                Ok(()) => return Ok(()),
                Err(_) if std::time::Instant::now() < deadline => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn start(&self, node_id: u8, timeout: Duration) -> Result<(), Error> {
        self.request_state(node_id, NmtOpcode::Start, NodeState::Operational, timeout)
    }

    pub fn stop(&self, node_id: u8, timeout: Duration) -> Result<(), Error> {
        self.request_state(node_id, NmtOpcode::Stop, NodeState::Stopped, timeout)
    }

    pub fn pre_op(&self, node_id: u8, timeout: Duration) -> Result<(), Error> {
        self.request_state(node_id, NmtOpcode::EnterPreOp, NodeState::PreOp, timeout)
    }

    pub fn reset(&self, node_id: u8, timeout: Duration) -> Result<(), Error> {
        self.request_state(node_id, NmtOpcode::ResetNode, NodeState::PreOp, timeout)
    }

    pub fn reset_comm(&self, node_id: u8, timeout: Duration) -> Result<(), Error> {
        self.request_state(node_id, NmtOpcode::ResetCommunication, NodeState::PreOp, timeout)
    }

    fn read_loop(&self, stop: StopToken) {
        while !stop.is_stopped() {
            let frame = { self.port.lock().unwrap().recv(READ_TIMEOUT) };
            match frame {
                Ok(frame) => self.dispatch(&frame),
                Err(Error::Transport(TransportError::Timeout)) => continue,
                Err(e) => {
                    sb_warn!("can-read thread error, retrying: {e}");
                    let _ = stop.sleep(ERROR_RETRY_SLEEP);
                }
            }
        }
    }

    fn dispatch(&self, frame: &CanFrame) {
        if frame.kind == CanFrameKind::Error {
            self.inner.lock().unwrap().error_frame_count += 1;
            return;
        }

        if frame.id == self.settings.sync_id {
            self.on_sync();
        }

        let inner = self.inner.lock().unwrap();
        if let Some(recv) = inner.receivers.get(&frame.id) {
            recv.new_frame(frame);
            return;
        }
        drop(inner);
        self.default_handler(frame);
    }

    fn default_handler(&self, frame: &CanFrame) {
        if (EMERGENCY_BASE..EMERGENCY_BASE + 0x80).contains(&frame.id) {
            let node_id = (frame.id - EMERGENCY_BASE) as u8;
            if frame.len >= 2 {
                let code = u16::from_le_bytes([frame.data[0], frame.data[1]]) as u32;
                let inner = self.inner.lock().unwrap();
                if let Some(node) = inner.nodes.get(&node_id) {
                    node.record_error(code);
                }
            }
        } else if (SDO_RESPONSE_BASE..SDO_RESPONSE_BASE + 0x80).contains(&frame.id) {
            let node_id = (frame.id - SDO_RESPONSE_BASE) as u8;
            let inner = self.inner.lock().unwrap();
            if let Some(waiter) = inner.sdo_waiters.get(&node_id) {
                *waiter.buf.lock().unwrap() = Some(frame.data);
                waiter.cond.notify_all();
            }
        } else if (HEARTBEAT_BASE..HEARTBEAT_BASE + 0x80).contains(&frame.id) {
            let node_id = (frame.id - HEARTBEAT_BASE) as u8;
            self.on_heartbeat(node_id, frame);
        }
    }

    fn on_heartbeat(&self, node_id: u8, frame: &CanFrame) {
        if frame.len == 0 {
            return;
        }
        let byte0 = frame.data[0];
        let toggle = byte0 & 0x80 != 0;
        let state_code = byte0 & 0x7F;
        let state = nmt::decode_heartbeat_state(state_code);

        let inner = self.inner.lock().unwrap();
        let Some(node) = inner.nodes.get(&node_id).cloned() else {
            return;
        };
        drop(inner);

        if let Some(state) = state {
            node.fsm.set_state(state);
        }

        match node.config.guard_mode {
            GuardMode::Heartbeat => self.guard.notify_heartbeat(node_id),
            GuardMode::NodeGuard => {
                if !self.guard.notify_guard_reply(node_id, toggle) {
                    sb_warn!(
                        LogContext::new("nodeguard", node_id),
                        "toggle bit mismatch on guard reply"
                    );
                }
            }
            GuardMode::None => {}
        }
    }

    fn on_sync(&self) {
        if !self.settings.timing_reference {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.sync_count += 1;
        if inner.sync_count % 10 != 0 {
            return;
        }
        drop(inner);
        let ts = (now_ms() & 0xFFFF_FFFF) as u32;
        let frame = CanFrame::data_frame(self.settings.time_id, &ts.to_le_bytes());
        if let Err(e) = self.port.lock().unwrap().send(&frame) {
            sb_error!("failed to publish SYNC timestamp: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::transport::test_support::LoopbackCan;

    #[test]
    fn heartbeat_updates_node_state_and_rearms_guard() {
        let (host, mut node_port) = LoopbackCan::pair();
        let fabric = CanFabric::new(host, NetworkSettings::default());
        fabric.open().unwrap();

        let mut node_config = NodeConfig::default();
        node_config.guard_mode = GuardMode::Heartbeat;
        node_config.guard_timeout_ms = 200;
        let node = Arc::new(Node::new(9, node_config));
        fabric.attach(node.clone()).unwrap();

        node_port.open().unwrap();
        let hb = CanFrame::data_frame(HEARTBEAT_BASE + 9, &[5]); // operational
        node_port.send(&hb).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(node.state(), NodeState::Operational);
        fabric.close().unwrap();
    }

    #[test]
    fn emergency_frame_is_recorded_on_node() {
        let (host, mut node_port) = LoopbackCan::pair();
        let fabric = CanFabric::new(host, NetworkSettings::default());
        fabric.open().unwrap();
        let node = Arc::new(Node::new(3, NodeConfig::default()));
        fabric.attach(node.clone()).unwrap();

        node_port.open().unwrap();
        let emcy = CanFrame::data_frame(EMERGENCY_BASE + 3, &[0x10, 0x20, 0, 0, 0, 0, 0, 0]);
        node_port.send(&emcy).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(node.error_history(1), vec![0x2010]);
        fabric.close().unwrap();
    }
}
