//! EtherCAT-style Ethernet fabric: datagram-chained cyclic frames, AL-state
//! bring-up, distributed-clock offset/delay computation, and the CoE
//! mailbox tunnel.
//!
//! Mirrors [`crate::can::CanFabric`]'s shape — one read thread dispatching
//! replies off a pending-frame table, plus here a second cycle thread that
//! builds and sends the periodic process-data frame — but the addressing,
//! framing and bring-up sequence are EtherCAT's own.

pub mod al;
pub mod dc;
pub(crate) mod datagram;
pub mod mailbox;
pub mod sdo_channel;

pub use al::AlState;
pub use datagram::{Datagram, EcatCmd, FrameRing};
pub use dc::DcNodeInfo;
pub use mailbox::{MailboxFrame, MailboxTransport, MBX_TYPE_COE, MBX_TYPE_FOE};
pub use sdo_channel::{EcatSdoChannel, EcatSegmentChannel};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::EcatSettings;
use crate::error::{EcatError, Error, TransportError};
use crate::log::{sb_info, sb_warn, LogContext};
use crate::node::fsm::NodeState;
use crate::node::Node;
use crate::pdo::ecat_list::EcatPdoList;
use crate::sdo::SdoChannel;
use crate::timebase::{now_ms, StopToken, WorkerThread};
use crate::transport::{EthFrame, EthPort, ETHERCAT_ETHERTYPE};

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const ERROR_RETRY_SLEEP: Duration = Duration::from_millis(5);
const FRAME_RING_CAPACITY: usize = 16;
const MAX_FRAME_PAYLOAD: usize = 1486; // 1500 MTU minus the 14-byte link header

// Fixed ESC register addresses this implementation drives directly,
// rather than through the CoE mailbox.
const REG_DL_STATUS: u16 = 0x0110;
const REG_AL_CONTROL: u16 = 0x0120;
const REG_AL_STATUS: u16 = 0x0130;
const REG_PORT0_RECV_TIME: u16 = 0x0900;
const REG_SYSTEM_TIME: u16 = 0x0910;
const REG_SYSTEM_TIME_OFFSET: u16 = 0x0920;
const REG_SYNC0_CYCLE: u16 = 0x09A0;
const REG_SYNC0_START: u16 = 0x0990;
const REG_DC_CONTROL: u16 = 0x0981;
const REG_EEPROM_ADDR: u16 = 0x0502;
const REG_EEPROM_CONTROL: u16 = 0x0500;
const REG_EEPROM_DATA: u16 = 0x0508;
const REG_MBX_RX: u16 = 0x1000;
const REG_MBX_TX: u16 = 0x1800;
const MBX_MAX_LEN: u8 = 64;

const SYNC0_SETUP_MARGIN_NS: u64 = 100_000_000; // start 100ms out so every node sees it before it arrives
const SYNC0_RETRY_MAX: u8 = 20;

struct NodeEntry {
    node: Arc<Node>,
    address: u16,
    rpdo: Option<Arc<EcatPdoList>>,
    rpdo_reg: u16,
    tpdo: Option<Arc<EcatPdoList>>,
    tpdo_reg: u16,
}

struct Inner {
    nodes: HashMap<u8, NodeEntry>,
    ring_order: Vec<u8>,
}

/// EtherCAT-style Ethernet fabric over one `EthPort`.
pub struct EcatFabric<P: EthPort> {
    port: Mutex<P>,
    inner: Mutex<Inner>,
    ring: Arc<FrameRing>,
    settings: EcatSettings,
    read_worker: Mutex<Option<WorkerThread>>,
    cycle_worker: Mutex<Option<WorkerThread>>,
}

impl<P: EthPort + 'static> EcatFabric<P> {
    pub fn new(port: P, settings: EcatSettings) -> Arc<Self> {
        Arc::new(Self {
            port: Mutex::new(port),
            inner: Mutex::new(Inner { nodes: HashMap::new(), ring_order: Vec::new() }),
            ring: Arc::new(FrameRing::new(FRAME_RING_CAPACITY)),
            settings,
            read_worker: Mutex::new(None),
            cycle_worker: Mutex::new(None),
        })
    }

    pub fn open(self: &Arc<Self>) -> Result<(), Error> {
        self.port.lock().unwrap().open()?;
        let reader = self.clone();
        let read_worker = WorkerThread::start("ecat-read", move |stop| reader.read_loop(stop))?;
        *self.read_worker.lock().unwrap() = Some(read_worker);
        let cycler = self.clone();
        let cycle_worker = WorkerThread::start("ecat-cycle", move |stop| cycler.cycle_loop(stop))?;
        *self.cycle_worker.lock().unwrap() = Some(cycle_worker);
        Ok(())
    }

    pub fn close(&self) -> Result<(), Error> {
        if let Some(mut w) = self.cycle_worker.lock().unwrap().take() {
            let _ = w.stop(Duration::from_secs(1));
        }
        if let Some(mut w) = self.read_worker.lock().unwrap().take() {
            let _ = w.stop(Duration::from_secs(1));
        }
        self.port.lock().unwrap().close()
    }

    /// Attaches a node at its ring/station `address`, in bring-up order —
    /// `ring_order` drives both the DC delay chain and `set_node_al_state`
    /// broadcasts, so nodes must be attached in physical ring position.
    pub fn attach(&self, node: Arc<Node>, address: u16) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.nodes.contains_key(&node.id) {
            return Err(Error::Ecat(EcatError::NodeNotFound));
        }
        inner.ring_order.push(node.id);
        inner.nodes.insert(
            node.id,
            NodeEntry { node, address, rpdo: None, rpdo_reg: 0x1100, tpdo: None, tpdo_reg: 0x1A00 },
        );
        Ok(())
    }

    pub fn detach(&self, node_id: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.remove(&node_id);
        inner.ring_order.retain(|&id| id != node_id);
    }

    /// Installs (or replaces) the RPDO/TPDO lists a node's cyclic frame
    /// carries, and the sync-manager register pair they're written/read at.
    pub fn pdo_set(&self, node_id: u8, rpdo: Option<(Arc<EcatPdoList>, u16)>, tpdo: Option<(Arc<EcatPdoList>, u16)>) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.nodes.get_mut(&node_id).ok_or(Error::Ecat(EcatError::NodeNotFound))?;
        if let Some((list, reg)) = rpdo {
            entry.rpdo = Some(list);
            entry.rpdo_reg = reg;
        }
        if let Some((list, reg)) = tpdo {
            entry.tpdo = Some(list);
            entry.tpdo_reg = reg;
        }
        Ok(())
    }

    fn address_of(&self, node_id: u8) -> Result<u16, Error> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(&node_id)
            .map(|e| e.address)
            .ok_or(Error::Ecat(EcatError::NodeNotFound))
    }

    /// Stamps a sentinel datagram onto `datagrams`, sends the resulting
    /// frame(s), and blocks for the matching reply. Only a single
    /// fits-in-one-frame send is supported; a caller asking for more than
    /// that gets `EcatError::DatagramWontFit` rather than a silent split
    /// across un-coordinated replies.
    pub fn send_frame(&self, mut datagrams: Vec<Datagram>, timeout: Duration) -> Result<Vec<Datagram>, Error> {
        let (ring_index, frame_id) = self.ring.reserve();
        let mut with_sentinel = vec![datagram::make_sentinel(0, ring_index, frame_id)];
        with_sentinel.append(&mut datagrams);

        let src_mac = self.port.lock().unwrap().local_mac();
        let frames = datagram::build_frames(&with_sentinel, src_mac, MAX_FRAME_PAYLOAD);
        if frames.len() != 1 {
            return Err(Error::Ecat(EcatError::DatagramWontFit));
        }
        self.port.lock().unwrap().send(&frames[0])?;

        // `dispatch` already strips the echoed sentinel before delivering,
        // so `reply` here holds exactly the datagrams the caller sent.
        let reply = self.ring.wait(ring_index, timeout)?;
        if reply.is_empty() {
            return Err(Error::Ecat(EcatError::NoResponse));
        }
        Ok(reply)
    }

    pub fn node_read(&self, node_id: u8, reg: u16, len: u8) -> Result<Vec<u8>, Error> {
        let address = self.address_of(node_id)?;
        let dg = Datagram::new(EcatCmd::Fprd, 1, address, reg, vec![0u8; len as usize]);
        let reply = self.send_frame(vec![dg], Duration::from_millis(100))?;
        let dg = reply.into_iter().next().ok_or(Error::Ecat(EcatError::NoResponse))?;
        if dg.wkc == 0 {
            return Err(Error::Ecat(EcatError::NoResponse));
        }
        Ok(dg.data)
    }

    pub fn node_write(&self, node_id: u8, reg: u16, data: &[u8]) -> Result<(), Error> {
        let address = self.address_of(node_id)?;
        let dg = Datagram::new(EcatCmd::Fpwr, 1, address, reg, data.to_vec());
        let reply = self.send_frame(vec![dg], Duration::from_millis(100))?;
        let dg = reply.into_iter().next().ok_or(Error::Ecat(EcatError::NoResponse))?;
        if dg.wkc == 0 {
            return Err(Error::Ecat(EcatError::NoResponse));
        }
        Ok(())
    }

    /// Reads one 32-bit word from the slave information interface: program
    /// the word address, poll the busy bit, read the data register back.
    pub fn read_eeprom(&self, node_id: u8, word_addr: u16) -> Result<u32, Error> {
        self.node_write(node_id, REG_EEPROM_ADDR, &word_addr.to_le_bytes())?;
        self.node_write(node_id, REG_EEPROM_CONTROL, &[0x01, 0x00])?; // read command
        let deadline = Instant::now() + Duration::from_millis(200);
        loop {
            let status = self.node_read(node_id, REG_EEPROM_CONTROL, 2)?;
            let busy = status.first().map(|b| b & 0x80 != 0).unwrap_or(false);
            if !busy {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Ecat(EcatError::NoResponse));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let data = self.node_read(node_id, REG_EEPROM_DATA, 4)?;
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Writes one sync-manager descriptor: start address, length, control
    /// byte, then sets the enable bit.
    pub fn cfg_sync_mgr(&self, node_id: u8, base_reg: u16, addr: u16, len: u16, ctrl: u8) -> Result<(), Error> {
        let mut bytes = Vec::with_capacity(8);
        bytes.extend_from_slice(&addr.to_le_bytes());
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.push(ctrl);
        bytes.push(0x00); // status, read-only on the node
        bytes.push(0x01); // activate
        bytes.push(0x00); // PDI control
        self.node_write(node_id, base_reg, &bytes)
    }

    /// Programs the SYNC0 pulse period: disable, write the cycle time,
    /// pick a start time comfortably in the future, re-enable, and verify
    /// the control register actually took, retrying up to
    /// `SYNC0_RETRY_MAX` times.
    pub fn set_sync0_period(&self, node_id: u8, ns: u32) -> Result<(), Error> {
        for attempt in 0..SYNC0_RETRY_MAX {
            self.node_write(node_id, REG_DC_CONTROL, &[0x00])?;
            self.node_write(node_id, REG_SYNC0_CYCLE, &ns.to_le_bytes())?;
            let start = now_ms() * 1_000_000 + SYNC0_SETUP_MARGIN_NS;
            self.node_write(node_id, REG_SYNC0_START, &start.to_le_bytes())?;
            self.node_write(node_id, REG_DC_CONTROL, &[0x01])?;
            let readback = self.node_read(node_id, REG_DC_CONTROL, 1)?;
            if readback.first() == Some(&0x01) {
                return Ok(());
            }
            sb_warn!(LogContext::new("ecat-dc", node_id), "sync0 control readback mismatch, retry {attempt}");
        }
        Err(Error::Ecat(EcatError::Sync0Config))
    }

    /// Latches per-node DC offsets and propagation delays along the
    /// attach-order ring, then writes each node's offset back to its
    /// system-time-offset register.
    pub fn bring_up_dc(&self, host_time_ns: u64) -> Result<(), Error> {
        let ring_order = self.inner.lock().unwrap().ring_order.clone();
        let mut nodes = Vec::with_capacity(ring_order.len());
        for &node_id in &ring_order {
            let system_time = self.node_read(node_id, REG_SYSTEM_TIME, 8)?;
            let recv = self.node_read(node_id, REG_PORT0_RECV_TIME, 16)?;
            let dl_status = self.node_read(node_id, REG_DL_STATUS, 2)?;
            let status_word = u16::from_le_bytes([dl_status[0], dl_status[1]]);
            let mut port_receive_ns = [0u32; 4];
            let mut port_open = [false; 4];
            for p in 0..4 {
                port_receive_ns[p] = u32::from_le_bytes(recv[p * 4..p * 4 + 4].try_into().unwrap());
                port_open[p] = status_word & (1 << (p + 1)) != 0;
            }
            let system_time_ns = u64::from_le_bytes(system_time.try_into().unwrap());
            nodes.push(DcNodeInfo::new(system_time_ns, port_receive_ns, port_open));
        }

        dc::latch_offsets(&mut nodes, host_time_ns);
        dc::compute_branch_delays(&mut nodes);

        for (i, &node_id) in ring_order.iter().enumerate() {
            self.node_write(node_id, REG_SYSTEM_TIME_OFFSET, &nodes[i].offset_ns.to_le_bytes())?;
        }
        sb_info!(LogContext::new("ecat-dc", 0), "distributed clock bring-up complete for {} nodes", ring_order.len());
        Ok(())
    }

    /// Steps a node's AL state one legal hop at a time until `target` is
    /// reached or `timeout` elapses.
    pub fn set_node_al_state(&self, node_id: u8, target: AlState, timeout: Duration) -> Result<(), Error> {
        let node = {
            let inner = self.inner.lock().unwrap();
            inner.nodes.get(&node_id).map(|e| e.node.clone()).ok_or(Error::Ecat(EcatError::NodeNotFound))?
        };
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.node_read(node_id, REG_AL_STATUS, 1)?;
            let current = AlState::from_code(status[0]);
            node.fsm.set_state(al_to_node_state(current));
            if current == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Ecat(EcatError::NodeStateChange));
            }
            let next = current.next_toward(target);
            self.node_write(node_id, REG_AL_CONTROL, &[next as u8])?;
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Tunnels an 8-byte SDO command frame through the node's CoE mailbox.
    pub fn xmit_sdo(self: &Arc<Self>, node_id: u8, buf: &[u8; 8], timeout: Duration) -> Result<[u8; 8], Error> {
        let link = EcatMailboxLink { fabric: self.clone(), node_id };
        let channel = mailbox::CoeSdoChannel::new(link, self.address_of(node_id)?);
        let reply = channel.transfer(buf, timeout)?;
        let mut out = [0u8; 8];
        out[..reply.len().min(8)].copy_from_slice(&reply[..reply.len().min(8)]);
        Ok(out)
    }

    /// Starts a file-over-EtherCAT download: sends the initial FoE
    /// write-request opcode naming `filename`; the caller drives
    /// `foe_continue` with successive data segments.
    pub fn foe_start(self: &Arc<Self>, node_id: u8, filename: &str, timeout: Duration) -> Result<(), Error> {
        const FOE_OP_WRQ: u8 = 2;
        let mut data = vec![FOE_OP_WRQ, 0, 0, 0, 0, 0];
        data.extend_from_slice(filename.as_bytes());
        self.foe_exchange(node_id, data, timeout).map(|_| ())
    }

    /// Sends one FoE data segment (opcode DATA) and returns the node's ACK
    /// payload.
    pub fn foe_continue(self: &Arc<Self>, node_id: u8, packet_no: u32, chunk: &[u8], timeout: Duration) -> Result<Vec<u8>, Error> {
        const FOE_OP_DATA: u8 = 3;
        let mut data = vec![FOE_OP_DATA, 0];
        data.extend_from_slice(&packet_no.to_le_bytes());
        data.extend_from_slice(chunk);
        self.foe_exchange(node_id, data, timeout)
    }

    fn foe_exchange(&self, node_id: u8, data: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, Error> {
        let address = self.address_of(node_id)?;
        let link = EcatMailboxLinkRef { fabric: self, node_id };
        let frame = MailboxFrame { address, channel_priority: 0, mbx_type: MBX_TYPE_FOE, counter: mailbox::next_counter(0), data };
        link.write_mailbox(&frame)?;
        let reply = link.read_mailbox(timeout)?;
        if reply.mbx_type != MBX_TYPE_FOE {
            return Err(Error::Ecat(EcatError::FoeFormat));
        }
        if reply.data.first() == Some(&4) {
            // opcode ERR
            return Err(Error::Ecat(EcatError::FoeError));
        }
        Ok(reply.data)
    }

    fn read_loop(&self, stop: StopToken) {
        while !stop.is_stopped() {
            let frame = { self.port.lock().unwrap().recv(READ_TIMEOUT) };
            match frame {
                Ok(frame) => self.dispatch(&frame),
                Err(Error::Transport(TransportError::Timeout)) => continue,
                Err(e) => {
                    sb_warn!("ecat-read thread error, retrying: {e}");
                    let _ = stop.sleep(ERROR_RETRY_SLEEP);
                }
            }
        }
    }

    fn dispatch(&self, frame: &EthFrame) {
        if frame.ethertype() != Some(ETHERCAT_ETHERTYPE) {
            return;
        }
        let Ok(datagrams) = datagram::parse_datagrams(frame.payload()) else {
            return;
        };
        let Some(sentinel) = datagrams.first() else {
            return;
        };
        if let Some((ring_index, _frame_id)) = datagram::read_sentinel(sentinel) {
            self.ring.deliver(ring_index, datagrams[1..].to_vec());
        }
    }

    fn cycle_loop(&self, stop: StopToken) {
        while stop.sleep_cooperative(self.settings.cycle_period()).is_ok() {
            self.run_one_cycle();
        }
    }

    fn run_one_cycle(&self) {
        let entries: Vec<(u8, u16, Option<Arc<EcatPdoList>>, u16, Option<Arc<EcatPdoList>>, u16)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .ring_order
                .iter()
                .filter_map(|id| {
                    inner.nodes.get(id).map(|e| (*id, e.address, e.rpdo.clone(), e.rpdo_reg, e.tpdo.clone(), e.tpdo_reg))
                })
                .collect()
        };

        let mut datagrams = Vec::new();
        let mut tpdo_plan: Vec<(Arc<EcatPdoList>, usize)> = Vec::new();
        for (_, address, rpdo, rpdo_reg, tpdo, tpdo_reg) in entries {
            if let Some(list) = rpdo {
                datagrams.push(Datagram::new(EcatCmd::Fpwr, datagrams.len() as u8 + 1, address, rpdo_reg, list.encode()));
            }
            if let Some(list) = tpdo {
                let len = list.byte_len();
                datagrams.push(Datagram::new(EcatCmd::Fprd, datagrams.len() as u8 + 1, address, tpdo_reg, vec![0u8; len]));
                tpdo_plan.push((list, datagrams.len() - 1));
            }
        }
        if datagrams.is_empty() {
            return;
        }

        match self.send_frame(datagrams, self.settings.cycle_period()) {
            Ok(reply) => {
                for (list, idx) in tpdo_plan {
                    if let Some(dg) = reply.get(idx) {
                        if dg.wkc > 0 {
                            list.decode(&dg.data);
                        }
                    }
                }
            }
            Err(e) => sb_warn!("ecat cyclic frame failed: {e}"),
        }
    }
}

fn al_to_node_state(state: AlState) -> NodeState {
    match state {
        AlState::Init => NodeState::Stopped,
        AlState::PreOp => NodeState::PreOp,
        AlState::Boot => NodeState::Boot,
        AlState::SafeOp => NodeState::SafeOp,
        AlState::Op => NodeState::Operational,
    }
}

/// Bridges the CoE mailbox protocol onto the register-level `node_read`/
/// `node_write` primitives: writes go to the rx mailbox register, reads
/// poll the tx mailbox register until a frame with a nonzero length shows
/// up or `timeout` elapses.
struct EcatMailboxLink<P: EthPort + 'static> {
    fabric: Arc<EcatFabric<P>>,
    node_id: u8,
}

impl<P: EthPort + 'static> MailboxTransport for EcatMailboxLink<P> {
    fn write_mailbox(&self, frame: &MailboxFrame) -> Result<(), Error> {
        self.fabric.node_write(self.node_id, REG_MBX_RX, &frame.to_bytes())
    }

    fn read_mailbox(&self, timeout: Duration) -> Result<MailboxFrame, Error> {
        poll_mailbox(&self.fabric, self.node_id, timeout)
    }
}

struct EcatMailboxLinkRef<'a, P: EthPort + 'static> {
    fabric: &'a EcatFabric<P>,
    node_id: u8,
}

impl<'a, P: EthPort + 'static> EcatMailboxLinkRef<'a, P> {
    fn write_mailbox(&self, frame: &MailboxFrame) -> Result<(), Error> {
        self.fabric.node_write(self.node_id, REG_MBX_RX, &frame.to_bytes())
    }

    fn read_mailbox(&self, timeout: Duration) -> Result<MailboxFrame, Error> {
        poll_mailbox(self.fabric, self.node_id, timeout)
    }
}

fn poll_mailbox<P: EthPort + 'static>(fabric: &EcatFabric<P>, node_id: u8, timeout: Duration) -> Result<MailboxFrame, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        let bytes = fabric.node_read(node_id, REG_MBX_TX, MBX_MAX_LEN)?;
        if let Ok(frame) = MailboxFrame::from_bytes(&bytes) {
            if !frame.data.is_empty() {
                return Ok(frame);
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::Ecat(EcatError::MboxTimeout));
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::transport::test_support::LoopbackEth;
    use std::sync::atomic::{AtomicU8, Ordering};

    /// A minimal simulated ESC that answers FPRD/FPWR against one station
    /// address with a register file, bumping wkc on every matched access
    /// and forwarding the sentinel datagram back untouched but decremented
    /// (as a real slave's auto-increment address processing would).
    fn spawn_fake_slave(mut port: LoopbackEth, address: u16, al_status: Arc<AtomicU8>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            port.open().unwrap();
            let mut registers: HashMap<u16, Vec<u8>> = HashMap::new();
            loop {
                let frame = match port.recv(Duration::from_millis(500)) {
                    Ok(f) => f,
                    Err(_) => return,
                };
                if frame.ethertype() != Some(ETHERCAT_ETHERTYPE) {
                    continue;
                }
                let Ok(mut datagrams) = datagram::parse_datagrams(frame.payload()) else { continue };
                for dg in datagrams.iter_mut() {
                    if dg.cmd == EcatCmd::Apwr && dg.adp == datagram::SENTINEL_ADP_START {
                        dg.adp = dg.adp.wrapping_sub(1);
                        continue;
                    }
                    if dg.adp != address {
                        continue;
                    }
                    match dg.cmd {
                        EcatCmd::Fpwr => {
                            if dg.ado == REG_AL_CONTROL {
                                al_status.store(dg.data[0], Ordering::SeqCst);
                            }
                            registers.insert(dg.ado, dg.data.clone());
                            dg.wkc = 1;
                        }
                        EcatCmd::Fprd => {
                            if dg.ado == REG_AL_STATUS {
                                let len = dg.data.len();
                                dg.data = vec![0u8; len];
                                dg.data[0] = al_status.load(Ordering::SeqCst);
                            } else if let Some(stored) = registers.get(&dg.ado) {
                                for (i, b) in dg.data.iter_mut().enumerate() {
                                    *b = stored.get(i).copied().unwrap_or(0);
                                }
                            }
                            dg.wkc = 1;
                        }
                        _ => {}
                    }
                }
                let src = port.local_mac();
                let reply_frames = datagram::build_frames(&datagrams, src, MAX_FRAME_PAYLOAD);
                for f in reply_frames {
                    let _ = port.send(&f);
                }
            }
        })
    }

    #[test]
    fn node_write_then_read_roundtrips_through_simulated_slave() {
        let (host, node_port) = LoopbackEth::pair();
        let al_status = Arc::new(AtomicU8::new(AlState::Init as u8));
        let slave = spawn_fake_slave(node_port, 0x1001, al_status);

        let fabric = EcatFabric::new(host, EcatSettings::default());
        fabric.open().unwrap();
        let node = Arc::new(Node::new(1, NodeConfig::default()));
        fabric.attach(node, 0x1001).unwrap();

        fabric.node_write(1, 0x2000, &[0xAA, 0xBB]).unwrap();
        let readback = fabric.node_read(1, 0x2000, 2).unwrap();
        assert_eq!(readback, vec![0xAA, 0xBB]);

        fabric.close().unwrap();
        drop(slave);
    }

    #[test]
    fn set_node_al_state_steps_through_preop_to_op() {
        let (host, node_port) = LoopbackEth::pair();
        let al_status = Arc::new(AtomicU8::new(AlState::Init as u8));
        let slave = spawn_fake_slave(node_port, 0x1002, al_status);

        let fabric = EcatFabric::new(host, EcatSettings::default());
        fabric.open().unwrap();
        let node = Arc::new(Node::new(2, NodeConfig::default()));
        fabric.attach(node.clone(), 0x1002).unwrap();

        fabric.set_node_al_state(2, AlState::Op, Duration::from_secs(2)).unwrap();
        assert_eq!(node.state(), NodeState::Operational);

        fabric.close().unwrap();
        drop(slave);
    }
}
