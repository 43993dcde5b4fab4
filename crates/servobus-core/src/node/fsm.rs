//! Shared NMT / AL-state machine.
//!
//! Both transports drive the same state set; what differs is how a state
//! change is *observed* (NMT broadcast on CAN, AL-status poll on Ethernet)
//! and how a transition is *requested* (`CanFabric::start`/`stop`/... send
//! NMT opcodes; `EcatFabric::set_node_al_state` steps the AL-status/control
//! registers). `NodeFsm` itself never talks to the wire — it only tracks
//! the last observed state and wakes waiters.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, NodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Unknown,
    Boot,
    /// Equivalent to CiA-301 "Initialisation" / EtherCAT "Init".
    Stopped,
    PreOp,
    Operational,
    SafeOp,
    GuardErr,
    Invalid,
}

struct Inner {
    state: NodeState,
}

/// Tracks one node's lifecycle state and lets callers block for a target
/// state to be reached.
pub struct NodeFsm {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for NodeFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeFsm {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: NodeState::Unknown,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().unwrap().state
    }

    /// Updates the observed state and wakes any `await_state` waiters.
    /// Waiters must see the new state once woken; holding the lock across
    /// the `notify_all` guarantees that.
    pub fn set_state(&self, state: NodeState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        self.cond.notify_all();
    }

    /// Blocks until `target` is reached or `timeout` elapses. A negative
    /// timeout is not representable in `Duration`; callers wanting "forever"
    /// should pass `Duration::MAX`.
    pub fn await_state(&self, target: NodeState, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.state != target {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Node(NodeError::GuardTimeout));
            }
            let (guard, result) = self.cond.wait_timeout(inner, remaining).unwrap();
            inner = guard;
            if result.timed_out() && inner.state != target {
                return Err(Error::Node(NodeError::GuardTimeout));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn await_state_returns_once_reached() {
        let fsm = std::sync::Arc::new(NodeFsm::new());
        let fsm2 = fsm.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            fsm2.set_state(NodeState::Operational);
        });
        fsm.await_state(NodeState::Operational, Duration::from_secs(1))
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn await_state_times_out() {
        let fsm = NodeFsm::new();
        let err = fsm
            .await_state(NodeState::Operational, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, Error::Node(NodeError::GuardTimeout));
    }
}
