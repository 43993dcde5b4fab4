//! Plain configuration structs with the literal defaults named in the
//! design notes. No file format is parsed here — application code builds
//! these directly or deserializes them itself; text/XML configuration
//! parsing is out of scope for this crate.

use std::time::Duration;

/// Node guard discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    None,
    Heartbeat,
    NodeGuard,
}

/// Per-node liveness configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    pub guard_mode: GuardMode,
    pub guard_timeout_ms: u32,
    pub life_factor: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            guard_mode: GuardMode::None,
            guard_timeout_ms: 1000,
            life_factor: 2,
        }
    }
}

/// Per-session SDO timeout/retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoTimeouts {
    pub timeout_ms: u32,
    pub max_retry: u8,
}

impl Default for SdoTimeouts {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            max_retry: 4,
        }
    }
}

impl SdoTimeouts {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms as u64)
    }
}

/// Network-wide CAN settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSettings {
    pub read_thread_priority: i32,
    pub timing_reference: bool,
    pub sync_id: u32,
    pub time_id: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            read_thread_priority: 0,
            timing_reference: false,
            sync_id: 0x080,
            time_id: 0x181,
        }
    }
}

/// Network-wide EtherCAT-style settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcatSettings {
    pub cycle_thread_priority: i32,
    pub cycle_period_ms: u32,
}

impl Default for EcatSettings {
    fn default() -> Self {
        Self {
            cycle_thread_priority: 0,
            cycle_period_ms: 4,
        }
    }
}

impl EcatSettings {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms as u64)
    }
}
