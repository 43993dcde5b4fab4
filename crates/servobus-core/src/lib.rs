//! Platform-agnostic engine for host-side motion control over CANopen and
//! EtherCAT-style Ethernet fieldbuses.
//!
//! This crate has no I/O of its own: a platform crate (e.g. `servobus-linux`)
//! supplies a [`transport::CanPort`] and/or [`transport::EthPort`]
//! implementation and drives the engine's worker threads. Everything here
//! is about protocol state machines, wire codecs, and the object-reference
//! bookkeeping that ties them together.

pub mod config;
pub mod error;
pub mod log;
pub mod reftable;
pub mod timebase;
pub mod transport;

pub mod can;
pub mod ecat;
pub mod network;
pub mod node;
pub mod pdo;
pub mod sdo;
pub mod trajectory;

pub use error::Error;
pub use reftable::{Handle, RefTable};
pub use timebase::{now_ms, StopToken, WorkerThread};
