//! Modbus polling engine.
//!
//! Two drivers share one architecture: a min-heap poll scheduler with
//! per-device failure state ([`engine`]), a transport-neutral polling pass
//! ([`pass`]) and register codec ([`codec`]), and a write path for the
//! subscribe-to-write bridge ([`write`]).
//!
//! - [`rtu::RtuDriver`] drives two RS-485 buses with lazy baud
//!   reconfiguration.
//! - [`tcp::TcpDriver`] drives networked devices through a bounded pool of
//!   persistent sockets.

pub mod codec;
pub mod engine;
pub mod error;
pub mod io;
pub mod pass;
pub mod rtu;
pub mod scheduler;
pub mod tcp;
pub mod write;

pub use engine::{
    FailureOutcome, FailurePolicy, PollEngine, ReloadDelta, AUTO_RECOVERY_AGE_MS,
    AUTO_RECOVERY_SWEEP_MS, RTU_POLICY, TCP_POLICY,
};
pub use error::{ModbusError, Result};
pub use io::RegisterIo;
pub use rtu::{RtuDriver, RtuPortConfig};
pub use scheduler::PollScheduler;
pub use tcp::{TcpDriver, MAX_POOL_SIZE, POOL_IDLE_MS, POOL_MAX_AGE_MS};
