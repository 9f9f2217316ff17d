//! Network failover supervision.
//!
//! An Ethernet-primary / wireless-secondary controller with hysteresis and
//! signal-quality thresholds, plus the shared-ownership interface managers
//! and the raw client capability handed to socket-level consumers.

pub mod error;
pub mod iface;
pub mod supervisor;

pub use error::{NetError, Result};
pub use iface::{
    InterfaceKind, NetClient, NetworkInterface, SharedInterface, SignalQuality,
};
pub use supervisor::{FailoverConfig, InterfaceStatus, NetworkSupervisor};
