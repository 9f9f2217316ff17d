//! Persistent storage for the gateway.
//!
//! One redb database holds the configuration documents (per-device map plus
//! server/logging/OTA scalars) and the MQTT fallback queue. The store is the
//! single source of truth the drivers and publishers reload from when a
//! config-change event fires.

pub mod error;
pub mod fallback;
pub mod store;

pub use error::{Error, Result};
pub use fallback::{FallbackEntry, FallbackQueue, FALLBACK_CAPACITY};
pub use store::{ConfigStore, FullConfig};
